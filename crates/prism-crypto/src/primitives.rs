//! Random source and the symmetric primitives the rest of the crate builds on.
//!
//! Everything that needs fresh key material, HKDF output or AES-256-GCM goes
//! through here so there is exactly one place that touches the OS RNG. There
//! is no fallback: if the RNG or a primitive misbehaves, [`self_test`] fails
//! and the context refuses to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;

/// Symmetric key length (AES-256, chain keys, root keys).
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-GCM tag length.
pub const TAG_LEN: usize = 16;

const ZERO_SALT: [u8; 32] = [0u8; 32];

/// Fill an array from the OS RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::RandomUnavailable(e.to_string()))?;
    Ok(buf)
}

/// Draw a uniformly random `u32`.
pub fn random_u32() -> Result<u32, CryptoError> {
    Ok(u32::from_le_bytes(random_bytes::<4>()?))
}

/// HKDF-SHA256. A `None` salt means the fixed all-zero salt.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    okm: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt.unwrap_or(&ZERO_SALT)), ikm);
    hk.expand(info, okm)
        .map_err(|e| CryptoError::EncryptionError(format!("HKDF expand failed: {e}")))
}

/// Derive a single 32-byte key with a zero salt.
pub fn derive_key(ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut out = [0u8; KEY_LEN];
    hkdf_sha256(ikm, None, info, &mut out)?;
    Ok(out)
}

/// AES-256-GCM encrypt under a fresh random nonce.
///
/// Returns the nonce and `ciphertext || tag`.
pub fn seal(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes = random_bytes::<NONCE_LEN>()?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    Ok((nonce_bytes, ciphertext))
}

/// AES-256-GCM decrypt. Any failure is [`CryptoError::DecryptionFailed`].
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

// RFC 5869, test case 1.
const HKDF_KAT_OKM: &str =
    "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865";

/// Startup check of the RNG and every primitive the protocol relies on.
pub fn self_test() -> Result<(), CryptoError> {
    let probe: [u8; KEY_LEN] = random_bytes()?;
    let second: [u8; KEY_LEN] = random_bytes()?;
    if probe == second || probe == [0u8; KEY_LEN] {
        return Err(CryptoError::RandomUnavailable(
            "OS RNG produced degenerate output".into(),
        ));
    }

    let failed = |what: &str| CryptoError::EncryptionError(format!("self-test failed: {what}"));

    let salt: Vec<u8> = (0u8..=0x0c).collect();
    let info: Vec<u8> = (0xf0u8..=0xf9).collect();
    let mut okm = [0u8; 42];
    hkdf_sha256(&[0x0b; 22], Some(&salt), &info, &mut okm)?;
    if hex::encode(okm) != HKDF_KAT_OKM {
        return Err(failed("HKDF-SHA256"));
    }

    let (nonce, ciphertext) = seal(&probe, b"prism self-test", b"aad")?;
    let plaintext = open(&probe, &nonce, &ciphertext, b"aad").map_err(|_| failed("AES-GCM"))?;
    if plaintext != b"prism self-test" || open(&probe, &nonce, &ciphertext, b"bad").is_ok() {
        return Err(failed("AES-GCM"));
    }

    let signing = SigningKey::from_bytes(&probe);
    let signature = signing.sign(b"prism self-test");
    if signing
        .verifying_key()
        .verify(b"prism self-test", &signature)
        .is_err()
    {
        return Err(failed("Ed25519"));
    }

    let a = StaticSecret::from(probe);
    let b = StaticSecret::from(second);
    let ab = a.diffie_hellman(&X25519Public::from(&b));
    let ba = b.diffie_hellman(&X25519Public::from(&a));
    if ab.as_bytes() != ba.as_bytes() {
        return Err(failed("X25519"));
    }

    Ok(())
}
