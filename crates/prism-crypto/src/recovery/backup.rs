//! Recovery seed sealed under a user PIN.
//!
//! Layout: `version:u8 | salt:16 | nonce:24 | ciphertext || tag`. The key is
//! Argon2id(pin, salt); the cipher is XChaCha20-Poly1305 with the version and
//! salt as associated data.

use argon2::{Algorithm, Argon2, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::config::KdfParams;
use crate::error::CryptoError;
use crate::primitives;
use crate::recovery::mnemonic::SEED_LEN;

const BACKUP_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + SALT_LEN;

/// Encrypt `seed` under `pin`.
pub fn seal_seed(
    seed: &[u8; SEED_LEN],
    pin: &str,
    params: &KdfParams,
) -> Result<Vec<u8>, CryptoError> {
    let salt = primitives::random_bytes::<SALT_LEN>()?;
    let nonce = primitives::random_bytes::<NONCE_LEN>()?;
    let key = derive_pin_key(pin, &salt, params)?;

    let mut header = [0u8; HEADER_LEN];
    header[0] = BACKUP_VERSION;
    header[1..].copy_from_slice(&salt);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: seed,
                aad: &header,
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&header);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a sealed seed. A wrong PIN is [`CryptoError::DecryptionFailed`].
pub fn open_seed(
    sealed: &[u8],
    pin: &str,
    params: &KdfParams,
) -> Result<Zeroizing<[u8; SEED_LEN]>, CryptoError> {
    if sealed.len() != HEADER_LEN + NONCE_LEN + SEED_LEN + TAG_LEN {
        return Err(CryptoError::MalformedMessage(format!(
            "sealed seed must be {} bytes, got {}",
            HEADER_LEN + NONCE_LEN + SEED_LEN + TAG_LEN,
            sealed.len()
        )));
    }
    let (header, rest) = sealed.split_at(HEADER_LEN);
    if header[0] != BACKUP_VERSION {
        return Err(CryptoError::MalformedMessage(format!(
            "unknown backup version {}",
            header[0]
        )));
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_pin_key(pin, &header[1..], params)?;
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?,
    );

    let mut seed = Zeroizing::new([0u8; SEED_LEN]);
    seed.copy_from_slice(&plaintext);
    Ok(seed)
}

/// Derive a 32-byte key from the PIN using `Argon2id`.
fn derive_pin_key(
    pin: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut key = Zeroizing::new([0u8; 32]);
    hasher
        .hash_password_into(pin.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::EncryptionError(format!("argon2: {e}")))?;
    Ok(key)
}
