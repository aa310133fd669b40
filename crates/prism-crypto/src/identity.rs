use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::primitives;

/// Highest registration id (14 bits).
pub const MAX_REGISTRATION_ID: u32 = 0x3FFF;

/// Long-term identity key pair of this installation.
///
/// The identity IS the Ed25519 keypair: it signs the signed pre-key directly,
/// and is mapped onto Curve25519 (Edwards→Montgomery) for the X3DH DH legs.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Result<Self, CryptoError> {
        let seed = zeroize::Zeroizing::new(primitives::random_bytes::<32>()?);
        Ok(Self::from_secret_bytes(&seed))
    }

    /// Restore an identity from its 32-byte private seed.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Derive the identity deterministically from a 64-byte recovery seed.
    pub fn from_seed(seed: &[u8; 64]) -> Result<Self, CryptoError> {
        let secret = zeroize::Zeroizing::new(primitives::derive_key(seed, b"Prism-Identity-v1")?);
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Private seed, for persistence in the secure store only.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify `signature` over `message` by the Ed25519 key `public_key`.
    ///
    /// Both malformed keys/signatures and genuine mismatches map to
    /// [`CryptoError::InvalidSignature`].
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidSignature)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        verifying_key
            .verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// X25519 secret sharing the scalar Ed25519 uses internally, so that
    /// [`IdentityKeyPair::peer_x25519_public`] of our public key matches.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Map a peer's Ed25519 identity key onto Curve25519 (RFC 7748).
    pub fn peer_x25519_public(ed25519_public: &[u8]) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let bytes: [u8; 32] = ed25519_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
        Ok(x25519_dalek::PublicKey::from(
            verifying_key.to_montgomery().to_bytes(),
        ))
    }

    /// This identity's peer address.
    pub fn user_hash(&self) -> String {
        user_hash(&self.public_key_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Peer address derived from an identity public key: hex SHA-256.
pub fn user_hash(identity_public: &[u8]) -> String {
    hex::encode(Sha256::digest(identity_public))
}

/// Install-specific registration id in `[1, 16383]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u32);

impl RegistrationId {
    /// Draw 14 random bits, rerolling zero.
    pub fn generate() -> Result<Self, CryptoError> {
        loop {
            let candidate = primitives::random_u32()? & MAX_REGISTRATION_ID;
            if candidate != 0 {
                return Ok(Self(candidate));
            }
        }
    }

    pub fn new(value: u32) -> Result<Self, CryptoError> {
        if (1..=MAX_REGISTRATION_ID).contains(&value) {
            Ok(Self(value))
        } else {
            Err(CryptoError::InvalidKey(format!(
                "registration id {value} outside 1..={MAX_REGISTRATION_ID}"
            )))
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}
