use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("account not initialized")]
    AccountNotInitialized,

    #[error("account already exists")]
    AccountAlreadyExists,

    /// The signed pre-key in a bundle was not signed by the bundle's identity key.
    #[error("signed prekey signature is invalid")]
    InvalidSignature,

    #[error("no session for peer {0}")]
    NoSession(String),

    /// AEAD failure, counter mismatch or replay. Carries no detail on purpose:
    /// callers cannot tell tampering from a desynchronized ratchet.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key storage error: {0}")]
    StorageFailure(String),

    #[error("identity key for peer {0} changed")]
    UntrustedIdentity(String),

    #[error("prekey {0} not found")]
    PreKeyNotFound(u32),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("secure random source unavailable: {0}")]
    RandomUnavailable(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),
}
