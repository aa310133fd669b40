use crate::CryptoError;

/// Secure key-value storage collaborator.
///
/// Implementations must keep values confidential at rest (platform keystore,
/// encrypted database) and survive process restarts. The crypto crate only
/// defines the contract.
pub trait SecureStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    fn set_secure(&self, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Load the value stored under `key`.
    fn get_secure(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove_secure(&self, key: &str) -> Result<(), CryptoError>;
}

// Key names used throughout the crate.

/// Identity private seed. Written last on account creation.
pub const KEY_IDENTITY: &str = "signal/identity_keypair";
/// Registration id.
pub const KEY_REGISTRATION_ID: &str = "signal/registration_id";
/// Current signed prekey and the one retired by the last rotation, in one
/// entry so a rotation is a single write.
pub const KEY_SIGNED_PREKEY: &str = "signal/signed_prekeys";
/// Pool of one-time prekeys.
pub const KEY_PREKEY_POOL: &str = "signal/prekey_pool";
/// Index of peers that have a persisted session.
pub const KEY_SESSION_INDEX: &str = "signal/session_index";

/// Every account-level key, in the order they are written.
pub const ACCOUNT_KEYS: [&str; 4] = [
    KEY_PREKEY_POOL,
    KEY_SIGNED_PREKEY,
    KEY_REGISTRATION_ID,
    KEY_IDENTITY,
];

/// Store key for the session with `peer_id`.
pub fn session_key_name(peer_id: &str) -> String {
    format!("signal/session/{peer_id}")
}
