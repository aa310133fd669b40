pub mod account;
pub mod envelope;
pub mod fingerprint;
pub mod prekeys;
mod ratchet;
pub mod session;
pub mod state;
pub mod store;
#[cfg(test)]
pub(crate) mod test_stores;
mod x3dh;

pub use account::AccountManager;
pub use envelope::{EncryptedMessage, MessageKind};
pub use fingerprint::safety_number;
pub use prekeys::{PreKeyBundle, PreKeyPublic, SignedPreKeyPublic};
pub use session::SignalSessionManager;
pub use state::{Role, Session};
pub use store::{KeychainSessionStore, SessionStore};

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
