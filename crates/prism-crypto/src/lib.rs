mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod keychain;
pub mod memory_store;
pub mod primitives;
pub mod recovery;
pub mod signal;
pub mod transport;

pub use config::{KdfParams, ProtocolConfig};
pub use context::{CryptoContext, ReceivedMessage};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, RegistrationId};
pub use keychain::SecureStore;
pub use memory_store::MemorySecureStore;
pub use recovery::{generate_mnemonic, mnemonic_to_seed, validate_mnemonic, Mnemonic};
pub use signal::{
    safety_number, AccountManager, EncryptedMessage, KeychainSessionStore, MessageKind,
    PreKeyBundle, PreKeyPublic, Role, Session, SessionStore, SignalSessionManager,
    SignedPreKeyPublic,
};
pub use transport::{ApiClient, InboundMessage, MemoryRelay, RelayClient};
