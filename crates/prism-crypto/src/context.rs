use std::sync::Arc;

use zeroize::Zeroizing;

use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::identity;
use crate::keychain::SecureStore;
use crate::primitives;
use crate::recovery::{self, mnemonic::SEED_LEN, Mnemonic};
use crate::signal::envelope;
use crate::signal::prekeys::{PreKeyBundle, PreKeyPublic, SignedPreKeyPublic};
use crate::signal::{AccountManager, EncryptedMessage, KeychainSessionStore, SignalSessionManager};
use crate::transport::ApiClient;

/// The messaging core for one installation.
///
/// Built once at startup and passed by reference to the UI and transport
/// layers; tests build one per simulated device.
pub struct CryptoContext {
    config: ProtocolConfig,
    account: Arc<AccountManager>,
    sessions: SignalSessionManager,
}

/// Outcome of one polled message.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub id: String,
    pub sender: String,
    pub plaintext: Result<Vec<u8>, CryptoError>,
    /// Whether the server confirmed removal. A decrypted message that was not
    /// acknowledged comes back on the next poll and then fails as a replay.
    pub acked: bool,
}

impl CryptoContext {
    /// Validate `config`, check the crypto primitives and load any persisted
    /// account from `store`.
    pub fn open(store: Arc<dyn SecureStore>, config: ProtocolConfig) -> Result<Self, CryptoError> {
        config.validate()?;
        primitives::self_test()?;

        let account = Arc::new(AccountManager::new(Arc::clone(&store), config.clone()));
        let session_store = Arc::new(KeychainSessionStore::new(store));
        let sessions = SignalSessionManager::new(
            Arc::clone(&account),
            session_store,
            config.safety_number_iterations,
        );
        account.initialize()?;

        Ok(Self {
            config,
            account,
            sessions,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn account(&self) -> &AccountManager {
        &self.account
    }

    pub fn sessions(&self) -> &SignalSessionManager {
        &self.sessions
    }

    pub fn initialize(&self) -> Result<bool, CryptoError> {
        self.account.initialize()
    }

    pub fn create_account(&self) -> Result<PreKeyBundle, CryptoError> {
        self.account.create_account()
    }

    /// Replace the identity. Sessions go first; if they cannot be cleared the
    /// old account is left as it was.
    pub fn recreate_account(&self) -> Result<PreKeyBundle, CryptoError> {
        self.sessions.clear_sessions()?;
        self.account.recreate_account()
    }

    /// Create the account with an identity derived from a recovery phrase.
    pub fn restore_account(
        &self,
        phrase: &str,
        passphrase: &str,
    ) -> Result<PreKeyBundle, CryptoError> {
        let seed =
            recovery::mnemonic_to_seed(phrase, passphrase, self.config.mnemonic_pbkdf2_rounds)?;
        self.account.create_account_from_seed(&seed)
    }

    /// Fresh recovery phrase plus its seed sealed under `pin`, for onboarding.
    pub fn new_recovery_phrase(&self, pin: &str) -> Result<(Mnemonic, Vec<u8>), CryptoError> {
        let mnemonic = recovery::generate_mnemonic()?;
        let seed = mnemonic.to_seed("", self.config.mnemonic_pbkdf2_rounds)?;
        let sealed = recovery::seal_seed(&seed, pin, &self.config.backup_kdf)?;
        Ok((mnemonic, sealed))
    }

    /// Unseal a seed produced by [`Self::new_recovery_phrase`].
    pub fn open_recovery_seed(
        &self,
        sealed: &[u8],
        pin: &str,
    ) -> Result<Zeroizing<[u8; SEED_LEN]>, CryptoError> {
        recovery::open_seed(sealed, pin, &self.config.backup_kdf)
    }

    pub fn prekey_bundle(&self, prekey_id: Option<u32>) -> Result<PreKeyBundle, CryptoError> {
        self.account.prekey_bundle(prekey_id)
    }

    pub fn generate_prekeys(&self, start_id: u32, count: u32) -> Result<Vec<PreKeyPublic>, CryptoError> {
        self.account.generate_prekeys(start_id, count)
    }

    pub fn consume_prekey(&self, key_id: u32) -> Result<Vec<PreKeyPublic>, CryptoError> {
        self.account.consume_prekey(key_id)
    }

    pub fn establish_session(&self, peer_id: &str, bundle: &PreKeyBundle) -> Result<(), CryptoError> {
        self.sessions.establish_session(peer_id, bundle)
    }

    pub fn encrypt_message(
        &self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        self.sessions.encrypt_message(peer_id, plaintext)
    }

    pub fn decrypt_message(&self, peer_id: &str, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.sessions.decrypt_message(peer_id, bytes)
    }

    pub fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        self.sessions.delete_session(peer_id)
    }

    pub fn safety_number(&self, peer_id: &str) -> Result<String, CryptoError> {
        self.sessions.safety_number(peer_id)
    }

    /// This installation's address.
    pub fn user_hash(&self) -> Result<String, CryptoError> {
        self.account.user_hash()
    }

    /// Publish our bundle with one one-time prekey, then the rest of the pool.
    pub fn publish(&self, api: &dyn ApiClient) -> Result<(), CryptoError> {
        let bundle = self.account.prekey_bundle(None)?;
        api.publish_prekey_bundle(&bundle)?;
        let rest: Vec<PreKeyPublic> = self
            .account
            .public_prekeys()?
            .into_iter()
            .filter(|prekey| Some(prekey.key_id) != bundle.prekey.as_ref().map(|p| p.key_id))
            .collect();
        if !rest.is_empty() {
            api.upload_prekeys(&rest)?;
        }
        tracing::info!(prekeys = rest.len() + usize::from(bundle.prekey.is_some()), "bundle published");
        Ok(())
    }

    /// Rotate the signed prekey when it is older than the configured maximum
    /// age and republish the bundle. Returns the new key if one was made.
    pub fn refresh_signed_prekey(
        &self,
        api: &dyn ApiClient,
        now: u64,
    ) -> Result<Option<SignedPreKeyPublic>, CryptoError> {
        if !self.account.signed_prekey_needs_rotation(now)? {
            return Ok(None);
        }
        let rotated = self.account.rotate_signed_prekey()?;
        let mut bundle = self.account.prekey_bundle(None)?;
        // One-time keys are already on the server.
        bundle.prekey = None;
        api.publish_prekey_bundle(&bundle)?;
        Ok(Some(rotated))
    }

    /// Encrypt and send, establishing a session from the peer's published
    /// bundle first if there is none.
    pub fn send_message(
        &self,
        api: &dyn ApiClient,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<String, CryptoError> {
        if !self.sessions.has_session(peer_id)? {
            let bundle = api.fetch_prekey_bundle(peer_id)?;
            if bundle.user_hash() != peer_id {
                tracing::warn!(peer = %peer_id, "server returned a bundle for another identity");
                return Err(CryptoError::UntrustedIdentity(peer_id.to_string()));
            }
            self.sessions.establish_session(peer_id, &bundle)?;
        }
        let encrypted = self.sessions.encrypt_message(peer_id, plaintext)?;
        let message_id = api.send_ciphertext(peer_id, &encrypted.bytes)?;
        tracing::debug!(
            peer = %peer_id,
            message_number = encrypted.message_number,
            message_id = %message_id,
            "message sent"
        );
        Ok(message_id)
    }

    /// Poll, decrypt in arrival order and acknowledge what decrypted.
    ///
    /// Failed messages stay queued and are reported in the result. A failed
    /// acknowledgement does not stop the batch; the plaintext is still
    /// returned with `acked` unset. Prekeys generated by replenishment are
    /// uploaded afterwards.
    pub fn receive_messages(&self, api: &dyn ApiClient) -> Result<Vec<ReceivedMessage>, CryptoError> {
        let inbound = api.poll_messages()?;
        let mut received = Vec::with_capacity(inbound.len());

        for message in inbound {
            let plaintext = self.decrypt_from(&message.sender, &message.bytes);
            let acked = match &plaintext {
                Ok(_) => match api.ack_message(&message.id) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            peer = %message.sender,
                            message_id = %message.id,
                            error = %e,
                            "failed to acknowledge message"
                        );
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        peer = %message.sender,
                        message_id = %message.id,
                        error = %e,
                        "inbound message not decrypted"
                    );
                    false
                }
            };
            received.push(ReceivedMessage {
                id: message.id,
                sender: message.sender,
                plaintext,
                acked,
            });
        }

        let replenished = self.sessions.take_replenished_prekeys();
        if !replenished.is_empty() {
            if let Err(e) = api.upload_prekeys(&replenished) {
                // The keys stay valid locally; the server just hands out fewer.
                tracing::warn!(count = replenished.len(), error = %e, "prekey upload failed");
            }
        }
        Ok(received)
    }

    /// A bootstrap message must come from the identity its sender address names.
    fn decrypt_from(&self, sender: &str, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if let Some(header) = envelope::parse(bytes)?.prekey {
            if identity::user_hash(&header.identity_key) != sender {
                return Err(CryptoError::UntrustedIdentity(sender.to_string()));
            }
        }
        self.sessions.decrypt_message(sender, bytes)
    }

    /// Scorched earth: drop every key and session, in memory and at rest.
    ///
    /// Keeps going past storage errors and returns the first one.
    pub fn wipe_all(&self) -> Result<(), CryptoError> {
        self.sessions.wipe_all()?;
        tracing::info!("all keys and sessions wiped");
        Ok(())
    }
}
