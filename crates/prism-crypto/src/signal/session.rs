use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::CryptoError;
use crate::primitives;
use crate::signal::account::AccountManager;
use crate::signal::envelope::{self, EncryptedMessage, Envelope, PreKeyHeader};
use crate::signal::fingerprint;
use crate::signal::prekeys::{PreKeyBundle, PreKeyPublic};
use crate::signal::state::{Role, Session};
use crate::signal::store::SessionStore;
use crate::signal::{unix_now, x3dh};

/// Peers hash onto a fixed set of locks; two peers sharing one only serialize.
const PEER_LOCK_SHARDS: usize = 64;

/// Manages Signal-style sessions for 1:1 encrypted messaging.
///
/// X3DH establishes a session; a symmetric chain-key ratchet then gives each
/// message its own key. The initiator attaches its X3DH header to every
/// message until the peer answers, so the peer can build the matching
/// session from the first message it receives.
pub struct SignalSessionManager {
    account: Arc<AccountManager>,
    sessions: Arc<dyn SessionStore>,
    /// Held shared by every session read-modify-write, exclusively by wipes.
    wipe_lock: RwLock<()>,
    peer_locks: Box<[Mutex<()>]>,
    replenished: Mutex<Vec<PreKeyPublic>>,
    safety_number_iterations: u32,
}

impl SignalSessionManager {
    pub fn new(
        account: Arc<AccountManager>,
        sessions: Arc<dyn SessionStore>,
        safety_number_iterations: u32,
    ) -> Self {
        Self {
            account,
            sessions,
            wipe_lock: RwLock::new(()),
            peer_locks: (0..PEER_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
            replenished: Mutex::new(Vec::new()),
            safety_number_iterations,
        }
    }

    /// Serializes every read-modify-write of one peer's session.
    fn peer_lock(&self, peer_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        peer_id.hash(&mut hasher);
        let shard = hasher.finish() % self.peer_locks.len() as u64;
        &self.peer_locks[usize::try_from(shard).unwrap_or_default()]
    }

    /// Establish a session with a peer from their `PreKeyBundle` (initiator side).
    ///
    /// Fails with [`CryptoError::InvalidSignature`] before touching any state
    /// when the signed prekey does not verify, and with
    /// [`CryptoError::UntrustedIdentity`] when a session with a different
    /// identity key already exists.
    pub fn establish_session(&self, peer_id: &str, bundle: &PreKeyBundle) -> Result<(), CryptoError> {
        if let Err(e) = bundle.verify_signature() {
            tracing::warn!(peer = %peer_id, "signed prekey signature rejected");
            return Err(e);
        }
        let identity = self.account.identity()?;
        let remote_identity: [u8; 32] = bundle
            .identity_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;

        let _wipe = self.wipe_lock.read();
        let _guard = self.peer_lock(peer_id).lock();

        if let Some(existing) = self.sessions.get(peer_id)? {
            if existing.remote_identity != remote_identity {
                tracing::warn!(peer = %peer_id, "peer identity key changed");
                return Err(CryptoError::UntrustedIdentity(peer_id.to_string()));
            }
        }

        let initiated = x3dh::initiate(&identity, bundle)?;
        let local_identity = identity.public_key_bytes();
        let header = PreKeyHeader {
            registration_id: self.account.registration_id()?,
            signed_prekey_id: bundle.signed_prekey.key_id,
            one_time_prekey_id: bundle.prekey.as_ref().map(|prekey| prekey.key_id),
            identity_key: local_identity,
            base_key: initiated.base_key,
        };
        let session = Session::new(
            Role::Initiator,
            remote_identity,
            local_identity,
            &initiated.keys,
            initiated.base_key,
            Some(header),
            unix_now(),
        )?;
        self.sessions.put(peer_id, &session)?;

        tracing::info!(
            peer = %peer_id,
            signed_prekey_id = bundle.signed_prekey.key_id,
            one_time_prekey = bundle.prekey.is_some(),
            "session established"
        );
        Ok(())
    }

    /// Encrypt a message for an established session.
    pub fn encrypt_message(
        &self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        self.account.identity()?;

        let _wipe = self.wipe_lock.read();
        let _guard = self.peer_lock(peer_id).lock();

        let mut session = self
            .sessions
            .get(peer_id)?
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?;

        let (message_key, counter) = session.advance_sending()?;
        let header = envelope::encode_header(session.pending_prekey.as_ref(), counter);
        let aad = envelope::associated_data(
            &header,
            &session.local_identity,
            &session.remote_identity,
        );
        let (nonce, ciphertext) = primitives::seal(message_key.as_bytes(), plaintext, &aad)?;

        // Nothing is persisted until the ciphertext exists.
        self.sessions.put(peer_id, &session)?;

        let message_number = session.message_number();
        tracing::debug!(
            peer = %peer_id,
            message_number,
            prekey = session.pending_prekey.is_some(),
            "message encrypted"
        );
        Ok(EncryptedMessage {
            bytes: envelope::assemble(header, &nonce, &ciphertext),
            message_number,
        })
    }

    /// Decrypt a message from a peer.
    ///
    /// A `PreKey` message from a peer without a session creates the responder
    /// session. A `Normal` message without a session is
    /// [`CryptoError::NoSession`] and leaves no state behind.
    pub fn decrypt_message(&self, peer_id: &str, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.account.identity()?;
        let envelope = envelope::parse(bytes)?;

        let _wipe = self.wipe_lock.read();
        let _guard = self.peer_lock(peer_id).lock();

        let existing = self.sessions.get(peer_id)?;
        match (envelope.prekey, existing) {
            (None, None) => Err(CryptoError::NoSession(peer_id.to_string())),
            (None, Some(session)) => self.decrypt_with(peer_id, session, &envelope),
            (Some(header), Some(session)) if header.base_key == session.base_key => {
                self.decrypt_with(peer_id, session, &envelope)
            }
            (Some(header), Some(session)) => {
                if header.identity_key != session.remote_identity {
                    tracing::warn!(peer = %peer_id, "peer identity key changed");
                    return Err(CryptoError::UntrustedIdentity(peer_id.to_string()));
                }
                if session.has_seen_base_key(&header.base_key) {
                    tracing::warn!(peer = %peer_id, "replayed session bootstrap");
                    return Err(CryptoError::DecryptionFailed);
                }
                if session.is_unconfirmed()
                    && session.message_number() > 0
                    && session.local_identity < session.remote_identity
                {
                    // Both sides initiated; the peer adopts ours under the same rule.
                    tracing::warn!(peer = %peer_id, "rejected simultaneous session bootstrap");
                    return Err(CryptoError::DecryptionFailed);
                }
                self.bootstrap(peer_id, &header, &envelope, Some(&session))
            }
            (Some(header), None) => self.bootstrap(peer_id, &header, &envelope, None),
        }
    }

    fn decrypt_with(
        &self,
        peer_id: &str,
        mut session: Session,
        envelope: &Envelope<'_>,
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = open_on(&mut session, envelope).inspect_err(|_| {
            tracing::debug!(peer = %peer_id, counter = envelope.counter, "message rejected");
        })?;
        self.sessions.put(peer_id, &session)?;
        tracing::debug!(peer = %peer_id, counter = envelope.counter, "message decrypted");
        Ok(plaintext)
    }

    /// Responder side of X3DH, driven by the header on an incoming message.
    /// The new session remembers the base keys of `previous` and its history.
    fn bootstrap(
        &self,
        peer_id: &str,
        header: &PreKeyHeader,
        envelope: &Envelope<'_>,
        previous: Option<&Session>,
    ) -> Result<Vec<u8>, CryptoError> {
        let keys = self
            .account
            .responder_keys(header.signed_prekey_id, header.one_time_prekey_id)?;
        let output = x3dh::respond(
            &keys.identity,
            &keys.signed_prekey,
            keys.one_time_prekey.as_ref(),
            &header.identity_key,
            &header.base_key,
        )?;
        let mut session = Session::new(
            Role::Responder,
            header.identity_key,
            keys.identity.public_key_bytes(),
            &output,
            header.base_key,
            None,
            unix_now(),
        )?;
        if let Some(previous) = previous {
            session.retire(previous);
        }

        let plaintext = open_on(&mut session, envelope)?;
        self.sessions.put(peer_id, &session)?;
        tracing::info!(
            peer = %peer_id,
            signed_prekey_id = header.signed_prekey_id,
            registration_id = header.registration_id,
            "session established from incoming message"
        );

        // The session is stored; only now may the one-time key go.
        if let Some(key_id) = header.one_time_prekey_id {
            match self.account.consume_prekey(key_id) {
                Ok(fresh) => self.replenished.lock().extend(fresh),
                Err(e) => tracing::warn!(key_id, error = %e, "failed to consume one-time prekey"),
            }
        }
        Ok(plaintext)
    }

    /// Public prekeys generated by replenishment since the last call, for upload.
    pub fn take_replenished_prekeys(&self) -> Vec<PreKeyPublic> {
        std::mem::take(&mut *self.replenished.lock())
    }

    pub fn has_session(&self, peer_id: &str) -> Result<bool, CryptoError> {
        Ok(self.sessions.get(peer_id)?.is_some())
    }

    pub fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        let _wipe = self.wipe_lock.read();
        let _guard = self.peer_lock(peer_id).lock();
        self.sessions.delete(peer_id)?;
        tracing::info!(peer = %peer_id, "session deleted");
        Ok(())
    }

    /// Peers with a stored session.
    pub fn session_peers(&self) -> Result<Vec<String>, CryptoError> {
        self.sessions.peers()
    }

    /// Delete every session. Waits for in-flight session updates to finish.
    pub fn clear_sessions(&self) -> Result<(), CryptoError> {
        let _wipe = self.wipe_lock.write();
        self.sessions.clear()
    }

    /// Delete every session and all account keys.
    ///
    /// Both wipes are attempted; the first error is returned.
    pub fn wipe_all(&self) -> Result<(), CryptoError> {
        let _wipe = self.wipe_lock.write();
        let account = self.account.wipe_all();
        let sessions = self.sessions.clear();
        account.and(sessions)
    }

    /// Safety number for the session with `peer_id`.
    pub fn safety_number(&self, peer_id: &str) -> Result<String, CryptoError> {
        let local = self.account.identity_public_key()?;
        let session = self
            .sessions
            .get(peer_id)?
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?;
        fingerprint::safety_number(&local, &session.remote_identity, self.safety_number_iterations)
    }
}

/// Decrypt on `session`'s receiving chain and mark the session confirmed.
/// `session` is a working copy; the caller persists it on success.
fn open_on(session: &mut Session, envelope: &Envelope<'_>) -> Result<Vec<u8>, CryptoError> {
    let message_key = session.advance_receiving(envelope.counter)?;
    let aad = envelope::associated_data(
        envelope.header,
        &session.remote_identity,
        &session.local_identity,
    );
    let plaintext = primitives::open(
        message_key.as_bytes(),
        &envelope.nonce,
        envelope.ciphertext,
        &aad,
    )?;
    session.pending_prekey = None;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::memory_store::MemorySecureStore;
    use crate::signal::envelope::MessageKind;
    use crate::signal::store::KeychainSessionStore;
    use crate::signal::test_stores::{init_tracing, FailingStore, GatedStore};

    struct Party {
        account: Arc<AccountManager>,
        manager: SignalSessionManager,
        sessions: Arc<KeychainSessionStore>,
        id: String,
    }

    fn party_on(store: Arc<dyn crate::keychain::SecureStore>) -> Party {
        init_tracing();
        let config = ProtocolConfig {
            prekey_batch_size: 5,
            prekey_low_water_mark: 2,
            safety_number_iterations: 50,
            ..ProtocolConfig::default()
        };
        let account = Arc::new(AccountManager::new(store.clone(), config));
        account.create_account().unwrap();
        let sessions = Arc::new(KeychainSessionStore::new(store));
        let manager = SignalSessionManager::new(account.clone(), sessions.clone(), 50);
        let id = account.user_hash().unwrap();
        Party {
            account,
            manager,
            sessions,
            id,
        }
    }

    fn party() -> Party {
        party_on(Arc::new(MemorySecureStore::new()))
    }

    fn bundle_of(p: &Party) -> PreKeyBundle {
        p.account.prekey_bundle(None).unwrap()
    }

    #[test]
    fn first_message_bootstraps_responder() {
        let alice = party();
        let bob = party();

        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let first = bob.manager.encrypt_message(&alice.id, b"hello").unwrap();
        assert_eq!(first.message_number, 1);
        assert_eq!(first.kind().unwrap(), MessageKind::PreKey);

        assert_eq!(alice.manager.decrypt_message(&bob.id, &first.bytes).unwrap(), b"hello");
        assert!(alice.manager.has_session(&bob.id).unwrap());
        // One-time key 1 was used and consumed.
        assert_eq!(alice.account.prekey_count().unwrap(), 4);

        let reply = alice.manager.encrypt_message(&bob.id, b"hi bob").unwrap();
        assert_eq!(reply.kind().unwrap(), MessageKind::Normal);
        assert_eq!(bob.manager.decrypt_message(&alice.id, &reply.bytes).unwrap(), b"hi bob");

        // Confirmed: no more bootstrap headers.
        let next = bob.manager.encrypt_message(&alice.id, b"again").unwrap();
        assert_eq!(next.kind().unwrap(), MessageKind::Normal);
        assert_eq!(next.message_number, 2);
        assert_eq!(alice.manager.decrypt_message(&bob.id, &next.bytes).unwrap(), b"again");
    }

    #[test]
    fn header_repeats_until_answered() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();

        let messages: Vec<_> = (0..3)
            .map(|i| bob.manager.encrypt_message(&alice.id, format!("m{i}").as_bytes()).unwrap())
            .collect();
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.kind().unwrap(), MessageKind::PreKey);
            assert_eq!(
                alice.manager.decrypt_message(&bob.id, &message.bytes).unwrap(),
                format!("m{i}").as_bytes()
            );
        }
        assert_eq!(alice.account.prekey_count().unwrap(), 4);
    }

    #[test]
    fn normal_message_without_session_creates_nothing() {
        let alice = party();
        let bob = party();
        let carol = party();

        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let to_alice = bob.manager.encrypt_message(&alice.id, b"x").unwrap();
        alice.manager.decrypt_message(&bob.id, &to_alice.bytes).unwrap();
        let normal = alice.manager.encrypt_message(&bob.id, b"y").unwrap();

        assert!(matches!(
            carol.manager.decrypt_message(&alice.id, &normal.bytes),
            Err(CryptoError::NoSession(_))
        ));
        assert!(!carol.manager.has_session(&alice.id).unwrap());
        assert!(carol.sessions.peers().unwrap().is_empty());
    }

    #[test]
    fn encrypt_without_session_fails() {
        let alice = party();
        assert!(matches!(
            alice.manager.encrypt_message("nobody", b"x"),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn tampered_bundle_creates_no_session() {
        let alice = party();
        let bob = party();
        let mut bundle = bundle_of(&alice);
        bundle.signed_prekey.signature[10] ^= 0xFF;

        assert!(matches!(
            bob.manager.establish_session(&alice.id, &bundle),
            Err(CryptoError::InvalidSignature)
        ));
        assert!(!bob.manager.has_session(&alice.id).unwrap());
    }

    #[test]
    fn tampered_bundle_does_not_overwrite_session() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let before = bob.sessions.get(&alice.id).unwrap().unwrap().encode();

        let mut bundle = bundle_of(&alice);
        bundle.signed_prekey.public_key[0] ^= 1;
        assert!(bob.manager.establish_session(&alice.id, &bundle).is_err());
        assert_eq!(bob.sessions.get(&alice.id).unwrap().unwrap().encode(), before);
    }

    #[test]
    fn changed_identity_is_untrusted() {
        let alice = party();
        let bob = party();
        let mallory = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();

        assert!(matches!(
            bob.manager.establish_session(&alice.id, &bundle_of(&mallory)),
            Err(CryptoError::UntrustedIdentity(_))
        ));

        // Mallory bootstrapping under Alice's address is refused too.
        mallory.manager.establish_session(&bob.id, &bundle_of(&bob)).unwrap();
        let forged = mallory.manager.encrypt_message(&bob.id, b"trust me").unwrap();
        bob.manager
            .establish_session(&alice.id, &bundle_of(&alice))
            .unwrap();
        assert!(matches!(
            bob.manager.decrypt_message(&alice.id, &forged.bytes),
            Err(CryptoError::UntrustedIdentity(_))
        ));

        bob.manager.delete_session(&alice.id).unwrap();
        bob.manager.establish_session(&alice.id, &bundle_of(&mallory)).unwrap();
    }

    #[test]
    fn replay_and_tamper_rejected_without_state_change() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let first = bob.manager.encrypt_message(&alice.id, b"one").unwrap();
        alice.manager.decrypt_message(&bob.id, &first.bytes).unwrap();

        assert!(matches!(
            alice.manager.decrypt_message(&bob.id, &first.bytes),
            Err(CryptoError::DecryptionFailed)
        ));

        let second = bob.manager.encrypt_message(&alice.id, b"two").unwrap();
        let mut tampered = second.bytes.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            alice.manager.decrypt_message(&bob.id, &tampered),
            Err(CryptoError::DecryptionFailed)
        ));
        assert_eq!(alice.manager.decrypt_message(&bob.id, &second.bytes).unwrap(), b"two");
    }

    #[test]
    fn dropped_message_desynchronizes() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let first = bob.manager.encrypt_message(&alice.id, b"one").unwrap();
        alice.manager.decrypt_message(&bob.id, &first.bytes).unwrap();

        let _lost = bob.manager.encrypt_message(&alice.id, b"lost").unwrap();
        let third = bob.manager.encrypt_message(&alice.id, b"three").unwrap();
        assert!(matches!(
            alice.manager.decrypt_message(&bob.id, &third.bytes),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn simultaneous_initiation_converges() {
        let alice = party();
        let bob = party();

        alice.manager.establish_session(&bob.id, &bundle_of(&bob)).unwrap();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let from_alice = alice.manager.encrypt_message(&bob.id, b"from alice").unwrap();
        let from_bob = bob.manager.encrypt_message(&alice.id, b"from bob").unwrap();

        let at_bob = bob.manager.decrypt_message(&alice.id, &from_alice.bytes);
        let at_alice = alice.manager.decrypt_message(&bob.id, &from_bob.bytes);
        // Exactly one bootstrap wins.
        assert!(at_bob.is_ok() != at_alice.is_ok());

        let a_session = alice.sessions.get(&bob.id).unwrap().unwrap();
        let b_session = bob.sessions.get(&alice.id).unwrap().unwrap();
        assert_eq!(a_session.base_key(), b_session.base_key());

        let ping = alice.manager.encrypt_message(&bob.id, b"ping").unwrap();
        assert_eq!(bob.manager.decrypt_message(&alice.id, &ping.bytes).unwrap(), b"ping");
        let pong = bob.manager.encrypt_message(&alice.id, b"pong").unwrap();
        assert_eq!(alice.manager.decrypt_message(&bob.id, &pong.bytes).unwrap(), b"pong");
    }

    #[test]
    fn simultaneous_initiation_before_sending_adopts_peer() {
        let alice = party();
        let bob = party();
        alice.manager.establish_session(&bob.id, &bundle_of(&bob)).unwrap();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();

        let from_bob = bob.manager.encrypt_message(&alice.id, b"first").unwrap();
        assert_eq!(alice.manager.decrypt_message(&bob.id, &from_bob.bytes).unwrap(), b"first");
        let reply = alice.manager.encrypt_message(&bob.id, b"reply").unwrap();
        assert_eq!(reply.kind().unwrap(), MessageKind::Normal);
        assert_eq!(bob.manager.decrypt_message(&alice.id, &reply.bytes).unwrap(), b"reply");
    }

    #[test]
    fn failed_persist_keeps_old_state() {
        let store = Arc::new(FailingStore::new());
        let alice = party();
        let bob = party_on(store.clone());
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();

        store.fail_writes(true);
        assert!(bob.manager.encrypt_message(&alice.id, b"x").is_err());
        store.fail_writes(false);

        let retry = bob.manager.encrypt_message(&alice.id, b"y").unwrap();
        assert_eq!(retry.message_number, 1);
        assert_eq!(alice.manager.decrypt_message(&bob.id, &retry.bytes).unwrap(), b"y");
    }

    #[test]
    fn consumed_prekeys_trigger_replenishment() {
        let alice = party();
        for _ in 0..4 {
            let bob = party();
            let bundle = alice.account.prekey_bundle(None).unwrap();
            bob.manager.establish_session(&alice.id, &bundle).unwrap();
            let hello = bob.manager.encrypt_message(&alice.id, b"hello").unwrap();
            alice.manager.decrypt_message(&bob.id, &hello.bytes).unwrap();
        }
        // 5 -> 1 left, below the mark of 2: topped back up to 5 once.
        let fresh = alice.manager.take_replenished_prekeys();
        assert_eq!(fresh.len(), 4);
        assert!(alice.manager.take_replenished_prekeys().is_empty());
        assert_eq!(alice.account.prekey_count().unwrap(), 5);
    }

    #[test]
    fn safety_numbers_match() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let hello = bob.manager.encrypt_message(&alice.id, b"hello").unwrap();
        alice.manager.decrypt_message(&bob.id, &hello.bytes).unwrap();

        let from_alice = alice.manager.safety_number(&bob.id).unwrap();
        let from_bob = bob.manager.safety_number(&alice.id).unwrap();
        assert_eq!(from_alice, from_bob);
        assert!(matches!(
            alice.manager.safety_number("stranger"),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn concurrent_encrypts_never_reuse_a_counter() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let bob = Arc::new(bob);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bob = Arc::clone(&bob);
                let peer = alice.id.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| bob.manager.encrypt_message(&peer, b"x").unwrap().message_number)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut numbers: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=200).collect::<Vec<u32>>());
    }

    #[test]
    fn replayed_old_bootstrap_does_not_replace_session() {
        let alice = party();
        let bob = party();
        let without_prekey = || {
            let mut bundle = bundle_of(&alice);
            bundle.prekey = None;
            bundle
        };

        bob.manager.establish_session(&alice.id, &without_prekey()).unwrap();
        let old = bob.manager.encrypt_message(&alice.id, b"old").unwrap();
        assert_eq!(alice.manager.decrypt_message(&bob.id, &old.bytes).unwrap(), b"old");

        // Bob starts over; Alice adopts the new session.
        bob.manager.delete_session(&alice.id).unwrap();
        bob.manager.establish_session(&alice.id, &without_prekey()).unwrap();
        let new = bob.manager.encrypt_message(&alice.id, b"new").unwrap();
        assert_eq!(alice.manager.decrypt_message(&bob.id, &new.bytes).unwrap(), b"new");
        let live = alice.sessions.get(&bob.id).unwrap().unwrap().encode();

        assert!(matches!(
            alice.manager.decrypt_message(&bob.id, &old.bytes),
            Err(CryptoError::DecryptionFailed)
        ));
        assert_eq!(alice.sessions.get(&bob.id).unwrap().unwrap().encode(), live);

        let next = bob.manager.encrypt_message(&alice.id, b"next").unwrap();
        assert_eq!(alice.manager.decrypt_message(&bob.id, &next.bytes).unwrap(), b"next");
    }

    #[test]
    fn clear_waits_for_in_flight_encrypt() {
        let store = Arc::new(GatedStore::new());
        let alice = party();
        let bob = party_on(store.clone());
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();
        let bob = Arc::new(bob);

        let (entered, release) = store.arm("signal/session/");
        let sender = {
            let bob = Arc::clone(&bob);
            let peer = alice.id.clone();
            std::thread::spawn(move || bob.manager.encrypt_message(&peer, b"x"))
        };
        // The encrypt has loaded the session and not yet written it back.
        entered.recv().unwrap();
        let wiper = {
            let bob = Arc::clone(&bob);
            std::thread::spawn(move || bob.manager.clear_sessions())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        release.send(()).unwrap();

        sender.join().unwrap().unwrap();
        wiper.join().unwrap().unwrap();
        assert!(bob.sessions.peers().unwrap().is_empty());
        assert!(bob.sessions.get(&alice.id).unwrap().is_none());
        assert!(!bob.manager.has_session(&alice.id).unwrap());
    }

    #[test]
    fn wipe_all_clears_account_and_sessions() {
        let alice = party();
        let bob = party();
        bob.manager.establish_session(&alice.id, &bundle_of(&alice)).unwrap();

        bob.manager.wipe_all().unwrap();
        assert!(!bob.account.is_initialized());
        assert!(bob.sessions.peers().unwrap().is_empty());
        assert!(matches!(
            bob.manager.encrypt_message(&alice.id, b"x"),
            Err(CryptoError::AccountNotInitialized)
        ));
    }

    #[test]
    fn peer_lock_table_stays_fixed() {
        let alice = party();
        for i in 0..1000 {
            alice.manager.delete_session(&format!("peer-{i}")).unwrap();
        }
        assert_eq!(alice.manager.peer_locks.len(), PEER_LOCK_SHARDS);
        assert!(std::ptr::eq(
            alice.manager.peer_lock("peer-7"),
            alice.manager.peer_lock("peer-7")
        ));
    }
}
