//! Network/API collaborator contract and an in-process relay.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::signal::prekeys::{PreKeyBundle, PreKeyPublic};

/// Request/response operations the messaging core needs from the backend.
///
/// Peers are addressed by user hash. Transport, retries and authentication
/// belong to the implementation.
pub trait ApiClient: Send + Sync {
    /// Fetch a peer's bundle. The server hands out one unused one-time prekey.
    fn fetch_prekey_bundle(&self, peer_id: &str) -> Result<PreKeyBundle, CryptoError>;

    /// Publish (or replace) our bundle.
    fn publish_prekey_bundle(&self, bundle: &PreKeyBundle) -> Result<(), CryptoError>;

    /// Add one-time prekeys to our published set.
    fn upload_prekeys(&self, prekeys: &[PreKeyPublic]) -> Result<(), CryptoError>;

    /// Queue ciphertext for a peer. Returns the message id.
    fn send_ciphertext(&self, peer_id: &str, bytes: &[u8]) -> Result<String, CryptoError>;

    /// Messages waiting for us, oldest first.
    fn poll_messages(&self) -> Result<Vec<InboundMessage>, CryptoError>;

    /// Remove a delivered message from our queue.
    fn ack_message(&self, message_id: &str) -> Result<(), CryptoError>;
}

/// A queued message as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Sender's user hash.
    pub sender: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct RelayState {
    bundles: HashMap<String, PreKeyBundle>,
    prekeys: HashMap<String, BTreeMap<u32, PreKeyPublic>>,
    queues: HashMap<String, VecDeque<InboundMessage>>,
    next_message_id: u64,
}

/// In-memory stand-in for the backend, shared by every client in a process.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client authenticated as `user_hash`.
    pub fn client(&self, user_hash: &str) -> RelayClient {
        RelayClient {
            relay: self.clone(),
            user: user_hash.to_string(),
        }
    }

    /// Unused one-time prekeys the relay holds for `user_hash`.
    pub fn available_prekeys(&self, user_hash: &str) -> usize {
        self.state
            .lock()
            .prekeys
            .get(user_hash)
            .map_or(0, BTreeMap::len)
    }

    /// Messages queued for `user_hash`.
    pub fn queued(&self, user_hash: &str) -> usize {
        self.state.lock().queues.get(user_hash).map_or(0, VecDeque::len)
    }
}

/// [`ApiClient`] for one user of a [`MemoryRelay`].
pub struct RelayClient {
    relay: MemoryRelay,
    user: String,
}

impl RelayClient {
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl ApiClient for RelayClient {
    fn fetch_prekey_bundle(&self, peer_id: &str) -> Result<PreKeyBundle, CryptoError> {
        let mut state = self.relay.state.lock();
        let mut bundle = state
            .bundles
            .get(peer_id)
            .cloned()
            .ok_or_else(|| CryptoError::Transport(format!("unknown user {peer_id}")))?;
        bundle.prekey = state
            .prekeys
            .get_mut(peer_id)
            .and_then(BTreeMap::pop_first)
            .map(|(_, prekey)| prekey);
        tracing::debug!(
            peer = %peer_id,
            prekey_id = bundle.prekey.as_ref().map(|p| p.key_id),
            "relay served bundle"
        );
        Ok(bundle)
    }

    fn publish_prekey_bundle(&self, bundle: &PreKeyBundle) -> Result<(), CryptoError> {
        if bundle.user_hash() != self.user {
            return Err(CryptoError::Transport(
                "bundle identity does not match the authenticated user".into(),
            ));
        }
        bundle.verify_signature()?;

        let mut state = self.relay.state.lock();
        let mut stored = bundle.clone();
        if let Some(prekey) = stored.prekey.take() {
            state
                .prekeys
                .entry(self.user.clone())
                .or_default()
                .insert(prekey.key_id, prekey);
        }
        state.bundles.insert(self.user.clone(), stored);
        Ok(())
    }

    fn upload_prekeys(&self, prekeys: &[PreKeyPublic]) -> Result<(), CryptoError> {
        let mut state = self.relay.state.lock();
        if !state.bundles.contains_key(&self.user) {
            return Err(CryptoError::Transport("publish a bundle first".into()));
        }
        let pool = state.prekeys.entry(self.user.clone()).or_default();
        for prekey in prekeys {
            pool.insert(prekey.key_id, prekey.clone());
        }
        Ok(())
    }

    fn send_ciphertext(&self, peer_id: &str, bytes: &[u8]) -> Result<String, CryptoError> {
        let mut state = self.relay.state.lock();
        if !state.bundles.contains_key(peer_id) {
            return Err(CryptoError::Transport(format!("unknown user {peer_id}")));
        }
        state.next_message_id += 1;
        let id = format!("msg-{}", state.next_message_id);
        state
            .queues
            .entry(peer_id.to_string())
            .or_default()
            .push_back(InboundMessage {
                id: id.clone(),
                sender: self.user.clone(),
                bytes: bytes.to_vec(),
            });
        Ok(id)
    }

    fn poll_messages(&self) -> Result<Vec<InboundMessage>, CryptoError> {
        let state = self.relay.state.lock();
        Ok(state
            .queues
            .get(&self.user)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn ack_message(&self, message_id: &str) -> Result<(), CryptoError> {
        let mut state = self.relay.state.lock();
        let queue = state
            .queues
            .get_mut(&self.user)
            .ok_or_else(|| CryptoError::Transport(format!("unknown message {message_id}")))?;
        let position = queue
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| CryptoError::Transport(format!("unknown message {message_id}")))?;
        queue.remove(position);
        Ok(())
    }
}
