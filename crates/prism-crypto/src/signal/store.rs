use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{Reader, Writer};
use crate::keychain::{session_key_name, SecureStore, KEY_SESSION_INDEX};
use crate::signal::state::Session;
use crate::CryptoError;

/// Repository of sessions, one per peer.
///
/// Each call returns an independent copy; changes only take effect through
/// [`SessionStore::put`].
pub trait SessionStore: Send + Sync {
    /// Load the session with a peer.
    fn get(&self, peer_id: &str) -> Result<Option<Session>, CryptoError>;

    /// Store the session with a peer, replacing any previous one.
    fn put(&self, peer_id: &str, session: &Session) -> Result<(), CryptoError>;

    /// Delete the session with a peer. Deleting a missing session is not an error.
    fn delete(&self, peer_id: &str) -> Result<(), CryptoError>;

    /// Peers with a stored session, sorted.
    fn peers(&self) -> Result<Vec<String>, CryptoError>;

    /// Delete every session.
    fn clear(&self) -> Result<(), CryptoError>;
}

/// [`SessionStore`] persisted in a [`SecureStore`], one entry per peer plus
/// an index of peer ids.
pub struct KeychainSessionStore {
    store: Arc<dyn SecureStore>,
    index_lock: Mutex<()>,
}

impl KeychainSessionStore {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            index_lock: Mutex::new(()),
        }
    }

    fn load_index(&self) -> Result<Vec<String>, CryptoError> {
        let Some(bytes) = self.store.get_secure(KEY_SESSION_INDEX)? else {
            return Ok(Vec::new());
        };
        let mut r = Reader::new(&bytes, CryptoError::CorruptState);
        let count = r.u32()?;
        let mut peers = Vec::new();
        for _ in 0..count {
            let peer = std::str::from_utf8(r.var_bytes()?)
                .map_err(|e| CryptoError::CorruptState(format!("session index: {e}")))?;
            peers.push(peer.to_string());
        }
        r.finish()?;
        Ok(peers)
    }

    fn save_index(&self, peers: &[String]) -> Result<(), CryptoError> {
        if peers.is_empty() {
            return self.store.remove_secure(KEY_SESSION_INDEX);
        }
        let count = u32::try_from(peers.len())
            .map_err(|_| CryptoError::StorageFailure("session index too large".into()))?;
        let mut w = Writer::default();
        w.u32(count);
        for peer in peers {
            w.var_bytes(peer.as_bytes())?;
        }
        self.store.set_secure(KEY_SESSION_INDEX, &w.finish())
    }
}

impl SessionStore for KeychainSessionStore {
    fn get(&self, peer_id: &str) -> Result<Option<Session>, CryptoError> {
        self.store
            .get_secure(&session_key_name(peer_id))?
            .map(|bytes| Session::decode(&zeroize::Zeroizing::new(bytes)))
            .transpose()
    }

    fn put(&self, peer_id: &str, session: &Session) -> Result<(), CryptoError> {
        if peer_id.is_empty() {
            return Err(CryptoError::StorageFailure("empty peer id".into()));
        }
        {
            // Index first: a stale index entry is harmless, an unindexed
            // session would survive `clear`.
            let _guard = self.index_lock.lock();
            let mut peers = self.load_index()?;
            if let Err(pos) = peers.binary_search_by(|p| p.as_str().cmp(peer_id)) {
                peers.insert(pos, peer_id.to_string());
                self.save_index(&peers)?;
            }
        }
        let encoded = zeroize::Zeroizing::new(session.encode());
        self.store.set_secure(&session_key_name(peer_id), &encoded)
    }

    fn delete(&self, peer_id: &str) -> Result<(), CryptoError> {
        self.store.remove_secure(&session_key_name(peer_id))?;
        let _guard = self.index_lock.lock();
        let mut peers = self.load_index()?;
        if let Ok(pos) = peers.binary_search_by(|p| p.as_str().cmp(peer_id)) {
            peers.remove(pos);
            self.save_index(&peers)?;
        }
        Ok(())
    }

    fn peers(&self) -> Result<Vec<String>, CryptoError> {
        let _guard = self.index_lock.lock();
        let mut peers = self.load_index()?;
        peers.retain(|peer| {
            self.store
                .get_secure(&session_key_name(peer))
                .is_ok_and(|entry| entry.is_some())
        });
        Ok(peers)
    }

    fn clear(&self) -> Result<(), CryptoError> {
        let _guard = self.index_lock.lock();
        let peers = self.load_index()?;

        let mut first_error = None;
        for peer in &peers {
            if let Err(e) = self.store.remove_secure(&session_key_name(peer)) {
                tracing::warn!(peer = %peer, error = %e, "failed to remove session");
                first_error.get_or_insert(e);
            }
        }
        if first_error.is_none() {
            self.store.remove_secure(KEY_SESSION_INDEX)?;
        }
        tracing::debug!(sessions = peers.len(), "sessions cleared");
        first_error.map_or(Ok(()), Err)
    }
}
