//! In-memory implementation of [`SecureStore`].
//!
//! Suitable for tests and for embedding the crate before a platform keystore
//! is wired in. Data is lost on process exit and is not encrypted at rest.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::keychain::SecureStore;
use crate::CryptoError;

#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Names of all stored entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl SecureStore for MemorySecureStore {
    fn set_secure(&self, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get_secure(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove_secure(&self, key: &str) -> Result<(), CryptoError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
