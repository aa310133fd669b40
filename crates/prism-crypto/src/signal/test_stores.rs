use std::sync::{mpsc, Once};

use parking_lot::Mutex;

use crate::keychain::SecureStore;
use crate::memory_store::MemorySecureStore;
use crate::CryptoError;

/// Secure store whose writes can be switched to fail, for atomicity tests.
#[derive(Default)]
pub struct FailingStore {
    inner: MemorySecureStore,
    /// Writes still allowed before failing; `None` means unlimited.
    write_budget: Mutex<Option<usize>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set_secure` / `remove_secure` fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.write_budget.lock() = fail.then_some(0);
    }

    /// Allow `count` more writes, then fail the rest.
    pub fn fail_writes_after(&self, count: usize) {
        *self.write_budget.lock() = Some(count);
    }

    fn check(&self) -> Result<(), CryptoError> {
        match self.write_budget.lock().as_mut() {
            Some(0) => Err(CryptoError::StorageFailure("injected write failure".into())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl SecureStore for FailingStore {
    fn set_secure(&self, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.check()?;
        self.inner.set_secure(key, data)
    }

    fn get_secure(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.inner.get_secure(key)
    }

    fn remove_secure(&self, key: &str) -> Result<(), CryptoError> {
        self.check()?;
        self.inner.remove_secure(key)
    }
}

/// Secure store that parks the first read of a matching key until released,
/// for interleaving tests.
#[derive(Default)]
pub struct GatedStore {
    inner: MemorySecureStore,
    gate: Mutex<Option<Gate>>,
}

struct Gate {
    prefix: String,
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the next read of a key starting with `prefix`. The returned
    /// receiver fires once the read is parked; sending on the returned
    /// sender lets it continue.
    pub fn arm(&self, prefix: &str) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock() = Some(Gate {
            prefix: prefix.to_string(),
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

impl SecureStore for GatedStore {
    fn set_secure(&self, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.inner.set_secure(key, data)
    }

    fn get_secure(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let gate = {
            let mut gate = self.gate.lock();
            if gate.as_ref().is_some_and(|g| key.starts_with(&g.prefix)) {
                gate.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        self.inner.get_secure(key)
    }

    fn remove_secure(&self, key: &str) -> Result<(), CryptoError> {
        self.inner.remove_secure(key)
    }
}

/// Route `tracing` output through the test harness, once per binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
