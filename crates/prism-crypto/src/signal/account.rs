use std::sync::Arc;

use parking_lot::Mutex;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::codec::{Reader, Writer};
use crate::config::ProtocolConfig;
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, RegistrationId};
use crate::keychain::{
    SecureStore, ACCOUNT_KEYS, KEY_IDENTITY, KEY_PREKEY_POOL, KEY_REGISTRATION_ID,
    KEY_SIGNED_PREKEY,
};
use crate::signal::prekeys::{
    PreKeyBundle, PreKeyPool, PreKeyPublic, SignedPreKeyPair, SignedPreKeyPublic, MAX_PREKEY_ID,
};
use crate::signal::unix_now;

/// Owns the local identity, registration id, signed prekeys and the
/// one-time prekey pool, and keeps them in sync with the secure store.
///
/// The identity entry is written last and removed first, so a store that
/// holds an identity always holds a complete account.
pub struct AccountManager {
    store: Arc<dyn SecureStore>,
    config: ProtocolConfig,
    state: Mutex<Option<AccountState>>,
}

struct AccountState {
    identity: Arc<IdentityKeyPair>,
    registration_id: RegistrationId,
    signed_prekey: SignedPreKeyPair,
    previous_signed_prekey: Option<SignedPreKeyPair>,
    pool: PreKeyPool,
}

/// Private keys the responder side of X3DH needs, copied out of the account.
pub(crate) struct ResponderKeys {
    pub(crate) identity: Arc<IdentityKeyPair>,
    pub(crate) signed_prekey: StaticSecret,
    pub(crate) one_time_prekey: Option<StaticSecret>,
}

impl AccountManager {
    pub fn new(store: Arc<dyn SecureStore>, config: ProtocolConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(None),
        }
    }

    /// Load the persisted account, if any. Returns whether an account is loaded.
    ///
    /// Safe to call repeatedly; an already-loaded account is left untouched.
    pub fn initialize(&self) -> Result<bool, CryptoError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(true);
        }
        match load_state(self.store.as_ref())? {
            Some(loaded) => {
                tracing::info!(
                    user = %loaded.identity.user_hash(),
                    prekeys = loaded.pool.len(),
                    "account loaded"
                );
                *state = Some(loaded);
                Ok(true)
            }
            None => {
                tracing::debug!("no persisted account");
                Ok(false)
            }
        }
    }

    /// Create a fresh identity, signed prekey and one-time prekey batch.
    pub fn create_account(&self) -> Result<PreKeyBundle, CryptoError> {
        self.create_with(IdentityKeyPair::generate()?)
    }

    /// Create the account from a 64-byte recovery seed, so the identity key
    /// matches the one originally derived from the same mnemonic.
    pub fn create_account_from_seed(&self, seed: &[u8; 64]) -> Result<PreKeyBundle, CryptoError> {
        self.create_with(IdentityKeyPair::from_seed(seed)?)
    }

    /// Wipe any existing account, then create a new one.
    pub fn recreate_account(&self) -> Result<PreKeyBundle, CryptoError> {
        self.wipe_all()?;
        self.create_account()
    }

    fn create_with(&self, identity: IdentityKeyPair) -> Result<PreKeyBundle, CryptoError> {
        let mut state = self.state.lock();
        if state.is_some() || self.store.get_secure(KEY_IDENTITY)?.is_some() {
            return Err(CryptoError::AccountAlreadyExists);
        }

        let registration_id = RegistrationId::generate()?;
        let signed_prekey = SignedPreKeyPair::generate(1, &identity, unix_now())?;
        let mut pool = PreKeyPool::default();
        pool.generate_range(1, self.config.prekey_batch_size)?;

        let created = AccountState {
            identity: Arc::new(identity),
            registration_id,
            signed_prekey,
            previous_signed_prekey: None,
            pool,
        };
        persist_state(self.store.as_ref(), &created)?;

        let bundle = created.bundle(self.config.device_id, None);
        tracing::info!(
            user = %created.identity.user_hash(),
            registration_id = registration_id.value(),
            prekeys = created.pool.len(),
            "account created"
        );
        *state = Some(created);
        Ok(bundle)
    }

    /// The public bundle. `prekey_id` selects a specific one-time key when it
    /// is still in the pool; otherwise any available key is included.
    pub fn prekey_bundle(&self, prekey_id: Option<u32>) -> Result<PreKeyBundle, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;
        Ok(state.bundle(self.config.device_id, prekey_id))
    }

    /// Add `count` one-time prekeys with ids starting at `start_id` and
    /// persist the pool. Returns the public halves for upload.
    pub fn generate_prekeys(
        &self,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<PreKeyPublic>, CryptoError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(CryptoError::AccountNotInitialized)?;

        let mut pool = state.pool.clone();
        let published = pool.generate_range(start_id, count)?;
        self.store.set_secure(KEY_PREKEY_POOL, &pool.encode()?)?;
        state.pool = pool;

        tracing::debug!(start_id, count, total = state.pool.len(), "prekeys generated");
        Ok(published)
    }

    /// Remove a one-time prekey after use. When the pool falls below the
    /// low-water mark it is topped back up to the batch size; the new public
    /// keys are returned so the caller can upload them.
    pub fn consume_prekey(&self, key_id: u32) -> Result<Vec<PreKeyPublic>, CryptoError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(CryptoError::AccountNotInitialized)?;

        let mut pool = state.pool.clone();
        pool.remove(key_id)
            .ok_or(CryptoError::PreKeyNotFound(key_id))?;

        let remaining = u32::try_from(pool.len()).unwrap_or(u32::MAX);
        let replenished = if remaining < self.config.prekey_low_water_mark {
            pool.replenish(self.config.prekey_batch_size.saturating_sub(remaining))?
        } else {
            Vec::new()
        };

        self.store.set_secure(KEY_PREKEY_POOL, &pool.encode()?)?;
        state.pool = pool;

        tracing::debug!(
            key_id,
            remaining = state.pool.len(),
            replenished = replenished.len(),
            "prekey consumed"
        );
        Ok(replenished)
    }

    /// Replace the signed prekey, keeping the current one as the previous key
    /// so bootstrap messages already in flight still decrypt.
    pub fn rotate_signed_prekey(&self) -> Result<SignedPreKeyPublic, CryptoError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(CryptoError::AccountNotInitialized)?;

        let current_id = state.signed_prekey.key_id();
        let next_id = if current_id >= MAX_PREKEY_ID {
            1
        } else {
            current_id + 1
        };
        let rotated = SignedPreKeyPair::generate(next_id, &state.identity, unix_now())?;

        self.store.set_secure(
            KEY_SIGNED_PREKEY,
            &encode_signed_prekeys(&rotated, Some(&state.signed_prekey))?,
        )?;

        let public = rotated.to_public();
        let retired = std::mem::replace(&mut state.signed_prekey, rotated);
        state.previous_signed_prekey = Some(retired);

        tracing::info!(key_id = next_id, previous = current_id, "signed prekey rotated");
        Ok(public)
    }

    /// Whether the signed prekey is older than the configured maximum age.
    pub fn signed_prekey_needs_rotation(&self, now: u64) -> Result<bool, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;
        Ok(state
            .signed_prekey
            .is_expired(now, self.config.signed_prekey_max_age_secs))
    }

    /// Drop every account key from memory, then from the secure store.
    ///
    /// All entries are attempted even if one removal fails; the first error
    /// is returned.
    pub fn wipe_all(&self) -> Result<(), CryptoError> {
        self.state.lock().take();

        let mut first_error = None;
        for key in ACCOUNT_KEYS.iter().rev() {
            if let Err(e) = self.store.remove_secure(key) {
                tracing::warn!(key, error = %e, "failed to remove account key");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!("account wiped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn identity_public_key(&self) -> Result<[u8; 32], CryptoError> {
        Ok(self.identity()?.public_key_bytes())
    }

    pub fn registration_id(&self) -> Result<u32, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;
        Ok(state.registration_id.value())
    }

    /// This account's peer address.
    pub fn user_hash(&self) -> Result<String, CryptoError> {
        Ok(self.identity()?.user_hash())
    }

    /// Number of one-time prekeys left in the pool.
    pub fn prekey_count(&self) -> Result<usize, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;
        Ok(state.pool.len())
    }

    /// Public halves of every one-time prekey in the pool, lowest id first.
    pub fn public_prekeys(&self) -> Result<Vec<PreKeyPublic>, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;
        Ok(state.pool.public_keys())
    }

    pub fn device_id(&self) -> u32 {
        self.config.device_id
    }

    pub(crate) fn identity(&self) -> Result<Arc<IdentityKeyPair>, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;
        Ok(Arc::clone(&state.identity))
    }

    /// Copy out the private keys named by an incoming bootstrap header.
    /// The one-time key stays in the pool until [`Self::consume_prekey`].
    pub(crate) fn responder_keys(
        &self,
        signed_prekey_id: u32,
        one_time_prekey_id: Option<u32>,
    ) -> Result<ResponderKeys, CryptoError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(CryptoError::AccountNotInitialized)?;

        let signed_prekey = if state.signed_prekey.key_id() == signed_prekey_id {
            &state.signed_prekey
        } else {
            state
                .previous_signed_prekey
                .as_ref()
                .filter(|previous| previous.key_id() == signed_prekey_id)
                .ok_or(CryptoError::PreKeyNotFound(signed_prekey_id))?
        };

        let one_time_prekey = one_time_prekey_id
            .map(|id| {
                state
                    .pool
                    .get(id)
                    .map(|pair| pair.secret().clone())
                    .ok_or(CryptoError::PreKeyNotFound(id))
            })
            .transpose()?;

        Ok(ResponderKeys {
            identity: Arc::clone(&state.identity),
            signed_prekey: signed_prekey.pair().secret().clone(),
            one_time_prekey,
        })
    }
}

impl AccountState {
    fn bundle(&self, device_id: u32, prekey_id: Option<u32>) -> PreKeyBundle {
        let prekey = prekey_id
            .and_then(|id| self.pool.get(id))
            .or_else(|| self.pool.first())
            .map(|pair| pair.to_public());
        PreKeyBundle {
            registration_id: self.registration_id.value(),
            device_id,
            identity_key: self.identity.public_key_bytes().to_vec(),
            signed_prekey: self.signed_prekey.to_public(),
            prekey,
        }
    }
}

fn persist_state(store: &dyn SecureStore, state: &AccountState) -> Result<(), CryptoError> {
    store.set_secure(KEY_PREKEY_POOL, &state.pool.encode()?)?;
    store.set_secure(
        KEY_SIGNED_PREKEY,
        &encode_signed_prekeys(
            &state.signed_prekey,
            state.previous_signed_prekey.as_ref(),
        )?,
    )?;
    store.set_secure(
        KEY_REGISTRATION_ID,
        &state.registration_id.value().to_le_bytes(),
    )?;
    // Commit marker.
    store.set_secure(KEY_IDENTITY, state.identity.secret_key_bytes())
}

fn load_state(store: &dyn SecureStore) -> Result<Option<AccountState>, CryptoError> {
    let Some(identity_bytes) = store.get_secure(KEY_IDENTITY)? else {
        return Ok(None);
    };
    let identity_bytes = Zeroizing::new(identity_bytes);
    let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
        identity_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::CorruptState("identity key must be 32 bytes".into()))?,
    );
    let identity = IdentityKeyPair::from_secret_bytes(&secret);

    let registration_bytes = required(store, KEY_REGISTRATION_ID)?;
    let registration_id = RegistrationId::new(u32::from_le_bytes(
        registration_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::CorruptState("registration id must be 4 bytes".into()))?,
    ))
    .map_err(|e| CryptoError::CorruptState(e.to_string()))?;

    let (signed_prekey, previous_signed_prekey) =
        decode_signed_prekeys(&required(store, KEY_SIGNED_PREKEY)?)?;
    let pool = PreKeyPool::decode(&required(store, KEY_PREKEY_POOL)?)?;

    Ok(Some(AccountState {
        identity: Arc::new(identity),
        registration_id,
        signed_prekey,
        previous_signed_prekey,
        pool,
    }))
}

/// `current | has_previous:u8 | [previous]`, each length-prefixed.
fn encode_signed_prekeys(
    current: &SignedPreKeyPair,
    previous: Option<&SignedPreKeyPair>,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let current = Zeroizing::new(current.encode());
    let mut w = Writer::with_capacity(256);
    w.var_bytes(&current)?.u8(u8::from(previous.is_some()));
    if let Some(previous) = previous {
        w.var_bytes(&Zeroizing::new(previous.encode()))?;
    }
    Ok(Zeroizing::new(w.finish()))
}

fn decode_signed_prekeys(
    data: &[u8],
) -> Result<(SignedPreKeyPair, Option<SignedPreKeyPair>), CryptoError> {
    let mut r = Reader::new(data, CryptoError::CorruptState);
    let current = SignedPreKeyPair::decode(r.var_bytes()?)?;
    let previous = if r.flag()? {
        Some(SignedPreKeyPair::decode(r.var_bytes()?)?)
    } else {
        None
    };
    r.finish()?;
    Ok((current, previous))
}

fn required(store: &dyn SecureStore, key: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    store
        .get_secure(key)?
        .map(Zeroizing::new)
        .ok_or_else(|| CryptoError::CorruptState(format!("identity present but {key} missing")))
}
