//! Pre-key types, the public bundle, and the persisted one-time pool.
//!
//! Pre-key bundles are published through the API client so that peers can
//! establish a session with us while we are offline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::codec::{Reader, Writer};
use crate::error::CryptoError;
use crate::identity::{self, IdentityKeyPair};
use crate::primitives;

/// Prekey ids are 24-bit and wrap back to 1.
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFF;

const POOL_FORMAT: u8 = 1;
const SIGNED_FORMAT: u8 = 1;

/// A Curve25519 prekey with its id.
#[derive(Clone)]
pub struct PreKeyPair {
    key_id: u32,
    secret: StaticSecret,
    public: X25519Public,
}

impl PreKeyPair {
    pub fn generate(key_id: u32) -> Result<Self, CryptoError> {
        Ok(Self::from_secret(key_id, primitives::random_bytes::<32>()?))
    }

    pub(crate) fn from_secret(key_id: u32, secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = X25519Public::from(&secret);
        Self {
            key_id,
            secret,
            public,
        }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn to_public(&self) -> PreKeyPublic {
        PreKeyPublic {
            key_id: self.key_id,
            public_key: self.public.as_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyPair")
            .field("key_id", &self.key_id)
            .field("public_key", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// A prekey signed by the identity key, plus its creation time.
#[derive(Clone, Debug)]
pub struct SignedPreKeyPair {
    pair: PreKeyPair,
    signature: [u8; 64],
    timestamp: u64,
}

impl SignedPreKeyPair {
    /// Generate a prekey and sign its public key with `identity`.
    pub fn generate(
        key_id: u32,
        identity: &IdentityKeyPair,
        timestamp: u64,
    ) -> Result<Self, CryptoError> {
        let pair = PreKeyPair::generate(key_id)?;
        let signature = identity.sign(&pair.public_key_bytes()).to_bytes();
        Ok(Self {
            pair,
            signature,
            timestamp,
        })
    }

    pub fn key_id(&self) -> u32 {
        self.pair.key_id
    }

    pub fn pair(&self) -> &PreKeyPair {
        &self.pair
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Whether the key is older than `max_age_secs` at `now`.
    pub fn is_expired(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(self.timestamp) > max_age_secs
    }

    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            key_id: self.pair.key_id,
            public_key: self.pair.public.as_bytes().to_vec(),
            signature: self.signature.to_vec(),
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(1 + 4 + 32 + 64 + 8);
        w.u8(SIGNED_FORMAT)
            .u32(self.pair.key_id)
            .bytes(self.pair.secret.as_bytes())
            .bytes(&self.signature)
            .u64(self.timestamp);
        w.finish()
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut r = Reader::new(data, CryptoError::CorruptState);
        let format = r.u8()?;
        if format != SIGNED_FORMAT {
            return Err(CryptoError::CorruptState(format!(
                "unknown signed prekey format {format}"
            )));
        }
        let key_id = r.u32()?;
        let secret = zeroize::Zeroizing::new(r.array::<32>()?);
        let signature = r.array::<64>()?;
        let timestamp = r.u64()?;
        r.finish()?;
        Ok(Self {
            pair: PreKeyPair::from_secret(key_id, *secret),
            signature,
            timestamp,
        })
    }
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyPublic {
    pub key_id: u32,
    /// X25519 public key (32 bytes).
    pub public_key: Vec<u8>,
}

/// Public half of a signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    /// X25519 public key (32 bytes).
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key` by the identity key.
    pub signature: Vec<u8>,
}

/// The public keys a peer needs to establish a session with us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    pub signed_prekey: SignedPreKeyPublic,
    /// Optional one-time prekey (consumed on first use).
    pub prekey: Option<PreKeyPublic>,
}

impl PreKeyBundle {
    /// Check the signed prekey signature against the bundle's identity key.
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(
            &self.identity_key,
            &self.signed_prekey.public_key,
            &self.signed_prekey.signature,
        )
    }

    /// Peer address of the bundle's owner.
    pub fn user_hash(&self) -> String {
        identity::user_hash(&self.identity_key)
    }
}

/// Local pool of one-time prekeys, keyed by id.
#[derive(Clone, Default)]
pub(crate) struct PreKeyPool {
    keys: BTreeMap<u32, PreKeyPair>,
    next_id: u32,
}

impl PreKeyPool {
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn get(&self, key_id: u32) -> Option<&PreKeyPair> {
        self.keys.get(&key_id)
    }

    /// Lowest-id key still available.
    pub(crate) fn first(&self) -> Option<&PreKeyPair> {
        self.keys.values().next()
    }

    pub(crate) fn public_keys(&self) -> Vec<PreKeyPublic> {
        self.keys.values().map(PreKeyPair::to_public).collect()
    }

    pub(crate) fn remove(&mut self, key_id: u32) -> Option<PreKeyPair> {
        self.keys.remove(&key_id)
    }

    /// Insert `count` keys with ids `start_id..start_id + count`.
    pub(crate) fn generate_range(
        &mut self,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<PreKeyPublic>, CryptoError> {
        if start_id == 0 {
            return Err(CryptoError::InvalidKey("prekey id 0 is reserved".into()));
        }
        let end = start_id
            .checked_add(count)
            .filter(|end| *end - 1 <= MAX_PREKEY_ID)
            .ok_or_else(|| CryptoError::InvalidKey("prekey id range exceeds 24 bits".into()))?;
        if let Some(taken) = (start_id..end).find(|id| self.keys.contains_key(id)) {
            return Err(CryptoError::InvalidKey(format!(
                "prekey id {taken} already in pool"
            )));
        }

        let mut published = Vec::with_capacity(count as usize);
        for key_id in start_id..end {
            let pair = PreKeyPair::generate(key_id)?;
            published.push(pair.to_public());
            self.keys.insert(key_id, pair);
        }
        self.next_id = self.next_id.max(end);
        Ok(published)
    }

    /// Top the pool up with `count` keys at the next free ids, wrapping
    /// after [`MAX_PREKEY_ID`].
    pub(crate) fn replenish(&mut self, count: u32) -> Result<Vec<PreKeyPublic>, CryptoError> {
        let mut published = Vec::with_capacity(count as usize);
        let mut candidate = self.next_id.max(1);
        let mut generated = 0;
        while generated < count {
            if candidate > MAX_PREKEY_ID {
                candidate = 1;
            }
            if !self.keys.contains_key(&candidate) {
                let pair = PreKeyPair::generate(candidate)?;
                published.push(pair.to_public());
                self.keys.insert(candidate, pair);
                generated += 1;
            }
            candidate += 1;
        }
        self.next_id = candidate;
        Ok(published)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let count = u32::try_from(self.keys.len())
            .map_err(|_| CryptoError::EncryptionError("prekey pool too large".into()))?;
        let mut w = Writer::with_capacity(9 + self.keys.len() * 36);
        w.u8(POOL_FORMAT).u32(self.next_id).u32(count);
        for pair in self.keys.values() {
            w.u32(pair.key_id).bytes(pair.secret.as_bytes());
        }
        Ok(w.finish())
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut r = Reader::new(data, CryptoError::CorruptState);
        let format = r.u8()?;
        if format != POOL_FORMAT {
            return Err(CryptoError::CorruptState(format!(
                "unknown prekey pool format {format}"
            )));
        }
        let next_id = r.u32()?;
        let count = r.u32()?;
        let mut keys = BTreeMap::new();
        for _ in 0..count {
            let key_id = r.u32()?;
            let secret = zeroize::Zeroizing::new(r.array::<32>()?);
            keys.insert(key_id, PreKeyPair::from_secret(key_id, *secret));
        }
        r.finish()?;
        Ok(Self { keys, next_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_prekey_signature_verifies() {
        let identity = IdentityKeyPair::generate().unwrap();
        let signed = SignedPreKeyPair::generate(1, &identity, 1_000).unwrap();
        let public = signed.to_public();
        assert_eq!(public.signature.len(), 64);
        assert!(IdentityKeyPair::verify(
            &identity.public_key_bytes(),
            &public.public_key,
            &public.signature
        )
        .is_ok());
    }

    #[test]
    fn signed_prekey_expiry() {
        let identity = IdentityKeyPair::generate().unwrap();
        let signed = SignedPreKeyPair::generate(1, &identity, 1_000).unwrap();
        assert!(!signed.is_expired(1_000 + 60, 3_600));
        assert!(signed.is_expired(1_000 + 3_601, 3_600));
        assert!(!signed.is_expired(0, 3_600));
    }

    #[test]
    fn signed_prekey_persists() {
        let identity = IdentityKeyPair::generate().unwrap();
        let signed = SignedPreKeyPair::generate(7, &identity, 99).unwrap();
        let restored = SignedPreKeyPair::decode(&signed.encode()).unwrap();
        assert_eq!(restored.key_id(), 7);
        assert_eq!(restored.timestamp(), 99);
        assert_eq!(restored.to_public(), signed.to_public());
    }

    #[test]
    fn pool_generate_range_rejects_overlap() {
        let mut pool = PreKeyPool::default();
        let published = pool.generate_range(1, 5).unwrap();
        assert_eq!(published.len(), 5);
        assert_eq!(published[0].key_id, 1);
        assert_eq!(published[4].key_id, 5);
        assert!(pool.generate_range(5, 2).is_err());
        assert!(pool.generate_range(0, 1).is_err());
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn pool_replenish_uses_fresh_ids() {
        let mut pool = PreKeyPool::default();
        pool.generate_range(1, 3).unwrap();
        pool.remove(2);
        let fresh = pool.replenish(2).unwrap();
        let ids: Vec<u32> = fresh.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn pool_replenish_wraps_past_max_id() {
        let mut pool = PreKeyPool::default();
        pool.generate_range(MAX_PREKEY_ID, 1).unwrap();
        let fresh = pool.replenish(1).unwrap();
        assert_eq!(fresh[0].key_id, 1);
    }

    #[test]
    fn pool_persists_secrets() {
        let mut pool = PreKeyPool::default();
        pool.generate_range(10, 3).unwrap();
        let restored = PreKeyPool::decode(&pool.encode().unwrap()).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.next_id, 13);
        assert_eq!(
            restored.get(11).unwrap().public_key_bytes(),
            pool.get(11).unwrap().public_key_bytes()
        );
    }

    #[test]
    fn corrupt_pool_is_reported() {
        assert!(matches!(
            PreKeyPool::decode(&[1, 0, 0]),
            Err(CryptoError::CorruptState(_))
        ));
        assert!(PreKeyPool::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn bundle_signature_check() {
        let identity = IdentityKeyPair::generate().unwrap();
        let signed = SignedPreKeyPair::generate(1, &identity, 0).unwrap();
        let mut bundle = PreKeyBundle {
            registration_id: 1,
            device_id: 1,
            identity_key: identity.public_key_bytes().to_vec(),
            signed_prekey: signed.to_public(),
            prekey: None,
        };
        bundle.verify_signature().unwrap();
        assert_eq!(bundle.user_hash(), identity.user_hash());

        bundle.signed_prekey.signature[0] ^= 0x01;
        assert!(matches!(
            bundle.verify_signature(),
            Err(CryptoError::InvalidSignature)
        ));
    }
}
