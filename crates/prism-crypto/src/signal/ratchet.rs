//! Symmetric chain-key ratchet.
//!
//! Each step derives a message key and the next chain key from the current
//! chain key with two distinct HKDF labels, so a leaked message key says
//! nothing about later chain keys.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::primitives::{self, KEY_LEN};

const MESSAGE_KEY_INFO: &[u8] = &[0x01];
const CHAIN_KEY_INFO: &[u8] = &[0x02];

const INITIATOR_CHAIN_INFO: &[u8] = b"Prism-Chain-Initiator";
const RESPONDER_CHAIN_INFO: &[u8] = b"Prism-Chain-Responder";

/// A chain key and the index of the next message it will produce.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ChainKey {
    key: [u8; KEY_LEN],
    index: u32,
}

/// Single-use AEAD key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKey([u8; KEY_LEN]);

impl MessageKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl ChainKey {
    pub(crate) fn new(key: [u8; KEY_LEN], index: u32) -> Self {
        Self { key, index }
    }

    pub(crate) fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn message_key(&self) -> Result<MessageKey, CryptoError> {
        Ok(MessageKey(primitives::derive_key(
            &self.key,
            MESSAGE_KEY_INFO,
        )?))
    }

    /// The chain key one step on.
    pub(crate) fn next(&self) -> Result<Self, CryptoError> {
        let index = self
            .index
            .checked_add(1)
            .ok_or_else(|| CryptoError::EncryptionError("message counter exhausted".into()))?;
        Ok(Self {
            key: primitives::derive_key(&self.key, CHAIN_KEY_INFO)?,
            index,
        })
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Split the X3DH chain key into the initiator's and responder's sending
/// chains, salted with the root key.
pub(crate) fn directional_chains(
    root_key: &[u8; KEY_LEN],
    chain_key: &[u8; KEY_LEN],
) -> Result<(ChainKey, ChainKey), CryptoError> {
    let mut initiator = [0u8; KEY_LEN];
    let mut responder = [0u8; KEY_LEN];
    primitives::hkdf_sha256(chain_key, Some(root_key), INITIATOR_CHAIN_INFO, &mut initiator)?;
    primitives::hkdf_sha256(chain_key, Some(root_key), RESPONDER_CHAIN_INFO, &mut responder)?;
    Ok((ChainKey::new(initiator, 0), ChainKey::new(responder, 0)))
}
