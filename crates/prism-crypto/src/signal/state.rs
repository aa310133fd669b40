use zeroize::Zeroize;

use crate::codec::{Reader, Writer};
use crate::error::CryptoError;
use crate::signal::envelope::PreKeyHeader;
use crate::signal::ratchet::{self, ChainKey, MessageKey};
use crate::signal::x3dh::X3dhOutput;

const SESSION_FORMAT: u8 = 2;

/// Base keys of replaced sessions remembered per peer.
pub(crate) const MAX_RETIRED_BASE_KEYS: usize = 16;

/// Which side of X3DH this end played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn to_byte(self) -> u8 {
        match self {
            Self::Initiator => 1,
            Self::Responder => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CryptoError> {
        match byte {
            1 => Ok(Self::Initiator),
            2 => Ok(Self::Responder),
            other => Err(CryptoError::CorruptState(format!("unknown session role {other}"))),
        }
    }
}

/// Ratchet state shared with one peer.
///
/// Holds only the local identity's public key; the private half stays with
/// the account manager.
#[derive(Clone)]
pub struct Session {
    pub(crate) role: Role,
    pub(crate) remote_identity: [u8; 32],
    pub(crate) local_identity: [u8; 32],
    pub(crate) root_key: [u8; 32],
    pub(crate) sending: ChainKey,
    pub(crate) receiving: ChainKey,
    pub(crate) base_key: [u8; 32],
    /// Bootstrap header attached to outgoing messages until the peer answers.
    pub(crate) pending_prekey: Option<PreKeyHeader>,
    pub(crate) created_at: u64,
    /// Base keys of earlier sessions with this peer, oldest first. A bootstrap
    /// carrying one of these is a replay.
    pub(crate) retired_base_keys: Vec<[u8; 32]>,
}

impl Session {
    pub(crate) fn new(
        role: Role,
        remote_identity: [u8; 32],
        local_identity: [u8; 32],
        keys: &X3dhOutput,
        base_key: [u8; 32],
        pending_prekey: Option<PreKeyHeader>,
        created_at: u64,
    ) -> Result<Self, CryptoError> {
        let (initiator, responder) = ratchet::directional_chains(&keys.root_key, &keys.chain_key)?;
        let (sending, receiving) = match role {
            Role::Initiator => (initiator, responder),
            Role::Responder => (responder, initiator),
        };
        Ok(Self {
            role,
            remote_identity,
            local_identity,
            root_key: keys.root_key,
            sending,
            receiving,
            base_key,
            pending_prekey,
            created_at,
            retired_base_keys: Vec::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_identity(&self) -> &[u8; 32] {
        &self.remote_identity
    }

    pub fn local_identity(&self) -> &[u8; 32] {
        &self.local_identity
    }

    /// Messages sent on this session.
    pub fn message_number(&self) -> u32 {
        self.sending.index()
    }

    /// Messages received on this session.
    pub fn received_count(&self) -> u32 {
        self.receiving.index()
    }

    /// The initiator's X3DH ephemeral public key; identifies the session.
    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    /// Whether the peer has yet to answer on this session.
    pub fn is_unconfirmed(&self) -> bool {
        self.pending_prekey.is_some()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether `base_key` names this session or one it replaced.
    pub(crate) fn has_seen_base_key(&self, base_key: &[u8; 32]) -> bool {
        self.base_key == *base_key || self.retired_base_keys.contains(base_key)
    }

    /// Carry `previous`'s bootstrap history over to this replacement.
    pub(crate) fn retire(&mut self, previous: &Session) {
        let mut history = previous.retired_base_keys.clone();
        history.push(previous.base_key);
        history.retain(|key| *key != self.base_key);
        let excess = history.len().saturating_sub(MAX_RETIRED_BASE_KEYS);
        history.drain(..excess);
        self.retired_base_keys = history;
    }

    /// Take one step on the sending chain, returning the key and counter to
    /// use. Works on `self`; callers persist a copy only on success.
    pub(crate) fn advance_sending(&mut self) -> Result<(MessageKey, u32), CryptoError> {
        let counter = self.sending.index();
        let key = self.sending.message_key()?;
        self.sending = self.sending.next()?;
        Ok((key, counter))
    }

    /// Take one step on the receiving chain if `counter` is the next
    /// expected message. Anything else is a replay or a gap.
    pub(crate) fn advance_receiving(&mut self, counter: u32) -> Result<MessageKey, CryptoError> {
        if counter != self.receiving.index() {
            return Err(CryptoError::DecryptionFailed);
        }
        let key = self.receiving.message_key()?;
        self.receiving = self.receiving.next()?;
        Ok(key)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(256);
        w.u8(SESSION_FORMAT)
            .u8(self.role.to_byte())
            .bytes(&self.remote_identity)
            .bytes(&self.local_identity)
            .bytes(&self.root_key)
            .bytes(self.sending.key())
            .u32(self.sending.index())
            .bytes(self.receiving.key())
            .u32(self.receiving.index())
            .bytes(&self.base_key);
        match &self.pending_prekey {
            Some(header) => {
                w.u8(1);
                header.write(&mut w);
            }
            None => {
                w.u8(0);
            }
        }
        w.u64(self.created_at);
        // Never more than MAX_RETIRED_BASE_KEYS entries.
        w.u8(u8::try_from(self.retired_base_keys.len()).unwrap_or(u8::MAX));
        for key in self.retired_base_keys.iter().take(usize::from(u8::MAX)) {
            w.bytes(key);
        }
        w.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut r = Reader::new(data, CryptoError::CorruptState);
        let format = r.u8()?;
        if format != SESSION_FORMAT {
            return Err(CryptoError::CorruptState(format!(
                "unknown session format {format}"
            )));
        }
        let role = Role::from_byte(r.u8()?)?;
        let remote_identity = r.array()?;
        let local_identity = r.array()?;
        let root_key = r.array()?;
        let sending = ChainKey::new(r.array()?, r.u32()?);
        let receiving = ChainKey::new(r.array()?, r.u32()?);
        let base_key = r.array()?;
        let pending_prekey = if r.flag()? {
            Some(PreKeyHeader::read(&mut r)?)
        } else {
            None
        };
        let created_at = r.u64()?;
        let retired = usize::from(r.u8()?);
        if retired > MAX_RETIRED_BASE_KEYS {
            return Err(CryptoError::CorruptState(format!(
                "{retired} retired base keys"
            )));
        }
        let retired_base_keys = (0..retired)
            .map(|_| r.array())
            .collect::<Result<Vec<[u8; 32]>, _>>()?;
        r.finish()?;

        Ok(Self {
            role,
            remote_identity,
            local_identity,
            root_key,
            sending,
            receiving,
            base_key,
            pending_prekey,
            created_at,
            retired_base_keys,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("remote_identity", &hex::encode(self.remote_identity))
            .field("sent", &self.sending.index())
            .field("received", &self.receiving.index())
            .field("unconfirmed", &self.pending_prekey.is_some())
            .finish_non_exhaustive()
    }
}
