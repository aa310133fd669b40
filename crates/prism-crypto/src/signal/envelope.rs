//! Wire format of encrypted messages.
//!
//! ```text
//! version:u8 | kind:u8
//! [PreKey: registration_id:u32 | signed_prekey_id:u32 | has_one_time:u8 |
//!          one_time_id:u32 | identity_key:32 | base_key:32]
//! counter:u32 | nonce:12 | ciphertext || tag
//! ```
//!
//! Everything before the nonce is the header, which is authenticated as
//! associated data together with both identity keys.

use crate::codec::{Reader, Writer};
use crate::error::CryptoError;
use crate::primitives::{NONCE_LEN, TAG_LEN};

pub const WIRE_VERSION: u8 = 1;

/// Message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Sent on an established session.
    Normal = 1,
    /// Carries the X3DH bootstrap header so the receiver can create the session.
    PreKey = 2,
}

impl MessageKind {
    fn from_byte(byte: u8) -> Result<Self, CryptoError> {
        match byte {
            1 => Ok(Self::Normal),
            2 => Ok(Self::PreKey),
            other => Err(CryptoError::MalformedMessage(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// What the responder needs to mirror the initiator's X3DH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PreKeyHeader {
    pub(crate) registration_id: u32,
    pub(crate) signed_prekey_id: u32,
    pub(crate) one_time_prekey_id: Option<u32>,
    pub(crate) identity_key: [u8; 32],
    pub(crate) base_key: [u8; 32],
}

impl PreKeyHeader {
    pub(crate) fn write(&self, w: &mut Writer) {
        w.u32(self.registration_id)
            .u32(self.signed_prekey_id)
            .u8(u8::from(self.one_time_prekey_id.is_some()))
            .u32(self.one_time_prekey_id.unwrap_or(0))
            .bytes(&self.identity_key)
            .bytes(&self.base_key);
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, CryptoError> {
        let registration_id = r.u32()?;
        let signed_prekey_id = r.u32()?;
        let has_one_time = r.flag()?;
        let one_time_id = r.u32()?;
        Ok(Self {
            registration_id,
            signed_prekey_id,
            one_time_prekey_id: has_one_time.then_some(one_time_id),
            identity_key: r.array()?,
            base_key: r.array()?,
        })
    }
}

/// Output of `encrypt_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Wire bytes to hand to the transport.
    pub bytes: Vec<u8>,
    /// Messages sent on this session so far, this one included.
    pub message_number: u32,
}

impl EncryptedMessage {
    pub fn kind(&self) -> Result<MessageKind, CryptoError> {
        Ok(parse(&self.bytes)?.kind())
    }
}

/// A parsed message borrowing from the wire bytes.
#[derive(Debug)]
pub(crate) struct Envelope<'a> {
    pub(crate) header: &'a [u8],
    pub(crate) prekey: Option<PreKeyHeader>,
    pub(crate) counter: u32,
    pub(crate) nonce: [u8; NONCE_LEN],
    pub(crate) ciphertext: &'a [u8],
}

impl Envelope<'_> {
    pub(crate) fn kind(&self) -> MessageKind {
        if self.prekey.is_some() {
            MessageKind::PreKey
        } else {
            MessageKind::Normal
        }
    }
}

/// Encode the authenticated header.
pub(crate) fn encode_header(prekey: Option<&PreKeyHeader>, counter: u32) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + 77 + 4);
    w.u8(WIRE_VERSION);
    match prekey {
        Some(header) => {
            w.u8(MessageKind::PreKey as u8);
            header.write(&mut w);
        }
        None => {
            w.u8(MessageKind::Normal as u8);
        }
    }
    w.u32(counter);
    w.finish()
}

/// Header followed by nonce and ciphertext.
pub(crate) fn assemble(header: Vec<u8>, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut bytes = header;
    bytes.reserve(NONCE_LEN + ciphertext.len());
    bytes.extend_from_slice(nonce);
    bytes.extend_from_slice(ciphertext);
    bytes
}

pub(crate) fn parse(bytes: &[u8]) -> Result<Envelope<'_>, CryptoError> {
    let mut r = Reader::new(bytes, CryptoError::MalformedMessage);
    let version = r.u8()?;
    if version != WIRE_VERSION {
        return Err(CryptoError::MalformedMessage(format!(
            "unsupported wire version {version}"
        )));
    }
    let prekey = match MessageKind::from_byte(r.u8()?)? {
        MessageKind::PreKey => Some(PreKeyHeader::read(&mut r)?),
        MessageKind::Normal => None,
    };
    let counter = r.u32()?;
    let header = &bytes[..r.position()];
    let nonce = r.array::<NONCE_LEN>()?;
    let ciphertext = r.rest();
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::MalformedMessage("ciphertext shorter than tag".into()));
    }
    Ok(Envelope {
        header,
        prekey,
        counter,
        nonce,
        ciphertext,
    })
}

/// AEAD associated data: header, then sender and receiver identity keys.
pub(crate) fn associated_data(header: &[u8], sender: &[u8; 32], receiver: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + 64);
    aad.extend_from_slice(header);
    aad.extend_from_slice(sender);
    aad.extend_from_slice(receiver);
    aad
}
