//! Binary encoding helpers for persisted state and wire messages.
//!
//! Integers are little-endian and fixed-width; variable-length byte strings
//! carry a `u32` length prefix. Readers never panic on short input.

use crate::CryptoError;

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Fixed-width bytes; the reader must know the length.
    pub(crate) fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Length-prefixed bytes.
    pub(crate) fn var_bytes(&mut self, value: &[u8]) -> Result<&mut Self, CryptoError> {
        let len = u32::try_from(value.len())
            .map_err(|_| CryptoError::EncryptionError("field longer than u32::MAX".into()))?;
        self.u32(len);
        self.buf.extend_from_slice(value);
        Ok(self)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    error: fn(String) -> CryptoError,
}

impl<'a> Reader<'a> {
    /// `error` builds the error returned on truncated or trailing input.
    pub(crate) fn new(data: &'a [u8], error: fn(String) -> CryptoError) -> Self {
        Self {
            data,
            pos: 0,
            error,
        }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                (self.error)(format!(
                    "need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CryptoError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn var_bytes(&mut self) -> Result<&'a [u8], CryptoError> {
        let len = usize::try_from(self.u32()?)
            .map_err(|_| (self.error)("length prefix overflows usize".into()))?;
        self.take(len)
    }

    /// A boolean encoded as a single `0`/`1` byte.
    pub(crate) fn flag(&mut self) -> Result<bool, CryptoError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err((self.error)(format!("invalid flag byte {other}"))),
        }
    }

    /// Everything not yet consumed.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// Number of bytes consumed so far.
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// Fail if any input is left over.
    pub(crate) fn finish(self) -> Result<(), CryptoError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err((self.error)(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )))
        }
    }
}
