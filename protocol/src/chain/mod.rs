//! # Chain Types
//!
//! Blocks, transactions, scripts and proof-of-work arithmetic, plus the
//! canonical byte encoding that block and transaction hashes are computed
//! over.
//!
//! ## Encoding
//!
//! Integers are little-endian and fixed width. Byte strings and vectors
//! carry a `u32` length prefix. There is exactly one encoding per value,
//! so `decode(encode(x)) == x` and hashes are stable across nodes.

pub mod block;
pub mod script;
pub mod transaction;
pub mod work;

pub use block::{Block, Header, HEADER_SIZE};
pub use script::Script;
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput, POINT_SIZE};

use crate::crypto::Hash;

/// Largest length prefix accepted while decoding. Anything bigger cannot
/// fit in a valid block and would only let a peer make us allocate.
pub const MAX_DECODE_LENGTH: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("length prefix {0} exceeds decode limit")]
    TooLarge(usize),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("signature of {0} bytes does not fit its one-byte length")]
    SignatureTooLong(usize),
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// A forward-only cursor over encoded bytes.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn hash(&mut self) -> Result<Hash, CodecError> {
        self.array()
    }

    /// A `u32` length prefix, bounded by [`MAX_DECODE_LENGTH`].
    pub fn length(&mut self) -> Result<usize, CodecError> {
        let len = self.u32()? as usize;
        if len > MAX_DECODE_LENGTH {
            return Err(CodecError::TooLarge(len));
        }
        Ok(len)
    }

    pub fn var_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.length()?;
        self.bytes(len)
    }
}

// ---------------------------------------------------------------------------
// Writer helpers
// ---------------------------------------------------------------------------

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert_eq!(reader.u8().unwrap(), 1);
        assert_eq!(
            reader.u32(),
            Err(CodecError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn var_bytes_round_trip_and_limit() {
        let mut out = Vec::new();
        put_var_bytes(&mut out, b"keel");
        put_u64(&mut out, 7);
        let mut reader = Reader::new(&out);
        assert_eq!(reader.var_bytes().unwrap(), b"keel");
        assert_eq!(reader.u64().unwrap(), 7);
        reader.finish().unwrap();

        let huge = (MAX_DECODE_LENGTH as u32 + 1).to_le_bytes();
        assert!(matches!(
            Reader::new(&huge).var_bytes(),
            Err(CodecError::TooLarge(_))
        ));
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let reader = Reader::new(&[0u8; 3]);
        assert_eq!(reader.finish(), Err(CodecError::TrailingBytes(3)));
    }
}
