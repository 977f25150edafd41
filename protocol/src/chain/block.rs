//! # Block Structure
//!
//! ## Header Layout (92 bytes, little-endian)
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ version              u32      │  0
//! │ previous_block_hash  [u8; 32] │  4
//! │ merkle               [u8; 32] │ 36
//! │ timestamp            u32      │ 68
//! │ bits                 u32      │ 72
//! │ nonce                u64      │ 76
//! │ number               u64      │ 84  (height)
//! └───────────────────────────────┘ 92
//! ```
//!
//! The block hash is SHA-256d of those 92 bytes.
//!
//! ## Block Encoding
//!
//! ```text
//! [header: 92][tx_count: u32][transaction × tx_count][sig_len: u8][signature]
//! ```
//!
//! Version 2 blocks are signed: the signature covers the block hash and
//! must verify under the key paid by the coinbase's first output. Earlier
//! versions carry an empty signature.

use serde::{Deserialize, Serialize};

use super::transaction::Transaction;
use super::{put_u32, put_u64, CodecError, Reader};
use crate::crypto::{double_sha256, Hash, KeelKeypair, KeelSignature};

pub const HEADER_SIZE: usize = 92;

/// First block version whose blocks carry a signature.
pub const SIGNED_BLOCK_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub previous_block_hash: Hash,
    pub merkle: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u64,
    /// Height the block claims. Checked against its position on connect.
    pub number: u64,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        put_u32(&mut out, self.version);
        out.extend_from_slice(&self.previous_block_hash);
        out.extend_from_slice(&self.merkle);
        put_u32(&mut out, self.timestamp);
        put_u32(&mut out, self.bits);
        put_u64(&mut out, self.nonce);
        put_u64(&mut out, self.number);

        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&out);
        bytes
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: reader.u32()?,
            previous_block_hash: reader.hash()?,
            merkle: reader.hash()?,
            timestamp: reader.u32()?,
            bits: reader.u32()?,
            nonce: reader.u64()?,
            number: reader.u64()?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let header = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(header)
    }

    pub fn hash(&self) -> Hash {
        double_sha256(&self.to_bytes())
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    /// Raw signature bytes; empty for unsigned blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            signature: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn is_signed_version(&self) -> bool {
        self.header.version >= SIGNED_BLOCK_VERSION
    }

    /// Sign the block hash. The header must be final before signing.
    pub fn sign(&mut self, keypair: &KeelKeypair) {
        self.signature = keypair.sign(&self.hash()).as_bytes().to_vec();
    }

    /// `true` when the signature verifies under the coinbase payout key.
    pub fn verify_signature(&self) -> bool {
        let key = self
            .transactions
            .first()
            .and_then(|coinbase| coinbase.outputs.first())
            .and_then(|output| output.script.pay_to_key_target());
        match (key, KeelSignature::try_from_slice(&self.signature)) {
            (Some(key), Ok(signature)) => key.verify(&self.hash(), &signature),
            _ => false,
        }
    }

    /// Merkle root over the transaction hashes.
    pub fn generate_merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(Transaction::hash).collect();
        merkle_root(hashes)
    }

    pub fn serialized_size(&self) -> usize {
        let transactions: usize = self
            .transactions
            .iter()
            .map(Transaction::serialized_size)
            .sum();
        HEADER_SIZE + 4 + transactions + 1 + self.signature.len()
    }

    /// Fails only when the signature is too long to encode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let sig_len = self.signature_length()?;
        let mut out = Vec::with_capacity(self.serialized_size());
        out.extend_from_slice(&self.header.to_bytes());
        put_u32(&mut out, self.transactions.len() as u32);
        for tx in &self.transactions {
            tx.encode_into(&mut out);
        }
        out.push(sig_len);
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    /// The signature's one-byte length prefix.
    pub fn signature_length(&self) -> Result<u8, CodecError> {
        u8::try_from(self.signature.len())
            .map_err(|_| CodecError::SignatureTooLong(self.signature.len()))
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = Header::decode(reader)?;
        let count = reader.length()?;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::decode(reader)?);
        }
        let sig_len = reader.u8()? as usize;
        let signature = reader.bytes(sig_len)?.to_vec();
        Ok(Self {
            header,
            transactions,
            signature,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let block = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(block)
    }
}

/// Pairwise SHA-256d up to a single root. An odd node at any level is
/// paired with itself. The empty list has the null root.
pub fn merkle_root(mut hashes: Vec<Hash>) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            if let Some(last) = hashes.last().copied() {
                hashes.push(last);
            }
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(&pair[0]);
                combined[32..].copy_from_slice(&pair[1]);
                double_sha256(&combined)
            })
            .collect();
    }
    hashes[0]
}
