//! # Scripts
//!
//! Keel does not run a script interpreter. An output script is one of two
//! templates, and anything else is unspendable:
//!
//! ```text
//! empty                       anyone can spend
//! [0xAC][public key: 32]      pay-to-key: the input script is a 64-byte
//!                             Ed25519 signature over the signature hash
//! ```
//!
//! Coinbase input scripts are free-form bytes. When height-in-coinbase is
//! active they must start with [`Script::coinbase_height`] for the block's
//! height: one length byte, then the height as a minimal little-endian
//! number with a sign bit.

use serde::{Deserialize, Serialize};

use crate::crypto::{blake3_hash, KeelPublicKey, KeelSignature, Hash};

/// Opcode that tags a pay-to-key output.
pub const OP_PAY_TO_KEY: u8 = 0xAC;

const PAY_TO_KEY_SIZE: usize = 33;

/// Width of the address hash that keys the history index.
pub const ADDRESS_HASH_SIZE: usize = 20;

pub type AddressHash = [u8; ADDRESS_HASH_SIZE];

#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn pay_to_key(key: &KeelPublicKey) -> Self {
        let mut bytes = Vec::with_capacity(PAY_TO_KEY_SIZE);
        bytes.push(OP_PAY_TO_KEY);
        bytes.extend_from_slice(key.as_bytes());
        Self(bytes)
    }

    /// Push of `height` as a script number, the prefix a coinbase script
    /// must carry once height-in-coinbase is active.
    pub fn coinbase_height(height: u64) -> Vec<u8> {
        let mut number = Vec::new();
        let mut value = height;
        while value > 0 {
            number.push((value & 0xFF) as u8);
            value >>= 8;
        }
        // A set top bit would read back as negative; pad with a zero byte.
        if number.last().is_some_and(|b| b & 0x80 != 0) {
            number.push(0);
        }
        let mut push = Vec::with_capacity(number.len() + 1);
        push.push(number.len() as u8);
        push.extend_from_slice(&number);
        push
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key of a pay-to-key script.
    pub fn pay_to_key_target(&self) -> Option<KeelPublicKey> {
        match self.0.split_first() {
            Some((&OP_PAY_TO_KEY, key)) if self.0.len() == PAY_TO_KEY_SIZE => {
                KeelPublicKey::try_from_slice(key).ok()
            }
            _ => None,
        }
    }

    /// History key for outputs paying this script. Only pay-to-key scripts
    /// have an owner; anyone-can-spend outputs are not indexed.
    pub fn address_hash(&self) -> Option<AddressHash> {
        let key = self.pay_to_key_target()?;
        let digest = blake3_hash(key.as_bytes());
        let mut hash = [0u8; ADDRESS_HASH_SIZE];
        hash.copy_from_slice(&digest[..ADDRESS_HASH_SIZE]);
        Some(hash)
    }

    /// Check `input` against this output script for a spend whose
    /// signature hash is `sighash`.
    pub fn verify_spend(&self, input: &Script, sighash: &Hash) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(key) = self.pay_to_key_target() else {
            return false;
        };
        match KeelSignature::try_from_slice(input.as_bytes()) {
            Ok(signature) => key.verify(sighash, &signature),
            Err(_) => false,
        }
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}
