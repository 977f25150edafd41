//! # Transactions
//!
//! ```text
//! version: u32
//! inputs:  [count: u32] { previous_output: [hash: 32][index: u32]
//!                         script: [len: u32][bytes]
//!                         sequence: u32 } × count
//! outputs: [count: u32] { value: u64, script: [len: u32][bytes] } × count
//! locktime: u32
//! ```
//!
//! The transaction hash is SHA-256d of that encoding. A coinbase has
//! exactly one input, and that input spends the null outpoint.

use serde::{Deserialize, Serialize};

use super::script::Script;
use super::{put_u32, put_u64, put_var_bytes, CodecError, Reader};
use crate::crypto::{double_sha256, Hash, KeelKeypair, NULL_HASH};

/// Encoded width of an [`OutPoint`].
pub const POINT_SIZE: usize = 36;

/// Locktimes below this are heights, at or above it are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence value that opts an input out of locktime.
pub const MAX_SEQUENCE: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// OutPoint
// ---------------------------------------------------------------------------

/// A reference to a transaction slot: an output when spent, an input when
/// recorded as the spender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The outpoint a coinbase input spends.
    pub fn null() -> Self {
        Self {
            hash: NULL_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH && self.index == u32::MAX
    }

    pub fn to_bytes(&self) -> [u8; POINT_SIZE] {
        let mut out = [0u8; POINT_SIZE];
        out[..32].copy_from_slice(&self.hash);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let point = Self::decode(&mut reader)?;
        Ok(point)
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            hash: reader.hash()?,
            index: reader.u32()?,
        })
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hex::encode(self.hash), self.index)
    }
}

// ---------------------------------------------------------------------------
// Inputs & Outputs
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script: Script,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script: Script::empty(),
            sequence: MAX_SEQUENCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub script: Script,
}

impl TxOutput {
    pub fn new(value: u64, script: Script) -> Self {
        Self { value, script }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            locktime: 0,
        }
    }

    /// A coinbase for `height`: the height push followed by `extra`, paying
    /// `outputs`.
    pub fn coinbase(height: u64, extra: &[u8], outputs: Vec<TxOutput>) -> Self {
        let mut script = Script::coinbase_height(height);
        script.extend_from_slice(extra);
        // Coinbase scripts must be at least two bytes long.
        while script.len() < 2 {
            script.push(0);
        }
        let input = TxInput {
            previous_output: OutPoint::null(),
            script: Script::new(script),
            sequence: MAX_SEQUENCE,
        };
        Self::new(vec![input], outputs)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn hash(&self) -> Hash {
        double_sha256(&self.to_bytes())
    }

    /// Sum of output values, `None` on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.value))
    }

    /// Final at `height` / `time`: no locktime, a locktime already passed,
    /// or every input opted out.
    pub fn is_final(&self, height: u64, time: u32) -> bool {
        if self.locktime == 0 {
            return true;
        }
        let passed = if self.locktime < LOCKTIME_THRESHOLD {
            u64::from(self.locktime) < height
        } else {
            self.locktime < time
        };
        passed || self.inputs.iter().all(|input| input.sequence == MAX_SEQUENCE)
    }

    /// The digest an input signature commits to: the transaction with every
    /// input script cleared, followed by the input index.
    pub fn signature_hash(&self, input_index: u32) -> Hash {
        let mut stripped = self.clone();
        for input in &mut stripped.inputs {
            input.script = Script::empty();
        }
        let mut bytes = stripped.to_bytes();
        put_u32(&mut bytes, input_index);
        double_sha256(&bytes)
    }

    /// Sign input `index` for a pay-to-key output owned by `keypair`.
    pub fn sign_input(&mut self, index: usize, keypair: &KeelKeypair) {
        let sighash = self.signature_hash(index as u32);
        if let Some(input) = self.inputs.get_mut(index) {
            input.script = Script::new(keypair.sign(&sighash).as_bytes().to_vec());
        }
    }

    pub fn serialized_size(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|input| POINT_SIZE + 4 + input.script.len() + 4)
            .sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|output| 8 + 4 + output.script.len())
            .sum();
        4 + 4 + inputs + 4 + outputs + 4
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        put_u32(out, self.version);
        put_u32(out, self.inputs.len() as u32);
        for input in &self.inputs {
            out.extend_from_slice(&input.previous_output.to_bytes());
            put_var_bytes(out, input.script.as_bytes());
            put_u32(out, input.sequence);
        }
        put_u32(out, self.outputs.len() as u32);
        for output in &self.outputs {
            put_u64(out, output.value);
            put_var_bytes(out, output.script.as_bytes());
        }
        put_u32(out, self.locktime);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.encode_into(&mut out);
        out
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = reader.u32()?;
        let input_count = reader.length()?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput {
                previous_output: OutPoint::decode(reader)?,
                script: Script::new(reader.var_bytes()?.to_vec()),
                sequence: reader.u32()?,
            });
        }
        let output_count = reader.length()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput {
                value: reader.u64()?,
                script: Script::new(reader.var_bytes()?.to_vec()),
            });
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            locktime: reader.u32()?,
        })
    }

    /// Decode exactly one transaction from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let tx = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(prev: Hash, index: u32, value: u64) -> Transaction {
        Transaction::new(
            vec![TxInput::new(OutPoint::new(prev, index))],
            vec![TxOutput::new(value, Script::empty())],
        )
    }

    #[test]
    fn encoding_is_canonical() {
        let tx = spend([1u8; 32], 2, 50);
        let bytes = tx.to_bytes();
        assert_eq!(bytes.len(), tx.serialized_size());
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
        assert_eq!(tx.hash(), double_sha256(&bytes));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = spend([1u8; 32], 0, 1).to_bytes();
        bytes.push(0);
        assert_eq!(
            Transaction::from_bytes(&bytes),
            Err(CodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn coinbase_detection() {
        let coinbase = Transaction::coinbase(7, b"keel", vec![TxOutput::new(1, Script::empty())]);
        assert!(coinbase.is_coinbase());
        assert!(coinbase.inputs[0]
            .script
            .as_bytes()
            .starts_with(&Script::coinbase_height(7)));
        assert!(!spend([0u8; 32], 0, 1).is_coinbase());

        // Genesis height pushes a single byte; padding keeps the script legal.
        assert_eq!(Transaction::coinbase(0, b"", vec![]).inputs[0].script.len(), 2);
    }

    #[test]
    fn outpoint_bytes_round_trip() {
        let point = OutPoint::new([3u8; 32], 9);
        assert_eq!(OutPoint::from_bytes(&point.to_bytes()).unwrap(), point);
        assert!(OutPoint::null().is_null());
    }

    #[test]
    fn total_output_value_detects_overflow() {
        let mut tx = spend([0u8; 32], 0, u64::MAX);
        assert_eq!(tx.total_output_value(), Some(u64::MAX));
        tx.outputs.push(TxOutput::new(1, Script::empty()));
        assert_eq!(tx.total_output_value(), None);
    }

    #[test]
    fn finality_rules() {
        let mut tx = spend([0u8; 32], 0, 1);
        assert!(tx.is_final(0, 0));

        tx.locktime = 10;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(10, 0));
        assert!(tx.is_final(11, 0));

        tx.locktime = LOCKTIME_THRESHOLD + 100;
        assert!(!tx.is_final(1_000, LOCKTIME_THRESHOLD + 100));
        assert!(tx.is_final(1_000, LOCKTIME_THRESHOLD + 101));

        tx.inputs[0].sequence = MAX_SEQUENCE;
        assert!(tx.is_final(0, 0));
    }

    #[test]
    fn signature_hash_ignores_input_scripts() {
        let kp = KeelKeypair::from_seed(&[4u8; 32]);
        let mut tx = spend([9u8; 32], 0, 10);
        let before = tx.signature_hash(0);
        tx.sign_input(0, &kp);
        assert_eq!(tx.signature_hash(0), before);
        assert_ne!(tx.signature_hash(1), before);

        let output = Script::pay_to_key(&kp.public_key());
        assert!(output.verify_spend(&tx.inputs[0].script, &before));
    }
}
