//! # Block Validation
//!
//! A candidate block at a given height goes through four ordered steps,
//! each cheaper than the next:
//!
//! 1. [`check_block`](BlockValidator::check_block): rules that need
//!    nothing but the block itself (size, proof of work, coinbase
//!    placement, per-transaction structure, merkle root, signature).
//! 2. [`initialize_context`](BlockValidator::initialize_context): count
//!    the versions of preceding blocks to decide which upgrades are in
//!    force.
//! 3. [`accept_block`](BlockValidator::accept_block): rules relative to
//!    the block's ancestors (difficulty, median time past, finality,
//!    checkpoints, minimum version, height in coinbase).
//! 4. [`connect_block`](BlockValidator::connect_block): every input
//!    against the outputs it spends.
//!
//! All chain reads go through a [`ChainContext`]. The organizer supplies
//! one that overlays a fork's earlier blocks on the main chain below the
//! fork point; tests supply an in-memory one. Steps that read the chain
//! return a [`BlockError`], which keeps a failed read apart from a verdict
//! on the block.

use std::collections::HashSet;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::chain::script::Script;
use crate::chain::work::{check_proof_of_work, retarget};
use crate::chain::{block::SIGNED_BLOCK_VERSION, Block, Header, OutPoint, Transaction};
use crate::config::{
    Settings, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_SIZE, MAX_FUTURE_BLOCK_SECONDS, MAX_MONEY,
    MEDIAN_TIME_PAST_BLOCKS, MIN_COINBASE_SCRIPT_SIZE,
};
use crate::crypto::keys::SIGNATURE_LENGTH;
use crate::crypto::Hash;
use crate::database::DbError;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Why a block was rejected. Every variant but `MissingAncestor` kills the
/// block and its descendants for good, unless [`is_malleable`] says the
/// failure may be a mangled copy of a valid block.
///
/// [`is_malleable`]: ValidationError::is_malleable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    // -- check_block --------------------------------------------------------
    #[error("block is empty or exceeds the size limit")]
    SizeLimits,

    #[error("block hash does not meet its target")]
    ProofOfWork,

    #[error("block timestamp {0} is too far in the future")]
    FuturisticTimestamp(u32),

    #[error("first transaction is not a coinbase")]
    FirstNotCoinbase,

    #[error("more than one coinbase")]
    ExtraCoinbases,

    #[error("transaction has no inputs or no outputs")]
    EmptyTransaction,

    #[error("output value out of range")]
    OutputValueOverflow,

    #[error("transaction spends the same output twice")]
    DuplicateInputs,

    #[error("coinbase script size {0} out of range")]
    InvalidCoinbaseScriptSize(usize),

    #[error("non-coinbase input spends the null point")]
    PreviousOutputNull,

    #[error("block contains duplicate transactions")]
    Duplicate,

    #[error("merkle root mismatch")]
    MerkleMismatch,

    #[error("block signature does not verify")]
    InvalidBlockSignature,

    #[error("signed block carries a {0}-byte signature")]
    SignatureLength(usize),

    #[error("unsigned block version carries a signature")]
    UnexpectedSignature,

    // -- accept_block -------------------------------------------------------
    #[error("header claims height {claimed}, connects at {actual}")]
    HeightMismatch { claimed: u64, actual: u64 },

    #[error("bits {actual:#x} differ from required {required:#x}")]
    IncorrectProofOfWork { required: u32, actual: u32 },

    #[error("timestamp not after median time past")]
    TimestampTooEarly,

    #[error("block contains a non-final transaction")]
    NonFinalTransaction,

    #[error("block does not match checkpoint at height {0}")]
    CheckpointsFailed(u64),

    #[error("block version {version} below required {minimum}")]
    OldVersionBlock { version: u32, minimum: u32 },

    #[error("coinbase does not start with the block height")]
    CoinbaseHeightMismatch,

    // -- connect_block ------------------------------------------------------
    #[error("input {0} spends an unknown output")]
    InputNotFound(OutPoint),

    #[error("output {0} is already spent")]
    DoubleSpend(OutPoint),

    #[error("coinbase output {0} spent before maturity")]
    ImmatureCoinbase(OutPoint),

    #[error("input script does not satisfy {0}")]
    ScriptFailed(OutPoint),

    #[error("input value out of range")]
    InputValueOverflow,

    #[error("transaction spends more than its inputs")]
    SpendExceedsValue,

    #[error("fees out of range")]
    FeesOutOfRange,

    #[error("coinbase pays more than subsidy and fees")]
    CoinbaseTooLarge,

    // -- data access --------------------------------------------------------
    #[error("ancestor at height {0} is unavailable")]
    MissingAncestor(u64),
}

impl ValidationError {
    /// Stable identifier for logs and peer scoring.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SizeLimits => "size_limits",
            Self::ProofOfWork => "proof_of_work",
            Self::FuturisticTimestamp(_) => "futuristic_timestamp",
            Self::FirstNotCoinbase => "first_not_coinbase",
            Self::ExtraCoinbases => "extra_coinbases",
            Self::EmptyTransaction => "empty_transaction",
            Self::OutputValueOverflow => "output_value_overflow",
            Self::DuplicateInputs => "duplicate_inputs",
            Self::InvalidCoinbaseScriptSize(_) => "invalid_coinbase_script_size",
            Self::PreviousOutputNull => "previous_output_null",
            Self::Duplicate => "duplicate",
            Self::MerkleMismatch => "merkle_mismatch",
            Self::InvalidBlockSignature => "invalid_block_signature",
            Self::SignatureLength(_) => "signature_length",
            Self::UnexpectedSignature => "unexpected_signature",
            Self::HeightMismatch { .. } => "height_mismatch",
            Self::IncorrectProofOfWork { .. } => "incorrect_proof_of_work",
            Self::TimestampTooEarly => "timestamp_too_early",
            Self::NonFinalTransaction => "non_final_transaction",
            Self::CheckpointsFailed(_) => "checkpoints_failed",
            Self::OldVersionBlock { .. } => "old_version_block",
            Self::CoinbaseHeightMismatch => "coinbase_height_mismatch",
            Self::InputNotFound(_) => "input_not_found",
            Self::DoubleSpend(_) => "double_spend",
            Self::ImmatureCoinbase(_) => "immature_coinbase",
            Self::ScriptFailed(_) => "validate_inputs_failed",
            Self::InputValueOverflow => "input_value_overflow",
            Self::SpendExceedsValue => "spend_exceeds_value",
            Self::FeesOutOfRange => "fees_out_of_range",
            Self::CoinbaseTooLarge => "coinbase_too_large",
            Self::MissingAncestor(_) => "missing_ancestor",
        }
    }

    /// `true` when an ancestor the block needs is not there yet. Such
    /// blocks stay pending.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::MissingAncestor(_))
    }

    /// `true` when the failure lies in bytes the block hash does not
    /// commit to. Another copy under the same hash may still be valid, so
    /// the hash must not be refused.
    pub fn is_malleable(&self) -> bool {
        matches!(
            self,
            Self::MerkleMismatch
                | Self::Duplicate
                | Self::InvalidBlockSignature
                | Self::SignatureLength(_)
                | Self::UnexpectedSignature
        )
    }
}

/// Failure of a validation step that reads the chain.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The block breaks a rule.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// The chain could not be read. Says nothing about the block.
    #[error("chain read failed: {0}")]
    Store(#[from] DbError),
}

// ---------------------------------------------------------------------------
// Chain Context
// ---------------------------------------------------------------------------

/// The chain as seen from the block being validated: everything up to and
/// including its parent, nothing above.
pub trait ChainContext {
    fn fetch_header(&self, height: u64) -> Result<Option<Header>, DbError>;

    /// A transaction and the height it was confirmed at.
    fn fetch_transaction(&self, hash: &Hash) -> Result<Option<(Transaction, u64)>, DbError>;

    fn is_output_spent(&self, outpoint: &OutPoint) -> Result<bool, DbError>;

    /// Median timestamp of the (up to) eleven blocks below `height`.
    fn median_time_past(&self, height: u64) -> Result<u32, BlockError> {
        let first = height.saturating_sub(MEDIAN_TIME_PAST_BLOCKS);
        let mut times = Vec::with_capacity(MEDIAN_TIME_PAST_BLOCKS as usize);
        for ancestor in first..height {
            let header = self
                .fetch_header(ancestor)?
                .ok_or(ValidationError::MissingAncestor(ancestor))?;
            times.push(header.timestamp);
        }
        if times.is_empty() {
            return Ok(0);
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }
}

// ---------------------------------------------------------------------------
// Transaction Checks
// ---------------------------------------------------------------------------

/// Structural rules for a single transaction.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(ValidationError::EmptyTransaction);
    }

    let mut total: u64 = 0;
    for output in &tx.outputs {
        if output.value > MAX_MONEY {
            return Err(ValidationError::OutputValueOverflow);
        }
        total = total
            .checked_add(output.value)
            .filter(|total| *total <= MAX_MONEY)
            .ok_or(ValidationError::OutputValueOverflow)?;
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    if !tx.inputs.iter().all(|input| seen.insert(input.previous_output)) {
        return Err(ValidationError::DuplicateInputs);
    }

    if tx.is_coinbase() {
        let size = tx.inputs[0].script.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&size) {
            return Err(ValidationError::InvalidCoinbaseScriptSize(size));
        }
    } else if tx.inputs.iter().any(|input| input.previous_output.is_null()) {
        return Err(ValidationError::PreviousOutputNull);
    }
    Ok(())
}

fn is_distinct_tx_set(transactions: &[Transaction]) -> bool {
    let mut seen = HashSet::with_capacity(transactions.len());
    transactions.iter().all(|tx| seen.insert(tx.hash()))
}

// ---------------------------------------------------------------------------
// Block Validator
// ---------------------------------------------------------------------------

pub struct BlockValidator<'a, C: ChainContext> {
    context: &'a C,
    settings: &'a Settings,
    block: &'a Block,
    height: u64,
    now: u64,
    minimum_version: u32,
    height_in_coinbase: bool,
}

impl<'a, C: ChainContext> BlockValidator<'a, C> {
    pub fn new(context: &'a C, settings: &'a Settings, block: &'a Block, height: u64) -> Self {
        Self {
            context,
            settings,
            block,
            height,
            now: chrono::Utc::now().timestamp().max(0) as u64,
            minimum_version: 1,
            height_in_coinbase: false,
        }
    }

    /// Judge timestamps against `now` instead of the wall clock.
    pub fn at_time(mut self, now: u64) -> Self {
        self.now = now;
        self
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn check_block(&self) -> Result<(), ValidationError> {
        let block = self.block;
        let transactions = &block.transactions;
        if transactions.is_empty() || block.serialized_size() > MAX_BLOCK_SIZE {
            return Err(ValidationError::SizeLimits);
        }

        let header = &block.header;
        if !check_proof_of_work(&header.hash(), header.bits, self.settings.pow_limit()) {
            return Err(ValidationError::ProofOfWork);
        }

        if u64::from(header.timestamp) > self.now + MAX_FUTURE_BLOCK_SECONDS {
            return Err(ValidationError::FuturisticTimestamp(header.timestamp));
        }

        if !transactions[0].is_coinbase() {
            return Err(ValidationError::FirstNotCoinbase);
        }
        if transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(ValidationError::ExtraCoinbases);
        }

        for tx in transactions {
            check_transaction(tx)?;
        }

        if !is_distinct_tx_set(transactions) {
            return Err(ValidationError::Duplicate);
        }

        if header.merkle != block.generate_merkle_root() {
            return Err(ValidationError::MerkleMismatch);
        }

        if block.is_signed_version() {
            if block.signature.len() != SIGNATURE_LENGTH {
                return Err(ValidationError::SignatureLength(block.signature.len()));
            }
            if !block.verify_signature() {
                return Err(ValidationError::InvalidBlockSignature);
            }
        } else if !block.signature.is_empty() {
            return Err(ValidationError::UnexpectedSignature);
        }
        Ok(())
    }

    /// Versions of up to `version_sample_window` blocks below this one.
    fn preceding_versions(&self) -> Result<Vec<u32>, BlockError> {
        let first = self
            .height
            .saturating_sub(self.settings.version_sample_window);
        let mut versions = Vec::new();
        for height in (first..self.height).rev() {
            // A short sample is fine; the rules just stay off longer.
            match self.context.fetch_header(height)? {
                Some(header) => versions.push(header.version),
                None => break,
            }
        }
        Ok(versions)
    }

    pub fn initialize_context(&mut self) -> Result<(), BlockError> {
        let upgraded = self
            .preceding_versions()?
            .into_iter()
            .filter(|version| *version >= SIGNED_BLOCK_VERSION)
            .count() as u64;

        self.minimum_version = if upgraded >= self.settings.version_reject_count {
            SIGNED_BLOCK_VERSION
        } else {
            1
        };

        let signalled = upgraded >= self.settings.version_enforce_count
            && self.block.header.version >= SIGNED_BLOCK_VERSION;
        let by_height = self
            .settings
            .height_in_coinbase_height
            .is_some_and(|activation| self.height >= activation);
        self.height_in_coinbase = signalled || by_height;
        Ok(())
    }

    /// The compact target this block must carry.
    pub fn work_required(&self) -> Result<u32, BlockError> {
        if self.height == 0 {
            return Ok(self.settings.proof_of_work_limit);
        }
        let parent = self.header_at(self.height - 1)?;
        let interval = self.settings.retarget_interval.max(1);
        if !self.settings.retarget || self.height % interval != 0 {
            return Ok(parent.bits);
        }
        let first = self.header_at(self.height.saturating_sub(interval))?;
        let actual = u64::from(parent.timestamp.saturating_sub(first.timestamp));
        Ok(retarget(
            parent.bits,
            actual,
            self.settings.target_timespan,
            self.settings.pow_limit(),
        ))
    }

    fn header_at(&self, height: u64) -> Result<Header, BlockError> {
        Ok(self
            .context
            .fetch_header(height)?
            .ok_or(ValidationError::MissingAncestor(height))?)
    }

    pub fn accept_block(&self) -> Result<(), BlockError> {
        let header = &self.block.header;
        if header.number != self.height {
            return Err(ValidationError::HeightMismatch {
                claimed: header.number,
                actual: self.height,
            }
            .into());
        }

        let required = self.work_required()?;
        if header.bits != required {
            return Err(ValidationError::IncorrectProofOfWork {
                required,
                actual: header.bits,
            }
            .into());
        }

        if header.timestamp <= self.context.median_time_past(self.height)? {
            return Err(ValidationError::TimestampTooEarly.into());
        }

        if !self
            .block
            .transactions
            .iter()
            .all(|tx| tx.is_final(self.height, header.timestamp))
        {
            return Err(ValidationError::NonFinalTransaction.into());
        }

        if let Some(checkpoint) = self.settings.checkpoint_at(self.height) {
            if checkpoint.hash != self.block.hash() {
                return Err(ValidationError::CheckpointsFailed(self.height).into());
            }
        }

        if header.version < self.minimum_version {
            return Err(ValidationError::OldVersionBlock {
                version: header.version,
                minimum: self.minimum_version,
            }
            .into());
        }

        if self.height_in_coinbase {
            let expected = Script::coinbase_height(self.height);
            let coinbase = self
                .block
                .transactions
                .first()
                .and_then(|tx| tx.inputs.first())
                .ok_or(ValidationError::FirstNotCoinbase)?;
            if !coinbase.script.as_bytes().starts_with(&expected) {
                return Err(ValidationError::CoinbaseHeightMismatch.into());
            }
        }
        Ok(())
    }

    /// The transaction `hash` from earlier in this block or from the
    /// context, with its height.
    fn previous_transaction(
        &self,
        hash: &Hash,
        before: usize,
    ) -> Result<Option<(Transaction, u64)>, BlockError> {
        if let Some(tx) = self.block.transactions[..before]
            .iter()
            .find(|tx| &tx.hash() == hash)
        {
            return Ok(Some((tx.clone(), self.height)));
        }
        Ok(self.context.fetch_transaction(hash)?)
    }

    pub fn connect_block(&self) -> Result<(), BlockError> {
        let started = Instant::now();
        let transactions = &self.block.transactions;
        let mut spent_in_block: HashSet<OutPoint> = HashSet::new();
        let mut fees: u64 = 0;

        for (tx_index, tx) in transactions.iter().enumerate() {
            if tx.is_coinbase() {
                continue;
            }
            let mut value_in: u64 = 0;
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let point = input.previous_output;
                let (previous, previous_height) = self
                    .previous_transaction(&point.hash, tx_index)?
                    .ok_or(ValidationError::InputNotFound(point))?;
                let output = previous
                    .outputs
                    .get(point.index as usize)
                    .ok_or(ValidationError::InputNotFound(point))?;

                if output.value > MAX_MONEY {
                    return Err(ValidationError::InputValueOverflow.into());
                }

                if previous.is_coinbase()
                    && self.height.saturating_sub(previous_height) < self.settings.coinbase_maturity
                {
                    return Err(ValidationError::ImmatureCoinbase(point).into());
                }

                let sighash = tx.signature_hash(input_index as u32);
                if !output.script.verify_spend(&input.script, &sighash) {
                    return Err(ValidationError::ScriptFailed(point).into());
                }

                if !spent_in_block.insert(point) || self.context.is_output_spent(&point)? {
                    return Err(ValidationError::DoubleSpend(point).into());
                }

                value_in = value_in
                    .checked_add(output.value)
                    .filter(|value| *value <= MAX_MONEY)
                    .ok_or(ValidationError::InputValueOverflow)?;
            }

            let value_out = tx
                .total_output_value()
                .ok_or(ValidationError::OutputValueOverflow)?;
            let fee = value_in
                .checked_sub(value_out)
                .ok_or(ValidationError::SpendExceedsValue)?;
            fees = fees
                .checked_add(fee)
                .filter(|fees| *fees <= MAX_MONEY)
                .ok_or(ValidationError::FeesOutOfRange)?;
        }

        let reward = transactions
            .first()
            .ok_or(ValidationError::FirstNotCoinbase)?
            .total_output_value()
            .ok_or(ValidationError::OutputValueOverflow)?;
        if reward > self.settings.subsidy(self.height).saturating_add(fees) {
            return Err(ValidationError::CoinbaseTooLarge.into());
        }

        debug!(
            height = self.height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connected block"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::chain::{Script, TxInput, TxOutput};
    use crate::config::Checkpoint;
    use crate::crypto::KeelKeypair;

    /// An in-memory chain: headers by height, confirmed transactions and
    /// spent outputs.
    #[derive(Default)]
    struct FakeChain {
        headers: Vec<Header>,
        transactions: HashMap<Hash, (Transaction, u64)>,
        spent: HashSet<OutPoint>,
    }

    impl FakeChain {
        fn with_blocks(blocks: &[Block]) -> Self {
            let mut chain = Self::default();
            for (height, block) in blocks.iter().enumerate() {
                chain.headers.push(block.header);
                for tx in &block.transactions {
                    for input in tx.inputs.iter().filter(|_| !tx.is_coinbase()) {
                        chain.spent.insert(input.previous_output);
                    }
                    chain.transactions.insert(tx.hash(), (tx.clone(), height as u64));
                }
            }
            chain
        }
    }

    impl ChainContext for FakeChain {
        fn fetch_header(&self, height: u64) -> Result<Option<Header>, DbError> {
            Ok(self.headers.get(height as usize).copied())
        }

        fn fetch_transaction(&self, hash: &Hash) -> Result<Option<(Transaction, u64)>, DbError> {
            Ok(self.transactions.get(hash).cloned())
        }

        fn is_output_spent(&self, outpoint: &OutPoint) -> Result<bool, DbError> {
            Ok(self.spent.contains(outpoint))
        }
    }

    fn settings() -> Settings {
        Settings {
            coinbase_maturity: 1,
            ..Settings::regtest()
        }
    }

    /// A child of `parent` mined to the regtest target.
    fn mine(parent: &Block, height: u64, mut transactions: Vec<Transaction>) -> Block {
        if transactions.first().map_or(true, |tx| !tx.is_coinbase()) {
            transactions.insert(
                0,
                Transaction::coinbase(height, b"", vec![TxOutput::new(50, Script::empty())]),
            );
        }
        let mut block = Block::new(
            Header {
                version: 1,
                previous_block_hash: parent.hash(),
                merkle: [0u8; 32],
                timestamp: parent.header.timestamp + 600,
                bits: parent.header.bits,
                nonce: 0,
                number: height,
            },
            transactions,
        );
        solve(&mut block);
        block
    }

    fn solve(block: &mut Block) {
        block.header.merkle = block.generate_merkle_root();
        let limit = settings().pow_limit();
        while !check_proof_of_work(&block.hash(), block.header.bits, limit) {
            block.header.nonce += 1;
        }
    }

    fn fixture() -> (Settings, Vec<Block>) {
        let settings = settings();
        let genesis = settings.genesis_block();
        let one = mine(&genesis, 1, vec![]);
        (settings, vec![genesis, one])
    }

    /// The rule a block broke. The in-memory chain never fails a read.
    fn verdict(e: BlockError) -> ValidationError {
        match e {
            BlockError::Invalid(e) => e,
            BlockError::Store(e) => panic!("in-memory chain failed: {e}"),
        }
    }

    fn validate(chain: &FakeChain, settings: &Settings, block: &Block, height: u64) -> Result<(), ValidationError> {
        let mut validator = BlockValidator::new(chain, settings, block, height);
        validator.check_block()?;
        validator.initialize_context().map_err(verdict)?;
        validator.accept_block().map_err(verdict)?;
        validator.connect_block().map_err(verdict)
    }

    #[test]
    fn valid_child_passes() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let spend = Transaction::new(
            vec![TxInput::new(OutPoint::new(blocks[1].transactions[0].hash(), 0))],
            vec![TxOutput::new(45, Script::empty())],
        );
        let block = mine(&blocks[1], 2, vec![spend]);
        assert_eq!(validate(&chain, &settings, &block, 2), Ok(()));
    }

    #[test]
    fn duplicate_transactions_fail_check_block() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let spend = Transaction::new(
            vec![TxInput::new(OutPoint::new(blocks[1].transactions[0].hash(), 0))],
            vec![TxOutput::new(1, Script::empty())],
        );
        let block = mine(&blocks[1], 2, vec![spend.clone(), spend]);
        let err = BlockValidator::new(&chain, &settings, &block, 2)
            .check_block()
            .unwrap_err();
        assert_eq!(err.code(), "duplicate");
    }

    #[test]
    fn wrong_coinbase_height_fails_accept_block() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let wrong = Transaction::coinbase(7, b"", vec![TxOutput::new(50, Script::empty())]);
        let block = mine(&blocks[1], 2, vec![wrong]);

        let mut validator = BlockValidator::new(&chain, &settings, &block, 2);
        validator.check_block().unwrap();
        validator.initialize_context().unwrap();
        assert_eq!(
            validator.accept_block().map_err(verdict),
            Err(ValidationError::CoinbaseHeightMismatch)
        );
    }

    #[test]
    fn coinbase_height_rule_follows_settings() {
        let settings = Settings {
            height_in_coinbase_height: None,
            ..settings()
        };
        let genesis = settings.genesis_block();
        let chain = FakeChain::with_blocks(std::slice::from_ref(&genesis));
        let wrong = Transaction::coinbase(7, b"", vec![TxOutput::new(50, Script::empty())]);
        let block = mine(&genesis, 1, vec![wrong]);

        let mut validator = BlockValidator::new(&chain, &settings, &block, 1);
        validator.initialize_context().unwrap();
        assert_eq!(validator.accept_block().map_err(verdict), Ok(()));
    }

    #[test]
    fn double_spend_fails_connect_block() {
        let (settings, blocks) = fixture();
        let coinbase_point = OutPoint::new(blocks[1].transactions[0].hash(), 0);
        let mut chain = FakeChain::with_blocks(&blocks);
        chain.spent.insert(coinbase_point);

        let spend = Transaction::new(
            vec![TxInput::new(coinbase_point)],
            vec![TxOutput::new(1, Script::empty())],
        );
        let block = mine(&blocks[1], 2, vec![spend]);
        let err = validate(&chain, &settings, &block, 2).unwrap_err();
        assert_eq!(err, ValidationError::DoubleSpend(coinbase_point));
        assert_eq!(err.code(), "double_spend");
        assert!(!err.is_transient());
    }

    #[test]
    fn double_spend_within_block() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let point = OutPoint::new(blocks[1].transactions[0].hash(), 0);
        let a = Transaction::new(vec![TxInput::new(point)], vec![TxOutput::new(1, Script::empty())]);
        let b = Transaction::new(vec![TxInput::new(point)], vec![TxOutput::new(2, Script::empty())]);
        let block = mine(&blocks[1], 2, vec![a, b]);
        assert_eq!(
            validate(&chain, &settings, &block, 2),
            Err(ValidationError::DoubleSpend(point))
        );
    }

    #[test]
    fn spends_from_earlier_in_block_connect() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let first = Transaction::new(
            vec![TxInput::new(OutPoint::new(blocks[1].transactions[0].hash(), 0))],
            vec![TxOutput::new(40, Script::empty())],
        );
        let second = Transaction::new(
            vec![TxInput::new(OutPoint::new(first.hash(), 0))],
            vec![TxOutput::new(40, Script::empty())],
        );
        let block = mine(&blocks[1], 2, vec![first, second]);
        assert_eq!(validate(&chain, &settings, &block, 2), Ok(()));
    }

    #[test]
    fn pay_to_key_requires_signature() {
        let kp = KeelKeypair::from_seed(&[8u8; 32]);
        let settings = settings();
        let genesis = settings.genesis_block();
        let owned = Transaction::coinbase(1, b"", vec![TxOutput::new(50, Script::pay_to_key(&kp.public_key()))]);
        let one = mine(&genesis, 1, vec![owned.clone()]);
        let chain = FakeChain::with_blocks(&[genesis, one.clone()]);

        let mut spend = Transaction::new(
            vec![TxInput::new(OutPoint::new(owned.hash(), 0))],
            vec![TxOutput::new(50, Script::empty())],
        );
        let unsigned = mine(&one, 2, vec![spend.clone()]);
        assert_eq!(
            validate(&chain, &settings, &unsigned, 2).unwrap_err().code(),
            "validate_inputs_failed"
        );

        spend.sign_input(0, &kp);
        let signed = mine(&one, 2, vec![spend]);
        assert_eq!(validate(&chain, &settings, &signed, 2), Ok(()));
    }

    #[test]
    fn coinbase_maturity_is_enforced() {
        let settings = Settings {
            coinbase_maturity: 5,
            ..settings()
        };
        let (_, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let point = OutPoint::new(blocks[1].transactions[0].hash(), 0);
        let spend = Transaction::new(vec![TxInput::new(point)], vec![TxOutput::new(1, Script::empty())]);
        let block = mine(&blocks[1], 2, vec![spend]);
        assert_eq!(
            validate(&chain, &settings, &block, 2),
            Err(ValidationError::ImmatureCoinbase(point))
        );
    }

    #[test]
    fn overpaying_coinbase_rejected() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let greedy = Transaction::coinbase(2, b"", vec![TxOutput::new(settings.subsidy(2) + 1, Script::empty())]);
        let block = mine(&blocks[1], 2, vec![greedy]);
        assert_eq!(
            validate(&chain, &settings, &block, 2),
            Err(ValidationError::CoinbaseTooLarge)
        );
    }

    #[test]
    fn structural_failures() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);

        let mut bad_merkle = mine(&blocks[1], 2, vec![]);
        bad_merkle.header.merkle = [1u8; 32];
        let err = BlockValidator::new(&chain, &settings, &bad_merkle, 2).check_block();
        assert!(matches!(
            err,
            Err(ValidationError::MerkleMismatch) | Err(ValidationError::ProofOfWork)
        ));

        let mut future = mine(&blocks[1], 2, vec![]);
        future.header.timestamp = u32::MAX;
        solve(&mut future);
        assert_eq!(
            BlockValidator::new(&chain, &settings, &future, 2)
                .at_time(1_000)
                .check_block()
                .unwrap_err()
                .code(),
            "futuristic_timestamp"
        );

        let mut no_coinbase = mine(&blocks[1], 2, vec![]);
        no_coinbase.transactions[0] = Transaction::new(
            vec![TxInput::new(OutPoint::new([1u8; 32], 0))],
            vec![TxOutput::new(1, Script::empty())],
        );
        solve(&mut no_coinbase);
        assert_eq!(
            BlockValidator::new(&chain, &settings, &no_coinbase, 2).check_block(),
            Err(ValidationError::FirstNotCoinbase)
        );
    }

    #[test]
    fn signed_blocks_need_a_valid_signature() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let kp = KeelKeypair::from_seed(&[2u8; 32]);
        let coinbase = Transaction::coinbase(2, b"", vec![TxOutput::new(50, Script::pay_to_key(&kp.public_key()))]);
        let mut block = mine(&blocks[1], 2, vec![coinbase]);
        block.header.version = SIGNED_BLOCK_VERSION;
        solve(&mut block);
        assert_eq!(
            BlockValidator::new(&chain, &settings, &block, 2).check_block(),
            Err(ValidationError::SignatureLength(0))
        );
        block.sign(&KeelKeypair::from_seed(&[3u8; 32]));
        assert_eq!(
            BlockValidator::new(&chain, &settings, &block, 2).check_block(),
            Err(ValidationError::InvalidBlockSignature)
        );
        block.sign(&kp);
        assert_eq!(
            BlockValidator::new(&chain, &settings, &block, 2).check_block(),
            Ok(())
        );
    }

    #[test]
    fn context_rules() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);

        let mut wrong_bits = mine(&blocks[1], 2, vec![]);
        wrong_bits.header.bits = 0x2000ffff;
        solve(&mut wrong_bits);
        let validator = BlockValidator::new(&chain, &settings, &wrong_bits, 2);
        assert_eq!(verdict(validator.accept_block().unwrap_err()).code(), "incorrect_proof_of_work");

        let mut early = mine(&blocks[1], 2, vec![]);
        early.header.timestamp = blocks[0].header.timestamp;
        solve(&mut early);
        let validator = BlockValidator::new(&chain, &settings, &early, 2);
        assert_eq!(
            validator.accept_block().map_err(verdict),
            Err(ValidationError::TimestampTooEarly)
        );

        let misplaced = mine(&blocks[1], 2, vec![]);
        let validator = BlockValidator::new(&chain, &settings, &misplaced, 3);
        assert!(matches!(
            validator.accept_block().map_err(verdict),
            Err(ValidationError::HeightMismatch { claimed: 2, actual: 3 })
        ));
    }

    #[test]
    fn checkpoints_pin_blocks() {
        let (mut settings, blocks) = fixture();
        settings.checkpoints.push(Checkpoint {
            height: 2,
            hash: [9u8; 32],
        });
        let chain = FakeChain::with_blocks(&blocks);
        let block = mine(&blocks[1], 2, vec![]);
        let mut validator = BlockValidator::new(&chain, &settings, &block, 2);
        validator.initialize_context().unwrap();
        assert_eq!(
            validator.accept_block().map_err(verdict),
            Err(ValidationError::CheckpointsFailed(2))
        );
    }

    #[test]
    fn missing_ancestors_are_transient() {
        let settings = settings();
        let chain = FakeChain::default();
        let genesis = settings.genesis_block();
        let block = mine(&genesis, 1, vec![]);
        let err = verdict(
            BlockValidator::new(&chain, &settings, &block, 1)
                .accept_block()
                .unwrap_err(),
        );
        assert_eq!(err, ValidationError::MissingAncestor(0));
        assert!(err.is_transient());
    }

    /// A context whose reads all fail.
    struct BrokenChain;

    impl ChainContext for BrokenChain {
        fn fetch_header(&self, _: u64) -> Result<Option<Header>, DbError> {
            Err(DbError::Corrupt("unreadable header".into()))
        }

        fn fetch_transaction(&self, _: &Hash) -> Result<Option<(Transaction, u64)>, DbError> {
            Err(DbError::Corrupt("unreadable transaction".into()))
        }

        fn is_output_spent(&self, _: &OutPoint) -> Result<bool, DbError> {
            Err(DbError::Corrupt("unreadable spend".into()))
        }
    }

    #[test]
    fn failed_reads_are_not_verdicts() {
        let (settings, blocks) = fixture();
        let point = OutPoint::new(blocks[1].transactions[0].hash(), 0);
        let block = mine(&blocks[1], 2, vec![Transaction::new(
            vec![TxInput::new(point)],
            vec![TxOutput::new(1, Script::empty())],
        )]);

        let validator = BlockValidator::new(&BrokenChain, &settings, &block, 2);
        assert_eq!(validator.check_block(), Ok(()));
        assert!(matches!(validator.accept_block(), Err(BlockError::Store(_))));
        assert!(matches!(validator.connect_block(), Err(BlockError::Store(_))));
    }

    #[test]
    fn signature_bytes_must_match_the_version() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);

        let mut unsigned = mine(&blocks[1], 2, vec![]);
        let hash = unsigned.hash();
        unsigned.signature = vec![7u8; 300];
        assert_eq!(unsigned.hash(), hash);
        let err = BlockValidator::new(&chain, &settings, &unsigned, 2)
            .check_block()
            .unwrap_err();
        assert_eq!(err, ValidationError::UnexpectedSignature);
        assert!(err.is_malleable());

        let kp = KeelKeypair::from_seed(&[2u8; 32]);
        let coinbase = Transaction::coinbase(2, b"", vec![TxOutput::new(50, Script::pay_to_key(&kp.public_key()))]);
        let mut signed = mine(&blocks[1], 2, vec![coinbase]);
        signed.header.version = SIGNED_BLOCK_VERSION;
        solve(&mut signed);
        signed.sign(&kp);
        signed.signature.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            BlockValidator::new(&chain, &settings, &signed, 2).check_block(),
            Err(ValidationError::SignatureLength(SIGNATURE_LENGTH + 8))
        );
    }

    #[test]
    fn accept_block_without_coinbase_does_not_panic() {
        let (settings, blocks) = fixture();
        let chain = FakeChain::with_blocks(&blocks);
        let mut empty = mine(&blocks[1], 2, vec![]);
        empty.transactions.clear();

        let mut validator = BlockValidator::new(&chain, &settings, &empty, 2);
        validator.initialize_context().unwrap();
        assert_eq!(
            validator.accept_block().map_err(verdict),
            Err(ValidationError::FirstNotCoinbase)
        );
        assert_eq!(
            validator.connect_block().map_err(verdict),
            Err(ValidationError::FirstNotCoinbase)
        );
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let mut chain = FakeChain::default();
        let settings = settings();
        let mut parent = settings.genesis_block();
        chain.headers.push(parent.header);
        for height in 1..20 {
            let block = mine(&parent, height, vec![]);
            chain.headers.push(block.header);
            parent = block;
        }
        let base = chain.headers[0].timestamp;
        // Heights 9..=19, median is height 14.
        assert_eq!(chain.median_time_past(20).unwrap(), base + 14 * 600);
        assert_eq!(chain.median_time_past(0).unwrap(), 0);
    }
}
