//! # Chain Configuration & Constants
//!
//! Consensus constants, storage sizing and the per-network [`Settings`]
//! bundle. Anything a node operator may reasonably tune lives in
//! `Settings` and can be overridden from JSON; anything that would fork
//! the node off the network is a constant.

use std::fmt;
use std::str::FromStr;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::chain::work::target_from_compact;
use crate::chain::{Block, Header, Script, Transaction, TxOutput};
use crate::crypto::{Hash, NULL_HASH};

// ---------------------------------------------------------------------------
// Monetary Constants
// ---------------------------------------------------------------------------

/// Base units per coin.
pub const COIN: u64 = 100_000_000;

/// No output, and no sum of outputs, may exceed this.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

// ---------------------------------------------------------------------------
// Block Limits
// ---------------------------------------------------------------------------

/// Largest encoded block accepted.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Coinbase input script length bounds, inclusive.
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Blocks may be timestamped at most this far ahead of the local clock.
pub const MAX_FUTURE_BLOCK_SECONDS: u64 = 2 * 60 * 60;

/// Number of previous blocks whose timestamps form the median-time-past.
pub const MEDIAN_TIME_PAST_BLOCKS: u64 = 11;

// ---------------------------------------------------------------------------
// Organizer
// ---------------------------------------------------------------------------

/// Orphan blocks held at once.
pub const DEFAULT_BLOCK_POOL_CAPACITY: usize = 50;

/// Hashes remembered as invalid so a peer cannot make us re-validate them.
pub const MAX_INVALID_HASHES: usize = 1_000;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// File names inside a database directory.
pub const BLOCK_TABLE_FILE: &str = "block_table";
pub const BLOCK_INDEX_FILE: &str = "block_index";
pub const TRANSACTION_TABLE_FILE: &str = "transaction_table";
pub const SPEND_TABLE_FILE: &str = "spend_table";
pub const HISTORY_TABLE_FILE: &str = "history_table";
pub const HISTORY_ROWS_FILE: &str = "history_rows";
pub const ACCOUNT_TABLE_FILE: &str = "account_table";
pub const ASSET_TABLE_FILE: &str = "asset_table";
pub const DID_TABLE_FILE: &str = "did_table";
pub const LOCK_FILE: &str = "db.lock";

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// A block the chain must contain at a given height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    #[serde(with = "hex_hash")]
    pub hash: Hash,
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::crypto::hash::hash_from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Bucket counts per hash table. Fixed when a database is created; a
/// different value on open is ignored in favor of the stored one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBuckets {
    pub block: u32,
    pub transaction: u32,
    pub spend: u32,
    pub history: u32,
    pub account: u32,
    pub asset: u32,
    pub did: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: Network,

    /// Easiest allowed target, compact form.
    pub proof_of_work_limit: u32,
    /// Recompute the target every `retarget_interval` blocks. Off on
    /// regtest, where every block reuses its parent's bits.
    pub retarget: bool,
    pub retarget_interval: u64,
    /// Intended seconds per retarget window.
    pub target_timespan: u64,

    pub initial_subsidy: u64,
    pub subsidy_halving_interval: u64,
    pub coinbase_maturity: u64,

    /// Height from which coinbase scripts must start with the block height,
    /// regardless of version signalling. `None` leaves it to signalling.
    pub height_in_coinbase_height: Option<u64>,
    /// Blocks sampled when counting versions.
    pub version_sample_window: u64,
    /// Versions at or above the new level needed to enforce its rules.
    pub version_enforce_count: u64,
    /// Versions at or above the new level needed to reject older blocks.
    pub version_reject_count: u64,

    pub checkpoints: Vec<Checkpoint>,

    pub block_pool_capacity: usize,
    /// Outputs and spends below this height are not written to history.
    pub history_start_height: u64,
    /// Keep popped blocks fetchable by hash (see `DataBase::pop`).
    pub retain_unlinked_blocks: bool,

    pub buckets: TableBuckets,
}

impl Settings {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            proof_of_work_limit: 0x1d00ffff,
            retarget: true,
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            initial_subsidy: 50 * COIN,
            subsidy_halving_interval: 210_000,
            coinbase_maturity: 100,
            height_in_coinbase_height: None,
            version_sample_window: 1_000,
            version_enforce_count: 750,
            version_reject_count: 950,
            checkpoints: Vec::new(),
            block_pool_capacity: DEFAULT_BLOCK_POOL_CAPACITY,
            history_start_height: 0,
            retain_unlinked_blocks: true,
            buckets: TableBuckets {
                block: 650_000,
                transaction: 4_000_000,
                spend: 4_000_000,
                history: 1_000_000,
                account: 10_000,
                asset: 10_000,
                did: 10_000,
            },
        }
    }

    /// Trivial difficulty, no retargeting, tiny tables. For tests and local
    /// experimentation.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            proof_of_work_limit: 0x207fffff,
            retarget: false,
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            initial_subsidy: 50 * COIN,
            subsidy_halving_interval: 150,
            coinbase_maturity: 100,
            height_in_coinbase_height: Some(0),
            version_sample_window: 100,
            version_enforce_count: 75,
            version_reject_count: 95,
            checkpoints: Vec::new(),
            block_pool_capacity: DEFAULT_BLOCK_POOL_CAPACITY,
            history_start_height: 0,
            retain_unlinked_blocks: true,
            buckets: TableBuckets {
                block: 101,
                transaction: 211,
                spend: 211,
                history: 101,
                account: 31,
                asset: 31,
                did: 31,
            },
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// The easiest target as a number.
    pub fn pow_limit(&self) -> U256 {
        target_from_compact(self.proof_of_work_limit).unwrap_or_default()
    }

    /// Block reward at `height`, before fees.
    pub fn subsidy(&self, height: u64) -> u64 {
        let halvings = height / self.subsidy_halving_interval.max(1);
        if halvings >= 64 {
            return 0;
        }
        self.initial_subsidy >> halvings
    }

    pub fn checkpoint_at(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.height == height)
    }

    /// Height of the highest checkpoint, zero when there are none.
    pub fn last_checkpoint_height(&self) -> u64 {
        self.checkpoints.iter().map(|c| c.height).max().unwrap_or(0)
    }

    /// The network's first block. Never validated, only stored.
    pub fn genesis_block(&self) -> Block {
        let coinbase = Transaction::coinbase(
            0,
            b"keel genesis",
            vec![TxOutput::new(self.initial_subsidy, Script::empty())],
        );
        let mut block = Block::new(
            Header {
                version: 1,
                previous_block_hash: NULL_HASH,
                merkle: NULL_HASH,
                timestamp: 1_760_000_000,
                bits: self.proof_of_work_limit,
                nonce: 0,
                number: 0,
            },
            vec![coinbase],
        );
        block.header.merkle = block.generate_merkle_root();
        block
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::mainnet()
    }
}
