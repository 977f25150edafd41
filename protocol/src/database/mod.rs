//! # Keel Database
//!
//! The chain's persistent state, one memory-mapped file per table, all in
//! one directory:
//!
//! | File                | Structure        | Key              | Value                         |
//! |---------------------|------------------|------------------|-------------------------------|
//! | `block_table`       | slab hash table  | block hash       | header, height, tx hashes     |
//! | `block_index`       | record array     | height           | `block_table` offset          |
//! | `transaction_table` | slab hash table  | tx hash          | height, position, tx bytes    |
//! | `spend_table`       | record hash table| output point     | spending input point          |
//! | `history_table/rows`| record multimap  | address hash     | output / spend rows           |
//! | `account_table`     | slab hash table  | BLAKE3(name)     | account blob                  |
//! | `asset_table`       | slab hash table  | BLAKE3(symbol)   | registration blob             |
//! | `did_table`         | slab hash table  | BLAKE3(symbol)   | registration blob             |
//!
//! ## Write Ordering
//!
//! `push` writes transactions, spends and history first and the block
//! last; the block's index entry is what makes the height visible. `pop`
//! runs the other way round: the height disappears first, then the
//! block's transactions are unwound. Every step ends with a sync, so a
//! crash leaves the tip at a block boundary.
//!
//! Not-found is `Ok(None)`; `DbError` is reserved for failures.

pub mod account_db;
pub mod block_db;
pub mod history_db;
pub mod registry_db;
pub mod spend_db;
pub mod transaction_db;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

pub use account_db::{Account, AccountDatabase};
pub use block_db::{BlockDatabase, BlockResult, BlockStats};
pub use history_db::{HistoryDatabase, HistoryKind, HistoryRow};
pub use registry_db::{RegistryDatabase, RegistryEntry};
pub use spend_db::SpendDatabase;
pub use transaction_db::{TransactionDatabase, TransactionResult};

use crate::chain::{Block, CodecError, OutPoint, Reader, Transaction, TxOutput};
use crate::config::{self, Settings};
use crate::storage::{StoreError, TableStats};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database is inconsistent: {0}")]
    Corrupt(String),

    #[error("database directory {0} is in use by another process")]
    Locked(PathBuf),

    #[error("chain is empty")]
    Empty,
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Blob Encoding
// ---------------------------------------------------------------------------

/// `[len: u32][bincode(value)]`. Slab values carry no length of their own,
/// so anything not self-delimiting gets this prefix.
pub(crate) fn encode_blob<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    let body = bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub(crate) fn decode_blob<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    let mut reader = Reader::new(bytes);
    let body = reader.var_bytes()?;
    bincode::deserialize(body).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// DataBase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DataBaseStats {
    pub blocks: BlockStats,
    pub transactions: TableStats,
    pub spends: TableStats,
    pub history: TableStats,
    pub history_rows: u32,
    pub accounts: TableStats,
    pub assets: TableStats,
    pub dids: TableStats,
}

/// Every table of one chain, opened together and held under an exclusive
/// lock on the directory.
#[derive(Debug)]
pub struct DataBase {
    directory: PathBuf,
    lock: File,
    pub blocks: BlockDatabase,
    pub transactions: TransactionDatabase,
    pub spends: SpendDatabase,
    pub history: HistoryDatabase,
    pub accounts: AccountDatabase,
    pub assets: RegistryDatabase,
    pub dids: RegistryDatabase,
    history_start_height: u64,
    retain_unlinked_blocks: bool,
}

impl DataBase {
    fn lock(directory: &Path) -> DbResult<File> {
        let path = directory.join(config::LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| DbError::Locked(directory.to_path_buf()))?;
        Ok(file)
    }

    /// Create every table file in `directory`. Nothing is stored; callers
    /// push the genesis block themselves.
    pub fn create<P: AsRef<Path>>(directory: P, settings: &Settings) -> DbResult<Self> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory).map_err(|e| StoreError::io(directory, e))?;
        let lock = Self::lock(directory)?;
        let buckets = &settings.buckets;
        let path = |name: &str| directory.join(name);

        let db = Self {
            directory: directory.to_path_buf(),
            lock,
            blocks: BlockDatabase::create(
                &path(config::BLOCK_TABLE_FILE),
                &path(config::BLOCK_INDEX_FILE),
                buckets.block,
            )?,
            transactions: TransactionDatabase::create(
                &path(config::TRANSACTION_TABLE_FILE),
                buckets.transaction,
            )?,
            spends: SpendDatabase::create(&path(config::SPEND_TABLE_FILE), buckets.spend)?,
            history: HistoryDatabase::create(
                &path(config::HISTORY_TABLE_FILE),
                &path(config::HISTORY_ROWS_FILE),
                buckets.history,
            )?,
            accounts: AccountDatabase::create(&path(config::ACCOUNT_TABLE_FILE), buckets.account)?,
            assets: RegistryDatabase::create(&path(config::ASSET_TABLE_FILE), buckets.asset)?,
            dids: RegistryDatabase::create(&path(config::DID_TABLE_FILE), buckets.did)?,
            history_start_height: settings.history_start_height,
            retain_unlinked_blocks: settings.retain_unlinked_blocks,
        };
        db.sync()?;
        info!(directory = %directory.display(), "created database");
        Ok(db)
    }

    /// Open an existing database. Bucket counts come from the files, not
    /// from `settings`.
    pub fn open<P: AsRef<Path>>(directory: P, settings: &Settings) -> DbResult<Self> {
        let directory = directory.as_ref();
        let lock = Self::lock(directory)?;
        let path = |name: &str| directory.join(name);

        let db = Self {
            directory: directory.to_path_buf(),
            lock,
            blocks: BlockDatabase::open(
                &path(config::BLOCK_TABLE_FILE),
                &path(config::BLOCK_INDEX_FILE),
            )?,
            transactions: TransactionDatabase::open(&path(config::TRANSACTION_TABLE_FILE))?,
            spends: SpendDatabase::open(&path(config::SPEND_TABLE_FILE))?,
            history: HistoryDatabase::open(
                &path(config::HISTORY_TABLE_FILE),
                &path(config::HISTORY_ROWS_FILE),
            )?,
            accounts: AccountDatabase::open(&path(config::ACCOUNT_TABLE_FILE))?,
            assets: RegistryDatabase::open(&path(config::ASSET_TABLE_FILE))?,
            dids: RegistryDatabase::open(&path(config::DID_TABLE_FILE))?,
            history_start_height: settings.history_start_height,
            retain_unlinked_blocks: settings.retain_unlinked_blocks,
        };
        info!(
            directory = %directory.display(),
            top = ?db.blocks.top()?,
            "opened database"
        );
        Ok(db)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether popped blocks stay reachable by hash.
    pub fn retains_unlinked_blocks(&self) -> bool {
        self.retain_unlinked_blocks
    }

    /// The output `point` refers to, from the transaction table.
    fn previous_output(&self, point: &OutPoint) -> DbResult<Option<TxOutput>> {
        let Some(result) = self.transactions.get(&point.hash)? else {
            return Ok(None);
        };
        let tx = result.transaction()?;
        Ok(tx.outputs.get(point.index as usize).cloned())
    }

    /// Append `block` at `height`.
    pub fn push(&self, block: &Block, height: u64) -> DbResult<()> {
        let record_history = height >= self.history_start_height;

        for (position, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx.hash();
            self.transactions.store(tx, height, position as u32)?;

            if !tx.is_coinbase() {
                for (index, input) in tx.inputs.iter().enumerate() {
                    let spender = OutPoint::new(tx_hash, index as u32);
                    self.spends.store(&input.previous_output, &spender)?;
                    if !record_history {
                        continue;
                    }
                    if let Some(previous) = self.previous_output(&input.previous_output)? {
                        if let Some(address) = previous.script.address_hash() {
                            self.history
                                .add_input(&address, spender, height, previous.value)?;
                        }
                    }
                }
            }

            if record_history {
                for (index, output) in tx.outputs.iter().enumerate() {
                    if let Some(address) = output.script.address_hash() {
                        self.history.add_output(
                            &address,
                            OutPoint::new(tx_hash, index as u32),
                            height,
                            output.value,
                        )?;
                    }
                }
            }
        }

        self.blocks.store(block, height)?;
        self.sync()?;
        debug!(height, hash = %block.hash_hex(), "pushed block");
        Ok(())
    }

    /// Remove the top block and return it.
    pub fn pop(&self) -> DbResult<Block> {
        let height = self.blocks.top()?.ok_or(DbError::Empty)?;
        let stored = self
            .blocks
            .get_by_height(height)?
            .ok_or_else(|| DbError::Corrupt(format!("top height {height} has no block")))?;
        let hash = stored.hash()?;
        let header = stored.header()?;
        let signature = stored.signature()?;
        let mut transactions = Vec::with_capacity(stored.transaction_count()?);
        for tx_hash in stored.transaction_hashes()? {
            let tx = self.transactions.get(&tx_hash)?.ok_or_else(|| {
                DbError::Corrupt(format!("missing transaction {}", hex::encode(tx_hash)))
            })?;
            transactions.push(tx.transaction()?);
        }

        // The height goes first so readers never see a tip whose
        // transactions are half gone.
        self.blocks.unlink(height)?;
        if !self.retain_unlinked_blocks {
            self.blocks.remove(&hash)?;
        }
        self.blocks.sync()?;

        let record_history = height >= self.history_start_height;
        for tx in transactions.iter().rev() {
            self.unwind_transaction(tx, record_history)?;
        }
        self.sync()?;

        debug!(height, hash = %hex::encode(hash), "popped block");
        Ok(Block {
            header,
            transactions,
            signature,
        })
    }

    /// Undo the writes `push` made for `tx`, newest first.
    fn unwind_transaction(&self, tx: &Transaction, record_history: bool) -> DbResult<()> {
        if record_history {
            for output in tx.outputs.iter().rev() {
                if let Some(address) = output.script.address_hash() {
                    self.history.delete_last_row(&address)?;
                }
            }
        }
        if !tx.is_coinbase() {
            for input in tx.inputs.iter().rev() {
                if record_history {
                    if let Some(previous) = self.previous_output(&input.previous_output)? {
                        if let Some(address) = previous.script.address_hash() {
                            self.history.delete_last_row(&address)?;
                        }
                    }
                }
                self.spends.remove(&input.previous_output)?;
            }
        }
        self.transactions.remove(&tx.hash())?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        self.transactions.sync()?;
        self.spends.sync()?;
        self.history.sync()?;
        self.accounts.sync()?;
        self.assets.sync()?;
        self.dids.sync()?;
        self.blocks.sync()?;
        Ok(())
    }

    pub fn flush(&self) -> DbResult<()> {
        self.transactions.flush()?;
        self.spends.flush()?;
        self.history.flush()?;
        self.accounts.flush()?;
        self.assets.flush()?;
        self.dids.flush()?;
        self.blocks.flush()?;
        Ok(())
    }

    /// Refuse further writes. Files stay mapped until `close`.
    pub fn stop(&self) {
        self.blocks.stop();
        self.transactions.stop();
        self.spends.stop();
        self.history.stop();
        self.accounts.stop();
        self.assets.stop();
        self.dids.stop();
    }

    /// Flush, truncate every file to its logical size and release the
    /// directory lock.
    pub fn close(&self) -> DbResult<()> {
        self.transactions.close()?;
        self.spends.close()?;
        self.history.close()?;
        self.accounts.close()?;
        self.assets.close()?;
        self.dids.close()?;
        self.blocks.close()?;
        self.lock
            .unlock()
            .map_err(|e| StoreError::io(self.directory.join(config::LOCK_FILE), e))?;
        info!(directory = %self.directory.display(), "closed database");
        Ok(())
    }

    pub fn statinfo(&self) -> DataBaseStats {
        let (history, history_rows) = self.history.statinfo();
        DataBaseStats {
            blocks: self.blocks.statinfo(),
            transactions: self.transactions.statinfo(),
            spends: self.spends.statinfo(),
            history,
            history_rows,
            accounts: self.accounts.statinfo(),
            assets: self.assets.statinfo(),
            dids: self.dids.statinfo(),
        }
    }
}
