//! # Block Database
//!
//! Two files:
//!
//! - `block_table` — a slab hash table keyed by block hash. Each slab
//!   holds the header and metadata, not the transactions themselves:
//!
//!   ```text
//!   [header: 92][height: u32][tx_count: u32][tx_hash: 32 × tx_count]
//!   [sig_len: u8][signature: sig_len]
//!   ```
//!
//! - `block_index` — a dense array of slab offsets indexed by height.
//!   An offset of 0 marks a gap (no slab lives at offset 0).
//!
//! `unlink` only truncates the height index. Whether the hash-keyed slabs
//! go too is the caller's decision, see [`BlockDatabase::remove`].

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::DbResult;
use crate::chain::{Block, Header, Reader, HEADER_SIZE};
use crate::crypto::Hash;
use crate::storage::{Entry, MappedFile, RecordManager, SlabHashTable, StoreError, TableStats};

/// Width of one height-index entry.
const OFFSET_SIZE: u64 = 8;

/// Gap marker in the height index.
const EMPTY: u64 = 0;

// ---------------------------------------------------------------------------
// BlockResult
// ---------------------------------------------------------------------------

/// A stored block record, read lazily out of the mapping.
#[derive(Debug, Clone)]
pub struct BlockResult {
    entry: Entry<u64>,
}

impl BlockResult {
    fn reader(&self) -> DbResult<Reader<'_>> {
        Ok(Reader::new(self.entry.value()?))
    }

    /// Slab offset of this record, as stored in the height index.
    pub fn offset(&self) -> u64 {
        self.entry.link()
    }

    pub fn hash(&self) -> DbResult<Hash> {
        let key = self.entry.key()?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(key);
        Ok(hash)
    }

    pub fn header(&self) -> DbResult<Header> {
        let mut reader = self.reader()?;
        Ok(Header::decode(&mut reader)?)
    }

    /// Raw header bytes, exactly as hashed.
    pub fn header_bytes(&self) -> DbResult<[u8; HEADER_SIZE]> {
        Ok(self.reader()?.array()?)
    }

    pub fn height(&self) -> DbResult<u64> {
        let mut reader = self.reader()?;
        reader.bytes(HEADER_SIZE)?;
        Ok(u64::from(reader.u32()?))
    }

    pub fn transaction_count(&self) -> DbResult<usize> {
        let mut reader = self.reader()?;
        reader.bytes(HEADER_SIZE + 4)?;
        Ok(reader.u32()? as usize)
    }

    pub fn transaction_hash(&self, index: usize) -> DbResult<Option<Hash>> {
        let count = self.transaction_count()?;
        if index >= count {
            return Ok(None);
        }
        let mut reader = self.reader()?;
        reader.bytes(HEADER_SIZE + 8 + index * 32)?;
        Ok(Some(reader.hash()?))
    }

    pub fn transaction_hashes(&self) -> DbResult<Vec<Hash>> {
        let mut reader = self.reader()?;
        reader.bytes(HEADER_SIZE + 4)?;
        let count = reader.u32()? as usize;
        (0..count).map(|_| Ok(reader.hash()?)).collect()
    }

    pub fn signature(&self) -> DbResult<Vec<u8>> {
        let mut reader = self.reader()?;
        reader.bytes(HEADER_SIZE + 4)?;
        let count = reader.u32()? as usize;
        reader.bytes(count * 32)?;
        let len = reader.u8()? as usize;
        Ok(reader.bytes(len)?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// BlockDatabase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockStats {
    pub table: TableStats,
    pub heights: u32,
}

#[derive(Debug)]
pub struct BlockDatabase {
    table: SlabHashTable<32>,
    index: RecordManager,
    index_lock: Mutex<()>,
}

impl BlockDatabase {
    pub fn create(table: &Path, index: &Path, buckets: u32) -> DbResult<Self> {
        let table = SlabHashTable::create(table, buckets)?;
        let file = Arc::new(MappedFile::create(index)?);
        file.start()?;
        let index = RecordManager::new(file, 0, OFFSET_SIZE);
        index.create()?;
        Ok(Self {
            table,
            index,
            index_lock: Mutex::new(()),
        })
    }

    pub fn open(table: &Path, index: &Path) -> DbResult<Self> {
        let table = SlabHashTable::open(table)?;
        let file = Arc::new(MappedFile::open(index)?);
        file.start()?;
        let index = RecordManager::new(file, 0, OFFSET_SIZE);
        index.start()?;
        Ok(Self {
            table,
            index,
            index_lock: Mutex::new(()),
        })
    }

    fn record_size(block: &Block) -> u64 {
        (HEADER_SIZE + 4 + 4 + block.transactions.len() * 32 + 1 + block.signature.len()) as u64
    }

    /// Write the block's record and point the height index at it.
    pub fn store(&self, block: &Block, height: u64) -> DbResult<()> {
        let height32 = u32::try_from(height)
            .ok()
            .filter(|h| *h < u32::MAX)
            .ok_or(StoreError::IndexExhausted)?;
        let sig_len = block.signature_length()?;
        let tx_hashes: Vec<Hash> = block.transactions.iter().map(|tx| tx.hash()).collect();

        let offset = self
            .table
            .store(&block.hash(), Self::record_size(block), |buf| {
                let mut out = Vec::with_capacity(buf.len());
                out.extend_from_slice(&block.header.to_bytes());
                out.extend_from_slice(&height32.to_le_bytes());
                out.extend_from_slice(&(tx_hashes.len() as u32).to_le_bytes());
                for hash in &tx_hashes {
                    out.extend_from_slice(hash);
                }
                out.push(sig_len);
                out.extend_from_slice(&block.signature);
                buf.copy_from_slice(&out);
            })?;

        self.write_position(offset, height32)
    }

    fn write_position(&self, offset: u64, height: u32) -> DbResult<()> {
        let _guard = self.index_lock.lock();
        let count = self.index.count();
        if height >= count {
            let first = self.index.new_records(height + 1 - count)?;
            self.zeroize(first, height)?;
        }
        let (memory, position) = self.index.get(height)?;
        memory.write_u64(position, offset)?;
        Ok(())
    }

    /// Clear index entries `first..last` (exclusive).
    fn zeroize(&self, first: u32, last: u32) -> DbResult<()> {
        for height in first..last {
            let (memory, position) = self.index.get(height)?;
            memory.write_u64(position, EMPTY)?;
        }
        Ok(())
    }

    fn read_position(&self, height: u32) -> DbResult<u64> {
        let (memory, position) = self.index.get(height)?;
        Ok(memory.read_u64(position)?)
    }

    pub fn get_by_hash(&self, hash: &Hash) -> DbResult<Option<BlockResult>> {
        Ok(self.table.find(hash)?.map(|entry| BlockResult { entry }))
    }

    pub fn get_by_height(&self, height: u64) -> DbResult<Option<BlockResult>> {
        let Ok(height) = u32::try_from(height) else {
            return Ok(None);
        };
        if height >= self.index.count() {
            return Ok(None);
        }
        match self.read_position(height)? {
            EMPTY => Ok(None),
            offset => Ok(Some(BlockResult {
                entry: self.table.get(offset)?,
            })),
        }
    }

    /// Drop every height from `from_height` up out of the index.
    pub fn unlink(&self, from_height: u64) -> DbResult<()> {
        let _guard = self.index_lock.lock();
        let count = self.index.count();
        let Ok(from) = u32::try_from(from_height) else {
            return Ok(());
        };
        if from < count {
            self.zeroize(from, count)?;
            self.index.set_count(from)?;
        }
        Ok(())
    }

    /// Unlink the hash-keyed record. Returns `false` if it was not there.
    pub fn remove(&self, hash: &Hash) -> DbResult<bool> {
        Ok(self.table.unlink(hash)?)
    }

    /// The highest populated height.
    pub fn top(&self) -> DbResult<Option<u64>> {
        let mut height = self.index.count();
        while height > 0 {
            height -= 1;
            if self.read_position(height)? != EMPTY {
                return Ok(Some(u64::from(height)));
            }
        }
        Ok(None)
    }

    /// First and last gap below the index end, if any.
    pub fn gap_range(&self) -> DbResult<Option<(u64, u64)>> {
        let count = self.index.count();
        let Some(first) = self.next_empty(0, count)? else {
            return Ok(None);
        };
        let mut last = count;
        while last > first + 1 {
            last -= 1;
            if self.read_position(last)? == EMPTY {
                return Ok(Some((u64::from(first), u64::from(last))));
            }
        }
        Ok(Some((u64::from(first), u64::from(first))))
    }

    /// First missing height at or after `start`. A chain with no gaps
    /// reports its length. `None` when the index is empty or `start` lies
    /// past its end.
    pub fn next_gap(&self, start: u64) -> DbResult<Option<u64>> {
        let count = self.index.count();
        if count == 0 || start > u64::from(count) {
            return Ok(None);
        }
        let found = self.next_empty(start as u32, count)?;
        Ok(Some(u64::from(found.unwrap_or(count))))
    }

    fn next_empty(&self, start: u32, end: u32) -> DbResult<Option<u32>> {
        for height in start..end {
            if self.read_position(height)? == EMPTY {
                return Ok(Some(height));
            }
        }
        Ok(None)
    }

    pub fn sync(&self) -> DbResult<()> {
        self.table.sync()?;
        self.index.sync()?;
        Ok(())
    }

    pub fn flush(&self) -> DbResult<()> {
        self.table.flush()?;
        self.index.file().flush()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.table.stop();
        self.index.file().stop();
    }

    pub fn close(&self) -> DbResult<()> {
        self.index.sync()?;
        self.index.file().close()?;
        self.table.close()?;
        Ok(())
    }

    pub fn statinfo(&self) -> BlockStats {
        BlockStats {
            table: self.table.statinfo(),
            heights: self.index.count(),
        }
    }
}
