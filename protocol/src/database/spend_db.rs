//! # Spend Database
//!
//! Record hash table from a spent output to the input that spent it. Both
//! are 36-byte points (`[hash: 32][index: u32]`).

use std::path::Path;

use super::DbResult;
use crate::chain::{OutPoint, POINT_SIZE};
use crate::storage::{RecordHashTable, TableStats};

#[derive(Debug)]
pub struct SpendDatabase {
    table: RecordHashTable<POINT_SIZE>,
}

impl SpendDatabase {
    pub fn create(path: &Path, buckets: u32) -> DbResult<Self> {
        Ok(Self {
            table: RecordHashTable::create(path, buckets, POINT_SIZE as u64)?,
        })
    }

    pub fn open(path: &Path) -> DbResult<Self> {
        Ok(Self {
            table: RecordHashTable::open(path, POINT_SIZE as u64)?,
        })
    }

    /// Record that `spender` (transaction hash and input index) spends
    /// `outpoint`.
    pub fn store(&self, outpoint: &OutPoint, spender: &OutPoint) -> DbResult<()> {
        let spender = spender.to_bytes();
        self.table
            .store(&outpoint.to_bytes(), |buf| buf.copy_from_slice(&spender))?;
        Ok(())
    }

    /// The input spending `outpoint`, if it is spent.
    pub fn get(&self, outpoint: &OutPoint) -> DbResult<Option<OutPoint>> {
        match self.table.find(&outpoint.to_bytes())? {
            Some(entry) => Ok(Some(OutPoint::from_bytes(entry.value()?)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, outpoint: &OutPoint) -> DbResult<bool> {
        Ok(self.table.unlink(&outpoint.to_bytes())?)
    }

    pub fn sync(&self) -> DbResult<()> {
        Ok(self.table.sync()?)
    }

    pub fn flush(&self) -> DbResult<()> {
        Ok(self.table.flush()?)
    }

    pub fn stop(&self) {
        self.table.stop()
    }

    pub fn close(&self) -> DbResult<()> {
        Ok(self.table.close()?)
    }

    pub fn statinfo(&self) -> TableStats {
        self.table.statinfo()
    }
}
