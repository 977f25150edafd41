//! # Account Database
//!
//! Named accounts, keyed by the BLAKE3 hash of the name. The chain rules
//! never read these; the table exists so a node can be sized for them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{decode_blob, encode_blob, DbResult};
use crate::crypto::blake3_hash;
use crate::storage::{SlabHashTable, TableStats};

/// An account record. The name is stored alongside the payload so the
/// entry can be read back without knowing the key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub nonce: u64,
    /// Opaque application data.
    pub data: Vec<u8>,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct AccountDatabase {
    table: SlabHashTable<32>,
}

impl AccountDatabase {
    pub fn create(path: &Path, buckets: u32) -> DbResult<Self> {
        Ok(Self {
            table: SlabHashTable::create(path, buckets)?,
        })
    }

    pub fn open(path: &Path) -> DbResult<Self> {
        Ok(Self {
            table: SlabHashTable::open(path)?,
        })
    }

    /// Store `account`, shadowing any earlier entry with the same name.
    pub fn store(&self, account: &Account) -> DbResult<()> {
        let blob = encode_blob(account)?;
        self.table
            .store(&blake3_hash(account.name.as_bytes()), blob.len() as u64, |buf| {
                buf.copy_from_slice(&blob)
            })?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> DbResult<Option<Account>> {
        match self.table.find(&blake3_hash(name.as_bytes()))? {
            Some(entry) => Ok(Some(decode_blob(entry.value()?)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, name: &str) -> DbResult<bool> {
        Ok(self.table.unlink(&blake3_hash(name.as_bytes()))?)
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
