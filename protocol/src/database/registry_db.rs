//! # Registry Database
//!
//! Symbol-keyed registrations. One instance holds assets, another holds
//! decentralized identifiers; both share this layout:
//!
//! ```text
//! key:   BLAKE3(symbol)
//! value: [height: u64][blob_len: u32][bincode(RegistryEntry)]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{decode_blob, encode_blob, DbResult};
use crate::chain::script::AddressHash;
use crate::chain::Reader;
use crate::crypto::blake3_hash;
use crate::storage::{SlabHashTable, TableStats};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub symbol: String,
    pub owner: AddressHash,
    /// Height of the block that made the registration.
    pub height: u64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct RegistryDatabase {
    table: SlabHashTable<32>,
}

impl RegistryDatabase {
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

    pub fn store(&self, entry: &RegistryEntry) -> DbResult<()> {
        let blob = encode_blob(entry)?;
        let key = blake3_hash(entry.symbol.as_bytes());
        self.table.store(&key, 8 + blob.len() as u64, |buf| {
            buf[..8].copy_from_slice(&entry.height.to_le_bytes());
            buf[8..].copy_from_slice(&blob);
        })?;
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> DbResult<Option<RegistryEntry>> {
        let Some(entry) = self.table.find(&blake3_hash(symbol.as_bytes()))? else {
            return Ok(None);
        };
        let value = entry.value()?;
        let mut reader = Reader::new(value);
        let height = reader.u64()?;
        let mut registered: RegistryEntry = decode_blob(&value[reader.position()..])?;
        // The fixed-width height is authoritative.
        registered.height = height;
        Ok(Some(registered))
    }

    /// Height of the registration, read without decoding the blob.
    pub fn height(&self, symbol: &str) -> DbResult<Option<u64>> {
        match self.table.find(&blake3_hash(symbol.as_bytes()))? {
            Some(entry) => Ok(Some(Reader::new(entry.value()?).u64()?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, symbol: &str) -> DbResult<bool> {
        Ok(self.table.unlink(&blake3_hash(symbol.as_bytes()))?)
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
