//! # Transaction Database
//!
//! Slab hash table keyed by transaction hash:
//!
//! ```text
//! [height: u64][position: u32][transaction bytes]
//! ```
//!
//! `position` is the transaction's index inside its block. The transaction
//! encoding is self-delimiting, so no length is stored.

use std::path::Path;

use super::DbResult;
use crate::chain::{Reader, Transaction};
use crate::crypto::Hash;
use crate::storage::{Entry, SlabHashTable, TableStats};

const METADATA_SIZE: u64 = 12;

/// A stored transaction plus where it was confirmed.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    entry: Entry<u64>,
}

impl TransactionResult {
    fn reader(&self) -> DbResult<Reader<'_>> {
        Ok(Reader::new(self.entry.value()?))
    }

    pub fn height(&self) -> DbResult<u64> {
        Ok(self.reader()?.u64()?)
    }

    /// Index of the transaction within its block.
    pub fn position(&self) -> DbResult<u32> {
        let mut reader = self.reader()?;
        reader.u64()?;
        Ok(reader.u32()?)
    }

    pub fn transaction(&self) -> DbResult<Transaction> {
        let mut reader = self.reader()?;
        reader.bytes(METADATA_SIZE as usize)?;
        Ok(Transaction::decode(&mut reader)?)
    }
}

#[derive(Debug)]
pub struct TransactionDatabase {
    table: SlabHashTable<32>,
}

impl TransactionDatabase {
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

    pub fn store(&self, tx: &Transaction, height: u64, position: u32) -> DbResult<()> {
        let bytes = tx.to_bytes();
        self.table
            .store(&tx.hash(), METADATA_SIZE + bytes.len() as u64, |buf| {
                buf[..8].copy_from_slice(&height.to_le_bytes());
                buf[8..12].copy_from_slice(&position.to_le_bytes());
                buf[12..].copy_from_slice(&bytes);
            })?;
        Ok(())
    }

    /// The newest record for `hash`.
    pub fn get(&self, hash: &Hash) -> DbResult<Option<TransactionResult>> {
        Ok(self.table.find(hash)?.map(|entry| TransactionResult { entry }))
    }

    pub fn remove(&self, hash: &Hash) -> DbResult<bool> {
        Ok(self.table.unlink(hash)?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{OutPoint, Script, TxInput, TxOutput};

    fn tx(seed: u8) -> Transaction {
        Transaction::new(
            vec![TxInput::new(OutPoint::new([seed; 32], 0))],
            vec![TxOutput::new(u64::from(seed), Script::new(vec![seed; 5]))],
        )
    }

    #[test]
    fn store_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let db = TransactionDatabase::create(&dir.path().join("tx"), 13).unwrap();
        let a = tx(1);
        let b = tx(2);
        db.store(&a, 10, 0).unwrap();
        db.store(&b, 11, 3).unwrap();

        let found = db.get(&b.hash()).unwrap().unwrap();
        assert_eq!(found.height().unwrap(), 11);
        assert_eq!(found.position().unwrap(), 3);
        assert_eq!(found.transaction().unwrap(), b);
        assert_eq!(db.get(&a.hash()).unwrap().unwrap().transaction().unwrap(), a);
        assert!(db.get(&[0u8; 32]).unwrap().is_none());
    }

    #[test]
    fn newest_confirmation_wins_and_remove_uncovers_older() {
        let dir = tempfile::tempdir().unwrap();
        let db = TransactionDatabase::create(&dir.path().join("tx"), 13).unwrap();
        let t = tx(5);
        db.store(&t, 4, 1).unwrap();
        db.store(&t, 9, 2).unwrap();
        assert_eq!(db.get(&t.hash()).unwrap().unwrap().height().unwrap(), 9);

        assert!(db.remove(&t.hash()).unwrap());
        assert_eq!(db.get(&t.hash()).unwrap().unwrap().height().unwrap(), 4);
        assert!(db.remove(&t.hash()).unwrap());
        assert!(!db.remove(&t.hash()).unwrap());
    }
}
