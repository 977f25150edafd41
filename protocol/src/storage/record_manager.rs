//! # Record Manager
//!
//! A linear allocator of fixed-size records inside a [`MappedFile`].
//!
//! ```text
//! header_size        header_size + 4
//!      │                   │
//!      ▼                   ▼
//!      [count: u32 LE]     [record 0][record 1] ... [record count-1]
//! ```
//!
//! Records are addressed by a `u32` index. Allocation only ever appends;
//! nothing is reclaimed. `set_count` exists for the one caller that needs
//! to truncate (the block height index on unlink).
//!
//! The in-file counter is only written by [`sync`](RecordManager::sync), so
//! records allocated after the last sync are invisible after a crash.

use std::sync::Arc;

use parking_lot::Mutex;

use super::memory_map::{MappedFile, Memory};
use super::{StoreError, StoreResult};

/// Width of the stored record count.
const COUNT_SIZE: u64 = 4;

/// Largest count. Index `u32::MAX` itself is the link sentinel.
const MAX_RECORDS: u64 = u32::MAX as u64;

#[derive(Debug)]
pub struct RecordManager {
    file: Arc<MappedFile>,
    header_size: u64,
    record_size: u64,
    count: Mutex<u32>,
}

impl RecordManager {
    pub fn new(file: Arc<MappedFile>, header_size: u64, record_size: u64) -> Self {
        Self {
            file,
            header_size,
            record_size,
            count: Mutex::new(0),
        }
    }

    /// Lay out an empty manager: zero count, logical size just past it.
    pub fn create(&self) -> StoreResult<()> {
        let memory = self.file.reserve(self.header_size + COUNT_SIZE)?;
        memory.write_u32(self.header_size, 0)?;
        *self.count.lock() = 0;
        Ok(())
    }

    /// Load the stored count and restore the logical size it implies.
    pub fn start(&self) -> StoreResult<()> {
        let memory = self.file.access()?;
        let count = memory.read_u32(self.header_size)?;
        let end = self.position(count);
        if end > self.file.size() {
            return Err(StoreError::Corrupt(format!(
                "{}: {count} records of {} bytes exceed file size {}",
                self.file.path().display(),
                self.record_size,
                self.file.size()
            )));
        }
        self.file.resize(end)?;
        *self.count.lock() = count;
        Ok(())
    }

    /// Persist the in-memory count into the file.
    pub fn sync(&self) -> StoreResult<()> {
        let count = *self.count.lock();
        self.file.access()?.write_u32(self.header_size, count)
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Truncate (or extend) the allocated range to `count` records.
    pub fn set_count(&self, count: u32) -> StoreResult<()> {
        let mut current = self.count.lock();
        self.file.reserve(self.position(count))?;
        *current = count;
        Ok(())
    }

    /// Allocate `n` contiguous records and return the first index.
    pub fn new_records(&self, n: u32) -> StoreResult<u32> {
        let mut count = self.count.lock();
        let first = *count;
        let next = u64::from(first) + u64::from(n);
        if next > MAX_RECORDS {
            return Err(StoreError::IndexExhausted);
        }
        self.file.reserve(self.position(next as u32))?;
        *count = next as u32;
        Ok(first)
    }

    /// File offset of record `index`.
    pub fn position(&self, index: u32) -> u64 {
        self.header_size + COUNT_SIZE + u64::from(index) * self.record_size
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    /// A snapshot handle plus the offset of record `index`.
    pub fn get(&self, index: u32) -> StoreResult<(Memory, u64)> {
        Ok((self.file.access()?, self.position(index)))
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir, header: u64, size: u64) -> RecordManager {
        let file = Arc::new(MappedFile::create(dir.path().join("records")).unwrap());
        file.start().unwrap();
        let manager = RecordManager::new(file, header, size);
        manager.create().unwrap();
        manager
    }

    #[test]
    fn allocation_is_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let records = manager(&dir, 12, 10);
        assert_eq!(records.new_records(1).unwrap(), 0);
        assert_eq!(records.new_records(3).unwrap(), 1);
        assert_eq!(records.new_records(1).unwrap(), 4);
        assert_eq!(records.count(), 5);
        assert_eq!(records.position(4), 12 + 4 + 40);
        assert_eq!(records.file().logical_size(), 12 + 4 + 50);
    }

    #[test]
    fn count_survives_restart_only_after_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        {
            let file = Arc::new(MappedFile::create(&path).unwrap());
            file.start().unwrap();
            let records = RecordManager::new(Arc::clone(&file), 0, 8);
            records.create().unwrap();
            records.new_records(3).unwrap();
            records.sync().unwrap();
            // Allocated but never synced.
            records.new_records(2).unwrap();
            file.close().unwrap();
        }

        let file = Arc::new(MappedFile::open(&path).unwrap());
        file.start().unwrap();
        let records = RecordManager::new(Arc::clone(&file), 0, 8);
        records.start().unwrap();
        assert_eq!(records.count(), 3);
        assert_eq!(file.logical_size(), 4 + 24);
    }

    #[test]
    fn set_count_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let records = manager(&dir, 0, 8);
        records.new_records(10).unwrap();
        records.set_count(4).unwrap();
        assert_eq!(records.count(), 4);
        assert_eq!(records.new_records(1).unwrap(), 4);
    }

    #[test]
    fn corrupt_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let records = manager(&dir, 0, 8);
        records
            .file()
            .access()
            .unwrap()
            .write_u32(0, 1_000_000)
            .unwrap();
        assert!(matches!(records.start(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn index_space_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        // Zero-size records: exhaust the index space without touching disk.
        let records = manager(&dir, 0, 0);
        assert_eq!(records.new_records(u32::MAX).unwrap(), 0);
        assert!(matches!(
            records.new_records(1),
            Err(StoreError::IndexExhausted)
        ));
    }
}
