//! # Slab Manager
//!
//! A linear allocator of variable-size byte slabs. The first 8 bytes after
//! the header hold the payload size, and that size counts its own 8 bytes,
//! so the first slab lands at offset 8. An offset of 0 never names a slab,
//! which lets other files use 0 as "empty".
//!
//! ```text
//! header_size
//!      │
//!      ▼
//!      [payload_size: u64 LE][slab][slab] ...
//!      ◄──────────── payload_size ────────►
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use super::memory_map::{MappedFile, Memory};
use super::{StoreError, StoreResult};

const SIZE_FIELD: u64 = 8;

#[derive(Debug)]
pub struct SlabManager {
    file: Arc<MappedFile>,
    header_size: u64,
    payload_size: Mutex<u64>,
}

impl SlabManager {
    pub fn new(file: Arc<MappedFile>, header_size: u64) -> Self {
        Self {
            file,
            header_size,
            payload_size: Mutex::new(SIZE_FIELD),
        }
    }

    pub fn create(&self) -> StoreResult<()> {
        let memory = self.file.reserve(self.header_size + SIZE_FIELD)?;
        memory.write_u64(self.header_size, SIZE_FIELD)?;
        *self.payload_size.lock() = SIZE_FIELD;
        Ok(())
    }

    pub fn start(&self) -> StoreResult<()> {
        let memory = self.file.access()?;
        let payload = memory.read_u64(self.header_size)?;
        let end = self.header_size.saturating_add(payload);
        if payload < SIZE_FIELD || end > self.file.size() {
            return Err(StoreError::Corrupt(format!(
                "{}: slab payload size {payload} inconsistent with file size {}",
                self.file.path().display(),
                self.file.size()
            )));
        }
        self.file.resize(end)?;
        *self.payload_size.lock() = payload;
        Ok(())
    }

    pub fn sync(&self) -> StoreResult<()> {
        let payload = *self.payload_size.lock();
        self.file.access()?.write_u64(self.header_size, payload)
    }

    /// Bytes in use, including the size field itself.
    pub fn payload_size(&self) -> u64 {
        *self.payload_size.lock()
    }

    /// Allocate `size` bytes and return the slab's offset.
    pub fn new_slab(&self, size: u64) -> StoreResult<u64> {
        let mut payload = self.payload_size.lock();
        let offset = *payload;
        let next = offset
            .checked_add(size)
            .ok_or(StoreError::IndexExhausted)?;
        self.file.reserve(self.header_size + next)?;
        *payload = next;
        Ok(offset)
    }

    /// File position of the slab at `offset`.
    pub fn position(&self, offset: u64) -> u64 {
        self.header_size + offset
    }

    pub fn get(&self, offset: u64) -> StoreResult<(Memory, u64)> {
        Ok((self.file.access()?, self.position(offset)))
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_slab_is_never_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(MappedFile::create(dir.path().join("slabs")).unwrap());
        file.start().unwrap();
        let slabs = SlabManager::new(Arc::clone(&file), 20);
        slabs.create().unwrap();

        assert_eq!(slabs.new_slab(100).unwrap(), 8);
        assert_eq!(slabs.new_slab(5).unwrap(), 108);
        assert_eq!(slabs.payload_size(), 113);
        assert_eq!(slabs.position(108), 128);
        assert_eq!(file.logical_size(), 20 + 113);
    }

    #[test]
    fn restart_restores_synced_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slabs");
        {
            let file = Arc::new(MappedFile::create(&path).unwrap());
            file.start().unwrap();
            let slabs = SlabManager::new(Arc::clone(&file), 0);
            slabs.create().unwrap();
            let offset = slabs.new_slab(11).unwrap();
            let (memory, position) = slabs.get(offset).unwrap();
            memory.write(position, b"hello slabs").unwrap();
            slabs.sync().unwrap();
            file.close().unwrap();
        }

        let file = Arc::new(MappedFile::open(&path).unwrap());
        file.start().unwrap();
        let slabs = SlabManager::new(file, 0);
        slabs.start().unwrap();
        assert_eq!(slabs.payload_size(), 19);
        let (memory, position) = slabs.get(8).unwrap();
        assert_eq!(memory.read(position, 11).unwrap(), b"hello slabs");
    }

    #[test]
    fn undersized_payload_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(MappedFile::create(dir.path().join("slabs")).unwrap());
        file.start().unwrap();
        let slabs = SlabManager::new(Arc::clone(&file), 0);
        slabs.create().unwrap();
        file.access().unwrap().write_u64(0, 3).unwrap();
        assert!(matches!(slabs.start(), Err(StoreError::Corrupt(_))));
    }
}
