//! # Hash Table
//!
//! A persistent chained hash table. One generic implementation serves both
//! value shapes:
//!
//! - [`RecordHashTable`] — fixed-size values, linked by `u32` record index.
//! - [`SlabHashTable`] — variable-size values, linked by `u64` slab offset.
//!
//! ```text
//! element: [key: K][next: link][value]
//!
//! bucket_header ──► newest ──► older ──► oldest ──► (sentinel)
//! ```
//!
//! Inserts prepend, so a lookup returns the most recently stored element
//! for a key. Duplicates are allowed; [`unlink`](HashTable::unlink) removes
//! the newest one from its chain and uncovers the next older element.
//! Storage is never reclaimed.
//!
//! ## Design Decisions
//!
//! - The payload is fully written and the allocator counter persisted
//!   before the element is linked. Readers only ever reach complete
//!   elements, and a crash before linking only leaks space.
//! - One `RwLock<()>` per table guards the chains. Lookups share it; the
//!   head swap and unlink relinking take it exclusively. Allocation and
//!   payload writes happen outside the lock.
//! - Chain walks are bounded by the allocator's element count, so a cycle
//!   in a damaged file surfaces as [`StoreError::Corrupt`] instead of a hang.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::bucket_header::{BucketHeader, Link};
use super::memory_map::{MappedFile, Memory};
use super::record_manager::RecordManager;
use super::slab_manager::SlabManager;
use super::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// The element store underneath a hash table.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    type Link: Link;

    /// Build over `file` with the arena starting after `header_size` bytes.
    /// `element_size` is the full record width for fixed-size allocators.
    fn build(file: Arc<MappedFile>, header_size: u64, element_size: u64) -> Self;
    fn create(&self) -> StoreResult<()>;
    fn start(&self) -> StoreResult<()>;
    fn sync(&self) -> StoreResult<()>;
    fn allocate(&self, size: u64) -> StoreResult<Self::Link>;
    fn position(&self, link: Self::Link) -> u64;
    /// Upper bound on the number of elements ever allocated.
    fn allocated(&self) -> u64;
}

impl Allocator for RecordManager {
    type Link = u32;

    fn build(file: Arc<MappedFile>, header_size: u64, element_size: u64) -> Self {
        RecordManager::new(file, header_size, element_size)
    }

    fn create(&self) -> StoreResult<()> {
        RecordManager::create(self)
    }

    fn start(&self) -> StoreResult<()> {
        RecordManager::start(self)
    }

    fn sync(&self) -> StoreResult<()> {
        RecordManager::sync(self)
    }

    fn allocate(&self, size: u64) -> StoreResult<u32> {
        debug_assert_eq!(size, self.record_size());
        self.new_records(1)
    }

    fn position(&self, link: u32) -> u64 {
        RecordManager::position(self, link)
    }

    fn allocated(&self) -> u64 {
        u64::from(self.count())
    }
}

impl Allocator for SlabManager {
    type Link = u64;

    fn build(file: Arc<MappedFile>, header_size: u64, _element_size: u64) -> Self {
        SlabManager::new(file, header_size)
    }

    fn create(&self) -> StoreResult<()> {
        SlabManager::create(self)
    }

    fn start(&self) -> StoreResult<()> {
        SlabManager::start(self)
    }

    fn sync(&self) -> StoreResult<()> {
        SlabManager::sync(self)
    }

    fn allocate(&self, size: u64) -> StoreResult<u64> {
        self.new_slab(size)
    }

    fn position(&self, link: u64) -> u64 {
        SlabManager::position(self, link)
    }

    fn allocated(&self) -> u64 {
        self.payload_size()
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A located element. Holds its own mapping snapshot, so it stays readable
/// while the table grows.
#[derive(Debug, Clone)]
pub struct Entry<L: Link> {
    memory: Memory,
    link: L,
    position: u64,
    key_size: u64,
    value_size: Option<u64>,
}

impl<L: Link> Entry<L> {
    /// Record index or slab offset of this element.
    pub fn link(&self) -> L {
        self.link
    }

    pub fn key(&self) -> StoreResult<&[u8]> {
        self.memory.read(self.position, self.key_size as usize)
    }

    fn value_offset(&self) -> u64 {
        self.position + self.key_size + L::SIZE
    }

    /// The value bytes. Slab values have no stored length, so for slabs
    /// this runs to the end of the snapshot and the caller's decoder
    /// decides where the value stops.
    pub fn value(&self) -> StoreResult<&[u8]> {
        let start = self.value_offset();
        match self.value_size {
            Some(size) => self.memory.read(start, size as usize),
            None => self.memory.read_range(start, self.memory.len() as u64),
        }
    }

    /// Overwrite the start of the value in place.
    ///
    /// Only for fields whose concurrent readers are serialized by the
    /// caller (the multimap's row head).
    pub(crate) fn overwrite(&self, bytes: &[u8]) -> StoreResult<()> {
        if let Some(size) = self.value_size {
            if bytes.len() as u64 > size {
                return Err(StoreError::OutOfBounds {
                    offset: self.value_offset(),
                    len: bytes.len(),
                    size: size as usize,
                });
            }
        }
        self.memory.write(self.value_offset(), bytes)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters reported by `statinfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub buckets: u32,
    /// Records for record tables, payload bytes for slab tables.
    pub allocated: u64,
    pub file_size: u64,
}

// ---------------------------------------------------------------------------
// HashTable
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HashTable<A: Allocator, const K: usize> {
    file: Arc<MappedFile>,
    header: BucketHeader<A::Link>,
    allocator: A,
    value_size: Option<u64>,
    lock: RwLock<()>,
}

/// Fixed-size values keyed by `K` bytes.
pub type RecordHashTable<const K: usize> = HashTable<RecordManager, K>;

/// Variable-size values keyed by `K` bytes.
pub type SlabHashTable<const K: usize> = HashTable<SlabManager, K>;

impl<A: Allocator, const K: usize> HashTable<A, K> {
    fn element_size(value_size: Option<u64>) -> u64 {
        K as u64 + <A::Link as Link>::SIZE + value_size.unwrap_or(0)
    }

    fn create_at(path: &Path, buckets: u32, value_size: Option<u64>) -> StoreResult<Self> {
        let file = Arc::new(MappedFile::create(path)?);
        file.start()?;
        let header = BucketHeader::new(Arc::clone(&file), buckets);
        header.create()?;
        let allocator = A::build(
            Arc::clone(&file),
            header.size(),
            Self::element_size(value_size),
        );
        allocator.create()?;
        Ok(Self {
            file,
            header,
            allocator,
            value_size,
            lock: RwLock::new(()),
        })
    }

    fn open_at(path: &Path, value_size: Option<u64>) -> StoreResult<Self> {
        let file = Arc::new(MappedFile::open(path)?);
        file.start()?;
        let mut header = BucketHeader::new(Arc::clone(&file), 1);
        header.start()?;
        let allocator = A::build(
            Arc::clone(&file),
            header.size(),
            Self::element_size(value_size),
        );
        allocator.start()?;
        Ok(Self {
            file,
            header,
            allocator,
            value_size,
            lock: RwLock::new(()),
        })
    }

    fn entry(&self, memory: Memory, link: A::Link) -> Entry<A::Link> {
        Entry {
            memory,
            link,
            position: self.allocator.position(link),
            key_size: K as u64,
            value_size: self.value_size,
        }
    }

    fn next_offset(&self, link: A::Link) -> u64 {
        self.allocator.position(link) + K as u64
    }

    fn insert<F>(&self, key: &[u8; K], size: u64, write: F) -> StoreResult<A::Link>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut value = vec![0u8; size as usize];
        write(&mut value);

        let link = self.allocator.allocate(K as u64 + <A::Link as Link>::SIZE + size)?;
        let position = self.allocator.position(link);
        let memory = self.file.access()?;
        memory.write(position, key)?;
        memory.write(position + K as u64 + <A::Link as Link>::SIZE, &value)?;
        self.allocator.sync()?;

        let bucket = self.header.bucket_index(key);
        let _guard = self.lock.write();
        let head = self.header.read(bucket)?;
        <A::Link as Link>::store_opt(head, &memory, position + K as u64)?;
        self.header.write(bucket, Some(link))?;
        Ok(link)
    }

    /// The newest element stored under `key`.
    pub fn find(&self, key: &[u8; K]) -> StoreResult<Option<Entry<A::Link>>> {
        let bucket = self.header.bucket_index(key);
        let _guard = self.lock.read();
        let memory = self.file.access()?;
        let mut current = self.header.read(bucket)?;
        let mut steps = 0u64;

        while let Some(link) = current {
            if memory.read(self.allocator.position(link), K)? == key.as_slice() {
                return Ok(Some(self.entry(memory, link)));
            }
            current = <A::Link as Link>::load_opt(&memory, self.next_offset(link))?;
            steps += 1;
            self.check_steps(steps, bucket)?;
        }
        Ok(None)
    }

    /// Every element chained in `bucket`, newest first.
    pub fn find_bucket(&self, bucket: u32) -> StoreResult<Vec<Entry<A::Link>>> {
        if bucket >= self.header.buckets() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.read();
        let memory = self.file.access()?;
        let mut entries = Vec::new();
        let mut current = self.header.read(bucket)?;

        while let Some(link) = current {
            current = <A::Link as Link>::load_opt(&memory, self.next_offset(link))?;
            entries.push(self.entry(memory.clone(), link));
            self.check_steps(entries.len() as u64, bucket)?;
        }
        Ok(entries)
    }

    /// The element at a known link, e.g. one recorded in a secondary index.
    pub fn get(&self, link: A::Link) -> StoreResult<Entry<A::Link>> {
        Ok(self.entry(self.file.access()?, link))
    }

    /// Remove the newest element for `key` from its chain.
    ///
    /// Returns `false` when the key is absent. The bytes stay in the file.
    pub fn unlink(&self, key: &[u8; K]) -> StoreResult<bool> {
        let bucket = self.header.bucket_index(key);
        let _guard = self.lock.write();
        let memory = self.file.access()?;
        let mut previous: Option<A::Link> = None;
        let mut current = self.header.read(bucket)?;
        let mut steps = 0u64;

        while let Some(link) = current {
            let next = <A::Link as Link>::load_opt(&memory, self.next_offset(link))?;
            if memory.read(self.allocator.position(link), K)? == key.as_slice() {
                match previous {
                    None => self.header.write(bucket, next)?,
                    Some(prev) => {
                        <A::Link as Link>::store_opt(next, &memory, self.next_offset(prev))?
                    }
                }
                return Ok(true);
            }
            previous = Some(link);
            current = next;
            steps += 1;
            self.check_steps(steps, bucket)?;
        }
        Ok(false)
    }

    fn check_steps(&self, steps: u64, bucket: u32) -> StoreResult<()> {
        if steps > self.allocator.allocated() {
            return Err(StoreError::Corrupt(format!(
                "{}: cycle in bucket {bucket}",
                self.file.path().display()
            )));
        }
        Ok(())
    }

    pub fn buckets(&self) -> u32 {
        self.header.buckets()
    }

    /// Persist the allocator counter.
    pub fn sync(&self) -> StoreResult<()> {
        self.allocator.sync()
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.file.flush()
    }

    pub fn stop(&self) {
        self.file.stop()
    }

    pub fn close(&self) -> StoreResult<()> {
        self.allocator.sync()?;
        self.file.close()
    }

    pub fn statinfo(&self) -> TableStats {
        TableStats {
            buckets: self.header.buckets(),
            allocated: self.allocator.allocated(),
            file_size: self.file.size(),
        }
    }
}

impl<const K: usize> HashTable<RecordManager, K> {
    /// Create a new table file with `buckets` chains and `value_size`-byte
    /// values.
    pub fn create<P: AsRef<Path>>(path: P, buckets: u32, value_size: u64) -> StoreResult<Self> {
        Self::create_at(path.as_ref(), buckets, Some(value_size))
    }

    pub fn open<P: AsRef<Path>>(path: P, value_size: u64) -> StoreResult<Self> {
        Self::open_at(path.as_ref(), Some(value_size))
    }

    /// Store a value; `write` fills the zeroed value buffer.
    pub fn store<F>(&self, key: &[u8; K], write: F) -> StoreResult<u32>
    where
        F: FnOnce(&mut [u8]),
    {
        let size = self.value_size.unwrap_or(0);
        self.insert(key, size, write)
    }

    pub fn value_size(&self) -> u64 {
        self.value_size.unwrap_or(0)
    }
}

impl<const K: usize> HashTable<SlabManager, K> {
    pub fn create<P: AsRef<Path>>(path: P, buckets: u32) -> StoreResult<Self> {
        Self::create_at(path.as_ref(), buckets, None)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_at(path.as_ref(), None)
    }

    /// Store a `size`-byte value; `write` fills the zeroed value buffer.
    pub fn store<F>(&self, key: &[u8; K], size: u64, write: F) -> StoreResult<u64>
    where
        F: FnOnce(&mut [u8]),
    {
        self.insert(key, size, write)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn records(dir: &tempfile::TempDir) -> RecordHashTable<4> {
        RecordHashTable::create(dir.path().join("records"), 8, 6).unwrap()
    }

    fn slabs(dir: &tempfile::TempDir) -> SlabHashTable<4> {
        SlabHashTable::create(dir.path().join("slabs"), 8).unwrap()
    }

    #[test]
    fn record_store_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let table = records(&dir);
        table.store(b"abcd", |v| v.copy_from_slice(b"123456")).unwrap();

        let entry = table.find(b"abcd").unwrap().unwrap();
        assert_eq!(entry.key().unwrap(), b"abcd");
        assert_eq!(entry.value().unwrap(), b"123456");
        assert!(table.find(b"zzzz").unwrap().is_none());
    }

    #[test]
    fn slab_store_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let table = slabs(&dir);
        let link = table
            .store(b"key1", 5, |v| v.copy_from_slice(b"hello"))
            .unwrap();
        assert_eq!(link, 8);

        let entry = table.find(b"key1").unwrap().unwrap();
        assert_eq!(entry.link(), link);
        assert_eq!(&entry.value().unwrap()[..5], b"hello");
    }

    #[test]
    fn duplicates_are_lifo_and_unlink_uncovers_older() {
        let dir = tempfile::tempdir().unwrap();
        let table = records(&dir);
        table.store(b"same", |v| v.copy_from_slice(b"first!")).unwrap();
        table.store(b"same", |v| v.copy_from_slice(b"second")).unwrap();

        assert_eq!(table.find(b"same").unwrap().unwrap().value().unwrap(), b"second");
        assert!(table.unlink(b"same").unwrap());
        assert_eq!(table.find(b"same").unwrap().unwrap().value().unwrap(), b"first!");
        assert!(table.unlink(b"same").unwrap());
        assert!(table.find(b"same").unwrap().is_none());
        assert!(!table.unlink(b"same").unwrap());
    }

    #[test]
    fn unlink_in_middle_of_chain() {
        let dir = tempfile::tempdir().unwrap();
        // One bucket forces every key into the same chain.
        let table = RecordHashTable::<4>::create(dir.path().join("one"), 1, 1).unwrap();
        table.store(b"aaaa", |v| v[0] = 1).unwrap();
        table.store(b"bbbb", |v| v[0] = 2).unwrap();
        table.store(b"cccc", |v| v[0] = 3).unwrap();

        assert!(table.unlink(b"bbbb").unwrap());
        assert!(table.find(b"bbbb").unwrap().is_none());
        assert_eq!(table.find(b"aaaa").unwrap().unwrap().value().unwrap(), [1]);
        assert_eq!(table.find(b"cccc").unwrap().unwrap().value().unwrap(), [3]);

        let keys: Vec<Vec<u8>> = table
            .find_bucket(0)
            .unwrap()
            .iter()
            .map(|e| e.key().unwrap().to_vec())
            .collect();
        assert_eq!(keys, vec![b"cccc".to_vec(), b"aaaa".to_vec()]);
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slabs");
        {
            let table = SlabHashTable::<4>::create(&path, 3).unwrap();
            table.store(b"k001", 3, |v| v.copy_from_slice(b"one")).unwrap();
            table.store(b"k002", 3, |v| v.copy_from_slice(b"two")).unwrap();
            table.close().unwrap();
        }
        let table = SlabHashTable::<4>::open(&path).unwrap();
        assert_eq!(table.buckets(), 3);
        assert_eq!(&table.find(b"k002").unwrap().unwrap().value().unwrap()[..3], b"two");
        assert_eq!(&table.find(b"k001").unwrap().unwrap().value().unwrap()[..3], b"one");
    }

    #[test]
    fn entries_stay_readable_across_growth() {
        let dir = tempfile::tempdir().unwrap();
        let table = slabs(&dir);
        table.store(b"old!", 4, |v| v.copy_from_slice(b"data")).unwrap();
        let entry = table.find(b"old!").unwrap().unwrap();

        for i in 0..500u32 {
            table
                .store(&i.to_le_bytes(), 1024, |v| v.fill(0xAB))
                .unwrap();
        }
        assert_eq!(&entry.value().unwrap()[..4], b"data");
    }

    #[test]
    fn statinfo_counts() {
        let dir = tempfile::tempdir().unwrap();
        let table = records(&dir);
        table.store(b"abcd", |_| {}).unwrap();
        table.store(b"efgh", |_| {}).unwrap();
        let stats = table.statinfo();
        assert_eq!(stats.buckets, 8);
        assert_eq!(stats.allocated, 2);
        assert!(stats.file_size >= 4 + 8 * 4 + 4 + 2 * 14);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(RecordHashTable::<4>::create(dir.path().join("c"), 16, 4).unwrap());

        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..250u32 {
                        let key = (t * 1000 + i).to_le_bytes();
                        table.store(&key, |v| v.copy_from_slice(&key)).unwrap();
                        let found = table.find(&key).unwrap().unwrap();
                        assert_eq!(found.value().unwrap(), key);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer should not panic");
        }
        assert_eq!(table.statinfo().allocated, 1000);
    }
}
