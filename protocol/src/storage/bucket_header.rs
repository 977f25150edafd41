//! # Bucket Header
//!
//! The fixed array of chain heads at the start of every hash-table file:
//!
//! ```text
//! [bucket_count: u32 LE][head 0][head 1] ... [head bucket_count-1]
//! ```
//!
//! A head is a [`Link`]: a `u32` record index or a `u64` slab offset. The
//! all-ones value marks an empty bucket on disk and comes back as `None`.

use std::fmt::Debug;
use std::sync::Arc;

use super::memory_map::{MappedFile, Memory};
use super::{StoreError, StoreResult};

const COUNT_SIZE: u64 = 4;

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// A pointer stored inside a table file.
pub trait Link: Copy + Eq + Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: u64;
    /// The on-disk "nothing here" value.
    const SENTINEL: Self;

    fn load(memory: &Memory, offset: u64) -> StoreResult<Self>;
    fn store(self, memory: &Memory, offset: u64) -> StoreResult<()>;

    /// Decode, mapping the sentinel to `None`.
    fn load_opt(memory: &Memory, offset: u64) -> StoreResult<Option<Self>> {
        let link = Self::load(memory, offset)?;
        Ok((link != Self::SENTINEL).then_some(link))
    }

    fn store_opt(link: Option<Self>, memory: &Memory, offset: u64) -> StoreResult<()> {
        link.unwrap_or(Self::SENTINEL).store(memory, offset)
    }
}

impl Link for u32 {
    const SIZE: u64 = 4;
    const SENTINEL: Self = u32::MAX;

    fn load(memory: &Memory, offset: u64) -> StoreResult<Self> {
        memory.read_u32(offset)
    }

    fn store(self, memory: &Memory, offset: u64) -> StoreResult<()> {
        memory.write_u32(offset, self)
    }
}

impl Link for u64 {
    const SIZE: u64 = 8;
    const SENTINEL: Self = u64::MAX;

    fn load(memory: &Memory, offset: u64) -> StoreResult<Self> {
        memory.read_u64(offset)
    }

    fn store(self, memory: &Memory, offset: u64) -> StoreResult<()> {
        memory.write_u64(offset, self)
    }
}

// ---------------------------------------------------------------------------
// BucketHeader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BucketHeader<L: Link> {
    file: Arc<MappedFile>,
    buckets: u32,
    _link: std::marker::PhantomData<L>,
}

impl<L: Link> BucketHeader<L> {
    pub fn new(file: Arc<MappedFile>, buckets: u32) -> Self {
        Self {
            file,
            buckets,
            _link: std::marker::PhantomData,
        }
    }

    /// Bytes occupied by a header of `buckets` slots.
    pub fn size_for(buckets: u32) -> u64 {
        COUNT_SIZE + u64::from(buckets) * L::SIZE
    }

    pub fn size(&self) -> u64 {
        Self::size_for(self.buckets)
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    /// Write the bucket count and mark every slot empty.
    pub fn create(&self) -> StoreResult<()> {
        if self.buckets == 0 {
            return Err(StoreError::Corrupt("bucket count must be non-zero".into()));
        }
        let memory = self.file.resize(self.size())?;
        memory.write_u32(0, self.buckets)?;
        let slots = usize::try_from(self.size() - COUNT_SIZE)
            .map_err(|_| StoreError::Corrupt("bucket header too large".into()))?;
        memory.write(COUNT_SIZE, &vec![0xFF; slots])
    }

    /// Adopt the bucket count stored in the file.
    ///
    /// The count is fixed for the life of the file; a different configured
    /// value is ignored so existing keys keep hashing to the same buckets.
    pub fn start(&mut self) -> StoreResult<()> {
        let stored = self.file.access()?.read_u32(0)?;
        if stored == 0 || Self::size_for(stored) > self.file.size() {
            return Err(StoreError::Corrupt(format!(
                "{}: invalid bucket count {stored}",
                self.file.path().display()
            )));
        }
        if stored != self.buckets {
            tracing::debug!(
                path = %self.file.path().display(),
                configured = self.buckets,
                stored,
                "using stored bucket count"
            );
        }
        self.buckets = stored;
        Ok(())
    }

    fn slot(&self, bucket: u32) -> u64 {
        COUNT_SIZE + u64::from(bucket) * L::SIZE
    }

    pub fn read(&self, bucket: u32) -> StoreResult<Option<L>> {
        let memory = self.file.access()?;
        L::load_opt(&memory, self.slot(bucket))
    }

    pub fn write(&self, bucket: u32, link: Option<L>) -> StoreResult<()> {
        let memory = self.file.access()?;
        L::store_opt(link, &memory, self.slot(bucket))
    }

    /// Bucket index for a key: the first 8 bytes of its BLAKE3 digest,
    /// little-endian, modulo the bucket count.
    pub fn bucket_index(&self, key: &[u8]) -> u32 {
        let digest = blake3::hash(key);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % u64::from(self.buckets)) as u32
    }
}
