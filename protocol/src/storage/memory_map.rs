//! # Memory-Mapped File
//!
//! `MappedFile` is the growable byte arena every table lives in. It keeps
//! two sizes:
//!
//! - **physical** — the file length, which is also the mapped length.
//! - **logical** — the number of bytes the allocators have handed out.
//!
//! `logical <= physical` always holds. Growth extends the file (by half
//! again when reserving, to amortize remaps), maps the new length and swaps
//! the mapping in. `close()` truncates the file back to its logical size.
//!
//! ## Handles Across Growth
//!
//! `access()` hands out a [`Memory`] snapshot: an `Arc` of the mapping that
//! was current at the time. A later growth never unmaps it. The old
//! mapping lives until the last handle drops, and because both mappings are
//! `MAP_SHARED` views of the same file, a write through either one is
//! visible through the other. The write lock is held for the
//! extend-remap-swap step only; readers never wait on I/O.
//!
//! ## Lifecycle
//!
//! ```text
//! open/create ──► start ──► (access / resize / reserve)* ──► stop ──► close
//! ```
//!
//! `start`, `stop` and `close` are idempotent. `stop` only marks the file as
//! winding down; in-flight writes still complete. After `close`, `access`
//! and growth fail with [`StoreError::Closed`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;
use tracing::{debug, error};

use super::{StoreError, StoreResult};

/// Growth ratio used by `reserve`, as a percentage of the requested size.
pub const EXPANSION_PERCENT: u64 = 150;

/// Growth ratio used by `resize`: exactly the requested size.
const EXACT_PERCENT: u64 = 100;

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// A snapshot of a file mapping.
///
/// Cheap to clone. All addressing is by absolute file offset and every
/// access is bounds-checked against the snapshot's length; nothing caches
/// raw pointers across a remap.
#[derive(Clone)]
pub struct Memory {
    map: Arc<MmapRaw>,
}

impl Memory {
    /// Length of this snapshot in bytes (the physical size when it was taken).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    fn check(&self, offset: u64, len: usize) -> StoreResult<usize> {
        let start = usize::try_from(offset).map_err(|_| StoreError::OutOfBounds {
            offset,
            len,
            size: self.len(),
        })?;
        match start.checked_add(len) {
            Some(end) if end <= self.len() => Ok(start),
            _ => Err(StoreError::OutOfBounds {
                offset,
                len,
                size: self.len(),
            }),
        }
    }

    /// Borrow `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> StoreResult<&[u8]> {
        let start = self.check(offset, len)?;
        // SAFETY: `check` guarantees `start..start + len` lies inside the
        // mapping, and the mapping stays alive for as long as `self` does.
        // Regions reachable by readers are only written before they are
        // linked or under the owning table's write lock.
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(start), len) })
    }

    /// Borrow everything from `offset` to `end` (exclusive).
    pub fn read_range(&self, offset: u64, end: u64) -> StoreResult<&[u8]> {
        let len = end.checked_sub(offset).ok_or(StoreError::OutOfBounds {
            offset,
            len: 0,
            size: self.len(),
        })?;
        self.read(offset, len as usize)
    }

    /// Copy `bytes` into the mapping at `offset`.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> StoreResult<()> {
        let start = self.check(offset, bytes.len())?;
        // SAFETY: bounds checked above. Callers only write to regions they
        // allocated themselves (not yet reachable by readers) or to link
        // fields while holding the table's exclusive lock.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(start),
                bytes.len(),
            );
        }
        Ok(())
    }

    pub fn read_u32(&self, offset: u64) -> StoreResult<u32> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, offset: u64) -> StoreResult<u64> {
        let bytes = self.read(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> StoreResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> StoreResult<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory").field("len", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// MappedFile
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MapState {
    file: Option<File>,
    map: Option<Arc<MmapRaw>>,
    physical: u64,
    logical: u64,
    stopped: bool,
    closed: bool,
}

/// A file mapped into memory that can grow while readers use it.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    state: RwLock<MapState>,
}

impl MappedFile {
    /// Open an existing, non-empty file. The file is not mapped until
    /// [`start`](Self::start).
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let physical = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();
        if physical == 0 {
            return Err(StoreError::Corrupt(format!(
                "cannot map empty file {}",
                path.display()
            )));
        }

        Ok(Self {
            path,
            state: RwLock::new(MapState {
                file: Some(file),
                map: None,
                physical,
                logical: physical,
                stopped: true,
                closed: false,
            }),
        })
    }

    /// Create (or truncate) a file holding a single zero byte, ready to be
    /// opened and resized by the owning table.
    pub fn create<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        file.set_len(1).map_err(|e| StoreError::io(path, e))?;
        drop(file);
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map the file. Idempotent while running.
    pub fn start(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::Closed(self.path.clone()));
        }
        if !state.stopped {
            return Ok(());
        }
        if state.map.is_none() {
            let file = state
                .file
                .as_ref()
                .ok_or_else(|| StoreError::Closed(self.path.clone()))?;
            let map = MmapRaw::map_raw(file).map_err(|e| StoreError::io(&self.path, e))?;
            state.map = Some(Arc::new(map));
        }
        state.stopped = false;
        debug!(path = %self.path.display(), size = state.physical, "mapped");
        Ok(())
    }

    /// Signal wind-down. Outstanding handles and writes are unaffected.
    pub fn stop(&self) {
        self.state.write().stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.state.read().stopped
    }

    /// Flush, unmap, truncate to the logical size and sync. Idempotent.
    ///
    /// All `Memory` handles should be dropped first: once the file is
    /// truncated, a surviving handle that reads past the new end faults.
    pub fn close(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.stopped = true;

        if let Some(map) = state.map.take() {
            map.flush().map_err(|e| StoreError::io(&self.path, e))?;
        }
        if let Some(file) = state.file.take() {
            file.set_len(state.logical)
                .map_err(|e| StoreError::io(&self.path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&self.path, e))?;
        }
        debug!(path = %self.path.display(), size = state.logical, "unmapped");
        Ok(())
    }

    /// Physical size: the file length.
    pub fn size(&self) -> u64 {
        self.state.read().physical
    }

    /// Logical size: the bytes in use.
    pub fn logical_size(&self) -> u64 {
        self.state.read().logical
    }

    /// A snapshot of the current mapping.
    pub fn access(&self) -> StoreResult<Memory> {
        let state = self.state.read();
        match (&state.map, state.closed) {
            (Some(map), false) => Ok(Memory {
                map: Arc::clone(map),
            }),
            _ => Err(StoreError::Closed(self.path.clone())),
        }
    }

    /// Set the logical size to exactly `size`, growing the file to exactly
    /// that size if it is too small.
    pub fn resize(&self, size: u64) -> StoreResult<Memory> {
        self.reserve_with(size, EXACT_PERCENT)
    }

    /// Set the logical size to `size`, growing the file by
    /// [`EXPANSION_PERCENT`] of `size` if it is too small.
    pub fn reserve(&self, size: u64) -> StoreResult<Memory> {
        self.reserve_with(size, EXPANSION_PERCENT)
    }

    fn reserve_with(&self, size: u64, percent: u64) -> StoreResult<Memory> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::Closed(self.path.clone()));
        }

        if size > state.physical {
            let target = size
                .checked_mul(percent)
                .map(|n| n / 100)
                .unwrap_or(size)
                .max(size);
            debug!(path = %self.path.display(), size = target, "resizing");

            let file = state
                .file
                .as_ref()
                .ok_or_else(|| StoreError::Closed(self.path.clone()))?;
            if let Err(e) = file.set_len(target) {
                error!(path = %self.path.display(), size = target, "resize failed, disk space may be low");
                return Err(StoreError::io(&self.path, e));
            }
            let len = usize::try_from(target).map_err(|_| StoreError::OutOfBounds {
                offset: 0,
                len: usize::MAX,
                size: 0,
            })?;
            let map = MmapOptions::new()
                .len(len)
                .map_raw(file)
                .map_err(|e| StoreError::io(&self.path, e))?;
            state.map = Some(Arc::new(map));
            state.physical = target;
        }

        state.logical = size;
        match &state.map {
            Some(map) => Ok(Memory {
                map: Arc::clone(map),
            }),
            None => Err(StoreError::Closed(self.path.clone())),
        }
    }

    /// msync the current mapping.
    pub fn flush(&self) -> StoreResult<()> {
        let state = self.state.read();
        if let Some(map) = &state.map {
            map.flush().map_err(|e| StoreError::io(&self.path, e))?;
        }
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "failed to close mapped file");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
