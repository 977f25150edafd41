//! # Record Multimap
//!
//! One key, many fixed-size values. A [`RecordHashTable`] maps each key to
//! the index of its newest row; rows live in a second file and link to the
//! next older row for the same key.
//!
//! ```text
//! table:  key ──► [first_row: u32]
//!                       │
//! rows:                 ▼
//!                 [next: u32][value] ──► [next: u32][value] ──► sentinel
//! ```
//!
//! Adding a value prepends a row, so iteration is newest first. Removing
//! only ever takes the newest row off the front, which is exactly what
//! popping blocks off the chain tip needs.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use super::bucket_header::Link;
use super::hash_table::{RecordHashTable, TableStats};
use super::memory_map::{MappedFile, Memory};
use super::record_manager::RecordManager;
use super::{StoreError, StoreResult};

const ROW_LINK: u64 = 4;

#[derive(Debug)]
pub struct RecordMultimap<const K: usize> {
    table: RecordHashTable<K>,
    rows: RecordManager,
    value_size: u64,
    lock: RwLock<()>,
}

impl<const K: usize> RecordMultimap<K> {
    pub fn create<P: AsRef<Path>>(
        table_path: P,
        rows_path: P,
        buckets: u32,
        value_size: u64,
    ) -> StoreResult<Self> {
        let table = RecordHashTable::create(table_path, buckets, ROW_LINK)?;
        let file = Arc::new(MappedFile::create(rows_path)?);
        file.start()?;
        let rows = RecordManager::new(file, 0, ROW_LINK + value_size);
        rows.create()?;
        Ok(Self {
            table,
            rows,
            value_size,
            lock: RwLock::new(()),
        })
    }

    pub fn open<P: AsRef<Path>>(table_path: P, rows_path: P, value_size: u64) -> StoreResult<Self> {
        let table = RecordHashTable::open(table_path, ROW_LINK)?;
        let file = Arc::new(MappedFile::open(rows_path)?);
        file.start()?;
        let rows = RecordManager::new(file, 0, ROW_LINK + value_size);
        rows.start()?;
        Ok(Self {
            table,
            rows,
            value_size,
            lock: RwLock::new(()),
        })
    }

    fn head(value: &[u8]) -> StoreResult<Option<u32>> {
        let bytes: [u8; 4] = value
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StoreError::Corrupt("multimap row link truncated".into()))?;
        let head = u32::from_le_bytes(bytes);
        Ok((head != u32::SENTINEL).then_some(head))
    }

    /// Prepend a value for `key`; `write` fills the zeroed value buffer.
    pub fn store<F>(&self, key: &[u8; K], write: F) -> StoreResult<u32>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut value = vec![0u8; self.value_size as usize];
        write(&mut value);

        let _guard = self.lock.write();
        let row = self.rows.new_records(1)?;
        let (memory, position) = self.rows.get(row)?;
        memory.write(position + ROW_LINK, &value)?;

        match self.table.find(key)? {
            Some(entry) => {
                let head = Self::head(entry.value()?)?;
                u32::store_opt(head, &memory, position)?;
                self.rows.sync()?;
                entry.overwrite(&row.to_le_bytes())?;
            }
            None => {
                u32::store_opt(None, &memory, position)?;
                self.rows.sync()?;
                self.table
                    .store(key, |v| v.copy_from_slice(&row.to_le_bytes()))?;
            }
        }
        Ok(row)
    }

    /// Iterate the values stored for `key`, newest first.
    pub fn find(&self, key: &[u8; K]) -> StoreResult<RowIter> {
        let _guard = self.lock.read();
        let head = match self.table.find(key)? {
            Some(entry) => Self::head(entry.value()?)?,
            None => None,
        };
        Ok(RowIter {
            memory: self.rows.file().access()?,
            base: self.rows.position(0),
            row_size: self.rows.record_size(),
            value_size: self.value_size,
            current: head,
            remaining: u64::from(self.rows.count()),
        })
    }

    /// Drop the newest value for `key`; the key goes away with its last row.
    pub fn delete_last_row(&self, key: &[u8; K]) -> StoreResult<bool> {
        let _guard = self.lock.write();
        let Some(entry) = self.table.find(key)? else {
            return Ok(false);
        };
        let Some(head) = Self::head(entry.value()?)? else {
            return self.table.unlink(key);
        };
        let (memory, position) = self.rows.get(head)?;
        match u32::load_opt(&memory, position)? {
            Some(next) => entry.overwrite(&next.to_le_bytes())?,
            None => {
                self.table.unlink(key)?;
            }
        }
        Ok(true)
    }

    pub fn sync(&self) -> StoreResult<()> {
        self.rows.sync()?;
        self.table.sync()
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.rows.file().flush()?;
        self.table.flush()
    }

    pub fn stop(&self) {
        self.rows.file().stop();
        self.table.stop();
    }

    pub fn close(&self) -> StoreResult<()> {
        self.rows.sync()?;
        self.rows.file().close()?;
        self.table.close()
    }

    /// Table stats plus the number of rows.
    pub fn statinfo(&self) -> (TableStats, u32) {
        (self.table.statinfo(), self.rows.count())
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One value in a multimap chain.
#[derive(Debug, Clone)]
pub struct Row {
    memory: Memory,
    offset: u64,
    len: usize,
    index: u32,
}

impl Row {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn value(&self) -> StoreResult<&[u8]> {
        self.memory.read(self.offset, self.len)
    }
}

/// Lazy walk over a key's rows. Single pass; call `find` again to restart.
#[derive(Debug)]
pub struct RowIter {
    memory: Memory,
    base: u64,
    row_size: u64,
    value_size: u64,
    current: Option<u32>,
    remaining: u64,
}

impl Iterator for RowIter {
    type Item = StoreResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current.take()?;
        if self.remaining == 0 {
            return Some(Err(StoreError::Corrupt("cycle in multimap rows".into())));
        }
        self.remaining -= 1;

        let position = self.base + u64::from(index) * self.row_size;
        match u32::load_opt(&self.memory, position) {
            Ok(next) => self.current = next,
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(Row {
            memory: self.memory.clone(),
            offset: position + ROW_LINK,
            len: self.value_size as usize,
            index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multimap(dir: &tempfile::TempDir) -> RecordMultimap<2> {
        RecordMultimap::create(
            dir.path().join("table"),
            dir.path().join("rows"),
            4,
            3,
        )
        .unwrap()
    }

    fn values(map: &RecordMultimap<2>, key: &[u8; 2]) -> Vec<Vec<u8>> {
        map.find(key)
            .unwrap()
            .map(|row| row.unwrap().value().unwrap().to_vec())
            .collect()
    }

    #[test]
    fn rows_come_back_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let map = multimap(&dir);
        map.store(b"ab", |v| v.copy_from_slice(b"one")).unwrap();
        map.store(b"ab", |v| v.copy_from_slice(b"two")).unwrap();
        map.store(b"cd", |v| v.copy_from_slice(b"xxx")).unwrap();
        map.store(b"ab", |v| v.copy_from_slice(b"thr")).unwrap();

        assert_eq!(values(&map, b"ab"), vec![b"thr".to_vec(), b"two".to_vec(), b"one".to_vec()]);
        assert_eq!(values(&map, b"cd"), vec![b"xxx".to_vec()]);
        assert!(values(&map, b"ef").is_empty());
    }

    #[test]
    fn delete_last_row_pops_front() {
        let dir = tempfile::tempdir().unwrap();
        let map = multimap(&dir);
        map.store(b"ab", |v| v.copy_from_slice(b"one")).unwrap();
        map.store(b"ab", |v| v.copy_from_slice(b"two")).unwrap();

        assert!(map.delete_last_row(b"ab").unwrap());
        assert_eq!(values(&map, b"ab"), vec![b"one".to_vec()]);
        assert!(map.delete_last_row(b"ab").unwrap());
        assert!(values(&map, b"ab").is_empty());
        assert!(!map.delete_last_row(b"ab").unwrap());

        // The key can come back after it emptied.
        map.store(b"ab", |v| v.copy_from_slice(b"new")).unwrap();
        assert_eq!(values(&map, b"ab"), vec![b"new".to_vec()]);
    }

    #[test]
    fn iterator_survives_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let map = multimap(&dir);
        map.store(b"ab", |v| v.copy_from_slice(b"one")).unwrap();
        let mut iter = map.find(b"ab").unwrap();
        for _ in 0..1000 {
            map.store(b"zz", |v| v.fill(1)).unwrap();
        }
        let row = iter.next().unwrap().unwrap();
        assert_eq!(row.value().unwrap(), b"one");
        assert!(iter.next().is_none());
    }

    #[test]
    fn reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (table, rows) = (dir.path().join("table"), dir.path().join("rows"));
        {
            let map = RecordMultimap::<2>::create(&table, &rows, 4, 3).unwrap();
            map.store(b"ab", |v| v.copy_from_slice(b"one")).unwrap();
            map.store(b"ab", |v| v.copy_from_slice(b"two")).unwrap();
            map.close().unwrap();
        }
        let map = RecordMultimap::<2>::open(&table, &rows, 3).unwrap();
        assert_eq!(values(&map, b"ab"), vec![b"two".to_vec(), b"one".to_vec()]);
        assert_eq!(map.statinfo().1, 2);
    }
}
