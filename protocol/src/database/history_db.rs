//! # History Database
//!
//! Per-address activity, newest first. A [`RecordMultimap`] keyed by the
//! 20-byte address hash, one row per received output or spend:
//!
//! ```text
//! [kind: u8][point: 36][height: u32][value: u64]
//! ```
//!
//! For outputs `point` is the output itself; for spends it is the spending
//! input and `value` is the amount the spent output carried.

use std::path::Path;

use serde::Serialize;

use super::{DbError, DbResult};
use crate::chain::script::{AddressHash, ADDRESS_HASH_SIZE};
use crate::chain::{OutPoint, Reader, POINT_SIZE};
use crate::storage::{RecordMultimap, TableStats};

const ROW_SIZE: u64 = 1 + POINT_SIZE as u64 + 4 + 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Output = 0,
    Spend = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
    pub kind: HistoryKind,
    pub point: OutPoint,
    pub height: u64,
    pub value: u64,
}

impl HistoryRow {
    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.kind as u8;
        buf[1..37].copy_from_slice(&self.point.to_bytes());
        buf[37..41].copy_from_slice(&(self.height as u32).to_le_bytes());
        buf[41..49].copy_from_slice(&self.value.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        let mut reader = Reader::new(bytes);
        let kind = match reader.u8()? {
            0 => HistoryKind::Output,
            1 => HistoryKind::Spend,
            other => return Err(DbError::Corrupt(format!("history row kind {other}"))),
        };
        Ok(Self {
            kind,
            point: OutPoint::from_bytes(reader.bytes(POINT_SIZE)?)?,
            height: u64::from(reader.u32()?),
            value: reader.u64()?,
        })
    }
}

#[derive(Debug)]
pub struct HistoryDatabase {
    rows: RecordMultimap<ADDRESS_HASH_SIZE>,
}

impl HistoryDatabase {
    pub fn create(table: &Path, rows: &Path, buckets: u32) -> DbResult<Self> {
        Ok(Self {
            rows: RecordMultimap::create(table, rows, buckets, ROW_SIZE)?,
        })
    }

    pub fn open(table: &Path, rows: &Path) -> DbResult<Self> {
        Ok(Self {
            rows: RecordMultimap::open(table, rows, ROW_SIZE)?,
        })
    }

    fn add(&self, address: &AddressHash, row: HistoryRow) -> DbResult<()> {
        self.rows.store(address, |buf| row.encode(buf))?;
        Ok(())
    }

    pub fn add_output(
        &self,
        address: &AddressHash,
        output: OutPoint,
        height: u64,
        value: u64,
    ) -> DbResult<()> {
        self.add(
            address,
            HistoryRow {
                kind: HistoryKind::Output,
                point: output,
                height,
                value,
            },
        )
    }

    pub fn add_input(
        &self,
        address: &AddressHash,
        input: OutPoint,
        height: u64,
        value: u64,
    ) -> DbResult<()> {
        self.add(
            address,
            HistoryRow {
                kind: HistoryKind::Spend,
                point: input,
                height,
                value,
            },
        )
    }

    /// Rows for `address` at or above `from_height`, newest first. A `limit`
    /// of zero means no limit.
    pub fn get(&self, address: &AddressHash, limit: usize, from_height: u64) -> DbResult<Vec<HistoryRow>> {
        let mut result = Vec::new();
        for row in self.rows.find(address)? {
            let row = HistoryRow::decode(row?.value()?)?;
            // Rows are newest first, so heights only go down from here.
            if row.height < from_height {
                break;
            }
            result.push(row);
            if limit != 0 && result.len() >= limit {
                break;
            }
        }
        Ok(result)
    }

    pub fn delete_last_row(&self, address: &AddressHash) -> DbResult<bool> {
        Ok(self.rows.delete_last_row(address)?)
    }

    pub fn sync(&self) -> DbResult<()> {
        Ok(self.rows.sync()?)
    }

    pub fn flush(&self) -> DbResult<()> {
        Ok(self.rows.flush()?)
    }

    pub fn stop(&self) {
        self.rows.stop()
    }

    pub fn close(&self) -> DbResult<()> {
        Ok(self.rows.close()?)
    }

    pub fn statinfo(&self) -> (TableStats, u32) {
        self.rows.statinfo()
    }
}
