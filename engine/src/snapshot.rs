//! Snapshot types for persisting and restoring the local cache.
//!
//! A snapshot holds every cached record plus the operation log. It is the
//! unit the client runtime writes to disk, so serialization must be
//! deterministic: records are kept in `BTreeMap`s keyed by table, then ID.

use crate::{error::Result, Error, Operation, OperationLog, RecordId, TableName, VersionedRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of the local cache and operation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Records by table, then by record ID
    pub tables: BTreeMap<TableName, BTreeMap<RecordId, VersionedRecord>>,
    /// Queued operations, oldest first
    pub operations: Vec<Operation>,
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            tables: BTreeMap::new(),
            operations: Vec::new(),
        }
    }

    /// Insert or replace a record.
    pub fn put_record(&mut self, record: VersionedRecord) {
        self.tables
            .entry(record.table.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Remove a record, dropping the table entry once it is empty.
    pub fn remove_record(&mut self, table: &str, id: &str) -> Option<VersionedRecord> {
        let records = self.tables.get_mut(table)?;
        let removed = records.remove(id);
        if records.is_empty() {
            self.tables.remove(table);
        }
        removed
    }

    pub fn get_record(&self, table: &str, id: &str) -> Option<&VersionedRecord> {
        self.tables.get(table)?.get(id)
    }

    /// All records across tables, in key order.
    pub fn records(&self) -> impl Iterator<Item = &VersionedRecord> {
        self.tables.values().flat_map(|records| records.values())
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Records with local changes not yet acknowledged.
    pub fn unsynced_count(&self) -> usize {
        self.records().filter(|r| !r.is_synced).count()
    }

    /// Rebuild the operation log stored in this snapshot.
    pub fn operation_log(&self) -> OperationLog {
        OperationLog::restore(self.operations.clone())
    }

    /// Check the snapshot is internally consistent.
    ///
    /// Every record must be filed under its own table and ID.
    pub fn validate(&self) -> Result<()> {
        for (table, records) in &self.tables {
            for (id, record) in records {
                if &record.table != table || &record.id != id {
                    return Err(Error::InvalidSnapshot(format!(
                        "record '{}/{}' filed under '{table}/{id}'",
                        record.table, record.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Counts describing a snapshot without its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub table_count: usize,
    pub record_count: usize,
    pub unsynced_count: usize,
    pub operation_count: usize,
}

impl From<&CacheSnapshot> for SnapshotMetadata {
    fn from(snapshot: &CacheSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            table_count: snapshot.tables.len(),
            record_count: snapshot.record_count(),
            unsynced_count: snapshot.unsynced_count(),
            operation_count: snapshot.operations.len(),
        }
    }
}
