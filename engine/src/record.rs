//! Versioned records held in the local cache.

use crate::{error::Result, Error, RecordId, Row, TableName, Timestamp};
use serde::{Deserialize, Serialize};

/// Row key carrying the record identity.
pub const ID_FIELD: &str = "id";
/// Row key carrying the last-modified timestamp (milliseconds since epoch).
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Written by the local user
    Local,
    /// Received from the remote store or push channel
    Remote,
}

/// A locally cached entity with a sync flag and a timestamp used for
/// conflict comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedRecord {
    /// Unique identifier within the table
    pub id: RecordId,
    /// Table this record belongs to
    pub table: TableName,
    /// User fields, excluding `id` and `updated_at`
    pub fields: Row,
    /// Last modification (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// True iff every operation affecting this record is done
    pub is_synced: bool,
    /// Local tombstone, purged once the delete is acknowledged
    #[serde(default)]
    pub deleted: bool,
}

impl VersionedRecord {
    /// Create a record from a local write. It starts unsynced.
    pub fn new_local(
        id: impl Into<RecordId>,
        table: impl Into<TableName>,
        fields: Row,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            fields: strip_reserved(fields),
            updated_at,
            is_synced: false,
            deleted: false,
        }
    }

    /// Create a record that mirrors remote state. It starts synced.
    pub fn new_remote(
        id: impl Into<RecordId>,
        table: impl Into<TableName>,
        fields: Row,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            is_synced: true,
            ..Self::new_local(id, table, fields, updated_at)
        }
    }

    /// Build a synced record from a remote row.
    ///
    /// The row must carry a string `id`. A missing `updated_at` reads as 0.
    pub fn from_row(table: impl Into<TableName>, row: &Row) -> Result<Self> {
        let id = row_id(row).ok_or(Error::MissingRowId)?.to_string();
        let updated_at = row_timestamp(row)?.unwrap_or(0);
        Ok(Self::new_remote(id, table, row.clone(), updated_at))
    }

    /// Render this record as a remote row (fields plus `id` and `updated_at`).
    pub fn to_row(&self) -> Row {
        let mut row = self.fields.clone();
        row.insert(ID_FIELD.into(), self.id.clone().into());
        row.insert(UPDATED_AT_FIELD.into(), self.updated_at.into());
        row
    }

    /// Get a field value.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Overwrite only the fields present in `delta`.
    ///
    /// Fields absent from the delta are left untouched; a field explicitly
    /// set to `null` in the delta is stored as `null`.
    pub fn apply_delta(&mut self, delta: &Row, updated_at: Timestamp) {
        for (key, value) in delta {
            if is_reserved(key) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = self.updated_at.max(updated_at);
    }

    /// Replace all fields from a local write and flag the record unsynced.
    pub fn replace_local(&mut self, fields: Row, updated_at: Timestamp) {
        self.fields = strip_reserved(fields);
        self.updated_at = updated_at;
        self.is_synced = false;
        self.deleted = false;
    }

    /// Mark the record as deleted locally (tombstone).
    pub fn mark_deleted(&mut self, updated_at: Timestamp) {
        self.deleted = true;
        self.is_synced = false;
        self.updated_at = updated_at;
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// True when both records carry the same user fields.
    pub fn same_content(&self, other: &VersionedRecord) -> bool {
        self.fields == other.fields && self.deleted == other.deleted
    }
}

/// Read the `id` of a row.
pub fn row_id(row: &Row) -> Option<&str> {
    row.get(ID_FIELD).and_then(|v| v.as_str())
}

/// Read the `updated_at` of a row as milliseconds.
///
/// Integers are taken as-is; strings must hold an integer. Anything else is
/// an error so a malformed timestamp never silently wins a conflict.
pub fn row_timestamp(row: &Row) -> Result<Option<Timestamp>> {
    match row.get(UPDATED_AT_FIELD) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            Error::InvalidTimestamp {
                field: UPDATED_AT_FIELD.into(),
                value: n.to_string(),
            }
        }),
        Some(serde_json::Value::String(s)) => {
            s.trim()
                .parse::<Timestamp>()
                .map(Some)
                .map_err(|_| Error::InvalidTimestamp {
                    field: UPDATED_AT_FIELD.into(),
                    value: s.clone(),
                })
        }
        Some(other) => Err(Error::InvalidTimestamp {
            field: UPDATED_AT_FIELD.into(),
            value: other.to_string(),
        }),
    }
}

fn is_reserved(key: &str) -> bool {
    key == ID_FIELD || key == UPDATED_AT_FIELD
}

fn strip_reserved(mut fields: Row) -> Row {
    fields.remove(ID_FIELD);
    fields.remove(UPDATED_AT_FIELD);
    fields
}
