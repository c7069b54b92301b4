//! Remote store seam.
//!
//! The remote store is the authoritative copy. Every write must tolerate
//! replays: `insert` is an upsert, `update` sets absolute values, and
//! deleting an absent row succeeds.

use async_trait::async_trait;
use dashmap::DashMap;
use quill_engine::{row_id, RecordId, Row, TableName};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Equality filter restricting a subscription or selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub column: String,
    pub value: String,
}

impl ChannelFilter {
    /// Filter rows where `column` equals `value`.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a row passes the filter. Numbers and booleans compare by
    /// their JSON text.
    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl std::fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// The authoritative remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch one row, `None` if it does not exist.
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError>;

    /// Insert a full row, replacing any existing row with the same id.
    async fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError>;

    /// Set the given fields on a row.
    async fn update(&self, table: &str, id: &str, fields: &Row) -> Result<(), RemoteError>;

    /// Delete a row. Deleting an absent row succeeds.
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    /// Select every row of a table passing the filter.
    async fn select(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> Result<Vec<Row>, RemoteError>;
}

/// In-process remote store.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    rows: DashMap<(TableName, RecordId), Row>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a row directly.
    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.rows
            .get(&(table.to_string(), id.to_string()))
            .map(|row| row.clone())
    }

    /// Write a row directly, as a server-side worker would.
    pub fn put(&self, table: &str, row: Row) -> Result<(), RemoteError> {
        let id = row_id(&row)
            .ok_or_else(|| RemoteError::InvalidRow("row is missing an id".into()))?
            .to_string();
        self.rows.insert((table.to_string(), id), row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError> {
        Ok(self.get(table, id))
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError> {
        self.put(table, row.clone())
    }

    async fn update(&self, table: &str, id: &str, fields: &Row) -> Result<(), RemoteError> {
        let mut entry = self
            .rows
            .entry((table.to_string(), id.to_string()))
            .or_insert_with(|| {
                let mut row = Row::new();
                row.insert("id".into(), id.into());
                row
            });
        for (key, value) in fields {
            entry.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.rows.remove(&(table.to_string(), id.to_string()));
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> Result<Vec<Row>, RemoteError> {
        let mut rows: Vec<(RecordId, Row)> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == table)
            .filter(|entry| filter.map_or(true, |f| f.matches(entry.value())))
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }
}
