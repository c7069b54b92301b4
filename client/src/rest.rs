//! HTTP remote store speaking PostgREST-style URLs.
//!
//! - `GET    /{table}?id=eq.{id}`
//! - `POST   /{table}` with `Prefer: resolution=merge-duplicates` (upsert)
//! - `PATCH  /{table}?id=eq.{id}`
//! - `DELETE /{table}?id=eq.{id}`
//!
//! Rows coming back may carry `updated_at` as an RFC 3339 string; it is
//! normalized to epoch milliseconds before the row leaves this module.

use async_trait::async_trait;
use chrono::DateTime;
use quill_engine::{Row, UPDATED_AT_FIELD};
use reqwest::{Method, RequestBuilder, Response};

use crate::config::{ConfigError, SyncConfig};
use crate::error::RemoteError;
use crate::remote::{ChannelFilter, RemoteStore};

/// Remote store backed by a REST endpoint.
#[derive(Debug, Clone)]
pub struct RestRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestRemoteStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build from configuration; a remote URL is required.
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let url = config
            .remote_url
            .clone()
            .ok_or(ConfigError::MissingRemoteUrl)?;
        Ok(Self::new(url, config.api_key.clone()))
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, table));
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError> {
        let request = self
            .request(Method::GET, table)
            .query(&[("id", format!("eq.{id}")), ("limit", "1".to_string())]);
        let rows: Vec<Row> = Self::send(request).await?.json().await?;
        rows.into_iter().next().map(normalize_row).transpose()
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError> {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);
        Self::send(request).await?;
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, fields: &Row) -> Result<(), RemoteError> {
        let request = self
            .request(Method::PATCH, table)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(fields);
        Self::send(request).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let request = self
            .request(Method::DELETE, table)
            .query(&[("id", format!("eq.{id}"))]);
        Self::send(request).await?;
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> Result<Vec<Row>, RemoteError> {
        let mut request = self.request(Method::GET, table).query(&[("order", "id")]);
        if let Some(filter) = filter {
            request = request.query(&[(filter.column.as_str(), format!("eq.{}", filter.value))]);
        }
        let rows: Vec<Row> = Self::send(request).await?.json().await?;
        rows.into_iter().map(normalize_row).collect()
    }
}

/// Rewrite an RFC 3339 `updated_at` as epoch milliseconds.
pub fn normalize_row(mut row: Row) -> Result<Row, RemoteError> {
    let Some(serde_json::Value::String(raw)) = row.get(UPDATED_AT_FIELD) else {
        return Ok(row);
    };
    if raw.trim().chars().all(|c| c.is_ascii_digit()) {
        return Ok(row);
    }

    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| RemoteError::InvalidRow(format!("updated_at '{raw}': {e}")))?;
    let millis = u64::try_from(parsed.timestamp_millis())
        .map_err(|_| RemoteError::InvalidRow(format!("updated_at '{raw}' is before 1970")))?;

    row.insert(UPDATED_AT_FIELD.into(), millis.into());
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn rfc3339_timestamps_become_millis() {
        let normalized =
            normalize_row(row(json!({"id": "s", "updated_at": "2024-01-01T00:00:01.500Z"})))
                .unwrap();
        assert_eq!(normalized["updated_at"], json!(1_704_067_201_500u64));
    }

    #[test]
    fn numeric_timestamps_pass_through() {
        let source = row(json!({"id": "s", "updated_at": 42}));
        assert_eq!(normalize_row(source.clone()).unwrap(), source);

        let digits = row(json!({"id": "s", "updated_at": "42"}));
        assert_eq!(normalize_row(digits.clone()).unwrap(), digits);
    }

    #[test]
    fn malformed_timestamps_are_rejected() {
        let result = normalize_row(row(json!({"id": "s", "updated_at": "yesterday"})));
        assert!(matches!(result, Err(RemoteError::InvalidRow(_))));
    }

    #[test]
    fn base_url_is_trimmed() {
        let store = RestRemoteStore::new("http://localhost:3000/", None);
        assert_eq!(store.base_url, "http://localhost:3000");

        let err = RestRemoteStore::from_config(&SyncConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRemoteUrl));
    }
}
