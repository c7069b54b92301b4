//! Configuration management for the sync runtime.

use quill_engine::{BackoffConfig, ConflictStrategy, RetryPolicy};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Sync tunables, loadable from `QUILL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base push channel reconnect delay (ms)
    pub reconnect_base_delay_ms: u64,
    /// Upper bound on a reconnect delay (ms)
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before relying on polling alone
    pub max_reconnect_attempts: u32,
    /// Fallback poll interval (ms)
    pub poll_interval_ms: u64,
    /// Failed attempts before an operation is abandoned
    pub max_operation_attempts: u32,
    /// Base operation retry delay (ms)
    pub retry_base_delay_ms: u64,
    /// Upper bound on an operation retry delay (ms)
    pub retry_max_delay_ms: u64,
    /// Strategy used when a record changed on both sides
    pub conflict_strategy: ConflictStrategy,
    /// Field holding a segment's generated choices
    pub choices_field: String,
    /// Field holding the story text the choices refer to
    pub story_text_field: String,
    /// Fields whose first non-null value signals a finished asset
    pub asset_fields: Vec<String>,
    /// Tables kept fresh by push or polling
    pub watch_tables: Vec<String>,
    /// Remote REST endpoint
    pub remote_url: Option<String>,
    /// API key sent to the remote store
    pub api_key: Option<String>,
    /// Local cache file
    pub cache_path: PathBuf,
    /// Background sync interval (ms)
    pub auto_sync_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            poll_interval_ms: 30_000,
            max_operation_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            conflict_strategy: ConflictStrategy::TimestampBased,
            choices_field: "choices".to_string(),
            story_text_field: "content".to_string(),
            asset_fields: vec!["image_url".to_string()],
            watch_tables: vec!["stories".to_string(), "segments".to_string()],
            remote_url: None,
            api_key: None,
            cache_path: PathBuf::from("quill-cache.json"),
            auto_sync_interval_ms: 60_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &'static str, default: u64| parse_or(&lookup, key, default);
        let interval = |key: &'static str, default: u64| match number(key, default)? {
            0 => Err(ConfigError::ZeroInterval { key }),
            ms => Ok(ms),
        };

        let conflict_strategy = match lookup("QUILL_CONFLICT_STRATEGY") {
            Some(raw) => raw.parse().map_err(ConfigError::InvalidStrategy)?,
            None => defaults.conflict_strategy,
        };

        Ok(Self {
            reconnect_base_delay_ms: number(
                "QUILL_RECONNECT_BASE_MS",
                defaults.reconnect_base_delay_ms,
            )?,
            reconnect_max_delay_ms: number("QUILL_RECONNECT_MAX_MS", defaults.reconnect_max_delay_ms)?,
            max_reconnect_attempts: parse_or(
                &lookup,
                "QUILL_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            poll_interval_ms: interval("QUILL_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            max_operation_attempts: parse_or(
                &lookup,
                "QUILL_MAX_OPERATION_ATTEMPTS",
                defaults.max_operation_attempts,
            )?,
            retry_base_delay_ms: number("QUILL_RETRY_BASE_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: number("QUILL_RETRY_MAX_MS", defaults.retry_max_delay_ms)?,
            conflict_strategy,
            choices_field: lookup("QUILL_CHOICES_FIELD").unwrap_or(defaults.choices_field),
            story_text_field: lookup("QUILL_STORY_TEXT_FIELD").unwrap_or(defaults.story_text_field),
            asset_fields: lookup("QUILL_ASSET_FIELDS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.asset_fields),
            watch_tables: lookup("QUILL_WATCH_TABLES")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.watch_tables),
            remote_url: lookup("QUILL_REMOTE_URL"),
            api_key: lookup("QUILL_API_KEY"),
            cache_path: lookup("QUILL_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            auto_sync_interval_ms: interval(
                "QUILL_AUTO_SYNC_INTERVAL_MS",
                defaults.auto_sync_interval_ms,
            )?,
        })
    }

    /// Push channel backoff tunables.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    /// Operation retry tunables.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_operation_attempts,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    /// Fallback poll period, never shorter than 1 ms.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Auto-sync period, never shorter than 1 ms.
    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_millis(self.auto_sync_interval_ms.max(1))
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key,
            value: raw,
        }),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    ZeroInterval { key: &'static str },

    #[error("QUILL_CONFLICT_STRATEGY: {0}")]
    InvalidStrategy(String),

    #[error("QUILL_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.backoff(), BackoffConfig::default());
        assert_eq!(config.conflict_strategy, ConflictStrategy::TimestampBased);
    }

    #[test]
    fn overrides_from_variables() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("QUILL_RECONNECT_BASE_MS", "250"),
            ("QUILL_MAX_RECONNECT_ATTEMPTS", "3"),
            ("QUILL_CONFLICT_STRATEGY", "server-wins"),
            ("QUILL_ASSET_FIELDS", "image_url, audio_url,"),
            ("QUILL_REMOTE_URL", "http://localhost:54321/rest/v1"),
        ]))
        .unwrap();

        assert_eq!(config.reconnect_base_delay_ms, 250);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.conflict_strategy, ConflictStrategy::ServerWins);
        assert_eq!(config.asset_fields, vec!["image_url", "audio_url"]);
        assert_eq!(
            config.remote_url.as_deref(),
            Some("http://localhost:54321/rest/v1")
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = SyncConfig::from_lookup(lookup(&[("QUILL_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                key: "QUILL_POLL_INTERVAL_MS",
                ..
            }
        ));

        let err = SyncConfig::from_lookup(lookup(&[("QUILL_CONFLICT_STRATEGY", "coin_flip")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStrategy(_)));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in ["QUILL_POLL_INTERVAL_MS", "QUILL_AUTO_SYNC_INTERVAL_MS"] {
            let err = SyncConfig::from_lookup(lookup(&[(key, "0")])).unwrap_err();
            assert!(
                matches!(err, ConfigError::ZeroInterval { key: k } if k == key),
                "{key}: {err}"
            );
        }

        let config = SyncConfig {
            poll_interval_ms: 0,
            auto_sync_interval_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.auto_sync_interval(), Duration::from_millis(1));
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let config = SyncConfig {
            max_operation_attempts: 2,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 100,
            ..SyncConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.delay_for(1), 10);
    }
}
