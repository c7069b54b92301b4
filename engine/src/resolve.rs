//! Conflict resolution between server and client versions of a record.
//!
//! Resolution is a pure function of its inputs: the same pair of records and
//! the same strategy always produce the same winner.

use crate::{Error, VersionedRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configured conflict strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// The server version always wins
    ServerWins,
    /// The client version always wins
    ClientWins,
    /// Strictly newer `updated_at` wins, ties go to the server (default)
    #[default]
    TimestampBased,
    /// A per-table callback decides, falling back to client wins
    ManualResolution,
}

impl ConflictStrategy {
    /// Stable name used in events and logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::TimestampBased => "timestamp_based",
            ConflictStrategy::ManualResolution => "manual_resolution",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "server_wins" => Ok(ConflictStrategy::ServerWins),
            "client_wins" => Ok(ConflictStrategy::ClientWins),
            "timestamp_based" | "timestamp" => Ok(ConflictStrategy::TimestampBased),
            "manual_resolution" | "manual" => Ok(ConflictStrategy::ManualResolution),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// A per-table manual resolution callback.
///
/// Returning `Err` is allowed; the resolver then falls back to the client
/// version and reports the failure in the resolution.
pub trait ManualResolver: Send + Sync {
    fn resolve(
        &self,
        server: &VersionedRecord,
        client: &VersionedRecord,
    ) -> Result<VersionedRecord, String>;
}

impl<F> ManualResolver for F
where
    F: Fn(&VersionedRecord, &VersionedRecord) -> Result<VersionedRecord, String> + Send + Sync,
{
    fn resolve(
        &self,
        server: &VersionedRecord,
        client: &VersionedRecord,
    ) -> Result<VersionedRecord, String> {
        self(server, client)
    }
}

/// Strategy bound to its dependencies at call time.
///
/// `Manual(None)` means manual resolution was configured but no callback is
/// registered for the table.
#[derive(Clone)]
pub enum Strategy {
    ServerWins,
    ClientWins,
    TimestampBased,
    Manual(Option<Arc<dyn ManualResolver>>),
}

impl Strategy {
    /// Bind a configured strategy to an optional registered callback.
    pub fn bind(configured: ConflictStrategy, manual: Option<Arc<dyn ManualResolver>>) -> Self {
        match configured {
            ConflictStrategy::ServerWins => Strategy::ServerWins,
            ConflictStrategy::ClientWins => Strategy::ClientWins,
            ConflictStrategy::TimestampBased => Strategy::TimestampBased,
            ConflictStrategy::ManualResolution => Strategy::Manual(manual),
        }
    }

    /// The configured strategy this binding came from.
    pub fn kind(&self) -> ConflictStrategy {
        match self {
            Strategy::ServerWins => ConflictStrategy::ServerWins,
            Strategy::ClientWins => ConflictStrategy::ClientWins,
            Strategy::TimestampBased => ConflictStrategy::TimestampBased,
            Strategy::Manual(_) => ConflictStrategy::ManualResolution,
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Manual(Some(_)) => f.write_str("Manual(<callback>)"),
            Strategy::Manual(None) => f.write_str("Manual(None)"),
            other => f.write_str(other.kind().name()),
        }
    }
}

/// Which side supplied the resolved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Winner {
    Server,
    Client,
    /// A manual callback produced a new record
    Merged,
}

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// The record to keep
    pub record: VersionedRecord,
    /// Where it came from
    pub winner: Winner,
    /// The strategy that was requested
    pub strategy: ConflictStrategy,
    /// Set when a manual resolution fell back to client wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// Ensure both versions describe the same record.
pub fn check_identity(server: &VersionedRecord, client: &VersionedRecord) -> crate::error::Result<()> {
    if server.id != client.id || server.table != client.table {
        return Err(Error::IdentityMismatch {
            server: format!("{}/{}", server.table, server.id),
            client: format!("{}/{}", client.table, client.id),
        });
    }
    Ok(())
}

/// Pick a winner between the server and client versions of a record.
pub fn resolve_conflict(
    server: &VersionedRecord,
    client: &VersionedRecord,
    strategy: &Strategy,
) -> Resolution {
    let kind = strategy.kind();
    let pick = |winner: Winner, fallback_reason: Option<String>| Resolution {
        record: match winner {
            Winner::Server => server.clone(),
            _ => client.clone(),
        },
        winner,
        strategy: kind,
        fallback_reason,
    };

    match strategy {
        Strategy::ServerWins => pick(Winner::Server, None),
        Strategy::ClientWins => pick(Winner::Client, None),
        Strategy::TimestampBased => {
            if client.updated_at > server.updated_at {
                pick(Winner::Client, None)
            } else {
                pick(Winner::Server, None)
            }
        }
        Strategy::Manual(None) => pick(
            Winner::Client,
            Some(format!("no manual resolver registered for '{}'", client.table)),
        ),
        Strategy::Manual(Some(resolver)) => match resolver.resolve(server, client) {
            Ok(mut merged) => {
                // The callback decides content, never identity.
                merged.id = client.id.clone();
                merged.table = client.table.clone();
                Resolution {
                    record: merged,
                    winner: Winner::Merged,
                    strategy: kind,
                    fallback_reason: None,
                }
            }
            Err(reason) => pick(Winner::Client, Some(format!("manual resolver failed: {reason}"))),
        },
    }
}
