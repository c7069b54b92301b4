//! # Quill Engine
//!
//! Deterministic decision core for an offline-first story client.
//!
//! The engine owns everything about synchronization that can be decided
//! without IO: what a cached record looks like, which queued operation may
//! run next, who wins a conflict, how healthy the push channel is, and
//! whether a generated choice set may enter the cache. The async runtime in
//! `quill-sync` wires these decisions to the network, the disk and the
//! clock.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or time sources
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`VersionedRecord`] is a cached row with an `updated_at` timestamp used
//! for conflict comparison and an `is_synced` flag that stays false until
//! every operation affecting the record is acknowledged.
//!
//! ### Operations
//!
//! Local writes become [`Operation`]s held in an [`OperationLog`]. The log
//! runs them FIFO per record, retries failures with exponential backoff and
//! marks them [`OperationStatus::Failed`] once the [`RetryPolicy`] is spent.
//!
//! ### Conflicts
//!
//! [`resolve_conflict`] picks a winner between the server and client
//! versions under a [`ConflictStrategy`]:
//! - [`ConflictStrategy::ServerWins`]
//! - [`ConflictStrategy::ClientWins`]
//! - [`ConflictStrategy::TimestampBased`] (default, ties go to the server)
//! - [`ConflictStrategy::ManualResolution`] (per-table callback)
//!
//! ### Channel Health
//!
//! [`ConnectionHealthTracker`] classifies the push channel from its
//! lifecycle signals and computes reconnect delays.
//!
//! ### Content Integrity
//!
//! [`ChoiceContract`] validates generated choice sets and decides whether an
//! incoming set may replace the cached one.
//!
//! ## Quick Start
//!
//! ```rust
//! use quill_engine::{
//!     resolve_conflict, validate_choice_set_contract, Strategy, VersionedRecord, Winner,
//! };
//! use serde_json::json;
//!
//! let fields = |content: &str| json!({"content": content}).as_object().cloned().unwrap();
//!
//! let server = VersionedRecord::new_remote("seg-1", "segments", fields("server"), 2000);
//! let client = VersionedRecord::new_local("seg-1", "segments", fields("client"), 3000);
//!
//! let resolution = resolve_conflict(&server, &client, &Strategy::TimestampBased);
//! assert_eq!(resolution.winner, Winner::Client);
//!
//! let story = "Mara stood at the gate of the old mill.";
//! assert!(validate_choice_set_contract(
//!     story,
//!     &json!(["Open the door", "Call for help", "Wait quietly"]),
//! ));
//! assert!(!validate_choice_set_contract(story, &json!(["go"])));
//! ```
//!
//! ## FFI
//!
//! The [`ffi`] module exposes the decision functions to other languages.
//! All data is exchanged as JSON strings.
//!
//! ## Persistence
//!
//! [`CacheSnapshot`] is the serializable form of the cache and queue, with
//! deterministic ordering.

pub mod choice;
pub mod error;
pub mod ffi;
pub mod health;
pub mod operation;
pub mod queue;
pub mod record;
pub mod resolve;
pub mod snapshot;

// Re-export main types at crate root
pub use choice::{
    default_contract, merge_choices, validate_choice_set_contract, ChoiceContract, ChoiceMerge,
    ChoiceRule, ChoiceSet, ContractReport, EntityExtractor, HeuristicExtractor, MergeDecision,
    StoryEntities, Violation, CHOICE_COUNT, FORBIDDEN_TERMS,
};
pub use error::Error;
pub use health::{
    BackoffConfig, ChannelStatus, ConnectionHealth, ConnectionHealthTracker, HealthState,
    HealthTransition, ReconnectDecision,
};
pub use operation::{exponential_delay, Operation, OperationKind, OperationStatus, RetryPolicy};
pub use queue::{FailOutcome, OperationLog};
pub use record::{row_id, row_timestamp, Provenance, VersionedRecord, ID_FIELD, UPDATED_AT_FIELD};
pub use resolve::{
    check_identity, resolve_conflict, ConflictStrategy, ManualResolver, Resolution, Strategy,
    Winner,
};
pub use snapshot::{CacheSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type OperationId = String;
pub type Timestamp = u64;
/// A remote row or field delta
pub type Row = serde_json::Map<String, serde_json::Value>;
