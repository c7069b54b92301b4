//! Choice guard applied to every remote value entering the cache.
//!
//! A segment's `choices` field is only ever replaced by a set that passes
//! the choice contract. Rejected values are dropped from the incoming delta
//! so the cached value stays whatever it was.

use std::sync::Arc;

use quill_engine::{ChoiceContract, ChoiceMerge, Provenance, Row, VersionedRecord};

use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};

/// Screens incoming `choices` values against the contract.
#[derive(Debug)]
pub struct ContentGuard {
    contract: Arc<ChoiceContract>,
    choices_field: String,
    story_text_field: String,
    events: Arc<EventBus>,
}

impl ContentGuard {
    pub fn new(
        contract: Arc<ChoiceContract>,
        choices_field: impl Into<String>,
        story_text_field: impl Into<String>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            contract,
            choices_field: choices_field.into(),
            story_text_field: story_text_field.into(),
            events,
        }
    }

    pub fn choices_field(&self) -> &str {
        &self.choices_field
    }

    /// Screen the `choices` entry of an incoming delta.
    ///
    /// The story text is read from the delta when it carries one, otherwise
    /// from the cached record. On rejection the field is removed from
    /// `delta`. Returns `None` when the delta does not touch choices.
    pub fn screen(
        &self,
        table: &str,
        record_id: &str,
        existing: Option<&VersionedRecord>,
        delta: &mut Row,
    ) -> Option<ChoiceMerge> {
        let incoming = delta.get(&self.choices_field)?.clone();

        let story_text = delta
            .get(&self.story_text_field)
            .or_else(|| existing.and_then(|r| r.field(&self.story_text_field)))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let existing_value = existing.and_then(|r| r.field(&self.choices_field));
        let existing_provenance = match existing {
            Some(record) if record.is_synced => Provenance::Remote,
            _ => Provenance::Local,
        };

        let merge = self.contract.merge(
            record_id,
            &story_text,
            existing_value,
            existing_provenance,
            &incoming,
        );

        tracing::info!(
            table,
            segment_id = record_id,
            decision = ?merge.decision,
            incoming = %incoming,
            existing = ?existing_value,
            reason = %merge.reason,
            "choice merge decided"
        );

        if merge.decision.rejected() {
            delta.remove(&self.choices_field);

            let error = SyncError::ValidationRejected {
                segment_id: record_id.to_string(),
                reason: merge.reason.clone(),
            };
            tracing::warn!(table, error = %error, "incoming choices dropped");

            self.events.emit(SyncEvent::ChoiceRejected {
                table: table.to_string(),
                segment_id: record_id.to_string(),
                decision: merge.decision,
                incoming,
                existing: existing_value.cloned(),
                reason: merge.reason.clone(),
            });
        }

        Some(merge)
    }
}
