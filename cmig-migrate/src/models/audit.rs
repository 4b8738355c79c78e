//! Append-only audit trail entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Phase;

/// Audit action names
pub mod actions {
    pub const START_RUN: &str = "start_run";
    pub const RUN_PHASE: &str = "run_phase";
    pub const RETRY: &str = "retry";
    pub const APPROVE_MAPPING: &str = "approve_mapping";
    pub const REVISE_MAPPING: &str = "revise_mapping";
    pub const PAUSE: &str = "pause";
    pub const PAUSE_REQUESTED: &str = "pause_requested";
    pub const RESUME: &str = "resume";
    pub const REJECT_RECORD: &str = "reject_record";
    pub const RECOVERED: &str = "recovered";
}

/// Event to append; id and timestamp are assigned on insert
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub run_id: Uuid,
    pub phase: Option<Phase>,
    pub action: &'static str,
    /// None for system-triggered actions
    pub actor_id: Option<String>,
    pub metadata: Value,
}

impl NewAuditEvent {
    pub fn new(run_id: Uuid, phase: Option<Phase>, action: &'static str, actor_id: Option<String>) -> Self {
        Self {
            run_id,
            phase,
            action,
            actor_id,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Persisted audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: i64,
    pub run_id: Uuid,
    pub phase: Option<Phase>,
    pub action: String,
    pub actor_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
