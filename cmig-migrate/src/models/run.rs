//! Migration run state machine
//!
//! Connecting → Connected → Discovering → Discovered → MappingInProgress →
//! MappingReview → Migrating → Verifying → Completed, with Paused reachable
//! from any non-terminal status and Failed as the other terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{IngestionStrategy, RunProgress, SourceProfile, SourceVendor};

/// Run status (persisted with exactly these names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Connecting,
    Connected,
    Discovering,
    Discovered,
    MappingInProgress,
    MappingReview,
    Migrating,
    Paused,
    Verifying,
    Completed,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 11] = [
        RunStatus::Connecting,
        RunStatus::Connected,
        RunStatus::Discovering,
        RunStatus::Discovered,
        RunStatus::MappingInProgress,
        RunStatus::MappingReview,
        RunStatus::Migrating,
        RunStatus::Paused,
        RunStatus::Verifying,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Connecting => "Connecting",
            RunStatus::Connected => "Connected",
            RunStatus::Discovering => "Discovering",
            RunStatus::Discovered => "Discovered",
            RunStatus::MappingInProgress => "MappingInProgress",
            RunStatus::MappingReview => "MappingReview",
            RunStatus::Migrating => "Migrating",
            RunStatus::Paused => "Paused",
            RunStatus::Verifying => "Verifying",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        RunStatus::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase a caller can request through `run_phase`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Connect,
    Discover,
    GenerateMapping,
    Transform,
    Validate,
    Promote,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Connect,
        Phase::Discover,
        Phase::GenerateMapping,
        Phase::Transform,
        Phase::Validate,
        Phase::Promote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Discover => "discover",
            Phase::GenerateMapping => "generateMapping",
            Phase::Transform => "transform",
            Phase::Validate => "validate",
            Phase::Promote => "promote",
        }
    }

    /// Accepts the camelCase name and its snake_case spelling
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generate_mapping" => Some(Phase::GenerateMapping),
            other => Phase::ALL.into_iter().find(|p| p.as_str() == other),
        }
    }

    /// The only status from which this phase may start
    pub fn allowed_from(&self) -> RunStatus {
        match self {
            Phase::Connect => RunStatus::Connecting,
            Phase::Discover => RunStatus::Connected,
            Phase::GenerateMapping => RunStatus::Discovered,
            Phase::Transform => RunStatus::MappingReview,
            Phase::Validate => RunStatus::Migrating,
            Phase::Promote => RunStatus::Verifying,
        }
    }

    /// Status held while the phase executes
    pub fn running_status(&self) -> RunStatus {
        match self {
            Phase::Discover => RunStatus::Discovering,
            Phase::GenerateMapping => RunStatus::MappingInProgress,
            other => other.allowed_from(),
        }
    }

    pub fn success_status(&self) -> RunStatus {
        match self {
            Phase::Connect => RunStatus::Connected,
            Phase::Discover => RunStatus::Discovered,
            Phase::GenerateMapping => RunStatus::MappingReview,
            Phase::Transform => RunStatus::Migrating,
            Phase::Validate => RunStatus::Verifying,
            Phase::Promote => RunStatus::Completed,
        }
    }

    /// Status after a vendor or mapping failure
    pub fn recoverable_failure_status(&self) -> RunStatus {
        match self {
            Phase::Connect | Phase::Discover | Phase::GenerateMapping => RunStatus::Failed,
            Phase::Transform => RunStatus::MappingReview,
            Phase::Validate => RunStatus::Migrating,
            Phase::Promote => RunStatus::Paused,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One migration attempt for one clinic from one source vendor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub source_vendor: SourceVendor,
    /// Resolved once at run start
    pub ingestion_strategy: IngestionStrategy,
    pub status: RunStatus,
    /// Last phase requested
    pub current_phase: Option<Phase>,
    pub source_profile: SourceProfile,
    /// 0 means no mapping spec yet
    pub mapping_spec_version: i64,
    pub mapping_approved_at: Option<DateTime<Utc>>,
    pub mapping_approved_by: Option<String>,
    pub progress: RunProgress,
    /// Status restored by resume
    pub resume_status: Option<RunStatus>,
    pub pause_requested: bool,
    /// Phase currently holding the run lock
    pub active_phase: Option<Phase>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRun {
    pub fn new(
        clinic_id: Uuid,
        source_vendor: SourceVendor,
        source_profile: SourceProfile,
        ingestion_strategy: IngestionStrategy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            clinic_id,
            source_vendor,
            ingestion_strategy,
            status: RunStatus::Connecting,
            current_phase: None,
            source_profile,
            mapping_spec_version: 0,
            mapping_approved_at: None,
            mapping_approved_by: None,
            progress: RunProgress::default(),
            resume_status: None,
            pause_requested: false,
            active_phase: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to new status
    pub fn transition_to(&mut self, new_status: RunStatus) {
        let now = Utc::now();
        tracing::debug!(
            run_id = %self.id,
            from = %self.status,
            to = %new_status,
            "Run status transition"
        );
        self.status = new_status;
        self.updated_at = now;

        if new_status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Approved mapping exists for the current version
    pub fn mapping_approved(&self) -> bool {
        self.mapping_spec_version > 0 && self.mapping_approved_at.is_some()
    }
}

/// Run view returned to callers (credentials never leave the service)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub source_vendor: SourceVendor,
    pub ingestion_strategy: IngestionStrategy,
    pub status: RunStatus,
    pub current_phase: Option<Phase>,
    pub source_url: Option<String>,
    pub uploaded_files: usize,
    pub mapping_spec_version: i64,
    pub mapping_approved_at: Option<DateTime<Utc>>,
    pub mapping_approved_by: Option<String>,
    pub progress: RunProgress,
    pub pause_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&MigrationRun> for RunSummary {
    fn from(run: &MigrationRun) -> Self {
        Self {
            id: run.id,
            clinic_id: run.clinic_id,
            source_vendor: run.source_vendor.clone(),
            ingestion_strategy: run.ingestion_strategy,
            status: run.status,
            current_phase: run.current_phase,
            source_url: run.source_profile.source_url().map(str::to_string),
            uploaded_files: run.source_profile.uploaded_files.len(),
            mapping_spec_version: run.mapping_spec_version,
            mapping_approved_at: run.mapping_approved_at,
            mapping_approved_by: run.mapping_approved_by.clone(),
            progress: run.progress.clone(),
            pause_requested: run.pause_requested,
            started_at: run.started_at,
            completed_at: run.completed_at,
            error_message: run.error_message.clone(),
            created_at: run.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run() -> MigrationRun {
        MigrationRun::new(
            Uuid::new_v4(),
            SourceVendor::VendorA,
            SourceProfile::default(),
            IngestionStrategy::Upload,
        )
    }

    #[test]
    fn test_new_run_starts_connecting_without_mapping() {
        let run = new_run();
        assert_eq!(run.status, RunStatus::Connecting);
        assert_eq!(run.mapping_spec_version, 0);
        assert!(!run.mapping_approved());
    }

    #[test]
    fn test_terminal_transition_sets_completed_at() {
        let mut run = new_run();
        run.transition_to(RunStatus::Failed);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert!(run.is_terminal());
    }

    #[test]
    fn test_phase_chain_is_contiguous() {
        // Each phase's success status is the next phase's entry status
        for pair in Phase::ALL.windows(2) {
            assert_eq!(pair[0].success_status(), pair[1].allowed_from());
        }
    }

    #[test]
    fn test_status_names_round_trip() {
        for status in RunStatus::ALL {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_phase_parse_accepts_both_spellings() {
        assert_eq!(Phase::parse("generateMapping"), Some(Phase::GenerateMapping));
        assert_eq!(Phase::parse("generate_mapping"), Some(Phase::GenerateMapping));
        assert_eq!(Phase::parse("approve"), None);
    }

    #[test]
    fn test_failure_statuses_follow_phase_table() {
        assert_eq!(Phase::Connect.recoverable_failure_status(), RunStatus::Failed);
        assert_eq!(Phase::Transform.recoverable_failure_status(), RunStatus::MappingReview);
        assert_eq!(Phase::Validate.recoverable_failure_status(), RunStatus::Migrating);
        assert_eq!(Phase::Promote.recoverable_failure_status(), RunStatus::Paused);
    }
}
