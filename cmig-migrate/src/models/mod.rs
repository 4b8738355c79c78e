//! Data models for cmig-migrate
//!
//! - Migration run state machine and typed phase results
//! - Staging records, mapping specs, audit events, artifacts

pub mod artifact;
pub mod audit;
pub mod canonical;
pub mod mapping;
pub mod progress;
pub mod run;
pub mod staging;
pub mod vendor;

pub use artifact::{ArtifactKind, ArtifactRef, MigrationArtifact};
pub use audit::{actions, AuditEvent, NewAuditEvent};
pub use mapping::{DerivedOp, FieldMapping, MappingSpec, TransformRule, ValueKind};
pub use progress::{
    ConnectResult, DiscoverResult, DiscoveredEntity, EntityValidation, MappingResult,
    PromoteResult, RunProgress, TransformResult, ValidateResult, ValidationIssue,
    ValidationReport,
};
pub use run::{MigrationRun, Phase, RunStatus, RunSummary};
pub use staging::{EntityType, RecordStatus, StagingRecord};
pub use vendor::{
    Credentials, IngestionStrategy, SourceProfile, SourceVendor, UploadFormat, UploadedFile,
};
