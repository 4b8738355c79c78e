//! Canonical staging records
//!
//! A staging record carries one vendor record through the run:
//! pending (raw only) → transformed → validated → promoted, with rejected
//! available at any point before promotion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Canonical entity types, declared in promotion dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Patient,
    Appointment,
    Chart,
    Invoice,
    Photo,
    Consent,
    Document,
}

impl EntityType {
    /// Promotion order: patients before everything that references them
    pub const PROMOTION_ORDER: [EntityType; 7] = [
        EntityType::Patient,
        EntityType::Appointment,
        EntityType::Chart,
        EntityType::Invoice,
        EntityType::Photo,
        EntityType::Consent,
        EntityType::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Patient => "patient",
            EntityType::Appointment => "appointment",
            EntityType::Chart => "chart",
            EntityType::Invoice => "invoice",
            EntityType::Photo => "photo",
            EntityType::Consent => "consent",
            EntityType::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        EntityType::PROMOTION_ORDER
            .into_iter()
            .find(|et| et.as_str() == value)
    }

    /// Live canonical table receiving promoted records
    pub fn live_table(&self) -> &'static str {
        match self {
            EntityType::Patient => "canonical_patients",
            EntityType::Appointment => "canonical_appointments",
            EntityType::Chart => "canonical_charts",
            EntityType::Invoice => "canonical_invoices",
            EntityType::Photo => "canonical_photos",
            EntityType::Consent => "canonical_consents",
            EntityType::Document => "canonical_documents",
        }
    }

    /// Everything except patients hangs off a patient
    pub fn references_patient(&self) -> bool {
        !matches!(self, EntityType::Patient)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-record staging status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Transformed,
    Validated,
    Promoted,
    Rejected,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 5] = [
        RecordStatus::Pending,
        RecordStatus::Transformed,
        RecordStatus::Validated,
        RecordStatus::Promoted,
        RecordStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Transformed => "transformed",
            RecordStatus::Validated => "validated",
            RecordStatus::Promoted => "promoted",
            RecordStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        RecordStatus::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Promoted and rejected records are never rewritten by a phase
    pub fn is_final(&self) -> bool {
        matches!(self, RecordStatus::Promoted | RecordStatus::Rejected)
    }

    /// Allowed per-record status moves
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        match (self, next) {
            (Promoted, _) => false,
            (Rejected, _) => false,
            (_, Rejected) => true,
            (Pending | Transformed | Validated, Transformed) => true,
            (Transformed | Validated, Validated) => true,
            (Validated, Promoted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance-tagged draft record (unique per run, entity type, source id)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingRecord {
    pub run_id: Uuid,
    pub entity_type: EntityType,
    /// Vendor-native identifier
    pub source_id: String,
    /// Vendor-shaped data as extracted
    pub raw_payload: Value,
    /// Canonical-shaped draft (empty object until transformed)
    pub payload: Value,
    pub status: RecordStatus,
    pub error_detail: Option<String>,
    /// Live row id once promoted
    pub promoted_id: Option<Uuid>,
    pub extracted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promoted_never_regresses() {
        for next in RecordStatus::ALL {
            assert!(!RecordStatus::Promoted.can_transition_to(next));
        }
    }

    #[test]
    fn test_only_validated_records_promote() {
        assert!(RecordStatus::Validated.can_transition_to(RecordStatus::Promoted));
        assert!(!RecordStatus::Transformed.can_transition_to(RecordStatus::Promoted));
        assert!(!RecordStatus::Pending.can_transition_to(RecordStatus::Promoted));
    }

    #[test]
    fn test_rejection_allowed_before_promotion() {
        assert!(RecordStatus::Pending.can_transition_to(RecordStatus::Rejected));
        assert!(RecordStatus::Validated.can_transition_to(RecordStatus::Rejected));
        assert!(!RecordStatus::Rejected.can_transition_to(RecordStatus::Transformed));
    }

    #[test]
    fn test_entity_type_parse_matches_as_str() {
        for et in EntityType::PROMOTION_ORDER {
            assert_eq!(EntityType::parse(et.as_str()), Some(et));
        }
        assert_eq!(EntityType::parse("horse"), None);
    }

    #[test]
    fn test_patients_promote_first() {
        assert_eq!(EntityType::PROMOTION_ORDER[0], EntityType::Patient);
        assert!(!EntityType::Patient.references_patient());
        assert!(EntityType::Invoice.references_patient());
    }
}
