//! Typed per-phase results
//!
//! Each phase writes exactly one result slot. `RunProgress::get` keeps the
//! phase-keyed read pattern (`"transformResult.counts"`) for external readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{ArtifactRef, EntityType, IngestionStrategy};

/// Entity type offered by the source platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredEntity {
    pub entity_type: EntityType,
    pub available: bool,
    pub access_method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub strategy: IngestionStrategy,
    pub attempts: u32,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResult {
    pub entities: Vec<DiscoveredEntity>,
    /// Raw records extracted per entity type in this invocation
    pub extracted: BTreeMap<EntityType, u64>,
    /// Flattened field paths seen in raw data, used to draft mappings
    pub observed_fields: BTreeMap<EntityType, BTreeSet<String>>,
    pub raw_extracts: BTreeMap<EntityType, ArtifactRef>,
    /// False when a pause interrupted extraction
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResult {
    pub version: i64,
    pub mapped_fields: usize,
    pub unmapped_fields: BTreeMap<EntityType, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResult {
    pub spec_version: i64,
    /// Records transformed per entity type
    pub counts: BTreeMap<EntityType, u64>,
    /// Records carrying coercion issues
    pub records_with_issues: u64,
    pub complete: bool,
}

/// One structural or referential problem on a staged record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub source_id: String,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityValidation {
    pub checked: u64,
    pub passed: u64,
    pub failed: u64,
    pub issues: Vec<ValidationIssue>,
}

/// Validation report: entity type → counts and issues
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub entities: BTreeMap<EntityType, EntityValidation>,
}

impl ValidationReport {
    pub fn has_failures(&self) -> bool {
        self.entities.values().any(|e| e.failed > 0)
    }

    pub fn total_failed(&self) -> u64 {
        self.entities.values().map(|e| e.failed).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResult {
    pub report: ValidationReport,
    pub passed: bool,
    pub report_artifact: Option<ArtifactRef>,
    pub sampling_packet: Option<ArtifactRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteResult {
    /// Records promoted by this invocation per entity type
    pub promoted: BTreeMap<EntityType, u64>,
    pub batches_committed: u64,
    pub complete: bool,
}

/// Phase-keyed result store persisted on the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_result: Option<ConnectResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discover_result: Option<DiscoverResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_mapping_result: Option<MappingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_result: Option<TransformResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_result: Option<ValidateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promote_result: Option<PromoteResult>,
}

impl RunProgress {
    /// Read a dotted key such as `"validateResult.report"`
    pub fn get(&self, key: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        key.split('.')
            .try_fold(&root, |node, part| node.get(part))
            .cloned()
    }
}
