//! Phase: generateMapping
//!
//! Drafts a new mapping version from the field paths observed at discovery.
//! The draft is stored unapproved; a human approves it (or revises it) before
//! transform may run.

use sqlx::SqlitePool;

use super::{MigrationOrchestrator, PhaseOutput, PhaseStep};
use crate::db::mapping_specs;
use crate::error::{MigrationError, MigrationResult};
use crate::models::{FieldMapping, MappingResult, MappingSpec, MigrationRun};
use crate::services::{check_spec, draft_mappings};
use crate::utils::retry_on_lock;

impl MigrationOrchestrator {
    /// Discovered → MappingInProgress → MappingReview
    pub(super) async fn phase_generate_mapping(&self, run: &MigrationRun) -> MigrationResult<PhaseStep> {
        let observed = run
            .progress
            .discover_result
            .as_ref()
            .map(|d| d.observed_fields.clone())
            .unwrap_or_default();

        let draft = draft_mappings(&observed);
        if draft.field_mappings.is_empty() {
            return Err(MigrationError::Mapping(
                "no discovered source field matches a canonical field".to_string(),
            ));
        }

        let field_mappings = draft.field_mappings;
        let spec = retry_on_lock("store_mapping_draft", self.config.db_max_lock_wait_ms, || {
            store_draft(&self.pool, run, field_mappings.clone())
        })
        .await?;

        tracing::info!(
            run_id = %run.id,
            version = spec.version,
            mapped_fields = spec.field_mappings.len(),
            unmapped_entities = draft.unmapped_fields.len(),
            "Mapping draft stored for review"
        );

        Ok(PhaseStep::succeeded(PhaseOutput::GenerateMapping(MappingResult {
            version: spec.version,
            mapped_fields: spec.field_mappings.len(),
            unmapped_fields: draft.unmapped_fields,
        })))
    }
}

async fn store_draft(
    pool: &SqlitePool,
    run: &MigrationRun,
    field_mappings: Vec<FieldMapping>,
) -> MigrationResult<MappingSpec> {
    let mut tx = pool.begin().await?;
    let version = mapping_specs::latest_version(&mut *tx, run.id).await? + 1;
    let spec = MappingSpec::new(run.id, version, field_mappings, None);
    check_spec(&spec)?;
    mapping_specs::insert_spec(&mut tx, &spec).await?;
    tx.commit().await?;
    Ok(spec)
}
