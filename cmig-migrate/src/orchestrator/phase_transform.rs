//! Phase: transform
//!
//! Applies the approved mapping to every non-final staging record, page by
//! page in source id order. Each page is one transaction. Records keep their
//! key, so a second run over unchanged input rewrites the same payloads and
//! reports the same counts.

use futures::future::join_all;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{MigrationOrchestrator, PhaseEnd, PhaseOutput, PhaseStep};
use crate::db::{mapping_specs, staging};
use crate::error::{MigrationError, MigrationResult};
use crate::models::{EntityType, MappingSpec, MigrationRun, RecordStatus, StagingRecord, TransformResult};
use crate::services::{check_spec, transform_record, TransformOutput};
use crate::utils::retry_on_lock;

#[derive(Debug, Default)]
struct EntityTransform {
    transformed: u64,
    with_issues: u64,
    interrupted: bool,
}

impl MigrationOrchestrator {
    /// MappingReview (approved) → Migrating
    pub(super) async fn phase_transform(&self, run: &MigrationRun) -> MigrationResult<PhaseStep> {
        let spec = mapping_specs::load_spec(&self.pool, run.id, run.mapping_spec_version)
            .await?
            .ok_or_else(|| {
                MigrationError::Mapping(format!(
                    "mapping version {} is missing",
                    run.mapping_spec_version
                ))
            })?;
        check_spec(&spec)?;

        let entity_types: Vec<EntityType> = staging::count_by_entity(&self.pool, run.id)
            .await?
            .into_keys()
            .collect();

        let results = join_all(
            entity_types
                .iter()
                .map(|&entity_type| self.transform_entity(run, &spec, entity_type)),
        )
        .await;

        let mut result = TransformResult {
            spec_version: spec.version,
            complete: true,
            ..Default::default()
        };
        for (&entity_type, outcome) in entity_types.iter().zip(results) {
            let outcome = outcome?;
            result.counts.insert(entity_type, outcome.transformed);
            result.records_with_issues += outcome.with_issues;
            result.complete &= !outcome.interrupted;
        }

        tracing::info!(
            run_id = %run.id,
            spec_version = spec.version,
            entity_types = result.counts.len(),
            records_with_issues = result.records_with_issues,
            "Transform pass finished"
        );

        let end = if result.complete {
            PhaseEnd::Succeeded
        } else {
            PhaseEnd::Interrupted
        };
        Ok(PhaseStep::new(PhaseOutput::Transform(result), end))
    }

    async fn transform_entity(
        &self,
        run: &MigrationRun,
        spec: &MappingSpec,
        entity_type: EntityType,
    ) -> MigrationResult<EntityTransform> {
        let mut outcome = EntityTransform::default();
        let mut after: Option<String> = None;

        loop {
            if self.pause_requested(run.id).await? {
                outcome.interrupted = true;
                break;
            }

            let page = staging::active_page(
                &self.pool,
                run.id,
                entity_type,
                after.as_deref(),
                self.config.page_size,
            )
            .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.source_id.clone());

            let drafts: Vec<(&StagingRecord, TransformOutput)> = page
                .iter()
                .map(|record| {
                    (
                        record,
                        transform_record(spec.mappings_for(entity_type), &record.raw_payload),
                    )
                })
                .collect();

            let written = retry_on_lock("transform_page", self.config.db_max_lock_wait_ms, || {
                write_drafts(&self.pool, run.id, entity_type, &drafts)
            })
            .await?;

            outcome.transformed += written;
            outcome.with_issues += drafts.iter().filter(|(_, d)| !d.issues.is_empty()).count() as u64;

            tracing::debug!(
                run_id = %run.id,
                entity_type = %entity_type,
                records = written,
                "Transformed page"
            );
        }

        Ok(outcome)
    }
}

/// Store a page of drafts; records changed since the page was read are skipped
async fn write_drafts(
    pool: &SqlitePool,
    run_id: Uuid,
    entity_type: EntityType,
    drafts: &[(&StagingRecord, TransformOutput)],
) -> MigrationResult<u64> {
    let mut tx = pool.begin().await?;
    let mut written = 0;

    for (record, draft) in drafts {
        let error_detail = draft.error_detail();
        let applied = staging::set_status(
            &mut tx,
            run_id,
            entity_type,
            &record.source_id,
            record.status,
            RecordStatus::Transformed,
            staging::RecordUpdate {
                payload: Some(&draft.payload),
                error_detail: error_detail.as_deref(),
            },
        )
        .await?;
        if applied {
            written += 1;
        }
    }

    tx.commit().await?;
    Ok(written)
}
