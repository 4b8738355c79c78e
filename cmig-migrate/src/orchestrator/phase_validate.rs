//! Phase: validate
//!
//! Structural and referential checks over every non-final staging record,
//! plus a deterministic per-entity sample for human review. Failing records
//! are a business outcome: they are reported, kept in `transformed` with the
//! issues in `error_detail`, and the run stays in `Migrating`.

use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::{MigrationOrchestrator, PhaseEnd, PhaseOutput, PhaseStep};
use crate::db::{artifacts, live, staging};
use crate::error::MigrationResult;
use crate::models::{
    ArtifactKind, ArtifactRef, EntityType, EntityValidation, MigrationRun, RecordStatus,
    StagingRecord, ValidateResult, ValidationIssue, ValidationReport,
};
use crate::services::validator::{
    patient_reference, sample_seed, structural_issues, unresolved_patient,
};
use crate::services::{EntityTally, Reservoir};
use crate::utils::retry_on_lock;

struct EntityCheck {
    validation: EntityValidation,
    sample: Vec<Value>,
    interrupted: bool,
}

impl MigrationOrchestrator {
    /// Migrating → Verifying, or stays in Migrating when any record fails
    pub(super) async fn phase_validate(&self, run: &MigrationRun) -> MigrationResult<PhaseStep> {
        let staged_patients = staging::staged_patient_ids(&self.pool, run.id).await?;
        let entity_types: Vec<EntityType> = staging::count_by_entity(&self.pool, run.id)
            .await?
            .into_keys()
            .collect();

        let mut report = ValidationReport::default();
        let mut samples: BTreeMap<EntityType, Vec<Value>> = BTreeMap::new();
        let mut interrupted = false;

        // sequential: each seed is derived from the entity type's position
        for (index, &entity_type) in entity_types.iter().enumerate() {
            let seed = sample_seed(run.id).wrapping_add(index as u64);
            let check = self
                .validate_entity(run, entity_type, &staged_patients, seed)
                .await?;
            report.entities.insert(entity_type, check.validation);
            samples.insert(entity_type, check.sample);
            if check.interrupted {
                interrupted = true;
                break;
            }
        }

        let report_artifact = self
            .store_artifact(run.id, ArtifactKind::Report, &serde_json::to_vec(&report)?)
            .await?;
        let sampling_packet = self
            .store_artifact(
                run.id,
                ArtifactKind::SamplingPacket,
                &serde_json::to_vec(&json!({
                    "runId": run.id,
                    "samples": samples,
                }))?,
            )
            .await?;

        let passed = !report.has_failures();
        tracing::info!(
            run_id = %run.id,
            passed,
            failed = report.total_failed(),
            interrupted,
            "Validation finished"
        );

        let end = match (interrupted, passed) {
            (true, _) => PhaseEnd::Interrupted,
            (false, true) => PhaseEnd::Succeeded,
            (false, false) => PhaseEnd::Held,
        };
        Ok(PhaseStep::new(
            PhaseOutput::Validate(ValidateResult {
                report,
                passed: passed && !interrupted,
                report_artifact: Some(report_artifact),
                sampling_packet: Some(sampling_packet),
            }),
            end,
        ))
    }

    async fn validate_entity(
        &self,
        run: &MigrationRun,
        entity_type: EntityType,
        staged_patients: &HashSet<String>,
        seed: u64,
    ) -> MigrationResult<EntityCheck> {
        let mut tally = EntityTally::new(self.config.max_issues_per_entity);
        let mut reservoir = Reservoir::new(self.config.sample_size, seed);
        let mut after: Option<String> = None;
        let mut interrupted = false;

        loop {
            if self.pause_requested(run.id).await? {
                interrupted = true;
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

            let mut verdicts = Vec::with_capacity(page.len());
            for record in &page {
                let issues = self.record_issues(run, record, staged_patients).await?;
                reservoir.offer(json!({
                    "sourceId": record.source_id,
                    "payload": record.payload,
                    "passed": issues.is_empty(),
                }));
                tally.record(issues.clone());
                verdicts.push((record, issues));
            }

            retry_on_lock("validate_page", self.config.db_max_lock_wait_ms, || {
                write_verdicts(&self.pool, run.id, entity_type, &verdicts)
            })
            .await?;
        }

        Ok(EntityCheck {
            validation: tally.finish(),
            sample: reservoir.into_items(),
            interrupted,
        })
    }

    async fn record_issues(
        &self,
        run: &MigrationRun,
        record: &StagingRecord,
        staged_patients: &HashSet<String>,
    ) -> MigrationResult<Vec<ValidationIssue>> {
        if record.status == RecordStatus::Pending {
            return Ok(vec![ValidationIssue {
                source_id: record.source_id.clone(),
                field: None,
                message: "record was never transformed".to_string(),
            }]);
        }

        let mut issues = structural_issues(record.entity_type, &record.source_id, &record.payload);
        if record.entity_type.references_patient() {
            if let Some(patient) = patient_reference(&record.payload) {
                let resolved = staged_patients.contains(patient)
                    || live::find_live_id(
                        &self.pool,
                        EntityType::Patient,
                        run.clinic_id,
                        &run.source_vendor,
                        patient,
                    )
                    .await?
                    .is_some();
                if !resolved {
                    issues.push(unresolved_patient(&record.source_id, patient));
                }
            }
        }
        Ok(issues)
    }

    async fn store_artifact(
        &self,
        run_id: Uuid,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> MigrationResult<ArtifactRef> {
        let stored = self.registry.artifacts().put(kind, bytes).await?;
        let mut conn = self.pool.acquire().await?;
        artifacts::record_artifact(&mut conn, run_id, kind, &stored).await?;
        Ok(stored)
    }
}

/// Apply a page of verdicts: passing records become validated, failing
/// transformed records carry their issues
async fn write_verdicts(
    pool: &SqlitePool,
    run_id: Uuid,
    entity_type: EntityType,
    verdicts: &[(&StagingRecord, Vec<ValidationIssue>)],
) -> MigrationResult<()> {
    let mut tx = pool.begin().await?;

    for (record, issues) in verdicts {
        if record.status == RecordStatus::Pending {
            continue;
        }
        let (next, detail) = if issues.is_empty() {
            (RecordStatus::Validated, None)
        } else {
            let detail = issues
                .iter()
                .map(|i| i.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            (RecordStatus::Transformed, Some(detail))
        };
        staging::set_status(
            &mut tx,
            run_id,
            entity_type,
            &record.source_id,
            record.status,
            next,
            staging::RecordUpdate {
                payload: None,
                error_detail: detail.as_deref(),
            },
        )
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
