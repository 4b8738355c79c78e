//! Manual run actions
//!
//! Each action is a single transaction: the state write is conditional on the
//! run still being idle in the status that was checked, and the audit event
//! commits with it. A lost race is reported as a precondition failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::MigrationOrchestrator;
use crate::db::{audit, mapping_specs, runs, staging};
use crate::error::{MigrationError, MigrationResult};
use crate::guard::CallerContext;
use crate::models::{
    actions, EntityType, FieldMapping, MappingSpec, MigrationRun, NewAuditEvent, RecordStatus,
    RunStatus, RunSummary, StagingRecord,
};
use crate::services::check_spec;

/// Result of approving a mapping version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingApproval {
    pub version: i64,
    pub approved_at: DateTime<Utc>,
    pub approved_by: String,
}

fn require_actor(caller: &CallerContext, action: &str) -> MigrationResult<String> {
    caller
        .actor_id
        .clone()
        .ok_or_else(|| MigrationError::Authorization(format!("{} requires an actor", action)))
}

fn lost_race(run_id: Uuid) -> MigrationError {
    MigrationError::Precondition(format!("run {} changed concurrently, reload and retry", run_id))
}

impl MigrationOrchestrator {
    /// Approve the current mapping version
    ///
    /// Not idempotent: a second approval of the same version is a
    /// precondition failure. Re-approval needs a new version (`revise_mapping`).
    pub async fn approve_mapping(
        &self,
        caller: &CallerContext,
        run_id: Uuid,
    ) -> MigrationResult<MappingApproval> {
        let actor = require_actor(caller, actions::APPROVE_MAPPING)?;
        let mut run = self.load_owned(caller, run_id).await?;

        if run.status != RunStatus::MappingReview || run.active_phase.is_some() {
            return Err(MigrationError::Precondition(format!(
                "approval requires status {}, run is {}",
                RunStatus::MappingReview,
                run.status
            )));
        }
        if run.mapping_spec_version == 0 {
            return Err(MigrationError::Precondition(
                "no mapping version to approve; run generateMapping first".to_string(),
            ));
        }
        if run.mapping_approved_at.is_some() {
            return Err(MigrationError::Precondition(format!(
                "mapping version {} is already approved",
                run.mapping_spec_version
            )));
        }

        let version = run.mapping_spec_version;
        let approved_at = Utc::now();
        run.mapping_approved_at = Some(approved_at);
        run.mapping_approved_by = Some(actor.clone());
        run.updated_at = approved_at;

        let mut tx = self.pool.begin().await?;
        if !mapping_specs::mark_approved(&mut tx, run_id, version, &approved_at, &actor).await? {
            return Err(MigrationError::Precondition(format!(
                "mapping version {} is already approved",
                version
            )));
        }
        if !runs::update_if_idle(&mut tx, &run, RunStatus::MappingReview).await? {
            return Err(lost_race(run_id));
        }
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run_id, None, actions::APPROVE_MAPPING, Some(actor.clone()))
                .with_metadata(json!({ "version": version })),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(run_id = %run_id, version, actor_id = %actor, "Mapping approved");

        Ok(MappingApproval {
            version,
            approved_at,
            approved_by: actor,
        })
    }

    /// Store a reviewed mapping as a new, unapproved version
    ///
    /// Allowed in MappingReview, and in Migrating so that validation failures
    /// can be fixed at the mapping; the run returns to MappingReview.
    pub async fn revise_mapping(
        &self,
        caller: &CallerContext,
        run_id: Uuid,
        field_mappings: Vec<FieldMapping>,
    ) -> MigrationResult<MappingSpec> {
        let actor = require_actor(caller, actions::REVISE_MAPPING)?;
        let mut run = self.load_owned(caller, run_id).await?;

        let prior = run.status;
        if !matches!(prior, RunStatus::MappingReview | RunStatus::Migrating)
            || run.active_phase.is_some()
        {
            return Err(MigrationError::Precondition(format!(
                "revising a mapping requires status {} or {}, run is {}",
                RunStatus::MappingReview,
                RunStatus::Migrating,
                run.status
            )));
        }

        let mut tx = self.pool.begin().await?;
        let previous = mapping_specs::latest_version(&mut *tx, run_id).await?;
        let spec = MappingSpec::new(run_id, previous + 1, field_mappings, Some(actor.clone()));
        check_spec(&spec)?;
        mapping_specs::insert_spec(&mut tx, &spec).await?;

        run.mapping_spec_version = spec.version;
        run.mapping_approved_at = None;
        run.mapping_approved_by = None;
        run.transition_to(RunStatus::MappingReview);
        if !runs::update_if_idle(&mut tx, &run, prior).await? {
            return Err(lost_race(run_id));
        }
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run_id, None, actions::REVISE_MAPPING, Some(actor.clone()))
                .with_metadata(json!({
                    "version": spec.version,
                    "previousVersion": previous,
                    "fieldMappings": spec.field_mappings.len(),
                })),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            run_id = %run_id,
            version = spec.version,
            actor_id = %actor,
            "Mapping revised"
        );
        Ok(spec)
    }

    /// Pause a run
    ///
    /// An idle run is paused at once. A run with a phase in flight gets a
    /// pause request that the phase honours at its next page or batch
    /// boundary.
    pub async fn pause(&self, caller: &CallerContext, run_id: Uuid) -> MigrationResult<RunSummary> {
        let mut run = self.load_owned(caller, run_id).await?;
        if run.is_terminal() || run.status == RunStatus::Paused {
            return Err(MigrationError::Precondition(format!(
                "pause requires a non-terminal, unpaused run; run is {}",
                run.status
            )));
        }

        let mut tx = self.pool.begin().await?;
        if runs::request_pause(&mut tx, run_id).await? {
            audit::append(
                &mut tx,
                &NewAuditEvent::new(run_id, run.active_phase, actions::PAUSE_REQUESTED, caller.actor_id.clone()),
            )
            .await?;
            tx.commit().await?;

            tracing::info!(run_id = %run_id, "Pause requested for in-flight phase");
            run.pause_requested = true;
            return Ok(RunSummary::from(&run));
        }

        let prior = run.status;
        run.resume_status = Some(prior);
        run.transition_to(RunStatus::Paused);
        if !runs::update_if_idle(&mut tx, &run, prior).await? {
            return Err(lost_race(run_id));
        }
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run_id, None, actions::PAUSE, caller.actor_id.clone())
                .with_metadata(json!({ "from": prior.as_str() })),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(run_id = %run_id, from = %prior, "Run paused");
        Ok(RunSummary::from(&run))
    }

    /// Paused → the status recorded when the run was paused
    pub async fn resume(&self, caller: &CallerContext, run_id: Uuid) -> MigrationResult<RunSummary> {
        let mut run = self.load_owned(caller, run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(MigrationError::Precondition(format!(
                "resume requires status {}, run is {}",
                RunStatus::Paused,
                run.status
            )));
        }

        let target = resume_target(&run);
        run.resume_status = None;
        run.error_message = None;
        run.transition_to(target);

        let mut tx = self.pool.begin().await?;
        if !runs::update_if_idle(&mut tx, &run, RunStatus::Paused).await? {
            return Err(lost_race(run_id));
        }
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run_id, None, actions::RESUME, caller.actor_id.clone())
                .with_metadata(json!({ "to": target.as_str() })),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(run_id = %run_id, to = %target, "Run resumed");
        Ok(RunSummary::from(&run))
    }

    /// Exclude one staging record from promotion
    pub async fn reject_record(
        &self,
        caller: &CallerContext,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        reason: &str,
    ) -> MigrationResult<StagingRecord> {
        let actor = require_actor(caller, actions::REJECT_RECORD)?;
        let run = self.load_owned(caller, run_id).await?;
        if run.is_terminal() {
            return Err(MigrationError::Precondition(format!(
                "records of a {} run cannot be rejected",
                run.status
            )));
        }

        let mut tx = self.pool.begin().await?;
        let record = staging::load_record(&mut *tx, run_id, entity_type, source_id)
            .await?
            .ok_or_else(|| {
                MigrationError::NotFound(format!("{} record {} in run {}", entity_type, source_id, run_id))
            })?;
        if record.status.is_final() {
            return Err(MigrationError::Precondition(format!(
                "{} record {} is already {}",
                entity_type, source_id, record.status
            )));
        }

        let reason = reason.trim();
        let detail = if reason.is_empty() {
            format!("rejected by {}", actor)
        } else {
            reason.to_string()
        };
        let applied = staging::set_status(
            &mut tx,
            run_id,
            entity_type,
            source_id,
            record.status,
            RecordStatus::Rejected,
            staging::RecordUpdate {
                payload: None,
                error_detail: Some(&detail),
            },
        )
        .await?;
        if !applied {
            return Err(lost_race(run_id));
        }
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run_id, None, actions::REJECT_RECORD, Some(actor.clone()))
                .with_metadata(json!({
                    "entityType": entity_type.as_str(),
                    "sourceId": source_id,
                    "previousStatus": record.status.as_str(),
                    "reason": detail,
                })),
        )
        .await?;
        let updated = staging::load_record(&mut *tx, run_id, entity_type, source_id)
            .await?
            .ok_or_else(|| MigrationError::System("rejected record vanished".to_string()))?;
        tx.commit().await?;

        tracing::info!(
            run_id = %run_id,
            entity_type = %entity_type,
            source_id,
            actor_id = %actor,
            "Record rejected"
        );
        Ok(updated)
    }

    /// Delete a run and everything it owns; refused while a phase is in flight
    pub async fn purge_run(&self, caller: &CallerContext, run_id: Uuid) -> MigrationResult<()> {
        let run = self.load_owned(caller, run_id).await?;
        if !runs::delete_idle_run(&self.pool, run_id).await? {
            return Err(MigrationError::Precondition(format!(
                "run {} has phase {} in flight",
                run_id,
                run.active_phase.map(|p| p.as_str()).unwrap_or("unknown")
            )));
        }

        tracing::warn!(
            run_id = %run_id,
            clinic_id = %run.clinic_id,
            actor_id = caller.actor_id.as_deref().unwrap_or("system"),
            "Run purged"
        );
        Ok(())
    }
}

/// Where a paused run goes back to
fn resume_target(run: &MigrationRun) -> RunStatus {
    run.resume_status
        .or_else(|| run.current_phase.map(|p| p.allowed_from()))
        .unwrap_or(RunStatus::Connecting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IngestionStrategy, Phase, SourceProfile, SourceVendor};

    fn paused_run() -> MigrationRun {
        let mut run = MigrationRun::new(
            Uuid::new_v4(),
            SourceVendor::CsvUpload,
            SourceProfile::default(),
            IngestionStrategy::Upload,
        );
        run.status = RunStatus::Paused;
        run
    }

    #[test]
    fn test_resume_prefers_recorded_status() {
        let mut run = paused_run();
        run.resume_status = Some(RunStatus::Verifying);
        run.current_phase = Some(Phase::Transform);
        assert_eq!(resume_target(&run), RunStatus::Verifying);
    }

    #[test]
    fn test_resume_falls_back_to_phase_entry_status() {
        let mut run = paused_run();
        run.current_phase = Some(Phase::Promote);
        assert_eq!(resume_target(&run), RunStatus::Verifying);
        run.current_phase = None;
        assert_eq!(resume_target(&run), RunStatus::Connecting);
    }
}
