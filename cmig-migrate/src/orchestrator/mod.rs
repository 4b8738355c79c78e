//! Migration orchestrator
//!
//! Drives a run through its state machine:
//! Connecting → Connected → Discovering → Discovered → MappingInProgress →
//! MappingReview → Migrating → Verifying → Completed
//!
//! # Phase contract
//! `run_phase` checks tenancy and the entry status, claims the per-run phase
//! lock with a conditional UPDATE, executes the matching `phase_*` method and
//! then persists the outcome in one transaction: new status and progress slot,
//! lock release, the audit entries for system retries and one `run_phase`
//! audit event. If the invocation is dropped or fails before that
//! transaction commits, a `PhaseLock` guard releases the lock on its own.
//!
//! Phase methods never write run state themselves. They stage records (each
//! page or batch in its own transaction) and return a `PhaseStep` describing
//! how the phase ended. A pause request is observed at page and batch
//! boundaries.
//!
//! Manual actions (approve, revise, pause, resume, reject, purge) live in
//! `run_actions`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use cmig_common::config::OrchestratorSettings;

use crate::connectors::{ConnectorError, ConnectorRegistry, VendorConnector};
use crate::db::{artifacts, audit, ledger, runs};
use crate::error::{MigrationError, MigrationResult};
use crate::guard::CallerContext;
use crate::models::{
    actions, AuditEvent, ConnectResult, DiscoverResult, MappingResult, MigrationArtifact,
    MigrationRun, NewAuditEvent, Phase, PromoteResult, RunProgress, RunStatus, RunSummary,
    SourceProfile, SourceVendor, TransformResult, ValidateResult, ValidationReport,
};
use crate::utils::{retry_on_lock, with_vendor_retry, FailedAttempt, RetryPolicy};

mod phase_connect;
mod phase_discover;
mod phase_mapping;
mod phase_promote;
mod phase_transform;
mod phase_validate;
mod run_actions;

pub use run_actions::MappingApproval;

/// Staging records read per page by transform and validate
const STAGING_PAGE_SIZE: usize = 200;

/// Runtime knobs for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub vendor_max_attempts: u32,
    pub vendor_backoff: Duration,
    pub vendor_call_deadline: Duration,
    pub promote_batch_size: usize,
    pub sample_size: usize,
    pub max_issues_per_entity: usize,
    pub db_max_lock_wait_ms: u64,
    pub page_size: usize,
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.vendor_max_attempts,
            initial_backoff: self.vendor_backoff,
            call_deadline: self.vendor_call_deadline,
        }
    }
}

impl From<&OrchestratorSettings> for OrchestratorConfig {
    fn from(settings: &OrchestratorSettings) -> Self {
        Self {
            vendor_max_attempts: settings.vendor_max_attempts.max(1),
            vendor_backoff: Duration::from_millis(settings.vendor_backoff_ms),
            vendor_call_deadline: Duration::from_millis(settings.vendor_call_deadline_ms.max(1)),
            promote_batch_size: settings.promote_batch_size.max(1),
            sample_size: settings.sample_size,
            max_issues_per_entity: settings.max_issues_per_entity,
            db_max_lock_wait_ms: settings.db_max_lock_wait_ms,
            page_size: STAGING_PAGE_SIZE,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&OrchestratorSettings::default())
    }
}

/// Typed result of one phase invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "result", rename_all = "camelCase")]
pub enum PhaseOutput {
    Connect(ConnectResult),
    Discover(DiscoverResult),
    GenerateMapping(MappingResult),
    Transform(TransformResult),
    Validate(ValidateResult),
    Promote(PromoteResult),
}

impl PhaseOutput {
    /// Write the result into its progress slot (and the mapping version it created)
    fn apply_to(&self, run: &mut MigrationRun) {
        let progress: &mut RunProgress = &mut run.progress;
        match self {
            PhaseOutput::Connect(r) => progress.connect_result = Some(r.clone()),
            PhaseOutput::Discover(r) => progress.discover_result = Some(r.clone()),
            PhaseOutput::GenerateMapping(r) => {
                progress.generate_mapping_result = Some(r.clone());
                run.mapping_spec_version = r.version;
                run.mapping_approved_at = None;
                run.mapping_approved_by = None;
            }
            PhaseOutput::Transform(r) => progress.transform_result = Some(r.clone()),
            PhaseOutput::Validate(r) => progress.validate_result = Some(r.clone()),
            PhaseOutput::Promote(r) => progress.promote_result = Some(r.clone()),
        }
    }
}

/// How a phase body ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseEnd {
    /// Move to the phase's success status
    Succeeded,
    /// Completed normally but stays in the entry status (validation failures)
    Held,
    /// Pause request observed at a page or batch boundary
    Interrupted,
}

impl PhaseEnd {
    fn as_str(&self) -> &'static str {
        match self {
            PhaseEnd::Succeeded => "succeeded",
            PhaseEnd::Held => "held",
            PhaseEnd::Interrupted => "paused",
        }
    }
}

pub(crate) struct PhaseStep {
    output: PhaseOutput,
    end: PhaseEnd,
}

impl PhaseStep {
    fn new(output: PhaseOutput, end: PhaseEnd) -> Self {
        Self { output, end }
    }

    fn succeeded(output: PhaseOutput) -> Self {
        Self::new(output, PhaseEnd::Succeeded)
    }
}

/// Per-invocation scratch state shared by parallel entity-type tasks
#[derive(Debug, Default)]
pub(crate) struct PhaseContext {
    retries: Mutex<Vec<FailedAttempt>>,
}

impl PhaseContext {
    async fn record_retries(&self, retried: Vec<FailedAttempt>) {
        if !retried.is_empty() {
            self.retries.lock().await.extend(retried);
        }
    }

    async fn retry_count(&self) -> usize {
        self.retries.lock().await.len()
    }

    fn into_retries(self) -> Vec<FailedAttempt> {
        self.retries.into_inner()
    }
}

/// Response of `run_phase`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseOutcome {
    pub run: RunSummary,
    #[serde(flatten)]
    pub output: PhaseOutput,
}

/// Everything known about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run: RunSummary,
    pub validation_report: Option<ValidationReport>,
    pub audit_trail: Vec<AuditEvent>,
    pub ledger: ledger::LedgerSummary,
    pub artifacts: Vec<MigrationArtifact>,
    pub generated_at: DateTime<Utc>,
}

/// Migration orchestrator service
pub struct MigrationOrchestrator {
    pool: SqlitePool,
    registry: Arc<ConnectorRegistry>,
    config: OrchestratorConfig,
}

impl MigrationOrchestrator {
    pub fn new(pool: SqlitePool, registry: Arc<ConnectorRegistry>, config: OrchestratorConfig) -> Self {
        Self {
            pool,
            registry,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create a run in `Connecting`, resolving its ingestion strategy once
    pub async fn start_run(
        &self,
        caller: &CallerContext,
        source_vendor: SourceVendor,
        source_profile: SourceProfile,
    ) -> MigrationResult<MigrationRun> {
        let strategy = self
            .registry
            .resolve_strategy(&source_vendor, &source_profile);
        let run = MigrationRun::new(caller.clinic_id, source_vendor, source_profile, strategy);

        let mut tx = self.pool.begin().await?;
        runs::insert_run(&mut tx, &run).await?;
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run.id, None, actions::START_RUN, caller.actor_id.clone())
                .with_metadata(json!({
                    "sourceVendor": run.source_vendor.as_str(),
                    "ingestionStrategy": strategy.as_str(),
                })),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            run_id = %run.id,
            clinic_id = %run.clinic_id,
            source_vendor = %run.source_vendor,
            strategy = %strategy,
            "Migration run started"
        );

        Ok(run)
    }

    /// Execute one phase
    ///
    /// Rejections (not found, wrong status, lock held) leave the run
    /// untouched. Any other failure is persisted on the run before it is
    /// returned. A validation phase with failing records returns Ok with the
    /// report and keeps the run in `Migrating`.
    pub async fn run_phase(
        &self,
        caller: &CallerContext,
        run_id: Uuid,
        phase: Phase,
    ) -> MigrationResult<PhaseOutcome> {
        let run = self.load_owned(caller, run_id).await?;
        if run.status != phase.allowed_from() {
            return Err(MigrationError::Precondition(format!(
                "{} requires status {}, run is {}",
                phase,
                phase.allowed_from(),
                run.status
            )));
        }
        let needs_approval = phase == Phase::Transform;
        if needs_approval && !run.mapping_approved() {
            return Err(MigrationError::Precondition(format!(
                "transform requires an approved mapping in {}",
                RunStatus::MappingReview
            )));
        }

        let acquired = retry_on_lock("acquire_phase", self.config.db_max_lock_wait_ms, || {
            runs::acquire_phase(&self.pool, run_id, phase, needs_approval)
        })
        .await?;
        if !acquired {
            let current = self.load_owned(caller, run_id).await?;
            return Err(match current.active_phase {
                Some(active) => MigrationError::Precondition(format!(
                    "phase {} is already in flight for run {}",
                    active, run_id
                )),
                None => MigrationError::Precondition(format!(
                    "{} requires status {}, run is {}",
                    phase,
                    phase.allowed_from(),
                    current.status
                )),
            });
        }
        let lock = PhaseLock {
            pool: self.pool.clone(),
            run_id,
            phase,
            max_lock_wait_ms: self.config.db_max_lock_wait_ms,
            armed: true,
        };

        let run = self.load_owned(caller, run_id).await?;
        let start_time = Instant::now();
        tracing::info!(
            run_id = %run.id,
            phase = %phase,
            status = %run.status,
            "Phase started"
        );

        let ctx = PhaseContext::default();
        let result = match phase {
            Phase::Connect => self.phase_connect(&run, &ctx).await,
            Phase::Discover => self.phase_discover(&run, &ctx).await,
            Phase::GenerateMapping => self.phase_generate_mapping(&run).await,
            Phase::Transform => self.phase_transform(&run).await,
            Phase::Validate => self.phase_validate(&run).await,
            Phase::Promote => self.phase_promote(&run).await,
        };

        let outcome = self
            .complete_phase(run, phase, caller.actor_id.clone(), ctx, result, lock)
            .await;

        tracing::info!(
            run_id = %run_id,
            phase = %phase,
            ok = outcome.is_ok(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Phase finished"
        );
        outcome
    }

    /// Fold the phase result into the run and persist it with the lock release
    async fn complete_phase(
        &self,
        mut run: MigrationRun,
        phase: Phase,
        actor_id: Option<String>,
        ctx: PhaseContext,
        result: MigrationResult<PhaseStep>,
        lock: PhaseLock,
    ) -> MigrationResult<PhaseOutcome> {
        let from = run.status;
        let retries = ctx.into_retries();

        let (outcome_label, failure, output) = match result {
            Ok(step) => {
                step.output.apply_to(&mut run);
                match step.end {
                    PhaseEnd::Succeeded => {
                        run.transition_to(phase.success_status());
                    }
                    PhaseEnd::Held => {
                        run.transition_to(phase.allowed_from());
                    }
                    PhaseEnd::Interrupted => {
                        run.resume_status = Some(phase.allowed_from());
                        run.transition_to(RunStatus::Paused);
                    }
                }
                (step.end.as_str(), None, Some(step.output))
            }
            Err(err) => {
                let err = phase_failure(err);
                let next = if err.is_recoverable() {
                    phase.recoverable_failure_status()
                } else {
                    RunStatus::Failed
                };
                if next == RunStatus::Paused {
                    run.resume_status = Some(phase.allowed_from());
                }
                run.error_message = Some(err.sanitized());
                run.transition_to(next);
                tracing::error!(
                    run_id = %run.id,
                    phase = %phase,
                    to = %next,
                    error = %err,
                    "Phase failed"
                );
                ("failed", Some(err), None)
            }
        };

        let persisted = retry_on_lock("complete_phase", self.config.db_max_lock_wait_ms, || {
            persist_phase_outcome(
                &self.pool,
                run.clone(),
                phase,
                from,
                actor_id.as_deref(),
                outcome_label,
                &retries,
            )
        })
        .await
        .map_err(|e| {
            tracing::error!(run_id = %run.id, phase = %phase, error = %e, "Failed to persist phase outcome");
            e
        })?;
        lock.disarm();

        if let Some(err) = failure {
            return Err(err);
        }
        let output = output.ok_or_else(|| {
            MigrationError::System("phase completed without a result".to_string())
        })?;

        Ok(PhaseOutcome {
            run: RunSummary::from(&persisted),
            output,
        })
    }

    /// Run summary, validation report, audit trail, ledger and artifacts
    pub async fn get_report(&self, caller: &CallerContext, run_id: Uuid) -> MigrationResult<RunReport> {
        let run = self.load_owned(caller, run_id).await?;
        let audit_trail = audit::list_events(&self.pool, run_id).await?;
        let ledger = ledger::summary(&self.pool, run_id).await?;
        let artifacts = artifacts::list_artifacts(&self.pool, run_id).await?;

        Ok(RunReport {
            validation_report: run
                .progress
                .validate_result
                .as_ref()
                .map(|r| r.report.clone()),
            run: RunSummary::from(&run),
            audit_trail,
            ledger,
            artifacts,
            generated_at: Utc::now(),
        })
    }

    /// Runs of the caller's clinic, newest first
    pub async fn list_runs(&self, caller: &CallerContext) -> MigrationResult<Vec<RunSummary>> {
        let runs = runs::list_runs(&self.pool, caller.clinic_id).await?;
        Ok(runs.iter().map(RunSummary::from).collect())
    }

    /// Load a run owned by the caller's clinic
    async fn load_owned(&self, caller: &CallerContext, run_id: Uuid) -> MigrationResult<MigrationRun> {
        match runs::load_run(&self.pool, run_id).await? {
            Some(run) if run.clinic_id == caller.clinic_id => Ok(run),
            _ => Err(MigrationError::NotFound(format!("run {}", run_id))),
        }
    }

    /// Connector for the run's persisted strategy
    fn connector(&self, run: &MigrationRun) -> MigrationResult<Box<dyn VendorConnector>> {
        Ok(self.registry.build(
            &run.source_vendor,
            run.ingestion_strategy,
            &run.source_profile,
        )?)
    }

    /// One vendor call under the retry policy; retried attempts go to the audit trail
    async fn vendor_call<F, Fut, T>(
        &self,
        ctx: &PhaseContext,
        operation: &str,
        call: F,
    ) -> MigrationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let retried = with_vendor_retry(operation, self.config.retry_policy(), call).await;
        ctx.record_retries(retried.retried).await;
        Ok(retried.result?)
    }

    async fn pause_requested(&self, run_id: Uuid) -> MigrationResult<bool> {
        runs::pause_requested(&self.pool, run_id).await
    }
}

/// Map a phase body error onto the taxonomy
///
/// Rejections raised inside a phase body are not caller errors at that
/// point; like every non-recoverable fault they become `System`.
fn phase_failure(err: MigrationError) -> MigrationError {
    if err.is_recoverable() {
        return err;
    }
    match err.into_system() {
        MigrationError::System(message) => MigrationError::System(message),
        other => MigrationError::System(other.to_string()),
    }
}

async fn persist_phase_outcome(
    pool: &SqlitePool,
    mut run: MigrationRun,
    phase: Phase,
    from: RunStatus,
    actor_id: Option<&str>,
    outcome: &str,
    retries: &[FailedAttempt],
) -> MigrationResult<MigrationRun> {
    let mut tx = pool.begin().await?;

    if runs::pause_requested(&mut *tx, run.id).await?
        && !run.is_terminal()
        && run.status != RunStatus::Paused
    {
        run.resume_status = Some(run.status);
        run.transition_to(RunStatus::Paused);
    }
    runs::finish_phase(&mut tx, &run).await?;

    for attempt in retries {
        audit::append(
            &mut tx,
            &NewAuditEvent::new(run.id, Some(phase), actions::RETRY, None).with_metadata(json!({
                "operation": attempt.operation,
                "attempt": attempt.attempt,
                "error": attempt.error,
            })),
        )
        .await?;
    }

    audit::append(
        &mut tx,
        &NewAuditEvent::new(run.id, Some(phase), actions::RUN_PHASE, actor_id.map(str::to_string))
            .with_metadata(json!({
                "outcome": outcome,
                "from": from.as_str(),
                "to": run.status.as_str(),
                "error": run.error_message,
            })),
    )
    .await?;

    tx.commit().await?;
    Ok(run)
}

/// Held from a successful `acquire_phase` until the outcome is persisted
///
/// Dropping it armed (the caller went away, or an error escaped before the
/// outcome transaction committed) releases the lock in a background task.
struct PhaseLock {
    pool: SqlitePool,
    run_id: Uuid,
    phase: Phase,
    max_lock_wait_ms: u64,
    armed: bool,
}

impl PhaseLock {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PhaseLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                run_id = %self.run_id,
                phase = %self.phase,
                "No runtime to release the phase lock; startup recovery will"
            );
            return;
        };

        let pool = self.pool.clone();
        let (run_id, phase, max_wait) = (self.run_id, self.phase, self.max_lock_wait_ms);
        runtime.spawn(async move {
            let released = retry_on_lock("release_phase", max_wait, || {
                release_abandoned(&pool, run_id, phase)
            })
            .await;
            if let Err(e) = released {
                tracing::error!(
                    run_id = %run_id,
                    phase = %phase,
                    error = %e,
                    "Failed to release abandoned phase lock"
                );
            }
        });
    }
}

/// Release the lock of a phase whose invocation ended without persisting
///
/// Returns false when the lock is no longer held by `phase`.
async fn release_abandoned(pool: &SqlitePool, run_id: Uuid, phase: Phase) -> MigrationResult<bool> {
    let Some(run) = runs::load_run(pool, run_id).await? else {
        return Ok(false);
    };
    if run.active_phase != Some(phase) {
        return Ok(false);
    }
    release_lock(pool, run, phase, "an abandoned request").await?;
    Ok(true)
}

/// Release phase locks left behind by a crashed process
pub async fn recover_interrupted(pool: &SqlitePool) -> MigrationResult<usize> {
    let locked = runs::list_locked_runs(pool).await?;
    let mut count = 0;

    for run in locked {
        let Some(phase) = run.active_phase else {
            continue;
        };
        release_lock(pool, run, phase, "a service restart").await?;
        count += 1;
    }

    Ok(count)
}

/// Clear a run's phase lock outside the normal phase flow
///
/// Transitional statuses cannot be resumed in place, so those runs are
/// paused with an explanatory message and resume to the phase's entry
/// status. A pending pause request is honoured the same way.
async fn release_lock(
    pool: &SqlitePool,
    mut run: MigrationRun,
    phase: Phase,
    cause: &str,
) -> MigrationResult<()> {
    let transitional = matches!(
        run.status,
        RunStatus::Discovering | RunStatus::MappingInProgress
    );
    if transitional || run.pause_requested {
        run.resume_status = Some(phase.allowed_from());
        run.transition_to(RunStatus::Paused);
    }
    if transitional {
        run.error_message = Some(format!("{} was interrupted by {}", phase, cause));
    }

    let mut tx = pool.begin().await?;
    runs::finish_phase(&mut tx, &run).await?;
    audit::append(
        &mut tx,
        &NewAuditEvent::new(run.id, Some(phase), actions::RECOVERED, None).with_metadata(json!({
            "to": run.status.as_str(),
            "cause": cause,
        })),
    )
    .await?;
    tx.commit().await?;

    tracing::warn!(
        run_id = %run.id,
        phase = %phase,
        status = %run.status,
        cause,
        "Released phase lock"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings_clamps_zeroes() {
        let settings = OrchestratorSettings {
            vendor_max_attempts: 0,
            promote_batch_size: 0,
            ..Default::default()
        };
        let config = OrchestratorConfig::from(&settings);
        assert_eq!(config.vendor_max_attempts, 1);
        assert_eq!(config.promote_batch_size, 1);
        assert_eq!(config.retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_phase_failure_collapses_rejections() {
        let err = phase_failure(MigrationError::Precondition("odd".into()));
        assert!(matches!(err, MigrationError::System(_)));
        let err = phase_failure(MigrationError::Mapping("bad".into()));
        assert!(matches!(err, MigrationError::Mapping(_)));
        let err = phase_failure(MigrationError::Database(sqlx::Error::RowNotFound));
        assert_eq!(err.to_string(), "System error: database operation failed");
    }

    #[test]
    fn test_phase_output_tagged_by_phase() {
        let output = PhaseOutput::Promote(PromoteResult::default());
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["phase"], "promote");
        assert!(value["result"].is_object());
    }
}
