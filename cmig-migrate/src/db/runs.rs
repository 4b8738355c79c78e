//! Migration run persistence
//!
//! The phase lock lives on the row: `active_phase` is claimed with a
//! conditional UPDATE and released when the phase outcome is written.
//! Plain state writes never touch `active_phase` or `pause_requested`.

use cmig_common::time;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{decode, decode_uuid};
use crate::error::MigrationResult;
use crate::models::{
    IngestionStrategy, MigrationRun, Phase, RunProgress, RunStatus, SourceProfile, SourceVendor,
};

const RUN_COLUMNS: &str = r#"
    id, clinic_id, source_vendor, ingestion_strategy, status, current_phase,
    source_profile, mapping_spec_version, mapping_approved_at, mapping_approved_by,
    progress, resume_status, pause_requested, active_phase, started_at,
    completed_at, error_message, created_at, updated_at
"#;

pub async fn insert_run(conn: &mut SqliteConnection, run: &MigrationRun) -> MigrationResult<()> {
    let source_profile = serde_json::to_string(&run.source_profile)?;
    let progress = serde_json::to_string(&run.progress)?;

    sqlx::query(
        r#"
        INSERT INTO migration_runs (
            id, clinic_id, source_vendor, ingestion_strategy, status, current_phase,
            source_profile, mapping_spec_version, progress, pause_requested,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(run.id.to_string())
    .bind(run.clinic_id.to_string())
    .bind(run.source_vendor.as_str())
    .bind(run.ingestion_strategy.as_str())
    .bind(run.status.as_str())
    .bind(run.current_phase.map(|p| p.as_str()))
    .bind(source_profile)
    .bind(run.mapping_spec_version)
    .bind(progress)
    .bind(time::to_db(&run.created_at))
    .bind(time::to_db(&run.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn load_run<'e, E>(executor: E, run_id: Uuid) -> MigrationResult<Option<MigrationRun>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM migration_runs WHERE id = ?",
        RUN_COLUMNS
    ))
    .bind(run_id.to_string())
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Runs of one clinic, newest first
pub async fn list_runs(pool: &SqlitePool, clinic_id: Uuid) -> MigrationResult<Vec<MigrationRun>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM migration_runs WHERE clinic_id = ? ORDER BY created_at DESC, id",
        RUN_COLUMNS
    ))
    .bind(clinic_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(run_from_row).collect()
}

/// Runs still holding a phase lock (only possible after a crash at startup)
pub async fn list_locked_runs(pool: &SqlitePool) -> MigrationResult<Vec<MigrationRun>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM migration_runs WHERE active_phase IS NOT NULL",
        RUN_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(run_from_row).collect()
}

/// Claim the phase lock
///
/// Succeeds only when the run is idle in the phase's entry status (and, for
/// transform, holds an approved mapping). Returns false when nothing matched.
pub async fn acquire_phase(
    pool: &SqlitePool,
    run_id: Uuid,
    phase: Phase,
    require_approved_mapping: bool,
) -> MigrationResult<bool> {
    let now = time::to_db(&time::now());
    let result = sqlx::query(
        r#"
        UPDATE migration_runs SET
            active_phase = ?,
            current_phase = ?,
            status = ?,
            started_at = COALESCE(started_at, ?),
            error_message = NULL,
            updated_at = ?
        WHERE id = ?
          AND status = ?
          AND active_phase IS NULL
          AND (? = 0 OR (mapping_spec_version > 0 AND mapping_approved_at IS NOT NULL))
        "#,
    )
    .bind(phase.as_str())
    .bind(phase.as_str())
    .bind(phase.running_status().as_str())
    .bind(&now)
    .bind(&now)
    .bind(run_id.to_string())
    .bind(phase.allowed_from().as_str())
    .bind(require_approved_mapping)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Write the phase outcome and release the lock
///
/// Clears any pause request: the caller has already folded it into `run`.
pub async fn finish_phase(conn: &mut SqliteConnection, run: &MigrationRun) -> MigrationResult<()> {
    write_state(conn, run, "active_phase = NULL, pause_requested = 0,", "").await?;
    Ok(())
}

/// Write a manual state change if the run is still idle in `expected`
pub async fn update_if_idle(
    conn: &mut SqliteConnection,
    run: &MigrationRun,
    expected: RunStatus,
) -> MigrationResult<bool> {
    write_state(
        conn,
        run,
        "",
        &format!(
            "AND status = '{}' AND active_phase IS NULL",
            expected.as_str()
        ),
    )
    .await
}

async fn write_state(
    conn: &mut SqliteConnection,
    run: &MigrationRun,
    extra_set: &str,
    extra_where: &str,
) -> MigrationResult<bool> {
    let progress = serde_json::to_string(&run.progress)?;

    let result = sqlx::query(&format!(
        r#"
        UPDATE migration_runs SET
            {extra_set}
            status = ?,
            current_phase = ?,
            mapping_spec_version = ?,
            mapping_approved_at = ?,
            mapping_approved_by = ?,
            progress = ?,
            resume_status = ?,
            started_at = ?,
            completed_at = ?,
            error_message = ?,
            updated_at = ?
        WHERE id = ? {extra_where}
        "#
    ))
    .bind(run.status.as_str())
    .bind(run.current_phase.map(|p| p.as_str()))
    .bind(run.mapping_spec_version)
    .bind(run.mapping_approved_at.as_ref().map(time::to_db))
    .bind(run.mapping_approved_by.as_deref())
    .bind(progress)
    .bind(run.resume_status.map(|s| s.as_str()))
    .bind(run.started_at.as_ref().map(time::to_db))
    .bind(run.completed_at.as_ref().map(time::to_db))
    .bind(run.error_message.as_deref())
    .bind(time::to_db(&run.updated_at))
    .bind(run.id.to_string())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Flag an in-flight phase for pausing; false when no phase holds the lock
pub async fn request_pause(conn: &mut SqliteConnection, run_id: Uuid) -> MigrationResult<bool> {
    let result = sqlx::query(
        "UPDATE migration_runs SET pause_requested = 1 WHERE id = ? AND active_phase IS NOT NULL",
    )
    .bind(run_id.to_string())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn pause_requested<'e, E>(executor: E, run_id: Uuid) -> MigrationResult<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let flag: Option<bool> =
        sqlx::query_scalar("SELECT pause_requested FROM migration_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(executor)
            .await?;

    Ok(flag.unwrap_or(false))
}

/// Delete an idle run; owned rows go with it through ON DELETE CASCADE
pub async fn delete_idle_run(pool: &SqlitePool, run_id: Uuid) -> MigrationResult<bool> {
    let result = sqlx::query("DELETE FROM migration_runs WHERE id = ? AND active_phase IS NULL")
        .bind(run_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

fn run_from_row(row: &SqliteRow) -> MigrationResult<MigrationRun> {
    let id: String = row.try_get("id")?;
    let clinic_id: String = row.try_get("clinic_id")?;
    let source_vendor: String = row.try_get("source_vendor")?;
    let strategy: String = row.try_get("ingestion_strategy")?;
    let status: String = row.try_get("status")?;
    let current_phase: Option<String> = row.try_get("current_phase")?;
    let source_profile: String = row.try_get("source_profile")?;
    let progress: String = row.try_get("progress")?;
    let resume_status: Option<String> = row.try_get("resume_status")?;
    let active_phase: Option<String> = row.try_get("active_phase")?;

    let source_profile: SourceProfile = serde_json::from_str(&source_profile)?;
    let progress: RunProgress = serde_json::from_str(&progress)?;

    Ok(MigrationRun {
        id: decode_uuid("id", &id)?,
        clinic_id: decode_uuid("clinic_id", &clinic_id)?,
        source_vendor: SourceVendor::parse(&source_vendor),
        ingestion_strategy: decode(
            "ingestion_strategy",
            &strategy,
            IngestionStrategy::parse(&strategy),
        )?,
        status: decode("status", &status, RunStatus::parse(&status))?,
        current_phase: current_phase
            .map(|p| decode("current_phase", &p, Phase::parse(&p)))
            .transpose()?,
        source_profile,
        mapping_spec_version: row.try_get("mapping_spec_version")?,
        mapping_approved_at: time::from_db_opt(
            "mapping_approved_at",
            row.try_get("mapping_approved_at")?,
        )?,
        mapping_approved_by: row.try_get("mapping_approved_by")?,
        progress,
        resume_status: resume_status
            .map(|s| decode("resume_status", &s, RunStatus::parse(&s)))
            .transpose()?,
        pause_requested: row.try_get("pause_requested")?,
        active_phase: active_phase
            .map(|p| decode("active_phase", &p, Phase::parse(&p)))
            .transpose()?,
        started_at: time::from_db_opt("started_at", row.try_get("started_at")?)?,
        completed_at: time::from_db_opt("completed_at", row.try_get("completed_at")?)?,
        error_message: row.try_get("error_message")?,
        created_at: time::from_db("created_at", row.try_get::<&str, _>("created_at")?)?,
        updated_at: time::from_db("updated_at", row.try_get::<&str, _>("updated_at")?)?,
    })
}
