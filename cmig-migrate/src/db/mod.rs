//! Database access for cmig-migrate
//!
//! SQLite through sqlx. Every staging-record status write goes through
//! `staging` together with its `ledger` delta in one transaction; audit
//! events are append-only (enforced by trigger).

pub mod artifacts;
pub mod audit;
pub mod ledger;
pub mod live;
pub mod mapping_specs;
pub mod runs;
pub mod staging;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MigrationError, MigrationResult};
use crate::models::EntityType;

/// Database file inside the root folder
pub const DATABASE_FILE_NAME: &str = "cmig.db";

/// Initialize database connection pool
///
/// Creates the file when missing and all tables idempotently.
pub async fn init_database_pool(db_path: &Path) -> MigrationResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(cmig_common::Error::Io)?;
    }

    let db_url = format!("sqlite://{}", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create migration and live canonical tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> MigrationResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    for entity_type in EntityType::PROMOTION_ORDER {
        let table = entity_type.live_table();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                clinic_id TEXT NOT NULL,
                source_vendor TEXT NOT NULL,
                source_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                patient_id TEXT,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (clinic_id, source_vendor, source_id)
            )
            "#
        ))
        .execute(pool)
        .await?;
    }

    tracing::info!("Database tables initialized (migration_*, canonical_*)");

    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS migration_runs (
        id TEXT PRIMARY KEY,
        clinic_id TEXT NOT NULL,
        source_vendor TEXT NOT NULL,
        ingestion_strategy TEXT NOT NULL,
        status TEXT NOT NULL,
        current_phase TEXT,
        source_profile TEXT NOT NULL,
        mapping_spec_version INTEGER NOT NULL DEFAULT 0,
        mapping_approved_at TEXT,
        mapping_approved_by TEXT,
        progress TEXT NOT NULL DEFAULT '{}',
        resume_status TEXT,
        pause_requested INTEGER NOT NULL DEFAULT 0,
        active_phase TEXT,
        started_at TEXT,
        completed_at TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_migration_runs_clinic ON migration_runs (clinic_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS migration_staging_records (
        run_id TEXT NOT NULL REFERENCES migration_runs (id) ON DELETE CASCADE,
        entity_type TEXT NOT NULL,
        source_id TEXT NOT NULL,
        raw_payload TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        error_detail TEXT,
        promoted_id TEXT,
        extracted_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (run_id, entity_type, source_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_staging_status
        ON migration_staging_records (run_id, entity_type, status, source_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS migration_record_ledger (
        run_id TEXT NOT NULL REFERENCES migration_runs (id) ON DELETE CASCADE,
        entity_type TEXT NOT NULL,
        status TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
        PRIMARY KEY (run_id, entity_type, status)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS migration_mapping_specs (
        run_id TEXT NOT NULL REFERENCES migration_runs (id) ON DELETE CASCADE,
        version INTEGER NOT NULL CHECK (version > 0),
        field_mappings TEXT NOT NULL,
        created_at TEXT NOT NULL,
        created_by TEXT,
        approved_at TEXT,
        approved_by TEXT,
        PRIMARY KEY (run_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS migration_audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES migration_runs (id) ON DELETE CASCADE,
        phase TEXT,
        action TEXT NOT NULL,
        actor_id TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_migration_audit_events_append_only
    BEFORE UPDATE ON migration_audit_events
    BEGIN
        SELECT RAISE(ABORT, 'migration_audit_events is append-only');
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS migration_artifacts (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES migration_runs (id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        locator TEXT NOT NULL,
        checksum TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
];

/// Decode a persisted enumeration, treating unknown text as corruption
pub(crate) fn decode<T>(column: &str, raw: &str, parsed: Option<T>) -> MigrationResult<T> {
    parsed.ok_or_else(|| {
        MigrationError::System(format!("unrecognised {} value '{}' in database", column, raw))
    })
}

pub(crate) fn decode_uuid(column: &str, raw: &str) -> MigrationResult<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|_| {
        MigrationError::System(format!("malformed {} '{}' in database", column, raw))
    })
}
