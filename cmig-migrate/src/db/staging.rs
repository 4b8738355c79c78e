//! Canonical staging records
//!
//! Every status change is a compare-and-set on the expected prior status and
//! carries its ledger delta in the same transaction.

use cmig_common::time;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::{decode, decode_uuid, ledger};
use crate::connectors::RawRecord;
use crate::error::{MigrationError, MigrationResult};
use crate::models::{EntityType, RecordStatus, StagingRecord};

const RECORD_COLUMNS: &str = r#"
    run_id, entity_type, source_id, raw_payload, payload, status,
    error_detail, promoted_id, extracted_at, updated_at
"#;

/// What an extraction upsert did to the staging row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New pending row
    Inserted,
    /// Raw data changed; draft reset to pending
    Updated,
    Unchanged,
    /// Row is promoted or rejected and was left alone
    Final,
}

/// Stage one raw record, keyed by (run, entity type, source id)
pub async fn upsert_raw(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    record: &RawRecord,
) -> MigrationResult<UpsertOutcome> {
    let raw_payload = serde_json::to_string(&record.data)?;
    let now = time::to_db(&time::now());

    let existing = sqlx::query(
        r#"
        SELECT status, raw_payload FROM migration_staging_records
        WHERE run_id = ? AND entity_type = ? AND source_id = ?
        "#,
    )
    .bind(run_id.to_string())
    .bind(record.entity_type.as_str())
    .bind(&record.source_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(existing) = existing else {
        sqlx::query(
            r#"
            INSERT INTO migration_staging_records (
                run_id, entity_type, source_id, raw_payload, payload, status,
                extracted_at, updated_at
            ) VALUES (?, ?, ?, ?, '{}', 'pending', ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(record.entity_type.as_str())
        .bind(&record.source_id)
        .bind(&raw_payload)
        .bind(time::to_db(&record.extracted_at))
        .bind(&now)
        .execute(&mut *conn)
        .await?;
        ledger::apply_delta(conn, run_id, record.entity_type, RecordStatus::Pending, 1).await?;
        return Ok(UpsertOutcome::Inserted);
    };

    let status: String = existing.try_get("status")?;
    let status = decode("status", &status, RecordStatus::parse(&status))?;
    let stored_raw: String = existing.try_get("raw_payload")?;

    if status.is_final() {
        return Ok(UpsertOutcome::Final);
    }
    if stored_raw == raw_payload {
        return Ok(UpsertOutcome::Unchanged);
    }

    sqlx::query(
        r#"
        UPDATE migration_staging_records SET
            raw_payload = ?, payload = '{}', status = 'pending', error_detail = NULL,
            extracted_at = ?, updated_at = ?
        WHERE run_id = ? AND entity_type = ? AND source_id = ?
        "#,
    )
    .bind(&raw_payload)
    .bind(time::to_db(&record.extracted_at))
    .bind(&now)
    .bind(run_id.to_string())
    .bind(record.entity_type.as_str())
    .bind(&record.source_id)
    .execute(&mut *conn)
    .await?;
    ledger::move_count(conn, run_id, record.entity_type, status, RecordStatus::Pending).await?;

    Ok(UpsertOutcome::Updated)
}

/// Next page of non-final records after `after_source_id`, in source id order
pub async fn active_page(
    pool: &SqlitePool,
    run_id: Uuid,
    entity_type: EntityType,
    after_source_id: Option<&str>,
    limit: usize,
) -> MigrationResult<Vec<StagingRecord>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {RECORD_COLUMNS} FROM migration_staging_records
        WHERE run_id = ? AND entity_type = ?
          AND status NOT IN ('promoted', 'rejected')
          AND source_id > ?
        ORDER BY source_id
        LIMIT ?
        "#
    ))
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(after_source_id.unwrap_or(""))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Oldest validated records awaiting promotion
pub async fn validated_batch(
    pool: &SqlitePool,
    run_id: Uuid,
    entity_type: EntityType,
    limit: usize,
) -> MigrationResult<Vec<StagingRecord>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {RECORD_COLUMNS} FROM migration_staging_records
        WHERE run_id = ? AND entity_type = ? AND status = 'validated'
        ORDER BY source_id
        LIMIT ?
        "#
    ))
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

pub async fn load_record<'e, E>(
    executor: E,
    run_id: Uuid,
    entity_type: EntityType,
    source_id: &str,
) -> MigrationResult<Option<StagingRecord>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        r#"
        SELECT {RECORD_COLUMNS} FROM migration_staging_records
        WHERE run_id = ? AND entity_type = ? AND source_id = ?
        "#
    ))
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(source_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Fields written alongside a status change
#[derive(Debug, Default)]
pub struct RecordUpdate<'a> {
    /// New canonical draft; None keeps the stored one
    pub payload: Option<&'a Value>,
    pub error_detail: Option<&'a str>,
}

/// Compare-and-set a record from `expected` to `next`
///
/// Returns false (and writes nothing) when the stored status is no longer
/// `expected`. Moving to the same status only rewrites the data columns.
pub async fn set_status(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    entity_type: EntityType,
    source_id: &str,
    expected: RecordStatus,
    next: RecordStatus,
    update: RecordUpdate<'_>,
) -> MigrationResult<bool> {
    if expected != next && !expected.can_transition_to(next) {
        return Err(MigrationError::System(format!(
            "illegal staging transition {} -> {}",
            expected, next
        )));
    }

    let payload = update.payload.map(serde_json::to_string).transpose()?;
    let result = sqlx::query(
        r#"
        UPDATE migration_staging_records SET
            status = ?,
            payload = COALESCE(?, payload),
            error_detail = ?,
            updated_at = ?
        WHERE run_id = ? AND entity_type = ? AND source_id = ? AND status = ?
        "#,
    )
    .bind(next.as_str())
    .bind(payload)
    .bind(update.error_detail)
    .bind(time::to_db(&time::now()))
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(source_id)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }
    ledger::move_count(conn, run_id, entity_type, expected, next).await?;
    Ok(true)
}

/// Link a promoted record to its live row
pub async fn set_promoted_id(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    entity_type: EntityType,
    source_id: &str,
    promoted_id: Uuid,
) -> MigrationResult<()> {
    sqlx::query(
        r#"
        UPDATE migration_staging_records SET promoted_id = ?
        WHERE run_id = ? AND entity_type = ? AND source_id = ? AND status = 'promoted'
        "#,
    )
    .bind(promoted_id.to_string())
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(source_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Source ids of staged patients that are still eligible for promotion
pub async fn staged_patient_ids(pool: &SqlitePool, run_id: Uuid) -> MigrationResult<HashSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT source_id FROM migration_staging_records
        WHERE run_id = ? AND entity_type = 'patient' AND status != 'rejected'
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().collect())
}

/// Staging rows per entity type (the ledger must always sum to these)
pub async fn count_by_entity(
    pool: &SqlitePool,
    run_id: Uuid,
) -> MigrationResult<BTreeMap<EntityType, i64>> {
    let rows = sqlx::query(
        r#"
        SELECT entity_type, COUNT(*) AS n FROM migration_staging_records
        WHERE run_id = ? GROUP BY entity_type
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let entity_type: String = row.try_get("entity_type")?;
        counts.insert(
            decode("entity_type", &entity_type, EntityType::parse(&entity_type))?,
            row.try_get("n")?,
        );
    }
    Ok(counts)
}

fn record_from_row(row: &SqliteRow) -> MigrationResult<StagingRecord> {
    let run_id: String = row.try_get("run_id")?;
    let entity_type: String = row.try_get("entity_type")?;
    let status: String = row.try_get("status")?;
    let raw_payload: String = row.try_get("raw_payload")?;
    let payload: String = row.try_get("payload")?;
    let promoted_id: Option<String> = row.try_get("promoted_id")?;

    Ok(StagingRecord {
        run_id: decode_uuid("run_id", &run_id)?,
        entity_type: decode("entity_type", &entity_type, EntityType::parse(&entity_type))?,
        source_id: row.try_get("source_id")?,
        raw_payload: serde_json::from_str(&raw_payload)?,
        payload: serde_json::from_str(&payload)?,
        status: decode("status", &status, RecordStatus::parse(&status))?,
        error_detail: row.try_get("error_detail")?,
        promoted_id: promoted_id
            .map(|id| decode_uuid("promoted_id", &id))
            .transpose()?,
        extracted_at: time::from_db("extracted_at", row.try_get::<&str, _>("extracted_at")?)?,
        updated_at: time::from_db("updated_at", row.try_get::<&str, _>("updated_at")?)?,
    })
}
