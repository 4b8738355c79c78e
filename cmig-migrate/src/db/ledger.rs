//! Record ledger
//!
//! Aggregated staging counts per (run, entity type, status). Only called from
//! inside the transaction that performs the matching staging write.

use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::decode;
use crate::error::MigrationResult;
use crate::models::{EntityType, RecordStatus};

/// Per entity type, count per status
pub type LedgerSummary = BTreeMap<EntityType, BTreeMap<RecordStatus, i64>>;

pub async fn apply_delta(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    entity_type: EntityType,
    status: RecordStatus,
    delta: i64,
) -> MigrationResult<()> {
    sqlx::query(
        r#"
        INSERT INTO migration_record_ledger (run_id, entity_type, status, count)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (run_id, entity_type, status) DO UPDATE SET
            count = count + excluded.count
        "#,
    )
    .bind(run_id.to_string())
    .bind(entity_type.as_str())
    .bind(status.as_str())
    .bind(delta)
    .execute(conn)
    .await?;

    Ok(())
}

/// Decrement `from`, increment `to`
pub async fn move_count(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    entity_type: EntityType,
    from: RecordStatus,
    to: RecordStatus,
) -> MigrationResult<()> {
    if from == to {
        return Ok(());
    }
    apply_delta(&mut *conn, run_id, entity_type, from, -1).await?;
    apply_delta(&mut *conn, run_id, entity_type, to, 1).await
}

pub async fn summary(pool: &SqlitePool, run_id: Uuid) -> MigrationResult<LedgerSummary> {
    let rows = sqlx::query(
        "SELECT entity_type, status, count FROM migration_record_ledger WHERE run_id = ?",
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut summary = LedgerSummary::new();
    for row in rows {
        let entity_type: String = row.try_get("entity_type")?;
        let status: String = row.try_get("status")?;
        let count: i64 = row.try_get("count")?;
        summary
            .entry(decode("entity_type", &entity_type, EntityType::parse(&entity_type))?)
            .or_default()
            .insert(decode("status", &status, RecordStatus::parse(&status))?, count);
    }
    Ok(summary)
}
