//! Live canonical tables
//!
//! One row per (clinic, vendor, source id). Inserts never overwrite, so a
//! repeated promotion resolves to the existing row instead of a duplicate.

use cmig_common::time;
use serde_json::Value;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::decode_uuid;
use crate::error::MigrationResult;
use crate::models::{EntityType, SourceVendor};

/// Row to insert into a live table
#[derive(Debug)]
pub struct LiveRecord<'a> {
    pub entity_type: EntityType,
    pub clinic_id: Uuid,
    pub source_vendor: &'a SourceVendor,
    pub source_id: &'a str,
    pub run_id: Uuid,
    /// Live patient row for dependent entities
    pub patient_id: Option<Uuid>,
    pub data: &'a Value,
}

/// Insert unless the natural key exists; returns the live id and whether it was new
pub async fn insert_live(
    conn: &mut SqliteConnection,
    record: &LiveRecord<'_>,
) -> MigrationResult<(Uuid, bool)> {
    let table = record.entity_type.live_table();
    let id = Uuid::new_v4();

    let result = sqlx::query(&format!(
        r#"
        INSERT INTO {table} (id, clinic_id, source_vendor, source_id, run_id, patient_id, data, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (clinic_id, source_vendor, source_id) DO NOTHING
        "#
    ))
    .bind(id.to_string())
    .bind(record.clinic_id.to_string())
    .bind(record.source_vendor.as_str())
    .bind(record.source_id)
    .bind(record.run_id.to_string())
    .bind(record.patient_id.map(|p| p.to_string()))
    .bind(serde_json::to_string(record.data)?)
    .bind(time::to_db(&time::now()))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok((id, true));
    }

    let existing = find_live_id(
        conn,
        record.entity_type,
        record.clinic_id,
        record.source_vendor,
        record.source_id,
    )
    .await?;
    match existing {
        Some(existing) => Ok((existing, false)),
        None => Err(crate::error::MigrationError::System(format!(
            "{} insert conflicted but no row found",
            table
        ))),
    }
}

pub async fn find_live_id<'e, E>(
    executor: E,
    entity_type: EntityType,
    clinic_id: Uuid,
    source_vendor: &SourceVendor,
    source_id: &str,
) -> MigrationResult<Option<Uuid>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let id: Option<String> = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE clinic_id = ? AND source_vendor = ? AND source_id = ?",
        entity_type.live_table()
    ))
    .bind(clinic_id.to_string())
    .bind(source_vendor.as_str())
    .bind(source_id)
    .fetch_optional(executor)
    .await?;

    id.map(|id| decode_uuid("id", &id)).transpose()
}

/// Rows of one live table for a clinic
pub async fn count_live(
    pool: &SqlitePool,
    entity_type: EntityType,
    clinic_id: Uuid,
) -> MigrationResult<i64> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE clinic_id = ?",
        entity_type.live_table()
    ))
    .bind(clinic_id.to_string())
    .fetch_one(pool)
    .await?;

    Ok(count)
}
