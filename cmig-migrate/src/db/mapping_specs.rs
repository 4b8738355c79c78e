//! Mapping spec versions (immutable once written, except the approval stamp)

use chrono::{DateTime, Utc};
use cmig_common::time;
use sqlx::{Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::decode_uuid;
use crate::error::MigrationResult;
use crate::models::{FieldMapping, MappingSpec};

pub async fn insert_spec(conn: &mut SqliteConnection, spec: &MappingSpec) -> MigrationResult<()> {
    let field_mappings = serde_json::to_string(&spec.field_mappings)?;

    sqlx::query(
        r#"
        INSERT INTO migration_mapping_specs (
            run_id, version, field_mappings, created_at, created_by
        ) VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(spec.run_id.to_string())
    .bind(spec.version)
    .bind(field_mappings)
    .bind(time::to_db(&spec.created_at))
    .bind(spec.created_by.as_deref())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn load_spec<'e, E>(
    executor: E,
    run_id: Uuid,
    version: i64,
) -> MigrationResult<Option<MappingSpec>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT run_id, version, field_mappings, created_at, created_by, approved_at, approved_by
        FROM migration_mapping_specs
        WHERE run_id = ? AND version = ?
        "#,
    )
    .bind(run_id.to_string())
    .bind(version)
    .fetch_optional(executor)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let run_id: String = row.try_get("run_id")?;
    let field_mappings: String = row.try_get("field_mappings")?;
    let field_mappings: Vec<FieldMapping> = serde_json::from_str(&field_mappings)?;

    Ok(Some(MappingSpec {
        run_id: decode_uuid("run_id", &run_id)?,
        version: row.try_get("version")?,
        field_mappings,
        created_at: time::from_db("created_at", row.try_get::<&str, _>("created_at")?)?,
        created_by: row.try_get("created_by")?,
        approved_at: time::from_db_opt("approved_at", row.try_get("approved_at")?)?,
        approved_by: row.try_get("approved_by")?,
    }))
}

/// Highest version stored for a run (0 when none)
pub async fn latest_version<'e, E>(executor: E, run_id: Uuid) -> MigrationResult<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM migration_mapping_specs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(executor)
            .await?;

    Ok(version.unwrap_or(0))
}

/// Stamp approval on a version; false when it was already approved
pub async fn mark_approved(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    version: i64,
    approved_at: &DateTime<Utc>,
    approved_by: &str,
) -> MigrationResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE migration_mapping_specs SET approved_at = ?, approved_by = ?
        WHERE run_id = ? AND version = ? AND approved_at IS NULL
        "#,
    )
    .bind(time::to_db(approved_at))
    .bind(approved_by)
    .bind(run_id.to_string())
    .bind(version)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}
