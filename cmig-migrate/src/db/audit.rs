//! Audit trail (append-only)

use cmig_common::time;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{decode, decode_uuid};
use crate::error::MigrationResult;
use crate::models::{AuditEvent, NewAuditEvent, Phase};

pub async fn append(conn: &mut SqliteConnection, event: &NewAuditEvent) -> MigrationResult<i64> {
    let metadata = serde_json::to_string(&event.metadata)?;

    let result = sqlx::query(
        r#"
        INSERT INTO migration_audit_events (run_id, phase, action, actor_id, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.run_id.to_string())
    .bind(event.phase.map(|p| p.as_str()))
    .bind(event.action)
    .bind(event.actor_id.as_deref())
    .bind(metadata)
    .bind(time::to_db(&time::now()))
    .execute(conn)
    .await?;

    tracing::debug!(
        run_id = %event.run_id,
        action = event.action,
        actor_id = event.actor_id.as_deref().unwrap_or("system"),
        "Audit event appended"
    );

    Ok(result.last_insert_rowid())
}

/// Full trail for a run in insertion order
pub async fn list_events(pool: &SqlitePool, run_id: Uuid) -> MigrationResult<Vec<AuditEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT id, run_id, phase, action, actor_id, metadata, created_at
        FROM migration_audit_events
        WHERE run_id = ?
        ORDER BY id
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let run_id: String = row.try_get("run_id")?;
            let phase: Option<String> = row.try_get("phase")?;
            let metadata: String = row.try_get("metadata")?;
            Ok(AuditEvent {
                id: row.try_get("id")?,
                run_id: decode_uuid("run_id", &run_id)?,
                phase: phase
                    .map(|p| decode("phase", &p, Phase::parse(&p)))
                    .transpose()?,
                action: row.try_get("action")?,
                actor_id: row.try_get("actor_id")?,
                metadata: serde_json::from_str(&metadata)?,
                created_at: time::from_db("created_at", row.try_get::<&str, _>("created_at")?)?,
            })
        })
        .collect()
}
