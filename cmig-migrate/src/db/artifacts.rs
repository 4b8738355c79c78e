//! Per-run artifact index (blobs themselves live in the artifact store)

use cmig_common::time;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{decode, decode_uuid};
use crate::error::MigrationResult;
use crate::models::{ArtifactKind, ArtifactRef, MigrationArtifact};

pub async fn record_artifact(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    kind: ArtifactKind,
    artifact: &ArtifactRef,
) -> MigrationResult<MigrationArtifact> {
    let entry = MigrationArtifact {
        id: Uuid::new_v4(),
        run_id,
        kind,
        locator: artifact.locator.clone(),
        checksum: artifact.checksum.clone(),
        created_at: time::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO migration_artifacts (id, run_id, kind, locator, checksum, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.id.to_string())
    .bind(run_id.to_string())
    .bind(kind.as_str())
    .bind(&entry.locator)
    .bind(&entry.checksum)
    .bind(time::to_db(&entry.created_at))
    .execute(conn)
    .await?;

    Ok(entry)
}

pub async fn list_artifacts(
    pool: &SqlitePool,
    run_id: Uuid,
) -> MigrationResult<Vec<MigrationArtifact>> {
    let rows = sqlx::query(
        r#"
        SELECT id, run_id, kind, locator, checksum, created_at
        FROM migration_artifacts
        WHERE run_id = ?
        ORDER BY created_at, id
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.try_get("id")?;
            let run_id: String = row.try_get("run_id")?;
            let kind: String = row.try_get("kind")?;
            Ok(MigrationArtifact {
                id: decode_uuid("id", &id)?,
                run_id: decode_uuid("run_id", &run_id)?,
                kind: decode("kind", &kind, ArtifactKind::parse(&kind))?,
                locator: row.try_get("locator")?,
                checksum: row.try_get("checksum")?,
                created_at: time::from_db("created_at", row.try_get::<&str, _>("created_at")?)?,
            })
        })
        .collect()
}
