//! Promotion of validated staging records into the live canonical tables
//!
//! One batch is one transaction. Each record is claimed with a
//! validated → promoted compare-and-set before its live row is written, so a
//! retried or concurrent promote never inserts the same record twice.

use sqlx::SqlitePool;

use crate::db::{live, staging};
use crate::error::{MigrationError, MigrationResult};
use crate::models::{EntityType, MigrationRun, RecordStatus, StagingRecord};
use crate::services::validator::patient_reference;
use crate::utils::retry_on_lock;

/// What one committed batch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records moved to promoted by this batch
    pub promoted: u64,
    /// Records another writer claimed first
    pub skipped: u64,
}

/// Promote one batch of validated records atomically
///
/// A dependent record whose patient is not live yet aborts the whole batch
/// with a mapping error; nothing from the batch is committed.
pub async fn promote_batch(
    pool: &SqlitePool,
    run: &MigrationRun,
    entity_type: EntityType,
    records: &[StagingRecord],
    max_lock_wait_ms: u64,
) -> MigrationResult<BatchOutcome> {
    retry_on_lock("promote_batch", max_lock_wait_ms, || {
        promote_batch_once(pool, run, entity_type, records)
    })
    .await
}

async fn promote_batch_once(
    pool: &SqlitePool,
    run: &MigrationRun,
    entity_type: EntityType,
    records: &[StagingRecord],
) -> MigrationResult<BatchOutcome> {
    let mut tx = pool.begin().await?;
    let mut outcome = BatchOutcome::default();

    for record in records {
        let patient_id = if entity_type.references_patient() {
            let reference = patient_reference(&record.payload).ok_or_else(|| {
                MigrationError::Mapping(format!(
                    "{} '{}' has no patient reference",
                    entity_type, record.source_id
                ))
            })?;
            let live_patient = live::find_live_id(
                &mut *tx,
                EntityType::Patient,
                run.clinic_id,
                &run.source_vendor,
                reference,
            )
            .await?;
            match live_patient {
                Some(id) => Some(id),
                None => {
                    return Err(MigrationError::Mapping(format!(
                        "{} '{}' references patient '{}' which is not live",
                        entity_type, record.source_id, reference
                    )))
                }
            }
        } else {
            None
        };

        let claimed = staging::set_status(
            &mut tx,
            run.id,
            entity_type,
            &record.source_id,
            RecordStatus::Validated,
            RecordStatus::Promoted,
            staging::RecordUpdate::default(),
        )
        .await?;
        if !claimed {
            outcome.skipped += 1;
            continue;
        }

        let (live_id, inserted) = live::insert_live(
            &mut tx,
            &live::LiveRecord {
                entity_type,
                clinic_id: run.clinic_id,
                source_vendor: &run.source_vendor,
                source_id: &record.source_id,
                run_id: run.id,
                patient_id,
                data: &record.payload,
            },
        )
        .await?;
        if !inserted {
            tracing::debug!(
                run_id = %run.id,
                entity_type = %entity_type,
                source_id = %record.source_id,
                live_id = %live_id,
                "Record already live, linking existing row"
            );
        }
        staging::set_promoted_id(&mut tx, run.id, entity_type, &record.source_id, live_id).await?;
        outcome.promoted += 1;
    }

    tx.commit().await?;
    Ok(outcome)
}
