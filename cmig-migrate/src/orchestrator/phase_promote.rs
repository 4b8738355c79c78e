//! Phase: promote
//!
//! Moves validated records into the live canonical tables in dependency
//! order, one atomic batch at a time. An interruption leaves only whole
//! batches committed; a re-run picks up the records still `validated`.

use super::{MigrationOrchestrator, PhaseEnd, PhaseOutput, PhaseStep};
use crate::db::staging;
use crate::error::MigrationResult;
use crate::models::{EntityType, MigrationRun, PromoteResult};
use crate::services::promote_batch;

impl MigrationOrchestrator {
    /// Verifying → Completed
    ///
    /// A dependent record whose patient is not live fails the batch with a
    /// mapping error, which pauses the run for review.
    pub(super) async fn phase_promote(&self, run: &MigrationRun) -> MigrationResult<PhaseStep> {
        let mut result = PromoteResult {
            complete: true,
            ..Default::default()
        };

        'entities: for entity_type in EntityType::PROMOTION_ORDER {
            loop {
                if self.pause_requested(run.id).await? {
                    tracing::info!(
                        run_id = %run.id,
                        entity_type = %entity_type,
                        batches = result.batches_committed,
                        "Pause requested, stopping promotion at batch boundary"
                    );
                    result.complete = false;
                    break 'entities;
                }

                let batch = staging::validated_batch(
                    &self.pool,
                    run.id,
                    entity_type,
                    self.config.promote_batch_size,
                )
                .await?;
                if batch.is_empty() {
                    break;
                }

                let outcome = promote_batch(
                    &self.pool,
                    run,
                    entity_type,
                    &batch,
                    self.config.db_max_lock_wait_ms,
                )
                .await?;
                result.batches_committed += 1;
                *result.promoted.entry(entity_type).or_insert(0) += outcome.promoted;

                tracing::debug!(
                    run_id = %run.id,
                    entity_type = %entity_type,
                    promoted = outcome.promoted,
                    skipped = outcome.skipped,
                    "Promotion batch committed"
                );
            }
        }

        tracing::info!(
            run_id = %run.id,
            batches = result.batches_committed,
            complete = result.complete,
            "Promotion finished"
        );

        let end = if result.complete {
            PhaseEnd::Succeeded
        } else {
            PhaseEnd::Interrupted
        };
        Ok(PhaseStep::new(PhaseOutput::Promote(result), end))
    }
}
