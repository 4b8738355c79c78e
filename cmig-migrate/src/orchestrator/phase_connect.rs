//! Phase: connect
//!
//! Builds the connector for the run's persisted strategy and logs in.

use cmig_common::time;

use super::{MigrationOrchestrator, PhaseContext, PhaseOutput, PhaseStep};
use crate::error::MigrationResult;
use crate::models::{ConnectResult, MigrationRun};

impl MigrationOrchestrator {
    /// Connecting → Connected
    ///
    /// Login is retried under the vendor retry policy; exhaustion surfaces as
    /// a vendor connection error and fails the run.
    pub(super) async fn phase_connect(
        &self,
        run: &MigrationRun,
        ctx: &PhaseContext,
    ) -> MigrationResult<PhaseStep> {
        let connector = self.connector(run)?;
        let connector = connector.as_ref();
        let credentials = run.source_profile.credentials.as_ref();

        tracing::info!(
            run_id = %run.id,
            strategy = %connector.strategy(),
            "Logging in to source"
        );

        self.vendor_call(ctx, "login", || connector.login(credentials))
            .await?;

        let attempts = ctx.retry_count().await as u32 + 1;
        tracing::info!(run_id = %run.id, attempts, "Connected to source");

        Ok(PhaseStep::succeeded(PhaseOutput::Connect(ConnectResult {
            strategy: connector.strategy(),
            attempts,
            connected_at: time::now(),
        })))
    }
}
