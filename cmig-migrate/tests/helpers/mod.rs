//! Test Helper Utilities
//!
//! Shared setup for cmig-migrate integration tests: a throwaway root folder
//! with its own database and artifact store, plus uploaded CSV fixtures.

#![allow(dead_code)]

use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use cmig_migrate::artifacts::{ArtifactStore, FsArtifactStore};
use cmig_migrate::connectors::{ConnectorRegistry, NavigationAgent, UnavailableAgent};
use cmig_migrate::db;
use cmig_migrate::guard::CallerContext;
use cmig_migrate::models::{
    ArtifactKind, EntityType, MigrationRun, Phase, SourceProfile, UploadFormat, UploadedFile,
};
use cmig_migrate::orchestrator::{MigrationOrchestrator, OrchestratorConfig, PhaseOutcome};

pub const PATIENTS_CSV: &str = "\
id,first_name,last_name,dob,email
p1,Ada,Lovelace,1815-12-10,ada@example.com
p2,Alan,Turing,06/23/1912,
";

pub const APPOINTMENTS_CSV: &str = "\
id,patient_id,start,provider
a1,p1,2024-05-01 09:30:00,Dr Grey
a2,p2,2024-05-02T10:00:00Z,Dr Grey
";

/// Test environment; the TempDir must outlive the pool
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub clinic_id: Uuid,
}

impl TestEnv {
    pub async fn new() -> TestEnv {
        let dir = TempDir::new().unwrap();
        let pool = db::init_database_pool(&dir.path().join(db::DATABASE_FILE_NAME))
            .await
            .unwrap();
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.path()));
        TestEnv {
            dir,
            pool,
            artifacts,
            clinic_id: Uuid::new_v4(),
        }
    }

    /// Caller acting for this environment's clinic
    pub fn caller(&self) -> CallerContext {
        CallerContext::new(self.clinic_id, Some("ops@clinic".to_string()))
    }

    /// Registry with the built-in vendors and no navigation agent
    pub fn registry(&self) -> ConnectorRegistry {
        self.registry_with_agent(Arc::new(UnavailableAgent))
    }

    pub fn registry_with_agent(&self, agent: Arc<dyn NavigationAgent>) -> ConnectorRegistry {
        ConnectorRegistry::with_builtin_vendors(Client::new(), agent, Arc::clone(&self.artifacts))
            .unwrap()
    }

    pub fn orchestrator(&self) -> MigrationOrchestrator {
        self.orchestrator_with(self.registry(), test_config())
    }

    pub fn orchestrator_with(
        &self,
        registry: ConnectorRegistry,
        config: OrchestratorConfig,
    ) -> MigrationOrchestrator {
        MigrationOrchestrator::new(self.pool.clone(), Arc::new(registry), config)
    }

    /// Store a CSV in the artifact store as a clinic upload
    pub async fn upload_csv(&self, entity_type: EntityType, content: &str) -> UploadedFile {
        let stored = self
            .artifacts
            .put(ArtifactKind::Upload, content.as_bytes())
            .await
            .unwrap();
        UploadedFile {
            locator: stored.locator,
            format: UploadFormat::Csv,
            entity_type: Some(entity_type),
            id_field: None,
        }
    }

    /// Source profile with patients and appointments uploaded
    pub async fn upload_profile(&self, patients: &str, appointments: &str) -> SourceProfile {
        SourceProfile {
            uploaded_files: vec![
                self.upload_csv(EntityType::Patient, patients).await,
                self.upload_csv(EntityType::Appointment, appointments).await,
            ],
            ..Default::default()
        }
    }
}

/// Fast retries and small batches so tests exercise batching
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        vendor_max_attempts: 3,
        vendor_backoff: Duration::from_millis(5),
        vendor_call_deadline: Duration::from_secs(5),
        promote_batch_size: 1,
        ..OrchestratorConfig::default()
    }
}

/// Run phases in order, panicking on the first error
pub async fn run_phases(
    orchestrator: &MigrationOrchestrator,
    caller: &CallerContext,
    run_id: Uuid,
    phases: &[Phase],
) -> Vec<PhaseOutcome> {
    let mut outcomes = Vec::new();
    for &phase in phases {
        let outcome = orchestrator
            .run_phase(caller, run_id, phase)
            .await
            .unwrap_or_else(|e| panic!("{} failed: {}", phase, e));
        outcomes.push(outcome);
    }
    outcomes
}

/// Connect, discover and generate a mapping, then approve it
pub async fn prepare_to_transform(
    orchestrator: &MigrationOrchestrator,
    caller: &CallerContext,
    run_id: Uuid,
) {
    run_phases(
        orchestrator,
        caller,
        run_id,
        &[Phase::Connect, Phase::Discover, Phase::GenerateMapping],
    )
    .await;
    orchestrator.approve_mapping(caller, run_id).await.unwrap();
}

/// Poll until no phase holds the run's lock (released by a background task)
pub async fn wait_until_unlocked(pool: &SqlitePool, run_id: Uuid) -> MigrationRun {
    for _ in 0..200 {
        let run = db::runs::load_run(pool, run_id).await.unwrap().unwrap();
        if run.active_phase.is_none() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} is still locked", run_id);
}
