//! cmig-migrate - Clinic Data Migration Orchestrator
//!
//! Moves a clinic's records out of a legacy practice-management platform into
//! the canonical store: connect, discover, map, transform, validate, promote.
//! Every run is driven phase by phase over the HTTP API.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use cmig_common::config;
use cmig_migrate::artifacts::{ArtifactStore, FsArtifactStore};
use cmig_migrate::connectors::{
    ConnectorRegistry, HttpNavigationAgent, NavigationAgent, UnavailableAgent,
};
use cmig_migrate::guard::StaticPermissionGuard;
use cmig_migrate::orchestrator::{recover_interrupted, MigrationOrchestrator, OrchestratorConfig};
use cmig_migrate::{db, AppState};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5740";

#[derive(Debug, Parser)]
#[command(name = "cmig-migrate", version, about = "Clinic data migration orchestrator")]
struct Args {
    /// Path to cmig-migrate.toml
    #[arg(long, env = "CMIG_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding the database and artifact store
    #[arg(long, env = "CMIG_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// HTTP listen address
    #[arg(long, env = "CMIG_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Navigation agent base URL (enables browser extraction)
    #[arg(long, env = "CMIG_AGENT_URL")]
    agent_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Step 1: Configuration (file optional, defaults otherwise)
    let toml_config = config::load_or_default(args.config.as_deref(), "CMIG_CONFIG")?;
    config::init_logging(&toml_config.logging)?;

    info!("Starting cmig-migrate (Migration Orchestrator)");
    info!(
        "Version: {} ({}, built {} [{}])",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // Step 2: Root folder, database and artifact store
    let root_folder = config::resolve_root_folder(
        args.root_folder.as_deref(),
        "CMIG_ROOT_FOLDER",
        &toml_config,
    );
    std::fs::create_dir_all(&root_folder)
        .map_err(|e| anyhow::anyhow!("Failed to create root folder {}: {}", root_folder.display(), e))?;
    info!("Root folder: {}", root_folder.display());

    let db_path = root_folder.join(db::DATABASE_FILE_NAME);
    info!("Database: {}", db_path.display());
    let pool = db::init_database_pool(&db_path).await?;

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(&root_folder));

    // Step 3: Connector backends, resolved once
    let http = reqwest::Client::builder()
        .user_agent(concat!("cmig-migrate/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let agent_url = args.agent_url.or_else(|| toml_config.agent.url.clone());
    let agent: Arc<dyn NavigationAgent> = match agent_url {
        Some(url) => {
            info!("Navigation agent: {}", url);
            Arc::new(HttpNavigationAgent::new(
                http.clone(),
                &url,
                toml_config.agent.api_key.clone(),
            ))
        }
        None => {
            info!("No navigation agent configured; browser extraction unavailable");
            Arc::new(UnavailableAgent)
        }
    };
    let registry = ConnectorRegistry::with_builtin_vendors(http, agent, artifacts)?;

    // Step 4: Release runs interrupted by the previous process
    let recovered = recover_interrupted(&pool).await?;
    if recovered > 0 {
        info!("Recovered {} interrupted run(s)", recovered);
    }

    let orchestrator = MigrationOrchestrator::new(
        pool,
        Arc::new(registry),
        OrchestratorConfig::from(&toml_config.orchestrator),
    );
    let guard = StaticPermissionGuard::new(toml_config.approvers.iter().cloned());
    let state = AppState::new(Arc::new(orchestrator), Arc::new(guard));

    let app = cmig_migrate::build_router(state);

    // Step 5: Serve
    let bind_address = args
        .bind_address
        .or_else(|| toml_config.bind_address.clone())
        .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
