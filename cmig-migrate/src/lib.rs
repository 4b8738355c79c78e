//! cmig-migrate library interface
//!
//! Exposes the orchestrator, connectors and HTTP router for the binary and
//! for integration testing.

pub mod api;
pub mod artifacts;
pub mod connectors;
pub mod db;
pub mod error;
pub mod guard;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod strategy;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, MigrationError, MigrationResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::guard::PermissionGuard;
use crate::orchestrator::MigrationOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<MigrationOrchestrator>,
    pub guard: Arc<dyn PermissionGuard>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(orchestrator: Arc<MigrationOrchestrator>, guard: Arc<dyn PermissionGuard>) -> Self {
        Self {
            orchestrator,
            guard,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::run_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
