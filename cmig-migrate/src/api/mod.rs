//! HTTP API handlers for cmig-migrate
//!
//! Thin layer over the orchestrator. Caller identity comes from the
//! `X-Clinic-Id` and `X-Actor-Id` headers; every handler asks the permission
//! guard before calling into the orchestrator.

pub mod caller;
pub mod health;
pub mod runs;

pub use caller::{ACTOR_HEADER, CLINIC_HEADER};
pub use health::health_routes;
pub use runs::run_routes;
