//! Migration run API handlers
//!
//! POST /runs, GET /runs, GET /runs/:id/report, POST /runs/:id/phases/:phase,
//! POST /runs/:id/approve, POST /runs/:id/mapping, POST /runs/:id/pause,
//! POST /runs/:id/resume, POST /runs/:id/records/:entity_type/:source_id/reject,
//! DELETE /runs/:id

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, MigrationError};
use crate::guard::{CallerContext, GuardAction};
use crate::models::{
    EntityType, FieldMapping, MappingSpec, Phase, RunSummary, SourceProfile, SourceVendor,
    StagingRecord,
};
use crate::orchestrator::{MappingApproval, PhaseOutcome, RunReport};
use crate::AppState;

/// POST /runs request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub source_vendor: SourceVendor,
    #[serde(default)]
    pub source_profile: SourceProfile,
}

/// GET /runs query
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub clinic_id: Option<Uuid>,
}

/// GET /runs response
#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

/// POST /runs/:id/mapping request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviseMappingRequest {
    pub field_mappings: Vec<FieldMapping>,
}

/// POST /runs/:id/records/:entity_type/:source_id/reject request
#[derive(Debug, Default, Deserialize)]
pub struct RejectRecordRequest {
    #[serde(default)]
    pub reason: String,
}

fn resource(run_id: Uuid) -> String {
    format!("run:{}", run_id)
}

/// POST /runs
pub async fn start_run(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<RunSummary>)> {
    state
        .guard
        .require_permission(&caller, "runs", GuardAction::StartRun)?;

    let run = state
        .orchestrator
        .start_run(&caller, request.source_vendor, request.source_profile)
        .await?;

    Ok((StatusCode::CREATED, Json(RunSummary::from(&run))))
}

/// GET /runs
///
/// Lists the caller's clinic. A `clinic_id` query naming another clinic is refused.
pub async fn list_runs(
    State(state): State<AppState>,
    caller: CallerContext,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<ListRunsResponse>> {
    state
        .guard
        .require_permission(&caller, "runs", GuardAction::ViewRun)?;
    if query.clinic_id.is_some_and(|c| c != caller.clinic_id) {
        return Err(MigrationError::Authorization(
            "runs of another clinic cannot be listed".to_string(),
        )
        .into());
    }

    let runs = state.orchestrator.list_runs(&caller).await?;
    Ok(Json(ListRunsResponse { runs }))
}

/// GET /runs/:id/report
pub async fn get_report(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunReport>> {
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::ViewRun)?;
    Ok(Json(state.orchestrator.get_report(&caller, run_id).await?))
}

/// POST /runs/:id/phases/:phase
///
/// Runs the phase to completion before answering. The phase runs in its own
/// task, so a client that disconnects does not cancel it.
pub async fn run_phase(
    State(state): State<AppState>,
    caller: CallerContext,
    Path((run_id, phase)): Path<(Uuid, String)>,
) -> ApiResult<Json<PhaseOutcome>> {
    let phase = Phase::parse(&phase)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown phase: {}", phase)))?;
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::RunPhase)?;

    let orchestrator = Arc::clone(&state.orchestrator);
    let outcome = tokio::spawn(async move { orchestrator.run_phase(&caller, run_id, phase).await })
        .await
        .map_err(|e| MigrationError::System(format!("phase task ended abnormally: {}", e)))??;
    Ok(Json(outcome))
}

/// POST /runs/:id/approve
pub async fn approve_mapping(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<MappingApproval>> {
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::ApproveMapping)?;
    Ok(Json(state.orchestrator.approve_mapping(&caller, run_id).await?))
}

/// POST /runs/:id/mapping
pub async fn revise_mapping(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(run_id): Path<Uuid>,
    Json(request): Json<ReviseMappingRequest>,
) -> ApiResult<(StatusCode, Json<MappingSpec>)> {
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::ReviseMapping)?;
    let spec = state
        .orchestrator
        .revise_mapping(&caller, run_id, request.field_mappings)
        .await?;
    Ok((StatusCode::CREATED, Json(spec)))
}

/// POST /runs/:id/pause
pub async fn pause(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunSummary>> {
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::Pause)?;
    Ok(Json(state.orchestrator.pause(&caller, run_id).await?))
}

/// POST /runs/:id/resume
pub async fn resume(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunSummary>> {
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::Resume)?;
    Ok(Json(state.orchestrator.resume(&caller, run_id).await?))
}

/// POST /runs/:id/records/:entity_type/:source_id/reject
pub async fn reject_record(
    State(state): State<AppState>,
    caller: CallerContext,
    Path((run_id, entity_type, source_id)): Path<(Uuid, String, String)>,
    body: Option<Json<RejectRecordRequest>>,
) -> ApiResult<Json<StagingRecord>> {
    let entity_type = EntityType::parse(&entity_type)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown entity type: {}", entity_type)))?;
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::RejectRecord)?;

    let Json(request) = body.unwrap_or_default();
    let record = state
        .orchestrator
        .reject_record(&caller, run_id, entity_type, &source_id, &request.reason)
        .await?;
    Ok(Json(record))
}

/// DELETE /runs/:id
pub async fn purge_run(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(run_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .guard
        .require_permission(&caller, &resource(run_id), GuardAction::Purge)?;
    state.orchestrator.purge_run(&caller, run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Build run routes
pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs", post(start_run).get(list_runs))
        .route("/runs/:id", axum::routing::delete(purge_run))
        .route("/runs/:id/report", get(get_report))
        .route("/runs/:id/phases/:phase", post(run_phase))
        .route("/runs/:id/approve", post(approve_mapping))
        .route("/runs/:id/mapping", post(revise_mapping))
        .route("/runs/:id/pause", post(pause))
        .route("/runs/:id/resume", post(resume))
        .route(
            "/runs/:id/records/:entity_type/:source_id/reject",
            post(reject_record),
        )
}
