//! API connector integration tests
//!
//! A local axum server stands in for a vendor with a documented REST API:
//! token login with rotating tokens, cursor pagination, one transient 503
//! and no document listing at all.

mod helpers;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cmig_migrate::connectors::{
    ApiConnector, ApiVendorSpec, ConnectorError, ConnectorRegistry, RecordPager,
    UnavailableAgent, VendorConnector,
};
use cmig_migrate::db::staging;
use cmig_migrate::models::{
    actions, Credentials, EntityType, IngestionStrategy, Phase, RecordStatus, RunStatus,
    SourceProfile, SourceVendor,
};
use cmig_migrate::orchestrator::PhaseOutput;

use helpers::{prepare_to_transform, run_phases, test_config, TestEnv};

const TOKEN: &str = "vendor-token";

#[derive(Clone, Default)]
struct MockVendor {
    /// Failures still to inject on the patient listing
    patient_failures: Arc<AtomicUsize>,
    list_calls: Arc<AtomicUsize>,
    logins: Arc<AtomicUsize>,
    /// Bumped to invalidate every token issued so far
    token_generation: Arc<AtomicUsize>,
    /// Expire the session right after the first patient page is served
    expire_after_first_page: Arc<AtomicBool>,
}

impl MockVendor {
    fn current_token(&self) -> String {
        format!("{}-{}", TOKEN, self.token_generation.load(Ordering::SeqCst))
    }
}

async fn login(State(vendor): State<MockVendor>, Json(body): Json<Value>) -> impl IntoResponse {
    if body["username"] == "frontdesk" && body["password"] == "secret" {
        vendor.logins.fetch_add(1, Ordering::SeqCst);
        (StatusCode::OK, Json(json!({ "access_token": vendor.current_token() })))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad credentials" })))
    }
}

async fn list(
    State(vendor): State<MockVendor>,
    Path(collection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", vendor.current_token()));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    vendor.list_calls.fetch_add(1, Ordering::SeqCst);
    if collection == "documents" {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "no such collection" })));
    }

    let cursor = query.get("cursor").map(String::as_str);
    let body = match (collection.as_str(), cursor) {
        ("patients", None) => {
            let injected = vendor
                .patient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
            }
            if vendor.expire_after_first_page.swap(false, Ordering::SeqCst) {
                vendor.token_generation.fetch_add(1, Ordering::SeqCst);
            }
            json!({
                "data": [{ "id": 1, "first_name": "Ada", "last_name": "Lovelace", "dob": "1815-12-10" }],
                "next_cursor": "page-2"
            })
        }
        ("patients", Some("page-2")) => json!({
            "data": [{ "id": 2, "first_name": "Alan", "last_name": "Turing", "dob": "1912-06-23" }],
            "next_cursor": null
        }),
        ("invoices", None) => json!({
            "data": [
                { "id": "inv-1", "patient_id": 1, "total": "$120.50", "status": "paid" },
                { "id": "inv-2", "patient_id": 2, "total": "80" }
            ],
            "next_cursor": null
        }),
        _ => json!({ "data": [], "next_cursor": null }),
    };
    (StatusCode::OK, Json(body))
}

/// Serve the mock vendor on an ephemeral port; returns its base URL
async fn spawn_vendor(vendor: MockVendor) -> String {
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/v1/:collection", get(list))
        .with_state(vendor);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn credentials(password: &str) -> Credentials {
    Credentials {
        username: Some("frontdesk".to_string()),
        password: Some(password.to_string()),
        api_key: None,
    }
}

#[tokio::test]
async fn test_pager_follows_cursor_until_exhausted() {
    let base_url = spawn_vendor(MockVendor::default()).await;
    let connector = ApiConnector::new(Client::new(), &base_url, ApiVendorSpec::conventional(None));

    connector.login(Some(&credentials("secret"))).await.unwrap();
    let pager = connector.extract_entity(EntityType::Patient).await.unwrap();

    let first = pager.next_page().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].source_id, "1");
    let second = pager.next_page().await.unwrap().unwrap();
    assert_eq!(second[0].source_id, "2");
    assert!(pager.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_token_is_refreshed_mid_pagination() {
    let vendor = MockVendor::default();
    vendor.expire_after_first_page.store(true, Ordering::SeqCst);
    let base_url = spawn_vendor(vendor.clone()).await;
    let connector = ApiConnector::new(Client::new(), &base_url, ApiVendorSpec::conventional(None));

    connector.login(Some(&credentials("secret"))).await.unwrap();
    let pager = connector.extract_entity(EntityType::Patient).await.unwrap();

    let first = pager.next_page().await.unwrap().unwrap();
    assert_eq!(first[0].source_id, "1");
    // The token used for page one is now rejected; the pager logs in again
    let second = pager.next_page().await.unwrap().unwrap();
    assert_eq!(second[0].source_id, "2");
    assert!(pager.next_page().await.unwrap().is_none());
    assert_eq!(vendor.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_listing_is_entity_unavailable() {
    let base_url = spawn_vendor(MockVendor::default()).await;
    let connector = ApiConnector::new(Client::new(), &base_url, ApiVendorSpec::conventional(None));

    connector.login(Some(&credentials("secret"))).await.unwrap();
    let pager = connector.extract_entity(EntityType::Document).await.unwrap();
    assert!(matches!(
        pager.next_page().await,
        Err(ConnectorError::EntityUnavailable(_))
    ));
}

#[tokio::test]
async fn test_discover_reports_missing_listing_as_unavailable() {
    let base_url = spawn_vendor(MockVendor::default()).await;

    let env = TestEnv::new().await;
    let mut registry = ConnectorRegistry::new(
        Client::new(),
        Arc::new(UnavailableAgent),
        Arc::clone(&env.artifacts),
    );
    registry.register_api(SourceVendor::VendorA, ApiVendorSpec::conventional(None));
    let orchestrator = env.orchestrator_with(registry, test_config());
    let caller = env.caller();

    let profile = SourceProfile {
        credentials: Some(credentials("secret")),
        source_url: Some(base_url),
        uploaded_files: vec![],
    };
    let run = orchestrator
        .start_run(&caller, SourceVendor::VendorA, profile)
        .await
        .unwrap();
    let outcomes = run_phases(&orchestrator, &caller, run.id, &[Phase::Connect, Phase::Discover]).await;
    assert_eq!(outcomes[1].run.status, RunStatus::Discovered);

    let discover = match &outcomes[1].output {
        PhaseOutput::Discover(result) => result.clone(),
        other => panic!("unexpected output {:?}", other),
    };
    assert!(discover.complete);
    let document = discover
        .entities
        .iter()
        .find(|e| e.entity_type == EntityType::Document)
        .unwrap();
    assert!(!document.available);
    assert!(!discover.extracted.contains_key(&EntityType::Document));
    assert_eq!(discover.extracted[&EntityType::Patient], 2);

    // Unavailable is not a transient failure, so nothing was retried
    let report = orchestrator.get_report(&caller, run.id).await.unwrap();
    assert!(!report.audit_trail.iter().any(|e| e.action == actions::RETRY));
}

#[tokio::test]
async fn test_bad_credentials_are_an_auth_error() {
    let base_url = spawn_vendor(MockVendor::default()).await;
    let connector = ApiConnector::new(Client::new(), &base_url, ApiVendorSpec::conventional(None));

    let err = connector.login(Some(&credentials("wrong"))).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Auth(_)));

    // Listing before a successful login is refused locally
    assert!(matches!(
        connector.extract_entity(EntityType::Patient).await,
        Err(ConnectorError::Auth(_))
    ));
}

#[tokio::test]
async fn test_api_run_retries_transient_failure_and_completes() {
    let vendor = MockVendor::default();
    vendor.patient_failures.store(1, Ordering::SeqCst);
    let base_url = spawn_vendor(vendor.clone()).await;

    let env = TestEnv::new().await;
    let mut registry = ConnectorRegistry::new(
        Client::new(),
        Arc::new(UnavailableAgent),
        Arc::clone(&env.artifacts),
    );
    registry.register_api(SourceVendor::VendorA, ApiVendorSpec::conventional(None));
    let orchestrator = env.orchestrator_with(registry, test_config());
    let caller = env.caller();

    let profile = SourceProfile {
        credentials: Some(credentials("secret")),
        source_url: Some(base_url),
        uploaded_files: vec![],
    };
    let run = orchestrator
        .start_run(&caller, SourceVendor::VendorA, profile)
        .await
        .unwrap();
    assert_eq!(run.ingestion_strategy, IngestionStrategy::Api);

    prepare_to_transform(&orchestrator, &caller, run.id).await;
    let outcomes = run_phases(
        &orchestrator,
        &caller,
        run.id,
        &[Phase::Transform, Phase::Validate, Phase::Promote],
    )
    .await;
    assert_eq!(outcomes[2].run.status, RunStatus::Completed);

    let report = orchestrator.get_report(&caller, run.id).await.unwrap();
    let retries: Vec<_> = report
        .audit_trail
        .iter()
        .filter(|e| e.action == actions::RETRY)
        .collect();
    assert_eq!(retries.len(), 1);
    assert!(retries[0].actor_id.is_none());
    assert_eq!(retries[0].phase, Some(Phase::Discover));
    assert_eq!(retries[0].metadata["operation"], "extract_patient");

    let discover = report.run.progress.discover_result.unwrap();
    assert_eq!(discover.extracted[&EntityType::Patient], 2);
    assert_eq!(discover.extracted[&EntityType::Invoice], 2);

    let invoice = staging::load_record(&env.pool, run.id, EntityType::Invoice, "inv-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, RecordStatus::Promoted);
    assert_eq!(invoice.payload["totalCents"], json!(12050));
    assert_eq!(invoice.payload["patientSourceId"], json!("1"));
    assert!(vendor.list_calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_persistent_vendor_failure_fails_connect() {
    let base_url = spawn_vendor(MockVendor::default()).await;

    let env = TestEnv::new().await;
    let mut registry = ConnectorRegistry::new(
        Client::new(),
        Arc::new(UnavailableAgent),
        Arc::clone(&env.artifacts),
    );
    registry.register_api(SourceVendor::VendorA, ApiVendorSpec::conventional(None));
    let orchestrator = env.orchestrator_with(registry, test_config());
    let caller = env.caller();

    let profile = SourceProfile {
        credentials: Some(credentials("wrong")),
        source_url: Some(base_url),
        uploaded_files: vec![],
    };
    let run = orchestrator
        .start_run(&caller, SourceVendor::VendorA, profile)
        .await
        .unwrap();

    let err = orchestrator
        .run_phase(&caller, run.id, Phase::Connect)
        .await
        .unwrap_err();
    assert!(matches!(err, cmig_migrate::MigrationError::VendorConnection(_)));

    let report = orchestrator.get_report(&caller, run.id).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Failed);
    // Auth failures are retried up to the attempt limit before escalating
    let retries = report
        .audit_trail
        .iter()
        .filter(|e| e.action == actions::RETRY)
        .count();
    assert_eq!(retries, 2);
    assert!(report.run.progress.connect_result.is_none());

    match orchestrator.run_phase(&caller, run.id, Phase::Connect).await {
        Err(cmig_migrate::MigrationError::Precondition(_)) => {}
        other => panic!("expected precondition, got {:?}", other.map(|o| o.output)),
    }
}

#[tokio::test]
async fn test_connect_reports_attempts() {
    let base_url = spawn_vendor(MockVendor::default()).await;

    let env = TestEnv::new().await;
    let mut registry = ConnectorRegistry::new(
        Client::new(),
        Arc::new(UnavailableAgent),
        Arc::clone(&env.artifacts),
    );
    registry.register_api(SourceVendor::VendorA, ApiVendorSpec::conventional(None));
    let orchestrator = env.orchestrator_with(registry, test_config());
    let caller = env.caller();

    let run = orchestrator
        .start_run(
            &caller,
            SourceVendor::VendorA,
            SourceProfile {
                credentials: Some(credentials("secret")),
                source_url: Some(base_url),
                uploaded_files: vec![],
            },
        )
        .await
        .unwrap();

    let outcome = orchestrator
        .run_phase(&caller, run.id, Phase::Connect)
        .await
        .unwrap();
    match outcome.output {
        PhaseOutput::Connect(result) => {
            assert_eq!(result.strategy, IngestionStrategy::Api);
            assert_eq!(result.attempts, 1);
        }
        other => panic!("unexpected output {:?}", other),
    }
}
