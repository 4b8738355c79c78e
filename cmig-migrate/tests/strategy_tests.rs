//! Ingestion strategy resolution through the built-in vendor registry

mod helpers;

use cmig_migrate::models::{Credentials, IngestionStrategy, SourceProfile, SourceVendor};

use helpers::{TestEnv, PATIENTS_CSV};

fn credentials() -> Option<Credentials> {
    Some(Credentials {
        username: Some("frontdesk".to_string()),
        password: Some("secret".to_string()),
        api_key: None,
    })
}

fn profile(with_credentials: bool, url: Option<&str>) -> SourceProfile {
    SourceProfile {
        credentials: if with_credentials { credentials() } else { None },
        source_url: url.map(str::to_string),
        uploaded_files: vec![],
    }
}

#[tokio::test]
async fn test_resolution_table() {
    let env = TestEnv::new().await;
    let registry = env.registry();
    let other = |name: &str| SourceVendor::Other(name.to_string());

    let cases = [
        (SourceVendor::VendorA, profile(true, None), IngestionStrategy::Api),
        (SourceVendor::VendorA, profile(false, None), IngestionStrategy::Upload),
        (
            SourceVendor::VendorB,
            profile(true, Some("https://clinic.vendorb.example")),
            IngestionStrategy::Browser,
        ),
        (
            other("UnknownVendor"),
            profile(true, Some("https://known-browser-platform.example")),
            IngestionStrategy::Browser,
        ),
        (
            other("UnknownVendor"),
            profile(true, Some("https://anything.test")),
            IngestionStrategy::Browser,
        ),
        (other("UnknownVendor"), profile(true, Some("   ")), IngestionStrategy::Upload),
        (
            other("UnknownVendor"),
            profile(false, Some("https://anything.test")),
            IngestionStrategy::Upload,
        ),
        (SourceVendor::CsvUpload, profile(false, None), IngestionStrategy::Upload),
    ];

    for (vendor, profile, expected) in cases {
        assert_eq!(
            registry.resolve_strategy(&vendor, &profile),
            expected,
            "{} with {:?}",
            vendor,
            profile.source_url
        );
    }
}

#[tokio::test]
async fn test_uploaded_files_take_precedence_over_api() {
    let env = TestEnv::new().await;
    let registry = env.registry();

    let mut profile = profile(true, Some("https://api.vendora.example"));
    profile
        .uploaded_files
        .push(env.upload_csv(cmig_migrate::models::EntityType::Patient, PATIENTS_CSV).await);

    assert_eq!(
        registry.resolve_strategy(&SourceVendor::VendorA, &profile),
        IngestionStrategy::Upload
    );
}

#[tokio::test]
async fn test_strategy_is_fixed_at_run_start() {
    let env = TestEnv::new().await;
    let orchestrator = env.orchestrator();
    let caller = env.caller();

    let run = orchestrator
        .start_run(&caller, SourceVendor::VendorA, profile(true, None))
        .await
        .unwrap();
    assert_eq!(run.ingestion_strategy, IngestionStrategy::Api);

    let report = orchestrator.get_report(&caller, run.id).await.unwrap();
    assert_eq!(report.run.ingestion_strategy, IngestionStrategy::Api);
    let start = &report.audit_trail[0];
    assert_eq!(start.action, cmig_migrate::models::actions::START_RUN);
    assert_eq!(start.metadata["ingestionStrategy"], "api");
    assert_eq!(start.actor_id.as_deref(), Some("ops@clinic"));
}
