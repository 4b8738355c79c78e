//! Vendor connectors
//!
//! A connector turns one source platform into raw vendor records. Three
//! variants exist (API, browser automation, file upload); the orchestrator
//! only ever sees the `VendorConnector` trait. Vendors are added by
//! registering an API spec or a navigation script with the
//! `ConnectorRegistry`, never by branching in the orchestrator.

pub mod api;
pub mod browser;
pub mod registry;
pub mod scripts;
pub mod upload;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{Credentials, DiscoveredEntity, EntityType, IngestionStrategy};

pub use api::{ApiConnector, ApiEntityEndpoint, ApiVendorSpec};
pub use browser::{BrowserConnector, HttpNavigationAgent, NavigationAgent, UnavailableAgent};
pub use registry::ConnectorRegistry;
pub use scripts::{EntityScript, VendorScript};
pub use upload::UploadConnector;

/// Connector failures (all surface as VendorConnectionError once retries are spent)
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Vendor call exceeded deadline of {0} ms")]
    Timeout(u64),

    #[error("Unexpected vendor response: {0}")]
    Protocol(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The source has no listing for an entity type it was expected to offer
    #[error("Entity type unavailable: {0}")]
    EntityUnavailable(String),
}

impl ConnectorError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Auth(_)
                | ConnectorError::Network(_)
                | ConnectorError::Navigation(_)
                | ConnectorError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectorError::Timeout(0)
        } else if err.is_decode() {
            ConnectorError::Protocol(err.to_string())
        } else {
            ConnectorError::Network(err.to_string())
        }
    }
}

/// One vendor-shaped record as extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub source_id: String,
    pub entity_type: EntityType,
    pub data: Map<String, Value>,
    pub extracted_at: DateTime<Utc>,
}

impl RawRecord {
    /// Build from a JSON object, reading the id from `id_field`
    ///
    /// Returns None when the value is not an object or has no usable id.
    pub fn from_value(entity_type: EntityType, id_field: &str, value: Value) -> Option<Self> {
        let Value::Object(data) = value else {
            return None;
        };
        let source_id = match data.get(id_field)? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            source_id,
            entity_type,
            data,
            extracted_at: Utc::now(),
        })
    }
}

/// Page-wise extraction of one entity type
///
/// Finite and not restartable: a fresh `extract_entity` call starts over.
/// The cursor only advances after a page is returned successfully, so a
/// failed `next_page` may be retried.
#[async_trait]
pub trait RecordPager: Send + Sync {
    /// Next page of records, or None when the extraction is exhausted
    async fn next_page(&self) -> Result<Option<Vec<RawRecord>>, ConnectorError>;
}

/// Capability set shared by every connector variant
#[async_trait]
pub trait VendorConnector: Send + Sync {
    fn strategy(&self) -> IngestionStrategy;

    async fn login(&self, credentials: Option<&Credentials>) -> Result<(), ConnectorError>;

    async fn discover_entities(&self) -> Result<Vec<DiscoveredEntity>, ConnectorError>;

    /// Whether pagers for different entity types may run at the same time
    ///
    /// False for connectors whose pagers share one session cursor.
    fn parallel_extraction(&self) -> bool {
        true
    }

    async fn extract_entity(
        &self,
        entity_type: EntityType,
    ) -> Result<Box<dyn RecordPager + '_>, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_record_accepts_numeric_ids() {
        let record =
            RawRecord::from_value(EntityType::Patient, "id", json!({"id": 42, "name": "A"})).unwrap();
        assert_eq!(record.source_id, "42");
    }

    #[test]
    fn test_raw_record_rejects_missing_or_blank_id() {
        assert!(RawRecord::from_value(EntityType::Patient, "id", json!({"name": "A"})).is_none());
        assert!(RawRecord::from_value(EntityType::Patient, "id", json!({"id": " "})).is_none());
        assert!(RawRecord::from_value(EntityType::Patient, "id", json!([1, 2])).is_none());
    }

    #[test]
    fn test_parse_errors_are_permanent() {
        assert!(!ConnectorError::Parse("x".into()).is_retryable());
        assert!(ConnectorError::Timeout(10).is_retryable());
        assert!(!ConnectorError::EntityUnavailable("charts".into()).is_retryable());
    }
}
