//! API connector
//!
//! Talks to a vendor's documented REST API as described by a declarative
//! `ApiVendorSpec`: optional token login, then cursor-paginated list
//! endpoints returning `{ data: [...], next_cursor: "..." | null }`.
//!
//! A token rejected mid-extraction triggers one fresh login with the
//! credentials of the last successful one. A 404 on the first page of a
//! listing means the vendor does not offer that entity type.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::{ConnectorError, RawRecord, RecordPager, VendorConnector};
use crate::models::{Credentials, DiscoveredEntity, EntityType, IngestionStrategy};

/// One list endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEntityEndpoint {
    pub entity_type: EntityType,
    /// Path relative to the base URL
    pub path: String,
    /// Field carrying the vendor-native id
    pub id_field: String,
}

/// How to talk to one vendor's API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiVendorSpec {
    /// Used when the run's source profile carries no URL
    pub base_url: Option<String>,
    /// Token endpoint; None means the API key is sent as the bearer token
    pub login_path: Option<String>,
    pub token_field: String,
    pub cursor_param: String,
    pub data_field: String,
    pub next_cursor_field: String,
    pub endpoints: Vec<ApiEntityEndpoint>,
}

impl ApiVendorSpec {
    /// Conventional REST layout: `/auth/login`, `/v1/<entity>s`, `cursor` pagination
    pub fn conventional(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url.map(str::to_string),
            login_path: Some("/auth/login".to_string()),
            token_field: "access_token".to_string(),
            cursor_param: "cursor".to_string(),
            data_field: "data".to_string(),
            next_cursor_field: "next_cursor".to_string(),
            endpoints: EntityType::PROMOTION_ORDER
                .into_iter()
                .map(|entity_type| ApiEntityEndpoint {
                    entity_type,
                    path: format!("/v1/{}s", entity_type.as_str()),
                    id_field: "id".to_string(),
                })
                .collect(),
        }
    }

    fn endpoint(&self, entity_type: EntityType) -> Option<&ApiEntityEndpoint> {
        self.endpoints.iter().find(|e| e.entity_type == entity_type)
    }
}

pub struct ApiConnector {
    client: Client,
    base_url: String,
    spec: ApiVendorSpec,
    token: RwLock<Option<String>>,
    /// Kept from the last successful login for token refresh
    credentials: RwLock<Option<Credentials>>,
}

impl ApiConnector {
    pub fn new(client: Client, base_url: &str, spec: ApiVendorSpec) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            spec,
            token: RwLock::new(None),
            credentials: RwLock::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, ConnectorError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectorError::Auth("not logged in".to_string()))
    }

    /// Obtain a token for `credentials` without touching the stored state
    async fn request_token(&self, credentials: &Credentials) -> Result<String, ConnectorError> {
        let Some(path) = &self.spec.login_path else {
            return credentials
                .api_key
                .clone()
                .ok_or_else(|| ConnectorError::Auth("API key required".to_string()));
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&serde_json::json!({
                "username": credentials.username,
                "password": credentials.password,
                "api_key": credentials.api_key,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "login"));
        }
        let body: Value = response.json().await?;
        body.get(&self.spec.token_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorError::Protocol(format!("login response has no '{}'", self.spec.token_field))
            })
    }

    /// Log in again after the vendor rejected `stale`
    ///
    /// Concurrent pagers that hit the same expiry share one new token.
    async fn refresh_token(&self, stale: &str) -> Result<String, ConnectorError> {
        let mut token = self.token.write().await;
        if let Some(current) = token.as_deref() {
            if current != stale {
                return Ok(current.to_string());
            }
        }
        let credentials = self
            .credentials
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectorError::Auth("not logged in".to_string()))?;

        let fresh = self.request_token(&credentials).await?;
        *token = Some(fresh.clone());
        tracing::debug!(base_url = %self.base_url, "API token refreshed");
        Ok(fresh)
    }
}

/// Classify a non-success HTTP status
fn status_error(status: StatusCode, context: &str) -> ConnectorError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ConnectorError::Auth(format!("{} rejected with {}", context, status))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ConnectorError::Network(format!("{} returned {}", context, status))
    } else {
        ConnectorError::Protocol(format!("{} returned {}", context, status))
    }
}

#[async_trait]
impl VendorConnector for ApiConnector {
    fn strategy(&self) -> IngestionStrategy {
        IngestionStrategy::Api
    }

    async fn login(&self, credentials: Option<&Credentials>) -> Result<(), ConnectorError> {
        let credentials =
            credentials.ok_or_else(|| ConnectorError::Auth("no credentials supplied".to_string()))?;

        let token = self.request_token(credentials).await?;

        *self.token.write().await = Some(token);
        *self.credentials.write().await = Some(credentials.clone());
        tracing::debug!(base_url = %self.base_url, "API login succeeded");
        Ok(())
    }

    async fn discover_entities(&self) -> Result<Vec<DiscoveredEntity>, ConnectorError> {
        self.bearer().await?;
        Ok(EntityType::PROMOTION_ORDER
            .into_iter()
            .map(|entity_type| DiscoveredEntity {
                entity_type,
                available: self.spec.endpoint(entity_type).is_some(),
                access_method: "api".to_string(),
            })
            .collect())
    }

    async fn extract_entity(
        &self,
        entity_type: EntityType,
    ) -> Result<Box<dyn RecordPager + '_>, ConnectorError> {
        let endpoint = self.spec.endpoint(entity_type).ok_or_else(|| {
            ConnectorError::Unsupported(format!("no API endpoint for {}", entity_type))
        })?;
        self.bearer().await?;

        Ok(Box::new(ApiPager {
            connector: self,
            url: format!("{}{}", self.base_url, endpoint.path),
            entity_type,
            id_field: &endpoint.id_field,
            cursor: Mutex::new(CursorState::Start),
        }))
    }
}

#[derive(Debug, Clone)]
enum CursorState {
    Start,
    Next(String),
    Done,
}

struct ApiPager<'a> {
    connector: &'a ApiConnector,
    url: String,
    entity_type: EntityType,
    id_field: &'a str,
    cursor: Mutex<CursorState>,
}

impl ApiPager<'_> {
    async fn fetch(&self, token: &str, cursor: Option<&str>) -> Result<Response, ConnectorError> {
        let spec = &self.connector.spec;
        let mut request = self.connector.client.get(&self.url).bearer_auth(token);
        if let Some(value) = cursor {
            request = request.query(&[(spec.cursor_param.as_str(), value)]);
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl RecordPager for ApiPager<'_> {
    async fn next_page(&self) -> Result<Option<Vec<RawRecord>>, ConnectorError> {
        let mut cursor = self.cursor.lock().await;
        let position = match &*cursor {
            CursorState::Done => return Ok(None),
            CursorState::Start => None,
            CursorState::Next(value) => Some(value.clone()),
        };

        let token = self.connector.bearer().await?;
        let mut response = self.fetch(&token, position.as_deref()).await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::debug!(url = %self.url, %status, "Token rejected, logging in again");
            let token = self.connector.refresh_token(&token).await?;
            response = self.fetch(&token, position.as_deref()).await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && position.is_none() {
            return Err(ConnectorError::EntityUnavailable(format!(
                "{} returned {}",
                self.url, status
            )));
        }
        if !status.is_success() {
            return Err(status_error(status, &self.url));
        }
        let mut body: Value = response.json().await?;

        let spec = &self.connector.spec;
        let items = match body.get_mut(&spec.data_field).map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ConnectorError::Protocol(format!(
                    "page has no '{}' array",
                    spec.data_field
                )))
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let record = RawRecord::from_value(self.entity_type, self.id_field, item)
                .ok_or_else(|| {
                    ConnectorError::Parse(format!(
                        "{} record without '{}'",
                        self.entity_type, self.id_field
                    ))
                })?;
            records.push(record);
        }

        // Advance only after the whole page parsed
        *cursor = match body.get(&spec.next_cursor_field).and_then(Value::as_str) {
            Some(next) if !next.is_empty() => CursorState::Next(next.to_string()),
            _ => CursorState::Done,
        };

        Ok(Some(records))
    }
}
