//! Browser-automation connector
//!
//! Drives an external navigation agent through a `VendorScript`. The agent
//! speaks two requests: `act` (perform an instruction) and `extract`
//! (return JSON matching a schema). Its internals are out of our hands; all
//! we rely on is the `{records, hasNextPage}` page shape.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::scripts::{page_schema, EntityScript, VendorScript};
use super::{ConnectorError, RawRecord, RecordPager, VendorConnector};
use crate::models::{Credentials, DiscoveredEntity, EntityType, IngestionStrategy};

/// Upper bound on pages per extraction; an agent stuck on `hasNextPage` fails instead of looping
const MAX_PAGES: u32 = 10_000;

/// Remote navigation agent
#[async_trait]
pub trait NavigationAgent: Send + Sync {
    async fn act(&self, instruction: &str) -> Result<(), ConnectorError>;

    async fn extract(&self, instruction: &str, schema: &Value) -> Result<Value, ConnectorError>;
}

/// Agent reached over HTTP (`POST /act`, `POST /extract`)
pub struct HttpNavigationAgent {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpNavigationAgent {
    pub fn new(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response, ConnectorError> {
        let mut request = self.client.post(format!("{}{}", self.base_url, path)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.is_server_error() {
            Err(ConnectorError::Network(format!("agent {} returned {}", path, status)))
        } else {
            Err(ConnectorError::Navigation(format!("agent {} returned {}", path, status)))
        }
    }
}

#[async_trait]
impl NavigationAgent for HttpNavigationAgent {
    async fn act(&self, instruction: &str) -> Result<(), ConnectorError> {
        self.post("/act", json!({ "action": instruction })).await?;
        Ok(())
    }

    async fn extract(&self, instruction: &str, schema: &Value) -> Result<Value, ConnectorError> {
        let response = self
            .post(
                "/extract",
                json!({ "instruction": instruction, "extractionSchema": schema }),
            )
            .await?;
        Ok(response.json().await?)
    }
}

/// Stand-in when no agent endpoint is configured
#[derive(Debug, Default)]
pub struct UnavailableAgent;

#[async_trait]
impl NavigationAgent for UnavailableAgent {
    async fn act(&self, _instruction: &str) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported(
            "no navigation agent configured".to_string(),
        ))
    }

    async fn extract(&self, _instruction: &str, _schema: &Value) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unsupported(
            "no navigation agent configured".to_string(),
        ))
    }
}

pub struct BrowserConnector {
    agent: Arc<dyn NavigationAgent>,
    script: VendorScript,
    source_url: String,
}

impl BrowserConnector {
    pub fn new(agent: Arc<dyn NavigationAgent>, script: VendorScript, source_url: &str) -> Self {
        Self {
            agent,
            script,
            source_url: source_url.to_string(),
        }
    }
}

#[async_trait]
impl VendorConnector for BrowserConnector {
    fn strategy(&self) -> IngestionStrategy {
        IngestionStrategy::Browser
    }

    /// Every pager drives the same agent session
    fn parallel_extraction(&self) -> bool {
        false
    }

    async fn login(&self, credentials: Option<&Credentials>) -> Result<(), ConnectorError> {
        let credentials =
            credentials.ok_or_else(|| ConnectorError::Auth("no credentials supplied".to_string()))?;
        let steps = self.script.render_login(
            &self.source_url,
            credentials.username.as_deref().unwrap_or_default(),
            credentials.password.as_deref().unwrap_or_default(),
        );

        for (index, step) in steps.iter().enumerate() {
            // Rendered steps carry the password; log the position only
            tracing::debug!(vendor = %self.script.vendor, step = index + 1, "Login step");
            self.agent.act(step).await?;
        }
        Ok(())
    }

    async fn discover_entities(&self) -> Result<Vec<DiscoveredEntity>, ConnectorError> {
        Ok(EntityType::PROMOTION_ORDER
            .into_iter()
            .map(|entity_type| DiscoveredEntity {
                entity_type,
                available: self.script.entity(entity_type).is_some(),
                access_method: "browser".to_string(),
            })
            .collect())
    }

    async fn extract_entity(
        &self,
        entity_type: EntityType,
    ) -> Result<Box<dyn RecordPager + '_>, ConnectorError> {
        let script = self.script.entity(entity_type).ok_or_else(|| {
            ConnectorError::Unsupported(format!("no navigation script for {}", entity_type))
        })?;
        Ok(Box::new(BrowserPager {
            agent: self.agent.as_ref(),
            script,
            schema: page_schema(),
            state: Mutex::new(PagerState::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct PagerState {
    /// Pages handed to the caller
    returned: u32,
    /// Page the agent is currently showing
    positioned_at: Option<u32>,
    has_next: bool,
}

struct BrowserPager<'a> {
    agent: &'a dyn NavigationAgent,
    script: &'a EntityScript,
    schema: Value,
    state: Mutex<PagerState>,
}

#[async_trait]
impl RecordPager for BrowserPager<'_> {
    async fn next_page(&self) -> Result<Option<Vec<RawRecord>>, ConnectorError> {
        let mut state = self.state.lock().await;

        if state.returned > 0 && !state.has_next {
            return Ok(None);
        }
        if state.returned >= MAX_PAGES {
            return Err(ConnectorError::Protocol(format!(
                "{} extraction exceeded {} pages",
                self.script.entity_type, MAX_PAGES
            )));
        }

        // A retried call must not skip a page, so navigation is remembered separately
        let target = state.returned;
        if state.positioned_at != Some(target) {
            let instruction = if target == 0 {
                &self.script.navigate
            } else {
                &self.script.next_page
            };
            self.agent.act(instruction).await?;
            state.positioned_at = Some(target);
        }

        let page = self.agent.extract(&self.script.extract, &self.schema).await?;
        let (records, has_next) = parse_page(self.script, page)?;

        state.returned += 1;
        state.has_next = has_next;
        Ok(Some(records))
    }
}

fn parse_page(script: &EntityScript, page: Value) -> Result<(Vec<RawRecord>, bool), ConnectorError> {
    let Value::Object(mut page) = page else {
        return Err(ConnectorError::Protocol("agent page is not an object".to_string()));
    };
    let has_next = page
        .get("hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let items = match page.remove("records") {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(ConnectorError::Protocol(
                "agent page has no records array".to_string(),
            ))
        }
    };

    let total = items.len();
    let records: Vec<RawRecord> = items
        .into_iter()
        .filter_map(|item| RawRecord::from_value(script.entity_type, &script.id_field, item))
        .collect();
    if records.len() < total {
        tracing::warn!(
            entity_type = %script.entity_type,
            skipped = total - records.len(),
            "Agent returned rows without an identifier"
        );
    }
    Ok((records, has_next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_skips_rows_without_id() {
        let script = VendorScript::generic();
        let entity = script.entity(EntityType::Patient).unwrap();
        let (records, has_next) = parse_page(
            entity,
            json!({"records": [{"id": "p1"}, {"name": "no id"}], "hasNextPage": true}),
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert!(has_next);
    }

    #[test]
    fn test_parse_page_requires_records_array() {
        let script = VendorScript::generic();
        let entity = script.entity(EntityType::Patient).unwrap();
        assert!(matches!(
            parse_page(entity, json!({"hasNextPage": false})),
            Err(ConnectorError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_agent_fails_permanently() {
        let err = UnavailableAgent.act("Open the site").await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
