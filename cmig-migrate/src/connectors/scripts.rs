//! Navigation scripts for browser-automated vendors
//!
//! A script is data, not code: natural-language instructions handed to the
//! navigation agent. Placeholders `{url}`, `{username}` and `{password}` are
//! filled from the run's source profile at login time.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{EntityType, SourceVendor};

/// Extraction instructions for one entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityScript {
    pub entity_type: EntityType,
    /// Brings the agent to the first page of the listing
    pub navigate: String,
    /// Passed with the extraction schema on every page
    pub extract: String,
    /// Advances to the following page while `hasNextPage` is true
    pub next_page: String,
    pub id_field: String,
}

/// Login steps and per-entity instructions for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorScript {
    pub vendor: SourceVendor,
    /// Regex over the source URL identifying the platform
    pub url_pattern: Option<String>,
    pub login_steps: Vec<String>,
    pub entities: Vec<EntityScript>,
}

impl VendorScript {
    /// Script used for platforms without a dedicated entry
    pub fn generic() -> Self {
        Self {
            vendor: SourceVendor::Other("generic".to_string()),
            url_pattern: None,
            login_steps: vec![
                "Open {url}".to_string(),
                "Sign in with username {username} and password {password}".to_string(),
                "Dismiss any welcome or announcement dialogs".to_string(),
            ],
            entities: EntityType::PROMOTION_ORDER
                .into_iter()
                .map(|entity_type| generic_entity(entity_type, entity_label(entity_type)))
                .collect(),
        }
    }

    /// Dedicated script for VendorB's clinic portal
    pub fn vendor_b() -> Self {
        Self {
            vendor: SourceVendor::VendorB,
            url_pattern: Some(r"^https?://([a-z0-9-]+\.)*vendorb\.example(/|$)".to_string()),
            login_steps: vec![
                "Open {url}/login".to_string(),
                "Type {username} into the Email field and {password} into the Password field, then press Log In".to_string(),
                "If a location picker appears, choose the first location".to_string(),
            ],
            entities: vec![
                portal_entity(EntityType::Patient, "Clients", "client"),
                portal_entity(EntityType::Appointment, "Calendar > List view", "appointment"),
                portal_entity(EntityType::Chart, "Charts", "chart entry"),
                portal_entity(EntityType::Invoice, "Sales > Invoices", "invoice"),
                portal_entity(EntityType::Photo, "Clients > Photos", "photo"),
                portal_entity(EntityType::Consent, "Forms > Signed", "signed form"),
            ],
        }
    }

    pub fn entity(&self, entity_type: EntityType) -> Option<&EntityScript> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }

    /// Login steps with placeholders filled in
    pub fn render_login(&self, url: &str, username: &str, password: &str) -> Vec<String> {
        self.login_steps
            .iter()
            .map(|step| {
                step.replace("{url}", url.trim_end_matches('/'))
                    .replace("{username}", username)
                    .replace("{password}", password)
            })
            .collect()
    }
}

fn entity_label(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Patient => "patients or clients",
        EntityType::Appointment => "appointments",
        EntityType::Chart => "chart notes or treatment records",
        EntityType::Invoice => "invoices",
        EntityType::Photo => "client photos",
        EntityType::Consent => "signed consent forms",
        EntityType::Document => "client documents",
    }
}

fn generic_entity(entity_type: EntityType, label: &str) -> EntityScript {
    EntityScript {
        entity_type,
        navigate: format!("Find the list of {} and open it", label),
        extract: format!(
            "Extract every {} row visible on this page with all visible columns and its identifier",
            label
        ),
        next_page: "Go to the next page of the list".to_string(),
        id_field: "id".to_string(),
    }
}

fn portal_entity(entity_type: EntityType, menu: &str, noun: &str) -> EntityScript {
    EntityScript {
        entity_type,
        navigate: format!("Open {} from the main menu", menu),
        extract: format!("Extract each {} row on this page including its id", noun),
        next_page: "Click the Next button below the table".to_string(),
        id_field: "id".to_string(),
    }
}

/// Schema sent with every extract request
pub fn page_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "records": {
                "type": "array",
                "items": { "type": "object" }
            },
            "hasNextPage": { "type": "boolean" }
        },
        "required": ["records", "hasNextPage"]
    })
}
