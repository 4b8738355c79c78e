//! Source vendor identity, connection profile and ingestion strategy

use serde::{Deserialize, Serialize};
use std::fmt;

use super::EntityType;

/// Platform the clinic is migrating away from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceVendor {
    VendorA,
    VendorB,
    CsvUpload,
    /// Any vendor without a dedicated registry entry
    Other(String),
}

impl SourceVendor {
    pub fn as_str(&self) -> &str {
        match self {
            SourceVendor::VendorA => "VendorA",
            SourceVendor::VendorB => "VendorB",
            SourceVendor::CsvUpload => "CsvUpload",
            SourceVendor::Other(name) => name,
        }
    }

    /// Parse a vendor identifier; unknown names become `Other`
    pub fn parse(value: &str) -> Self {
        match value {
            "VendorA" => SourceVendor::VendorA,
            "VendorB" => SourceVendor::VendorB,
            "CsvUpload" => SourceVendor::CsvUpload,
            other => SourceVendor::Other(other.to_string()),
        }
    }
}

impl From<String> for SourceVendor {
    fn from(value: String) -> Self {
        SourceVendor::parse(&value)
    }
}

impl From<SourceVendor> for String {
    fn from(value: SourceVendor) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector variant selected for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStrategy {
    Api,
    Browser,
    Upload,
}

impl IngestionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStrategy::Api => "api",
            IngestionStrategy::Browser => "browser",
            IngestionStrategy::Upload => "upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api" => Some(IngestionStrategy::Api),
            "browser" => Some(IngestionStrategy::Browser),
            "upload" => Some(IngestionStrategy::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for IngestionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor account credentials
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        [&self.username, &self.password, &self.api_key]
            .iter()
            .all(|v| v.as_deref().map(str::trim).unwrap_or("").is_empty())
    }
}

// Secrets never reach logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Format of a previously uploaded source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    Csv,
    Json,
    Fhir,
}

/// A file the clinic uploaded to the artifact store ahead of the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    /// Artifact store locator
    pub locator: String,
    pub format: UploadFormat,
    /// Required for CSV/JSON; FHIR bundles carry resource types
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    /// Column/key holding the vendor-native id (default "id")
    #[serde(default)]
    pub id_field: Option<String>,
}

/// Opaque connection profile supplied at run start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProfile {
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub uploaded_files: Vec<UploadedFile>,
}

impl SourceProfile {
    pub fn has_credentials(&self) -> bool {
        self.credentials.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_uploaded_files(&self) -> bool {
        !self.uploaded_files.is_empty()
    }

    /// Source URL, ignoring blank values
    pub fn source_url(&self) -> Option<&str> {
        self.source_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}
