//! Connector registry
//!
//! Resolved once at startup: the HTTP client, navigation agent and artifact
//! store, plus the per-vendor API specs and navigation scripts. Adding a
//! vendor means registering an entry here.

use regex::Regex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    ApiConnector, ApiVendorSpec, BrowserConnector, ConnectorError, NavigationAgent,
    UploadConnector, VendorConnector, VendorScript,
};
use crate::artifacts::ArtifactStore;
use crate::models::{IngestionStrategy, SourceProfile, SourceVendor};
use crate::strategy::{self, VendorCatalog};

pub struct ConnectorRegistry {
    http: Client,
    agent: Arc<dyn NavigationAgent>,
    artifacts: Arc<dyn ArtifactStore>,
    api_specs: HashMap<SourceVendor, ApiVendorSpec>,
    scripts: HashMap<SourceVendor, VendorScript>,
    generic_script: VendorScript,
    catalog: VendorCatalog,
}

impl ConnectorRegistry {
    /// Empty registry: upload always works, browser falls back to the generic script
    pub fn new(
        http: Client,
        agent: Arc<dyn NavigationAgent>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            http,
            agent,
            artifacts,
            api_specs: HashMap::new(),
            scripts: HashMap::new(),
            generic_script: VendorScript::generic(),
            catalog: VendorCatalog::new(),
        }
    }

    /// Registry with the vendors supported out of the box
    pub fn with_builtin_vendors(
        http: Client,
        agent: Arc<dyn NavigationAgent>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self, regex::Error> {
        let mut registry = Self::new(http, agent, artifacts);
        registry.register_api(
            SourceVendor::VendorA,
            ApiVendorSpec::conventional(Some("https://api.vendora.example")),
        );
        registry.register_script(VendorScript::vendor_b())?;
        registry.register_browser_platform(
            SourceVendor::Other("KnownBrowserPlatform".to_string()),
            r"^https?://([a-z0-9-]+\.)*known-browser-platform\.example(/|$)",
        )?;
        Ok(registry)
    }

    pub fn register_api(&mut self, vendor: SourceVendor, spec: ApiVendorSpec) {
        self.catalog.add_api_vendor(vendor.clone());
        self.api_specs.insert(vendor, spec);
    }

    pub fn register_script(&mut self, script: VendorScript) -> Result<(), regex::Error> {
        if let Some(pattern) = &script.url_pattern {
            self.catalog
                .add_browser_platform(script.vendor.clone(), Regex::new(pattern)?);
        }
        self.scripts.insert(script.vendor.clone(), script);
        Ok(())
    }

    /// Known platform driven by the generic script
    pub fn register_browser_platform(
        &mut self,
        vendor: SourceVendor,
        url_pattern: &str,
    ) -> Result<(), regex::Error> {
        self.catalog.add_browser_platform(vendor, Regex::new(url_pattern)?);
        Ok(())
    }

    pub fn catalog(&self) -> &VendorCatalog {
        &self.catalog
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        Arc::clone(&self.artifacts)
    }

    /// Strategy for a new run
    pub fn resolve_strategy(
        &self,
        vendor: &SourceVendor,
        profile: &SourceProfile,
    ) -> IngestionStrategy {
        strategy::resolve(
            &self.catalog,
            vendor,
            profile.has_credentials(),
            profile.has_uploaded_files(),
            profile.source_url(),
        )
    }

    fn script_for(&self, vendor: &SourceVendor, url: &str) -> &VendorScript {
        self.scripts
            .get(vendor)
            .or_else(|| {
                self.catalog
                    .browser_platform_for(url)
                    .and_then(|platform| self.scripts.get(platform))
            })
            .unwrap_or(&self.generic_script)
    }

    /// Connector for the strategy persisted on a run
    pub fn build(
        &self,
        vendor: &SourceVendor,
        strategy: IngestionStrategy,
        profile: &SourceProfile,
    ) -> Result<Box<dyn VendorConnector>, ConnectorError> {
        match strategy {
            IngestionStrategy::Upload => Ok(Box::new(UploadConnector::new(
                self.artifacts(),
                profile.uploaded_files.clone(),
            ))),
            IngestionStrategy::Api => {
                let spec = self.api_specs.get(vendor).ok_or_else(|| {
                    ConnectorError::Unsupported(format!("no API registered for {}", vendor))
                })?;
                let base_url = profile
                    .source_url()
                    .or(spec.base_url.as_deref())
                    .ok_or_else(|| {
                        ConnectorError::Unsupported(format!("no API base URL for {}", vendor))
                    })?;
                Ok(Box::new(ApiConnector::new(
                    self.http.clone(),
                    base_url,
                    spec.clone(),
                )))
            }
            IngestionStrategy::Browser => {
                let url = profile.source_url().ok_or_else(|| {
                    ConnectorError::Unsupported("browser strategy needs a source URL".to_string())
                })?;
                Ok(Box::new(BrowserConnector::new(
                    Arc::clone(&self.agent),
                    self.script_for(vendor, url).clone(),
                    url,
                )))
            }
        }
    }
}
