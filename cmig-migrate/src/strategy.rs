//! Ingestion strategy resolution
//!
//! Pure decision over the vendor catalog: which connector variant a run uses.
//! First match wins:
//! 1. uploaded files present → upload
//! 2. known API vendor with credentials → api
//! 3. source URL on a known browser-automatable platform with credentials → browser
//! 4. credentials and any source URL → browser
//! 5. otherwise → upload

use regex::Regex;
use std::collections::BTreeSet;

use crate::models::{IngestionStrategy, SourceVendor};

/// Vendors with a documented API and platforms a navigation agent can drive
#[derive(Debug, Clone, Default)]
pub struct VendorCatalog {
    api_vendors: BTreeSet<SourceVendor>,
    browser_platforms: Vec<(SourceVendor, Regex)>,
}

impl VendorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_api_vendor(&mut self, vendor: SourceVendor) {
        self.api_vendors.insert(vendor);
    }

    pub fn add_browser_platform(&mut self, vendor: SourceVendor, url_pattern: Regex) {
        self.browser_platforms.push((vendor, url_pattern));
    }

    pub fn is_api_vendor(&self, vendor: &SourceVendor) -> bool {
        self.api_vendors.contains(vendor)
    }

    /// Vendor whose platform pattern matches `url`, if any
    pub fn browser_platform_for(&self, url: &str) -> Option<&SourceVendor> {
        self.browser_platforms
            .iter()
            .find(|(_, pattern)| pattern.is_match(url))
            .map(|(vendor, _)| vendor)
    }
}

/// Select the connector variant for a run
///
/// Deterministic and total. Blank URLs count as absent.
pub fn resolve(
    catalog: &VendorCatalog,
    vendor: &SourceVendor,
    has_credentials: bool,
    has_uploaded_files: bool,
    source_url: Option<&str>,
) -> IngestionStrategy {
    let source_url = source_url.map(str::trim).filter(|u| !u.is_empty());

    if has_uploaded_files {
        return IngestionStrategy::Upload;
    }
    if has_credentials && catalog.is_api_vendor(vendor) {
        return IngestionStrategy::Api;
    }
    match source_url {
        Some(url) if has_credentials && catalog.browser_platform_for(url).is_some() => {
            IngestionStrategy::Browser
        }
        Some(_) if has_credentials => IngestionStrategy::Browser,
        _ => IngestionStrategy::Upload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> VendorCatalog {
        let mut catalog = VendorCatalog::new();
        catalog.add_api_vendor(SourceVendor::VendorA);
        catalog.add_browser_platform(
            SourceVendor::VendorB,
            Regex::new(r"^https?://([a-z0-9-]+\.)*vendorb\.example(/|$)").unwrap(),
        );
        catalog
    }

    #[test]
    fn test_upload_always_wins() {
        let strategy = resolve(
            &catalog(),
            &SourceVendor::VendorA,
            true,
            true,
            Some("https://app.vendorb.example"),
        );
        assert_eq!(strategy, IngestionStrategy::Upload);
    }

    #[test]
    fn test_api_vendor_requires_credentials() {
        let catalog = catalog();
        assert_eq!(
            resolve(&catalog, &SourceVendor::VendorA, true, false, None),
            IngestionStrategy::Api
        );
        assert_eq!(
            resolve(&catalog, &SourceVendor::VendorA, false, false, None),
            IngestionStrategy::Upload
        );
    }

    #[test]
    fn test_blank_url_is_treated_as_absent() {
        let strategy = resolve(
            &catalog(),
            &SourceVendor::Other("Unknown".into()),
            true,
            false,
            Some("  "),
        );
        assert_eq!(strategy, IngestionStrategy::Upload);
    }

    #[test]
    fn test_platform_lookup_by_url() {
        let catalog = catalog();
        assert_eq!(
            catalog.browser_platform_for("https://clinic.vendorb.example/login"),
            Some(&SourceVendor::VendorB)
        );
        assert!(catalog.browser_platform_for("https://vendorb.example.evil.test").is_none());
    }
}
