//! Upload connector
//!
//! Parses files the clinic uploaded ahead of the run (CSV, JSON array, FHIR
//! Bundle). No network calls; files are read from the artifact store by
//! locator and parsed once per connector.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use super::{ConnectorError, RawRecord, RecordPager, VendorConnector};
use crate::artifacts::ArtifactStore;
use crate::models::{
    Credentials, DiscoveredEntity, EntityType, IngestionStrategy, UploadFormat, UploadedFile,
};

const DEFAULT_ID_FIELD: &str = "id";
const PAGE_SIZE: usize = 500;

/// Vendor-id field synthesised from FHIR patient references
const FHIR_PATIENT_ID_FIELD: &str = "patient_id";

pub struct UploadConnector {
    artifacts: Arc<dyn ArtifactStore>,
    files: Vec<UploadedFile>,
    parsed: OnceCell<BTreeMap<EntityType, Vec<RawRecord>>>,
}

impl UploadConnector {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, files: Vec<UploadedFile>) -> Self {
        Self {
            artifacts,
            files,
            parsed: OnceCell::new(),
        }
    }

    async fn records(&self) -> Result<&BTreeMap<EntityType, Vec<RawRecord>>, ConnectorError> {
        self.parsed.get_or_try_init(|| self.parse_all()).await
    }

    async fn parse_all(&self) -> Result<BTreeMap<EntityType, Vec<RawRecord>>, ConnectorError> {
        let mut by_type: BTreeMap<EntityType, Vec<RawRecord>> = BTreeMap::new();

        for file in &self.files {
            let bytes = self.artifacts.get(&file.locator).await.map_err(|e| {
                ConnectorError::Parse(format!("cannot read upload {}: {}", file.locator, e))
            })?;
            let records = parse_file(file, &bytes)?;
            tracing::debug!(
                locator = %file.locator,
                format = ?file.format,
                records = records.len(),
                "Parsed uploaded file"
            );
            for record in records {
                by_type.entry(record.entity_type).or_default().push(record);
            }
        }
        Ok(by_type)
    }
}

#[async_trait]
impl VendorConnector for UploadConnector {
    fn strategy(&self) -> IngestionStrategy {
        IngestionStrategy::Upload
    }

    async fn login(&self, _credentials: Option<&Credentials>) -> Result<(), ConnectorError> {
        if self.files.is_empty() {
            return Err(ConnectorError::Unsupported(
                "no uploaded files to ingest".to_string(),
            ));
        }
        Ok(())
    }

    async fn discover_entities(&self) -> Result<Vec<DiscoveredEntity>, ConnectorError> {
        let records = self.records().await?;
        Ok(EntityType::PROMOTION_ORDER
            .into_iter()
            .map(|entity_type| DiscoveredEntity {
                entity_type,
                available: records.get(&entity_type).is_some_and(|r| !r.is_empty()),
                access_method: "upload".to_string(),
            })
            .collect())
    }

    async fn extract_entity(
        &self,
        entity_type: EntityType,
    ) -> Result<Box<dyn RecordPager + '_>, ConnectorError> {
        let records = self
            .records()
            .await?
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(Box::new(SlicePager {
            records,
            offset: Mutex::new(0),
        }))
    }
}

struct SlicePager<'a> {
    records: &'a [RawRecord],
    offset: Mutex<usize>,
}

#[async_trait]
impl RecordPager for SlicePager<'_> {
    async fn next_page(&self) -> Result<Option<Vec<RawRecord>>, ConnectorError> {
        let mut offset = self.offset.lock().await;
        if *offset >= self.records.len() {
            return Ok(None);
        }
        let end = (*offset + PAGE_SIZE).min(self.records.len());
        let page = self.records[*offset..end].to_vec();
        *offset = end;
        Ok(Some(page))
    }
}

/// Parse one uploaded file into raw records
pub fn parse_file(file: &UploadedFile, bytes: &[u8]) -> Result<Vec<RawRecord>, ConnectorError> {
    let id_field = file.id_field.as_deref().unwrap_or(DEFAULT_ID_FIELD);
    match file.format {
        UploadFormat::Csv => parse_csv(declared_type(file)?, id_field, bytes),
        UploadFormat::Json => parse_json(declared_type(file)?, id_field, bytes),
        UploadFormat::Fhir => parse_fhir_bundle(bytes),
    }
}

fn declared_type(file: &UploadedFile) -> Result<EntityType, ConnectorError> {
    file.entity_type.ok_or_else(|| {
        ConnectorError::Parse(format!(
            "upload {} must declare its entity type",
            file.locator
        ))
    })
}

fn parse_csv(
    entity_type: EntityType,
    id_field: &str,
    bytes: &[u8],
) -> Result<Vec<RawRecord>, ConnectorError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| ConnectorError::Parse(format!("CSV header: {}", e)))?
        .clone();

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| ConnectorError::Parse(format!("CSV row {}: {}", index + 2, e)))?;
        let data: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(header, cell)| (header.to_string(), Value::String(cell.to_string())))
            .collect();
        let record = RawRecord::from_value(entity_type, id_field, Value::Object(data))
            .ok_or_else(|| {
                ConnectorError::Parse(format!("CSV row {} has no '{}'", index + 2, id_field))
            })?;
        records.push(record);
    }
    Ok(records)
}

fn parse_json(
    entity_type: EntityType,
    id_field: &str,
    bytes: &[u8],
) -> Result<Vec<RawRecord>, ConnectorError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ConnectorError::Parse(format!("JSON: {}", e)))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ConnectorError::Parse(
                    "JSON upload must be an array or {\"data\": [...]}".to_string(),
                ))
            }
        },
        _ => {
            return Err(ConnectorError::Parse(
                "JSON upload must be an array".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            RawRecord::from_value(entity_type, id_field, item).ok_or_else(|| {
                ConnectorError::Parse(format!("JSON item {} has no '{}'", index, id_field))
            })
        })
        .collect()
}

fn fhir_entity_type(resource_type: &str) -> Option<EntityType> {
    match resource_type {
        "Patient" => Some(EntityType::Patient),
        "Appointment" => Some(EntityType::Appointment),
        "Encounter" => Some(EntityType::Chart),
        "Invoice" => Some(EntityType::Invoice),
        "Media" => Some(EntityType::Photo),
        "Consent" => Some(EntityType::Consent),
        "DocumentReference" => Some(EntityType::Document),
        _ => None,
    }
}

/// Bare patient id from a FHIR reference such as `Patient/123`
fn patient_reference(resource: &Map<String, Value>) -> Option<String> {
    let direct = ["subject", "patient"]
        .iter()
        .filter_map(|key| resource.get(*key)?.get("reference")?.as_str());
    let participants = resource
        .get("participant")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("actor")?.get("reference")?.as_str());

    direct
        .chain(participants)
        .find_map(|reference| reference.strip_prefix("Patient/"))
        .map(str::to_string)
}

fn parse_fhir_bundle(bytes: &[u8]) -> Result<Vec<RawRecord>, ConnectorError> {
    let bundle: Value =
        serde_json::from_slice(bytes).map_err(|e| ConnectorError::Parse(format!("FHIR: {}", e)))?;
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(ConnectorError::Parse(
            "FHIR upload must be a Bundle".to_string(),
        ));
    }

    let entries = bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for entry in entries {
        let Some(Value::Object(resource)) = entry.get("resource") else {
            skipped += 1;
            continue;
        };
        let Some(entity_type) = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .and_then(fhir_entity_type)
        else {
            skipped += 1;
            continue;
        };
        let Some(source_id) = resource.get("id").and_then(Value::as_str) else {
            return Err(ConnectorError::Parse(format!(
                "FHIR {} resource without id",
                entity_type
            )));
        };

        let mut data = resource.clone();
        if entity_type.references_patient() {
            if let Some(patient_id) = patient_reference(resource) {
                data.insert(FHIR_PATIENT_ID_FIELD.to_string(), Value::String(patient_id));
            }
        }
        records.push(RawRecord {
            source_id: source_id.to_string(),
            entity_type,
            data,
            extracted_at: Utc::now(),
        });
    }

    if skipped > 0 {
        tracing::debug!(skipped, "FHIR entries without a supported resource were ignored");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upload(format: UploadFormat, entity_type: Option<EntityType>) -> UploadedFile {
        UploadedFile {
            locator: "aa/test".to_string(),
            format,
            entity_type,
            id_field: None,
        }
    }

    #[test]
    fn test_csv_rows_become_records_without_blank_cells() {
        let csv = b"id,first_name,last_name,email\n p1 ,Ada,Lovelace,\np2,Alan,Turing,alan@example.com\n";
        let records = parse_file(&upload(UploadFormat::Csv, Some(EntityType::Patient)), csv).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_id, "p1");
        assert!(!records[0].data.contains_key("email"));
        assert_eq!(records[1].data["email"], "alan@example.com");
    }

    #[test]
    fn test_csv_row_without_id_is_a_parse_error() {
        let csv = b"id,first_name\n,Ada\n";
        let err = parse_file(&upload(UploadFormat::Csv, Some(EntityType::Patient)), csv).unwrap_err();
        assert!(matches!(err, ConnectorError::Parse(_)));
    }

    #[test]
    fn test_csv_requires_declared_entity_type() {
        assert!(parse_file(&upload(UploadFormat::Csv, None), b"id\n1\n").is_err());
    }

    #[test]
    fn test_json_accepts_data_envelope() {
        let body = json!({"data": [{"id": 7, "total": "12.50", "patient_id": "p1"}]});
        let records = parse_file(
            &upload(UploadFormat::Json, Some(EntityType::Invoice)),
            body.to_string().as_bytes(),
        )
        .unwrap();
        assert_eq!(records[0].source_id, "7");
    }

    #[test]
    fn test_fhir_bundle_maps_resource_types_and_patient_refs() {
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "p1", "name": [{"given": ["Ada"], "family": "Lovelace"}]}},
                {"resource": {"resourceType": "Encounter", "id": "e1", "subject": {"reference": "Patient/p1"}}},
                {"resource": {"resourceType": "Appointment", "id": "a1",
                    "participant": [{"actor": {"reference": "Practitioner/d1"}}, {"actor": {"reference": "Patient/p1"}}]}},
                {"resource": {"resourceType": "Observation", "id": "o1"}}
            ]
        });
        let records = parse_file(&upload(UploadFormat::Fhir, None), bundle.to_string().as_bytes()).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[1].entity_type, EntityType::Chart);
        assert_eq!(records[1].data["patient_id"], "p1");
        assert_eq!(records[2].data["patient_id"], "p1");
        assert!(!records[0].data.contains_key("patient_id"));
    }
}
