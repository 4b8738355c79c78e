//! Heuristic mapping drafts
//!
//! Matches the field paths observed at discovery against the canonical
//! synonym tables. Names are compared case-insensitively with `_`, `-` and
//! spaces ignored, so `First Name`, `first_name` and `firstName` all match.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::canonical::{canonical_fields, PATIENT_FULL_NAME_FIELD, PATIENT_REF_FIELD};
use crate::models::{DerivedOp, EntityType, FieldMapping, TransformRule, ValueKind};

/// Fields never worth listing as unmapped
const IDENTITY_FIELDS: &[&str] = &["id", "resourcetype", "meta.versionid", "meta.lastupdated"];

/// Drafted mappings plus the source fields nothing consumed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDraft {
    pub field_mappings: Vec<FieldMapping>,
    pub unmapped_fields: BTreeMap<EntityType, Vec<String>>,
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Fallback values for optional status fields the source may lack
fn status_default(entity_type: EntityType) -> Option<&'static str> {
    match entity_type {
        EntityType::Appointment => Some("booked"),
        EntityType::Invoice => Some("open"),
        _ => None,
    }
}

/// Draft field mappings for every entity type with observed fields
pub fn draft_mappings(observed: &BTreeMap<EntityType, BTreeSet<String>>) -> MappingDraft {
    let mut draft = MappingDraft::default();

    for (&entity_type, fields) in observed {
        let by_normal: BTreeMap<String, &String> =
            fields.iter().map(|f| (normalize(f), f)).collect();
        let mut used: BTreeSet<&String> = BTreeSet::new();
        let mut matched: BTreeMap<&'static str, &String> = BTreeMap::new();

        for canonical in canonical_fields(entity_type) {
            let candidates = std::iter::once(canonical.name).chain(canonical.synonyms.iter().copied());
            let Some(source) = candidates.map(normalize).find_map(|n| by_normal.get(&n).copied()) else {
                continue;
            };
            used.insert(source);
            matched.insert(canonical.name, source);

            let rule = match (canonical.name, canonical.kind, status_default(entity_type)) {
                ("status", _, Some(fallback)) => TransformRule::Default {
                    value: json!(fallback),
                },
                (_, ValueKind::String, _) if canonical.name != PATIENT_REF_FIELD => {
                    TransformRule::Rename
                }
                (_, kind, _) => TransformRule::Coerce { to: kind },
            };
            draft.field_mappings.push(FieldMapping {
                entity_type,
                source_field: Some(source.clone()),
                canonical_field: canonical.name.to_string(),
                rule,
            });
        }

        if let Some(fallback) = status_default(entity_type) {
            if !matched.contains_key("status") {
                draft
                    .field_mappings
                    .push(FieldMapping::constant(entity_type, "status", json!(fallback)));
            }
        }

        if entity_type == EntityType::Patient {
            if let (Some(first), Some(last)) = (matched.get("firstName"), matched.get("lastName")) {
                draft.field_mappings.push(FieldMapping {
                    entity_type,
                    source_field: None,
                    canonical_field: PATIENT_FULL_NAME_FIELD.to_string(),
                    rule: TransformRule::Derived {
                        sources: vec![(*first).clone(), (*last).clone()],
                        op: DerivedOp::Concat {
                            separator: " ".to_string(),
                        },
                    },
                });
            }
        }

        let unmapped: Vec<String> = fields
            .iter()
            .filter(|f| !used.contains(f) && !IDENTITY_FIELDS.contains(&normalize(f).as_str()))
            .cloned()
            .collect();
        if !unmapped.is_empty() {
            draft.unmapped_fields.insert(entity_type, unmapped);
        }
    }

    draft
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(entity_type: EntityType, fields: &[&str]) -> BTreeMap<EntityType, BTreeSet<String>> {
        let mut map = BTreeMap::new();
        map.insert(entity_type, fields.iter().map(|f| f.to_string()).collect());
        map
    }

    fn mapping_for<'a>(draft: &'a MappingDraft, canonical: &str) -> Option<&'a FieldMapping> {
        draft.field_mappings.iter().find(|m| m.canonical_field == canonical)
    }

    #[test]
    fn test_patient_synonyms_and_full_name() {
        let draft = draft_mappings(&observed(
            EntityType::Patient,
            &["id", "First Name", "last_name", "DOB", "favourite_colour"],
        ));

        assert_eq!(
            mapping_for(&draft, "firstName").unwrap().source_field.as_deref(),
            Some("First Name")
        );
        assert_eq!(
            mapping_for(&draft, "dateOfBirth").unwrap().rule,
            TransformRule::Coerce { to: ValueKind::Date }
        );
        assert!(matches!(
            mapping_for(&draft, "fullName").unwrap().rule,
            TransformRule::Derived { .. }
        ));
        assert_eq!(
            draft.unmapped_fields[&EntityType::Patient],
            vec!["favourite_colour".to_string()]
        );
    }

    #[test]
    fn test_patient_reference_is_coerced_to_string() {
        let draft = draft_mappings(&observed(EntityType::Appointment, &["id", "patient_id", "start"]));
        assert_eq!(
            mapping_for(&draft, PATIENT_REF_FIELD).unwrap().rule,
            TransformRule::Coerce { to: ValueKind::String }
        );
        // no status column: constant fallback
        let status = mapping_for(&draft, "status").unwrap();
        assert!(status.source_field.is_none());
        assert_eq!(status.rule, TransformRule::Default { value: json!("booked") });
    }

    #[test]
    fn test_fhir_paths_match() {
        let draft = draft_mappings(&observed(
            EntityType::Patient,
            &["id", "name.0.given.0", "name.0.family", "birthDate", "resourceType"],
        ));
        assert!(mapping_for(&draft, "firstName").is_some());
        assert!(mapping_for(&draft, "lastName").is_some());
        assert!(mapping_for(&draft, "dateOfBirth").is_some());
        assert!(draft.unmapped_fields.get(&EntityType::Patient).is_none());
    }

    #[test]
    fn test_draft_is_deterministic() {
        let fields = observed(EntityType::Invoice, &["id", "patient_id", "total", "status"]);
        assert_eq!(draft_mappings(&fields), draft_mappings(&fields));
    }
}
