//! Versioned field mapping specifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::EntityType;

/// Target type for a coercion rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
    /// ISO date (YYYY-MM-DD)
    Date,
    /// RFC 3339 timestamp
    DateTime,
    /// Money as integer cents
    Cents,
}

/// Combination applied by a derived rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DerivedOp {
    /// Join non-empty source values with a separator
    Concat { separator: String },
    /// First source with a non-empty value
    FirstNonEmpty,
}

/// How one canonical field is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformRule {
    /// Copy the source value as-is
    Rename,
    /// Convert the source value to a canonical type
    Coerce { to: ValueKind },
    /// Source value when present, else the constant
    Default { value: Value },
    /// Compound field built from several source fields
    Derived { sources: Vec<String>, op: DerivedOp },
}

/// One source field → canonical field rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub entity_type: EntityType,
    /// Dotted path into the raw record (absent for pure constants/derived rules)
    #[serde(default)]
    pub source_field: Option<String>,
    pub canonical_field: String,
    pub rule: TransformRule,
}

impl FieldMapping {
    pub fn rename(entity_type: EntityType, source: &str, canonical: &str) -> Self {
        Self {
            entity_type,
            source_field: Some(source.to_string()),
            canonical_field: canonical.to_string(),
            rule: TransformRule::Rename,
        }
    }

    pub fn coerce(entity_type: EntityType, source: &str, canonical: &str, to: ValueKind) -> Self {
        Self {
            entity_type,
            source_field: Some(source.to_string()),
            canonical_field: canonical.to_string(),
            rule: TransformRule::Coerce { to },
        }
    }

    pub fn constant(entity_type: EntityType, canonical: &str, value: Value) -> Self {
        Self {
            entity_type,
            source_field: None,
            canonical_field: canonical.to_string(),
            rule: TransformRule::Default { value },
        }
    }
}

/// Immutable mapping version for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSpec {
    pub run_id: Uuid,
    /// Strictly increasing per run, starting at 1
    pub version: i64,
    pub field_mappings: Vec<FieldMapping>,
    pub created_at: DateTime<Utc>,
    /// None for system-generated drafts
    pub created_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
}

impl MappingSpec {
    pub fn new(
        run_id: Uuid,
        version: i64,
        field_mappings: Vec<FieldMapping>,
        created_by: Option<String>,
    ) -> Self {
        Self {
            run_id,
            version,
            field_mappings,
            created_at: Utc::now(),
            created_by,
            approved_at: None,
            approved_by: None,
        }
    }

    pub fn mappings_for(&self, entity_type: EntityType) -> impl Iterator<Item = &FieldMapping> {
        self.field_mappings
            .iter()
            .filter(move |m| m.entity_type == entity_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_serialization_is_tagged() {
        let rule = TransformRule::Derived {
            sources: vec!["first".into(), "last".into()],
            op: DerivedOp::Concat {
                separator: " ".into(),
            },
        };
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["kind"], "derived");
        assert_eq!(value["op"]["op"], "concat");

        let coerce: TransformRule =
            serde_json::from_value(json!({"kind": "coerce", "to": "cents"})).unwrap();
        assert_eq!(coerce, TransformRule::Coerce { to: ValueKind::Cents });
    }

    #[test]
    fn test_mappings_for_filters_entity_type() {
        let spec = MappingSpec::new(
            Uuid::new_v4(),
            1,
            vec![
                FieldMapping::rename(EntityType::Patient, "first_name", "firstName"),
                FieldMapping::rename(EntityType::Invoice, "total", "totalCents"),
            ],
            None,
        );
        assert_eq!(spec.mappings_for(EntityType::Patient).count(), 1);
        assert_eq!(spec.mappings_for(EntityType::Chart).count(), 0);
    }
}
