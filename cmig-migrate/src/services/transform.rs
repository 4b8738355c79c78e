//! Transform engine
//!
//! Applies a mapping spec to one raw record. Pure and deterministic: the same
//! raw data and mappings always produce the same canonical payload, which is
//! what makes re-running the transform phase idempotent.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{MigrationError, MigrationResult};
use crate::models::canonical::is_canonical_field;
use crate::models::{DerivedOp, FieldMapping, MappingSpec, TransformRule, ValueKind};

/// Canonical draft plus the problems met while producing it
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub payload: Value,
    pub issues: Vec<String>,
}

impl TransformOutput {
    /// Issues joined for `error_detail`
    pub fn error_detail(&self) -> Option<String> {
        (!self.issues.is_empty()).then(|| self.issues.join("; "))
    }
}

/// Reject specs that can never apply (unknown canonical fields, rules without sources)
pub fn check_spec(spec: &MappingSpec) -> MigrationResult<()> {
    for mapping in &spec.field_mappings {
        if !is_canonical_field(mapping.entity_type, &mapping.canonical_field) {
            return Err(MigrationError::Mapping(format!(
                "'{}' is not a canonical {} field",
                mapping.canonical_field, mapping.entity_type
            )));
        }
        let needs_source = matches!(mapping.rule, TransformRule::Rename | TransformRule::Coerce { .. });
        if needs_source && mapping.source_field.as_deref().map_or(true, str::is_empty) {
            return Err(MigrationError::Mapping(format!(
                "{}.{} needs a source field",
                mapping.entity_type, mapping.canonical_field
            )));
        }
        if let TransformRule::Derived { sources, .. } = &mapping.rule {
            if sources.is_empty() {
                return Err(MigrationError::Mapping(format!(
                    "{}.{} derives from no fields",
                    mapping.entity_type, mapping.canonical_field
                )));
            }
        }
    }
    Ok(())
}

/// Value at a dotted path; numeric segments index arrays
///
/// A key containing dots (e.g. a CSV header) is matched whole before the path is split.
pub fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = raw.get(path) {
        return Some(value);
    }
    path.split('.').try_fold(raw, |node, segment| match node {
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        Value::Object(map) => map.get(segment),
        _ => None,
    })
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn present<'a>(raw: &'a Value, path: Option<&str>) -> Option<&'a Value> {
    lookup(raw, path?).filter(|v| !is_blank(v))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Apply the mappings of one entity type to a raw record
///
/// When several mappings target the same canonical field, the first one that
/// yields a value wins.
pub fn transform_record<'m>(
    mappings: impl IntoIterator<Item = &'m FieldMapping>,
    raw: &Value,
) -> TransformOutput {
    let mut payload = Map::new();
    let mut issues = Vec::new();

    for mapping in mappings {
        if payload.contains_key(&mapping.canonical_field) {
            continue;
        }
        let source = mapping.source_field.as_deref();

        let produced = match &mapping.rule {
            TransformRule::Rename => present(raw, source).cloned(),
            TransformRule::Coerce { to } => match present(raw, source) {
                None => None,
                Some(value) => match coerce(value, *to) {
                    Ok(converted) => Some(converted),
                    Err(reason) => {
                        issues.push(format!("{}: {}", mapping.canonical_field, reason));
                        None
                    }
                },
            },
            TransformRule::Default { value } => present(raw, source)
                .cloned()
                .or_else(|| Some(value.clone())),
            TransformRule::Derived { sources, op } => derive(raw, sources, op),
        };

        if let Some(value) = produced {
            payload.insert(mapping.canonical_field.clone(), value);
        }
    }

    TransformOutput {
        payload: Value::Object(payload),
        issues,
    }
}

fn derive(raw: &Value, sources: &[String], op: &DerivedOp) -> Option<Value> {
    let mut values = sources.iter().filter_map(|s| present(raw, Some(s)));
    match op {
        DerivedOp::FirstNonEmpty => values.next().cloned(),
        DerivedOp::Concat { separator } => {
            let parts: Vec<String> = values.filter_map(as_text).filter(|s| !s.is_empty()).collect();
            (!parts.is_empty()).then(|| Value::String(parts.join(separator)))
        }
    }
}

/// Convert a raw value to a canonical type
pub fn coerce(value: &Value, kind: ValueKind) -> Result<Value, String> {
    let text = as_text(value);
    let fail = || format!("cannot convert {} to {:?}", value, kind);

    match kind {
        ValueKind::String => text.map(Value::String).ok_or_else(fail),
        ValueKind::Integer => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| Value::from(f as i64))
                .ok_or_else(fail),
            _ => text
                .and_then(|t| t.replace(',', "").parse::<i64>().ok())
                .map(Value::from)
                .ok_or_else(fail),
        },
        ValueKind::Float => text
            .and_then(|t| t.replace(',', "").parse::<f64>().ok())
            .filter(|f| f.is_finite())
            .map(Value::from)
            .ok_or_else(fail),
        ValueKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => match text.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("true" | "yes" | "y" | "1") => Ok(Value::Bool(true)),
                Some("false" | "no" | "n" | "0") => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
        },
        ValueKind::Date => text
            .as_deref()
            .and_then(parse_date)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(fail),
        ValueKind::DateTime => text
            .as_deref()
            .and_then(parse_datetime)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .ok_or_else(fail),
        ValueKind::Cents => text
            .as_deref()
            .and_then(parse_cents)
            .map(Value::from)
            .ok_or_else(fail),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M"];

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| parse_datetime(text).map(|dt| dt.date_naive()))
}

/// Offset-less timestamps are taken as UTC
fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// "$1,234.5" → 123450. More than two significant decimals is rejected.
fn parse_cents(text: &str) -> Option<i64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' '))
        .collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > 2 {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let cents: i64 = format!("{:0<2}", fraction).parse().ok()?;
    let total = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -total } else { total })
}
