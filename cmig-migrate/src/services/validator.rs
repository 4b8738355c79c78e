//! Structural validation and deterministic sampling
//!
//! Record-level checks are pure; referential lookups against staging and
//! live tables happen in the validate phase, which feeds the results here.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use uuid::Uuid;

use crate::models::canonical::{required_fields, PATIENT_REF_FIELD};
use crate::models::{EntityType, EntityValidation, ValidationIssue};

/// Missing required canonical fields of a staged payload
pub fn structural_issues(entity_type: EntityType, source_id: &str, payload: &Value) -> Vec<ValidationIssue> {
    required_fields(entity_type)
        .filter(|field| {
            payload
                .get(field.name)
                .map_or(true, |v| v.is_null() || v.as_str().is_some_and(|s| s.trim().is_empty()))
        })
        .map(|field| ValidationIssue {
            source_id: source_id.to_string(),
            field: Some(field.name.to_string()),
            message: format!("required field '{}' is missing", field.name),
        })
        .collect()
}

/// Patient source id a dependent record points at
pub fn patient_reference(payload: &Value) -> Option<&str> {
    payload
        .get(PATIENT_REF_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn unresolved_patient(source_id: &str, patient_source_id: &str) -> ValidationIssue {
    ValidationIssue {
        source_id: source_id.to_string(),
        field: Some(PATIENT_REF_FIELD.to_string()),
        message: format!(
            "patient '{}' is neither staged nor already live",
            patient_source_id
        ),
    }
}

/// Per-entity tally that keeps at most `max_issues` issues
#[derive(Debug)]
pub struct EntityTally {
    max_issues: usize,
    inner: EntityValidation,
}

impl EntityTally {
    pub fn new(max_issues: usize) -> Self {
        Self {
            max_issues,
            inner: EntityValidation::default(),
        }
    }

    pub fn record(&mut self, issues: Vec<ValidationIssue>) {
        self.inner.checked += 1;
        if issues.is_empty() {
            self.inner.passed += 1;
        } else {
            self.inner.failed += 1;
            let room = self.max_issues.saturating_sub(self.inner.issues.len());
            self.inner.issues.extend(issues.into_iter().take(room));
        }
    }

    pub fn finish(self) -> EntityValidation {
        self.inner
    }
}

/// Stable RNG seed for a run, so re-validating draws the same sample
pub fn sample_seed(run_id: Uuid) -> u64 {
    let value = run_id.as_u128();
    (value >> 64) as u64 ^ value as u64
}

/// Reservoir sample of a stream of unknown length
///
/// Deterministic for a given seed and input order.
#[derive(Debug)]
pub struct Reservoir<T> {
    capacity: usize,
    seen: u64,
    items: Vec<T>,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.items[slot as usize] = item;
        }
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}
