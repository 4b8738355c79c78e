//! Timestamp utilities
//!
//! All persisted timestamps are RFC 3339 text in UTC.

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp
pub fn from_db(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Timestamp {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

/// Parse an optional stored timestamp
pub fn from_db_opt(field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| from_db(field, &v)).transpose()
}
