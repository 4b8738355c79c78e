//! Artifact descriptors (blobs live in the artifact store)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// JSON lines of raw vendor records for one entity type
    RawExtract,
    /// Validation report
    Report,
    /// Sampled records for human review
    SamplingPacket,
    /// Source file uploaded by the clinic
    Upload,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::RawExtract => "raw-extract",
            ArtifactKind::Report => "report",
            ArtifactKind::SamplingPacket => "sampling-packet",
            ArtifactKind::Upload => "upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            ArtifactKind::RawExtract,
            ArtifactKind::Report,
            ArtifactKind::SamplingPacket,
            ArtifactKind::Upload,
        ]
        .into_iter()
        .find(|k| k.as_str() == value)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of storing a blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub locator: String,
    /// Hex SHA-256 of the content
    pub checksum: String,
}

/// Artifact indexed against a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationArtifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: ArtifactKind,
    pub locator: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}
