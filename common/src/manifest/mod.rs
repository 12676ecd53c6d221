pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::naming;

pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Lifecycle of a unit's manifest. `Downloading` is the only non-terminal
/// value; once a manifest instance is written `Complete` or `Partial` it is
/// never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Downloading,
    Partial,
    Complete,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Downloading => "downloading",
            ManifestStatus::Partial => "partial",
            ManifestStatus::Complete => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ManifestStatus::Downloading)
    }
}

/// Durable per-unit fetch progress record. The manifest is the single source
/// of truth for whether a unit is safe to relocate; directory listings alone
/// are never trusted because a network filesystem can show a file mid-write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub unit_id: String,
    pub safe_id: String,
    pub expected: u32,
    pub have: u32,
    pub status: ManifestStatus,
    pub origin: String,
    pub primary: String,
    pub secondary: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn new(
        unit_id: &str,
        origin: &str,
        primary: &str,
        secondary: Vec<String>,
        expected: u32,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            safe_id: naming::safe_id(unit_id),
            expected,
            have: 0,
            status: ManifestStatus::Downloading,
            origin: origin.to_string(),
            primary: primary.to_string(),
            secondary,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.safe_id, MANIFEST_SUFFIX)
    }

    /// Records one successfully fetched file. `have` never exceeds
    /// `expected`; an attempt to do so is a double-count upstream and is
    /// logged instead of silently satisfying the completeness check.
    pub fn record_fetched(&mut self) {
        if self.have < self.expected {
            self.have += 1;
        } else {
            warn!(
                unit_id = %self.unit_id,
                expected = self.expected,
                "fetch recorded beyond the expected file count; clamping"
            );
        }
    }

    /// Seals the manifest: `complete` when every expected file arrived,
    /// `partial` otherwise.
    pub fn finalize(&mut self) {
        self.status = if self.have >= self.expected {
            ManifestStatus::Complete
        } else {
            ManifestStatus::Partial
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn is_complete(&self) -> bool {
        self.status == ManifestStatus::Complete
    }
}
