//! Per-batch ingestion watermark.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ingestion status of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    /// Not yet committed (new, interrupted, or failed to fetch)
    #[default]
    Pending,
    /// Merged and committed with final counts
    Ingested,
    /// The whole batch was parked (unrecognized layout, unexpected content)
    QuarantinedPartial,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Ingested => "ingested",
            BatchStatus::QuarantinedPartial => "quarantined-partial",
        })
    }
}

/// Row accounting for one merge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RowCounts {
    pub seen: usize,
    pub merged: usize,
    pub duplicate: usize,
    pub rejected: usize,
}

impl RowCounts {
    pub fn new(seen: usize, merged: usize, duplicate: usize, rejected: usize) -> Self {
        Self {
            seen,
            merged,
            duplicate,
            rejected,
        }
    }

    /// `seen == merged + duplicate + rejected`
    pub fn is_balanced(&self) -> bool {
        self.seen == self.merged + self.duplicate + self.rejected
    }
}

/// One watermark row per batch id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestWatermark {
    pub batch_id: String,
    pub status: BatchStatus,
    pub counts: RowCounts,

    /// Reason of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Failed fetch/merge attempts across runs
    #[serde(default)]
    pub attempts: u32,

    /// Checksum of the bytes last merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl IngestWatermark {
    pub fn pending(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            status: BatchStatus::Pending,
            counts: RowCounts::default(),
            last_error: None,
            attempts: 0,
            checksum: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_ingested(&self) -> bool {
        self.status == BatchStatus::Ingested
    }

    /// Commit a finished merge pass.
    pub fn commit(&mut self, counts: RowCounts, checksum: Option<String>) {
        self.status = BatchStatus::Ingested;
        self.counts = counts;
        self.checksum = checksum;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt, leaving committed batches untouched.
    pub fn record_failure(&mut self, status: BatchStatus, error: impl fmt::Display) {
        if self.is_ingested() {
            return;
        }
        self.status = status;
        self.last_error = Some(error.to_string());
        self.attempts += 1;
        self.updated_at = Utc::now();
    }
}
