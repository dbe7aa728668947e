//! Run-level summaries returned by the pipeline entry points.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::models::RowCounts;

// --- Historical ingest ---

/// What happened to one batch during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOutcome {
    /// Merged and committed in this run
    Ingested,
    /// Watermark already `ingested`; nothing fetched
    AlreadyIngested,
    /// Download failed after the retry budget; left `pending`
    FetchFailed,
    /// Header matched no known layout; batch parked
    SchemaUnrecognized,
    /// Remote served something other than a data file; batch parked
    UnexpectedContent,
    /// Run cancelled before the batch was committed
    Cancelled,
}

impl BatchOutcome {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            BatchOutcome::FetchFailed
                | BatchOutcome::SchemaUnrecognized
                | BatchOutcome::UnexpectedContent
        )
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchOutcome::Ingested => "ingested",
            BatchOutcome::AlreadyIngested => "already-ingested",
            BatchOutcome::FetchFailed => "fetch-failed",
            BatchOutcome::SchemaUnrecognized => "schema-unrecognized",
            BatchOutcome::UnexpectedContent => "unexpected-content",
            BatchOutcome::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub outcome: BatchOutcome,
    pub counts: RowCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchReport {
    pub fn new(batch_id: impl Into<String>, outcome: BatchOutcome, counts: RowCounts) -> Self {
        Self {
            batch_id: batch_id.into(),
            outcome,
            counts,
            error: None,
        }
    }

    pub fn failed(batch_id: impl Into<String>, outcome: BatchOutcome, error: &AppError) -> Self {
        Self {
            batch_id: batch_id.into(),
            outcome,
            counts: RowCounts::default(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: Vec<BatchReport>,
}

impl IngestSummary {
    pub fn count(&self, outcome: BatchOutcome) -> usize {
        self.batches.iter().filter(|b| b.outcome == outcome).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches.iter().filter(|b| b.outcome.is_failure())
    }

    pub fn report(&self, batch_id: &str) -> Option<&BatchReport> {
        self.batches.iter().find(|b| b.batch_id == batch_id)
    }

    /// Row counts summed over batches merged in this run.
    pub fn totals(&self) -> RowCounts {
        self.batches
            .iter()
            .filter(|b| b.outcome == BatchOutcome::Ingested)
            .fold(RowCounts::default(), |acc, b| RowCounts {
                seen: acc.seen + b.counts.seen,
                merged: acc.merged + b.counts.merged,
                duplicate: acc.duplicate + b.counts.duplicate,
                rejected: acc.rejected + b.counts.rejected,
            })
    }
}

// --- Station polling ---

/// Poller state between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PollerState {
    #[default]
    Idle,
    Polling,
    Degraded,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollerState::Idle => "idle",
            PollerState::Polling => "polling",
            PollerState::Degraded => "degraded",
        })
    }
}

/// Why a scheduler tick did not poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollSkip {
    /// A previous cycle is still in flight
    Overrun,
    /// The (possibly widened) interval has not elapsed
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum PollOutcome {
    Success {
        snapshots: usize,
        /// Entries without a station id, or repeated ids
        dropped: usize,
        /// Feed `last_updated` did not advance since the previous poll
        stale: bool,
    },
    Failure {
        error: String,
    },
    Skipped {
        cause: PollSkip,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub polled_at: DateTime<Utc>,
    pub outcome: PollOutcome,
    /// State after the cycle
    pub state: PollerState,
    pub consecutive_failures: u32,
    /// Interval until the next poll is due
    #[serde(with = "duration_secs")]
    pub next_interval: Duration,
}

impl PollReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PollOutcome::Success { .. })
    }

    /// Feed-level degradation, surfaced as a report value rather than an `Err`.
    pub fn degraded(&self) -> Option<AppError> {
        (self.state == PollerState::Degraded).then_some(AppError::FeedDegraded {
            consecutive_failures: self.consecutive_failures,
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

// --- Crawl ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Path matched the configured disallow list
    Disallowed,
    /// The host's robots.txt forbids the path
    RobotsTxt,
    /// Page budget exhausted before the URL was reached
    PageBudget,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Disallowed => "disallowed",
            SkipReason::RobotsTxt => "robots-txt",
            SkipReason::PageBudget => "page-budget",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUrl {
    pub url: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    /// URLs fetched successfully, in completion order
    pub fetched: Vec<String>,
    /// URLs whose fetch failed (recorded as error pages)
    pub failed: Vec<String>,
    pub skipped: Vec<SkippedUrl>,
    /// Links discovered beyond the depth limit, for follow-up runs
    pub unvisited_links: Vec<String>,
    pub cancelled: bool,
}

impl CrawlSummary {
    pub fn was_skipped(&self, url: &str) -> bool {
        self.skipped.iter().any(|s| s.url == url)
    }
}
