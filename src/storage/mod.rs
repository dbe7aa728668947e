//! Storage abstractions for the trip log, watermarks, snapshots and pages.
//!
//! Every stream is append-only. The trip log's [`TripLog::append_new`] and
//! the watermark store's [`WatermarkStore::update_watermark`] are the only
//! read-modify-write operations; implementations serialize them internally
//! and never hold a lock across an await point.
//!
//! ## Directory Structure (local backend)
//!
//! ```text
//! storage/
//! ├── watermarks.json        # One row per batch id (atomic rewrite)
//! ├── quarantine.jsonl       # Rejected rows with reason codes
//! ├── pages.jsonl            # Crawl history keyed by (url, fetched_at)
//! ├── trips/                 # Trip log partitioned by start month
//! │   └── 2023/
//! │       └── 01.jsonl
//! └── snapshots/             # Station snapshots by poll date
//!     └── 2024-05-01.jsonl
//! ```

pub mod local;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CrawlPage, IngestWatermark, QuarantinedRow, StationSnapshot, TripRecord};

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::MemoryStore;

/// Result of one atomic check-and-append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub merged: usize,
    pub duplicate: usize,
}

/// Append-only trip log with key membership.
#[async_trait]
pub trait TripLog: Send + Sync {
    /// Append records whose `trip_id` is not yet in the log.
    ///
    /// Membership check and append happen under one lock, so concurrent
    /// callers can never both append the same key.
    async fn append_new(&self, records: &[TripRecord]) -> Result<AppendOutcome>;

    /// Point lookup in the key index of the record's start-month partition.
    async fn contains(&self, record: &TripRecord) -> Result<bool>;

    /// Append rejected rows, skipping `(batch, row)` pairs already present.
    async fn append_quarantine(&self, rows: &[QuarantinedRow]) -> Result<usize>;

    async fn trip_count(&self) -> Result<usize>;

    async fn quarantine_count(&self) -> Result<usize>;
}

/// Per-batch watermark rows.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn watermark(&self, batch_id: &str) -> Result<Option<IngestWatermark>>;

    /// Read-modify-write one watermark, creating it as `pending` if absent.
    async fn update_watermark(
        &self,
        batch_id: &str,
        update: &(dyn for<'w> Fn(&'w mut IngestWatermark) + Send + Sync),
    ) -> Result<IngestWatermark>;

    /// All watermarks, ordered by batch id.
    async fn watermarks(&self) -> Result<Vec<IngestWatermark>>;

    /// Fail fast when the store cannot be reached at all.
    async fn health_check(&self) -> Result<()>;
}

/// Append-only station snapshot stream.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn append_snapshots(&self, snapshots: &[StationSnapshot]) -> Result<()>;
}

/// Append-only crawl history.
#[async_trait]
pub trait PageSink: Send + Sync {
    async fn append_page(&self, page: &CrawlPage) -> Result<()>;
}

/// Everything the pipeline persists.
pub trait Store: TripLog + WatermarkStore + SnapshotSink + PageSink {}

impl<T: TripLog + WatermarkStore + SnapshotSink + PageSink> Store for T {}
