// src/models/mod.rs

//! Domain models for the ingestion pipeline.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod layout;
mod manifest;
mod page;
mod station;
mod summary;
mod trip;
mod watermark;

// Re-export all public types
pub use config::{
    Config, CrawlerConfig, DiscoveryConfig, FetcherConfig, GovernorConfig, HostRateLimit,
    LoggingConfig, NormalizerConfig, PathsConfig, PollerConfig, RateLimitConfig, RetryConfig,
};
pub use layout::{
    ColumnMapping, DurationUnit, ResolvedLayout, SchemaLayout, StationFormat, TripField,
    normalize_header,
};
pub use manifest::{Manifest, ManifestEntry, RawBatch};
pub use page::CrawlPage;
pub use station::{StationEntry, StationFeed, StationFeedData, StationSnapshot};
pub use summary::{
    BatchOutcome, BatchReport, CrawlSummary, IngestSummary, PollOutcome, PollReport, PollSkip,
    PollerState, SkipReason, SkippedUrl,
};
pub use trip::{QuarantinedRow, RejectReason, TripRecord};
pub use watermark::{BatchStatus, IngestWatermark, RowCounts};
