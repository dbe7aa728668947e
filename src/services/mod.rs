//! Service layer for the ingestion pipeline.
//!
//! This module contains the business logic for:
//! - Raw batch retrieval and staging (`SourceFetcher`)
//! - Per-vintage CSV normalization (`SchemaNormalizer`)
//! - Idempotent trip log merging (`TripMerger`)
//! - Station feed polling (`StationStatePoller`)
//! - Supporting content crawling (`PoliteCrawler`)
//! - Manifest discovery (`ManifestDiscovery`)

mod crawler;
mod discovery;
mod fetcher;
mod merger;
mod normalizer;
mod poller;

pub use crawler::PoliteCrawler;
pub use discovery::{ManifestDiscovery, parse_listing};
pub use fetcher::SourceFetcher;
pub use merger::{MergeReport, TripMerger};
pub use normalizer::{NormalizedRows, RowOutcome, SchemaNormalizer};
pub use poller::{PollStatus, StationStatePoller};
