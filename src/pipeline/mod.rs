// src/pipeline/mod.rs

//! Pipeline entry points.
//!
//! - `run_historical_ingest`: Fetch, normalize and merge manifest batches
//! - `run_station_poll_cycle` / `run_poller`: Sample the station feed
//! - `run_crawl`: Harvest supporting content
//! - `run_discovery`: Build a manifest from the publisher's listing page
//!
//! Every entry point takes a [`PipelineContext`]; the caller owns its
//! lifetime and its cancellation token.

mod crawl;
mod discover;
mod ingest;
mod poll;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::Config;
use crate::services::StationStatePoller;
use crate::storage::{LocalStorage, Store};
use crate::throttle::ResourceGovernor;
use crate::utils::http::{HttpClient, ReqwestHttpClient};

pub use crawl::run_crawl;
pub use discover::run_discovery;
pub use ingest::run_historical_ingest;
pub use poll::{run_poller, run_station_poll_cycle};

/// Shared collaborators for one run.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub governor: Arc<ResourceGovernor>,
    pub client: Arc<dyn HttpClient>,
    pub store: Arc<dyn Store>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(config: Config, client: Arc<dyn HttpClient>, store: Arc<dyn Store>) -> Self {
        Self::with_cancel(config, client, store, CancellationToken::new())
    }

    /// Build a context whose governor observes `cancel`.
    pub fn with_cancel(
        config: Config,
        client: Arc<dyn HttpClient>,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
    ) -> Self {
        let governor = Arc::new(ResourceGovernor::new(&config.governor, cancel.clone()));
        Self {
            config: Arc::new(config),
            governor,
            client,
            store,
            cancel,
        }
    }

    /// Production wiring: reqwest transport and the local filesystem store.
    pub fn from_config(config: Config, cancel: CancellationToken) -> Result<Self> {
        let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(&config.governor)?);
        let store: Arc<dyn Store> = Arc::new(LocalStorage::new(config.paths.storage_dir.clone()));
        Ok(Self::with_cancel(config, client, store, cancel))
    }

    /// A poller bound to this context's governor and transport.
    pub fn station_poller(&self) -> StationStatePoller {
        StationStatePoller::new(
            &self.config.poller,
            Arc::clone(&self.governor),
            Arc::clone(&self.client),
        )
    }

    /// Stop every component at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
