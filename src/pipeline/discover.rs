// src/pipeline/discover.rs

//! Manifest discovery.

use super::PipelineContext;
use crate::error::Result;
use crate::models::Manifest;
use crate::services::ManifestDiscovery;

/// Build a manifest from the configured listing page.
pub async fn run_discovery(ctx: &PipelineContext) -> Result<Manifest> {
    ManifestDiscovery::new(
        ctx.config.discovery.page_url.clone(),
        ctx.governor.clone(),
        ctx.client.clone(),
    )
    .discover()
    .await
}
