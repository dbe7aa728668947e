// src/pipeline/crawl.rs

//! Supporting content crawl.

use super::PipelineContext;
use crate::error::Result;
use crate::models::CrawlSummary;
use crate::services::PoliteCrawler;

/// Crawl from `seeds`, or from the configured seeds when none are given.
pub async fn run_crawl(ctx: &PipelineContext, seeds: &[String]) -> Result<CrawlSummary> {
    let seeds = if seeds.is_empty() {
        ctx.config.crawler.seeds.as_slice()
    } else {
        seeds
    };
    let crawler = PoliteCrawler::new(
        &ctx.config.crawler,
        ctx.config.governor.user_agent.clone(),
        ctx.governor.clone(),
        ctx.client.clone(),
    )?;
    crawler.crawl(seeds, ctx.store.as_ref()).await
}
