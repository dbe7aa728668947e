// src/pipeline/ingest.rs

//! Historical batch ingestion.

use chrono::Utc;
use futures::stream::{self, StreamExt};

use super::PipelineContext;
use crate::error::{AppError, Result};
use crate::models::{
    BatchOutcome, BatchReport, BatchStatus, IngestSummary, Manifest, ManifestEntry,
};
use crate::services::{SchemaNormalizer, SourceFetcher, TripMerger};

/// Ingest every batch of `manifest` into the trip log.
///
/// Batch-level failures are reported in the summary and never block other
/// batches. An empty manifest or an unreachable store aborts the run.
pub async fn run_historical_ingest(
    ctx: &PipelineContext,
    manifest: &Manifest,
) -> Result<IngestSummary> {
    manifest.validate()?;
    ctx.store.health_check().await?;

    let started_at = Utc::now();
    let refresh = ctx.config.fetcher.refresh;
    let fetcher = SourceFetcher::new(
        ctx.governor.clone(),
        ctx.client.clone(),
        ctx.config.paths.staging_dir.clone(),
        refresh,
    );
    let normalizer = SchemaNormalizer::new(&ctx.config.normalizer);
    let merger = TripMerger::new(ctx.config.fetcher.merge_chunk_size);
    let concurrency = ctx.config.fetcher.max_concurrent_batches.max(1);

    log::info!(
        "Ingesting {} batches ({} at a time{})",
        manifest.resources.len(),
        concurrency,
        if refresh { ", refresh" } else { "" }
    );

    let mut batches = Vec::with_capacity(manifest.resources.len());
    let mut results = stream::iter(&manifest.resources)
        .map(|entry| ingest_batch(ctx, &fetcher, &normalizer, &merger, entry))
        .buffer_unordered(concurrency);

    while let Some(result) = results.next().await {
        match result {
            Ok(report) => {
                match &report.error {
                    Some(error) => log::warn!("Batch {}: {} ({})", report.batch_id, report.outcome, error),
                    None => log::info!("Batch {}: {}", report.batch_id, report.outcome),
                }
                batches.push(report);
            }
            Err(error) => {
                log::error!("Aborting ingest: {error}");
                return Err(error);
            }
        }
    }
    batches.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));

    let summary = IngestSummary {
        started_at,
        finished_at: Utc::now(),
        batches,
    };
    let totals = summary.totals();
    log::info!(
        "Ingest finished: {} ingested, {} skipped, {} failed; rows seen={} merged={} duplicate={} rejected={}",
        summary.count(BatchOutcome::Ingested),
        summary.count(BatchOutcome::AlreadyIngested),
        summary.failures().count(),
        totals.seen,
        totals.merged,
        totals.duplicate,
        totals.rejected
    );
    Ok(summary)
}

/// Fetch, normalize and merge one batch. `Err` only for structural failures.
async fn ingest_batch(
    ctx: &PipelineContext,
    fetcher: &SourceFetcher,
    normalizer: &SchemaNormalizer,
    merger: &TripMerger,
    entry: &ManifestEntry,
) -> Result<BatchReport> {
    let store = ctx.store.as_ref();
    let batch_id = entry.batch_id();
    let refresh = ctx.config.fetcher.refresh;

    if !refresh {
        if let Some(watermark) = store.watermark(batch_id).await? {
            if watermark.is_ingested() {
                return Ok(BatchReport::new(
                    batch_id,
                    BatchOutcome::AlreadyIngested,
                    watermark.counts,
                ));
            }
        }
    }

    let batch = match fetcher.fetch(entry).await {
        Ok(batch) => batch,
        Err(AppError::Cancelled) => {
            return Ok(BatchReport::failed(batch_id, BatchOutcome::Cancelled, &AppError::Cancelled));
        }
        Err(error) if error.is_structural() => return Err(error),
        Err(error) => {
            let (status, outcome) = match error {
                AppError::UnexpectedContent { .. } => {
                    (BatchStatus::QuarantinedPartial, BatchOutcome::UnexpectedContent)
                }
                _ => (BatchStatus::Pending, BatchOutcome::FetchFailed),
            };
            park(ctx, batch_id, status, &error).await?;
            return Ok(BatchReport::failed(batch_id, outcome, &error));
        }
    };

    let rows = match normalizer.normalize(&batch) {
        Ok(rows) => rows,
        Err(error) => {
            let (status, outcome) = match error {
                AppError::SchemaUnrecognized { .. } => {
                    (BatchStatus::QuarantinedPartial, BatchOutcome::SchemaUnrecognized)
                }
                _ => (BatchStatus::Pending, BatchOutcome::FetchFailed),
            };
            park(ctx, batch_id, status, &error).await?;
            return Ok(BatchReport::failed(batch_id, outcome, &error));
        }
    };
    log::debug!("Batch {} matched layout {}", batch_id, rows.layout_name());

    match merger
        .merge(store, batch_id, Some(&batch.checksum), rows, refresh, &ctx.cancel)
        .await
    {
        Ok(report) => {
            let outcome = if report.already_ingested {
                BatchOutcome::AlreadyIngested
            } else {
                BatchOutcome::Ingested
            };
            Ok(BatchReport::new(batch_id, outcome, report.counts))
        }
        Err(AppError::Cancelled) => Ok(BatchReport::failed(
            batch_id,
            BatchOutcome::Cancelled,
            &AppError::Cancelled,
        )),
        Err(error) => Err(error),
    }
}

/// Record a failed attempt on the batch watermark.
async fn park(
    ctx: &PipelineContext,
    batch_id: &str,
    status: BatchStatus,
    error: &AppError,
) -> Result<()> {
    let message = error.to_string();
    let watermark = ctx
        .store
        .update_watermark(batch_id, &|wm| wm.record_failure(status, &message))
        .await?;
    log::debug!(
        "Batch {} left {} after {} failed attempts",
        batch_id,
        watermark.status,
        watermark.attempts
    );
    Ok(())
}
