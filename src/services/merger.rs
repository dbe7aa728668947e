// src/services/merger.rs

//! Trip merger service.
//!
//! Deduplicates a batch's candidates against the trip log and appends only
//! new records, then commits the batch watermark once with final counts.
//! Re-merging a batch is idempotent: every key already in the log is
//! counted as a duplicate and skipped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{BatchStatus, QuarantinedRow, RowCounts, TripRecord};
use crate::services::normalizer::RowOutcome;
use crate::storage::{TripLog, WatermarkStore};

/// Result of one merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub counts: RowCounts,
    /// The batch was already ingested and nothing was read
    pub already_ingested: bool,
}

pub struct TripMerger {
    chunk_size: usize,
    batch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TripMerger {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            batch_locks: Mutex::new(HashMap::new()),
        }
    }

    fn batch_lock(&self, batch_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .batch_locks
            .lock()
            .map_err(|_| AppError::store("batch lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(batch_id.to_string()).or_default()))
    }

    /// Merge one batch's row sequence into the trip log.
    ///
    /// At most one merge per batch id runs at a time. A batch whose
    /// watermark is `ingested` is a no-op returning the stored counts unless
    /// `refresh` is set. Cancellation between chunks leaves the watermark
    /// `pending`.
    pub async fn merge<S, I>(
        &self,
        store: &S,
        batch_id: &str,
        checksum: Option<&str>,
        rows: I,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<MergeReport>
    where
        S: TripLog + WatermarkStore + ?Sized,
        I: IntoIterator<Item = RowOutcome>,
    {
        let lock = self.batch_lock(batch_id)?;
        let _serialized = lock.lock().await;

        if let Some(existing) = store.watermark(batch_id).await? {
            if existing.is_ingested() && !refresh {
                log::info!("Batch {batch_id} already ingested; skipping merge");
                return Ok(MergeReport {
                    counts: existing.counts,
                    already_ingested: true,
                });
            }
        }

        store
            .update_watermark(batch_id, &|wm| {
                wm.status = BatchStatus::Pending;
                wm.updated_at = Utc::now();
            })
            .await?;

        let mut counts = RowCounts::default();
        let mut in_batch: HashSet<String> = HashSet::new();
        let mut candidates: Vec<TripRecord> = Vec::with_capacity(self.chunk_size);
        let mut rejected: Vec<QuarantinedRow> = Vec::new();

        for outcome in rows {
            counts.seen += 1;
            match outcome {
                RowOutcome::Valid(record) => {
                    if in_batch.insert(record.trip_id.clone()) {
                        candidates.push(record);
                    } else {
                        counts.duplicate += 1;
                    }
                }
                RowOutcome::Quarantined(row) => {
                    log::debug!(
                        "Batch {} row {} quarantined: {} ({})",
                        row.batch_id,
                        row.row,
                        row.reason,
                        row.detail
                    );
                    counts.rejected += 1;
                    rejected.push(row);
                }
            }

            if candidates.len() >= self.chunk_size {
                self.flush(store, &mut candidates, &mut rejected, &mut counts, cancel)
                    .await?;
            }
        }
        self.flush(store, &mut candidates, &mut rejected, &mut counts, cancel)
            .await?;

        let checksum = checksum.map(str::to_string);
        store
            .update_watermark(batch_id, &|wm| wm.commit(counts, checksum.clone()))
            .await?;

        log::info!(
            "Batch {} ingested: seen={} merged={} duplicate={} rejected={}",
            batch_id,
            counts.seen,
            counts.merged,
            counts.duplicate,
            counts.rejected
        );
        Ok(MergeReport {
            counts,
            already_ingested: false,
        })
    }

    async fn flush<S>(
        &self,
        store: &S,
        candidates: &mut Vec<TripRecord>,
        rejected: &mut Vec<QuarantinedRow>,
        counts: &mut RowCounts,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: TripLog + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if !candidates.is_empty() {
            let appended = store.append_new(candidates).await?;
            counts.merged += appended.merged;
            counts.duplicate += appended.duplicate;
            candidates.clear();
        }
        if !rejected.is_empty() {
            store.append_quarantine(rejected).await?;
            rejected.clear();
        }
        Ok(())
    }
}
