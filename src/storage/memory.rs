//! In-memory storage backend.
//!
//! Used by tests and dry runs. Mirrors the local backend's semantics,
//! including the month-partitioned key index, and can be switched into a
//! failing mode to simulate an unreachable store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{CrawlPage, IngestWatermark, QuarantinedRow, StationSnapshot, TripRecord};
use crate::storage::{AppendOutcome, PageSink, SnapshotSink, TripLog, WatermarkStore};

#[derive(Default)]
struct TripState {
    index: HashMap<(i32, u32), HashSet<String>>,
    records: Vec<TripRecord>,
}

#[derive(Default)]
struct QuarantineState {
    keys: HashSet<(String, usize)>,
    rows: Vec<QuarantinedRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    trips: Mutex<TripState>,
    quarantine: Mutex<QuarantineState>,
    watermarks: Mutex<BTreeMap<String, IngestWatermark>>,
    snapshots: Mutex<Vec<StationSnapshot>>,
    pages: Mutex<Vec<CrawlPage>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a store error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn trips(&self) -> Vec<TripRecord> {
        lock(&self.trips).map(|t| t.records.clone()).unwrap_or_default()
    }

    pub fn quarantined(&self) -> Vec<QuarantinedRow> {
        lock(&self.quarantine)
            .map(|q| q.rows.clone())
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<StationSnapshot> {
        lock(&self.snapshots).map(|s| s.clone()).unwrap_or_default()
    }

    pub fn pages(&self) -> Vec<CrawlPage> {
        lock(&self.pages).map(|p| p.clone()).unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::store("memory store marked unavailable"));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AppError::store("memory store lock poisoned"))
}

#[async_trait]
impl TripLog for MemoryStore {
    async fn append_new(&self, records: &[TripRecord]) -> Result<AppendOutcome> {
        self.ensure_available()?;
        let mut state = lock(&self.trips)?;
        let mut outcome = AppendOutcome::default();
        for record in records {
            let inserted = state
                .index
                .entry(record.partition())
                .or_default()
                .insert(record.trip_id.clone());
            if inserted {
                state.records.push(record.clone());
                outcome.merged += 1;
            } else {
                outcome.duplicate += 1;
            }
        }
        Ok(outcome)
    }

    async fn contains(&self, record: &TripRecord) -> Result<bool> {
        self.ensure_available()?;
        let state = lock(&self.trips)?;
        Ok(state
            .index
            .get(&record.partition())
            .is_some_and(|keys| keys.contains(&record.trip_id)))
    }

    async fn append_quarantine(&self, rows: &[QuarantinedRow]) -> Result<usize> {
        self.ensure_available()?;
        let mut state = lock(&self.quarantine)?;
        let mut appended = 0;
        for row in rows {
            if state.keys.insert(row.key()) {
                state.rows.push(row.clone());
                appended += 1;
            }
        }
        Ok(appended)
    }

    async fn trip_count(&self) -> Result<usize> {
        self.ensure_available()?;
        Ok(lock(&self.trips)?.records.len())
    }

    async fn quarantine_count(&self) -> Result<usize> {
        self.ensure_available()?;
        Ok(lock(&self.quarantine)?.rows.len())
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn watermark(&self, batch_id: &str) -> Result<Option<IngestWatermark>> {
        self.ensure_available()?;
        Ok(lock(&self.watermarks)?.get(batch_id).cloned())
    }

    async fn update_watermark(
        &self,
        batch_id: &str,
        update: &(dyn for<'w> Fn(&'w mut IngestWatermark) + Send + Sync),
    ) -> Result<IngestWatermark> {
        self.ensure_available()?;
        let mut watermarks = lock(&self.watermarks)?;
        let entry = watermarks
            .entry(batch_id.to_string())
            .or_insert_with(|| IngestWatermark::pending(batch_id));
        update(entry);
        Ok(entry.clone())
    }

    async fn watermarks(&self) -> Result<Vec<IngestWatermark>> {
        self.ensure_available()?;
        Ok(lock(&self.watermarks)?.values().cloned().collect())
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }
}

#[async_trait]
impl SnapshotSink for MemoryStore {
    async fn append_snapshots(&self, snapshots: &[StationSnapshot]) -> Result<()> {
        self.ensure_available()?;
        lock(&self.snapshots)?.extend_from_slice(snapshots);
        Ok(())
    }
}

#[async_trait]
impl PageSink for MemoryStore {
    async fn append_page(&self, page: &CrawlPage) -> Result<()> {
        self.ensure_available()?;
        lock(&self.pages)?.push(page.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchStatus, RowCounts};
    use crate::storage::Store;

    #[tokio::test]
    async fn watermark_updates_through_a_trait_object() {
        let memory = MemoryStore::new();
        let store: &dyn Store = &memory;

        let message = String::from("HTTP 503");
        let parked = store
            .update_watermark("2023-01", &|wm| {
                wm.record_failure(BatchStatus::Pending, &message)
            })
            .await
            .unwrap();
        assert_eq!(parked.status, BatchStatus::Pending);
        assert_eq!(parked.attempts, 1);

        store
            .update_watermark("2023-01", &|wm| wm.commit(RowCounts::new(4, 3, 0, 1), None))
            .await
            .unwrap();
        let wm = store.watermark("2023-01").await.unwrap().unwrap();
        assert_eq!(wm.status, BatchStatus::Ingested);
        assert_eq!(store.watermarks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_watermark_updates() {
        let memory = MemoryStore::new();
        memory.set_unavailable(true);
        let err = memory
            .update_watermark("2023-01", &|wm| wm.commit(RowCounts::default(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }
}
