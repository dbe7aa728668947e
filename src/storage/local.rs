//! Local filesystem storage implementation.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── watermarks.json        # BTreeMap<batch_id, IngestWatermark>
//! ├── quarantine.jsonl
//! ├── pages.jsonl
//! ├── trips/YYYY/MM.jsonl    # Trip log, one partition per start month
//! └── snapshots/YYYY-MM-DD.jsonl
//! ```
//!
//! Trip log and quarantine appends run on the blocking pool, each under a
//! std mutex held for the whole read-check-append step. Watermark updates
//! hold an async lock across their read and their atomic rewrite. Snapshot
//! and page streams have no read-modify-write step and are appended through
//! `tokio::fs`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{CrawlPage, IngestWatermark, QuarantinedRow, StationSnapshot, TripRecord};
use crate::storage::{AppendOutcome, PageSink, SnapshotSink, TripLog, WatermarkStore};

const WATERMARKS: &str = "watermarks.json";
const QUARANTINE: &str = "quarantine.jsonl";
const PAGES: &str = "pages.jsonl";

type Partition = (i32, u32);

/// Local filesystem storage backend.
pub struct LocalStorage {
    disk: Arc<Disk>,
    watermark_lock: tokio::sync::Mutex<()>,
}

/// Synchronous side of the backend, shared with blocking tasks.
struct Disk {
    root_dir: PathBuf,
    /// Trip keys per loaded partition
    trip_index: Mutex<HashMap<Partition, HashSet<String>>>,
    /// Quarantine keys, loaded on first use
    quarantine_index: Mutex<Option<HashSet<(String, usize)>>>,
}

#[derive(Deserialize)]
struct TripKey {
    trip_id: String,
}

#[derive(Deserialize)]
struct QuarantineKey {
    batch_id: String,
    row: usize,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            disk: Arc::new(Disk {
                root_dir: root_dir.into(),
                trip_index: Mutex::new(HashMap::new()),
                quarantine_index: Mutex::new(None),
            }),
            watermark_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.disk.root_dir
    }

    /// Load every record of one month partition.
    pub fn load_trips(&self, year: i32, month: u32) -> Result<Vec<TripRecord>> {
        read_jsonl(&self.disk.path(&Disk::partition_key((year, month))))
    }

    pub fn load_quarantine(&self) -> Result<Vec<QuarantinedRow>> {
        read_jsonl(&self.disk.path(QUARANTINE))
    }

    pub fn load_pages(&self) -> Result<Vec<CrawlPage>> {
        read_jsonl(&self.disk.path(PAGES))
    }

    /// Run blocking file work off the async worker threads.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Disk) -> Result<T> + Send + 'static,
    {
        let disk = Arc::clone(&self.disk);
        tokio::task::spawn_blocking(move || work(&disk))
            .await
            .map_err(AppError::store)?
    }

    /// Append JSON lines to a file through tokio.
    async fn append_async<T: Serialize>(&self, key: &str, values: &[T]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let path = self.disk.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(AppError::store)?;
        }
        let buffer = encode_lines(values)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(AppError::store)?;
        file.write_all(&buffer).await.map_err(AppError::store)?;
        file.flush().await.map_err(AppError::store)?;
        Ok(())
    }
}

impl Disk {
    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Trip log key for a given year/month.
    fn partition_key((year, month): Partition) -> String {
        format!("trips/{}/{:02}.jsonl", year, month)
    }

    fn snapshot_key(snapshot: &StationSnapshot) -> String {
        let day = snapshot.polled_at.date_naive();
        format!(
            "snapshots/{}-{:02}-{:02}.jsonl",
            day.year(),
            day.month(),
            day.day()
        )
    }

    /// Ensure the partition's keys are in the index, reading them from disk once.
    fn loaded_partition<'a>(
        &self,
        index: &'a mut HashMap<Partition, HashSet<String>>,
        partition: Partition,
    ) -> Result<&'a mut HashSet<String>> {
        if !index.contains_key(&partition) {
            let keys: Vec<TripKey> = read_jsonl(&self.path(&Self::partition_key(partition)))?;
            log::debug!(
                "Loaded {} trip keys for partition {}-{:02}",
                keys.len(),
                partition.0,
                partition.1
            );
            index.insert(partition, keys.into_iter().map(|k| k.trip_id).collect());
        }
        index
            .get_mut(&partition)
            .ok_or_else(|| AppError::store("trip index partition missing after load"))
    }

    fn append_new(&self, records: &[TripRecord]) -> Result<AppendOutcome> {
        let mut index = lock(&self.trip_index)?;

        let mut outcome = AppendOutcome::default();
        let mut fresh: BTreeMap<Partition, Vec<&TripRecord>> = BTreeMap::new();
        for record in records {
            let partition = record.partition();
            let keys = self.loaded_partition(&mut index, partition)?;
            if keys.insert(record.trip_id.clone()) {
                fresh.entry(partition).or_default().push(record);
                outcome.merged += 1;
            } else {
                outcome.duplicate += 1;
            }
        }

        for (partition, records) in &fresh {
            let path = self.path(&Self::partition_key(*partition));
            if let Err(error) = append_lines(&path, records) {
                // Force a reload so the index matches what reached the disk.
                index.remove(partition);
                return Err(error);
            }
        }
        Ok(outcome)
    }

    fn contains(&self, trip_id: &str, partition: Partition) -> Result<bool> {
        let mut index = lock(&self.trip_index)?;
        let keys = self.loaded_partition(&mut index, partition)?;
        Ok(keys.contains(trip_id))
    }

    fn append_quarantine(&self, rows: &[QuarantinedRow]) -> Result<usize> {
        let mut guard = lock(&self.quarantine_index)?;
        if guard.is_none() {
            let keys: Vec<QuarantineKey> = read_jsonl(&self.path(QUARANTINE))?;
            *guard = Some(keys.into_iter().map(|k| (k.batch_id, k.row)).collect());
        }
        let keys = guard
            .as_mut()
            .ok_or_else(|| AppError::store("quarantine index missing after load"))?;

        let fresh: Vec<&QuarantinedRow> = rows.iter().filter(|r| keys.insert(r.key())).collect();
        if let Err(error) = append_lines(&self.path(QUARANTINE), &fresh) {
            *guard = None;
            return Err(error);
        }
        Ok(fresh.len())
    }

    fn trip_count(&self) -> Result<usize> {
        let trips_dir = self.path("trips");
        let years = match fs::read_dir(&trips_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::store(e)),
        };
        let mut total = 0;
        for year in years {
            let year = year.map_err(AppError::store)?.path();
            if !year.is_dir() {
                continue;
            }
            for month in fs::read_dir(&year).map_err(AppError::store)? {
                let month = month.map_err(AppError::store)?.path();
                if month.extension().is_some_and(|ext| ext == "jsonl") {
                    total += count_lines(&month)?;
                }
            }
        }
        Ok(total)
    }

    fn read_watermarks(&self) -> Result<BTreeMap<String, IngestWatermark>> {
        let path = self.path(WATERMARKS);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(AppError::store),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(AppError::store(e)),
        }
    }

    /// Write the watermark table atomically (write to temp, then rename).
    fn write_watermarks(&self, watermarks: &BTreeMap<String, IngestWatermark>) -> Result<()> {
        let path = self.path(WATERMARKS);
        ensure_parent(&path)?;
        let bytes = serde_json::to_vec_pretty(watermarks).map_err(AppError::store)?;

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(AppError::store)?;
        file.write_all(&bytes).map_err(AppError::store)?;
        file.sync_all().map_err(AppError::store)?;
        drop(file);

        fs::rename(&tmp, &path).map_err(AppError::store)?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        fs::create_dir_all(&self.root_dir).map_err(|e| {
            AppError::store(format!(
                "storage root {} unreachable: {}",
                self.root_dir.display(),
                e
            ))
        })?;
        self.read_watermarks().map(|_| ())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AppError::store("storage lock poisoned"))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(AppError::store)?;
    }
    Ok(())
}

fn encode_lines<T: Serialize>(values: &[T]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for value in values {
        serde_json::to_writer(&mut buffer, value).map_err(AppError::store)?;
        buffer.push(b'\n');
    }
    Ok(buffer)
}

/// Blocking append of JSON lines.
fn append_lines<T: Serialize>(path: &Path, values: &[T]) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    ensure_parent(path)?;
    let buffer = encode_lines(values)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(AppError::store)?;
    file.write_all(&buffer).map_err(AppError::store)?;
    file.sync_data().map_err(AppError::store)?;
    Ok(())
}

/// Read JSON lines, returning an empty list if the file doesn't exist.
fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::store(e)),
    };
    let mut values = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(AppError::store)?;
        if line.trim().is_empty() {
            continue;
        }
        values.push(serde_json::from_str(&line).map_err(AppError::store)?);
    }
    Ok(values)
}

fn count_lines(path: &Path) -> Result<usize> {
    match fs::File::open(path) {
        Ok(file) => {
            let mut count = 0;
            for line in BufReader::new(file).lines() {
                if !line.map_err(AppError::store)?.trim().is_empty() {
                    count += 1;
                }
            }
            Ok(count)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(AppError::store(e)),
    }
}

#[async_trait]
impl TripLog for LocalStorage {
    async fn append_new(&self, records: &[TripRecord]) -> Result<AppendOutcome> {
        let records = records.to_vec();
        self.blocking(move |disk| disk.append_new(&records)).await
    }

    async fn contains(&self, record: &TripRecord) -> Result<bool> {
        let trip_id = record.trip_id.clone();
        let partition = record.partition();
        self.blocking(move |disk| disk.contains(&trip_id, partition))
            .await
    }

    async fn append_quarantine(&self, rows: &[QuarantinedRow]) -> Result<usize> {
        let rows = rows.to_vec();
        self.blocking(move |disk| disk.append_quarantine(&rows))
            .await
    }

    async fn trip_count(&self) -> Result<usize> {
        self.blocking(Disk::trip_count).await
    }

    async fn quarantine_count(&self) -> Result<usize> {
        self.blocking(|disk| count_lines(&disk.path(QUARANTINE)))
            .await
    }
}

#[async_trait]
impl WatermarkStore for LocalStorage {
    async fn watermark(&self, batch_id: &str) -> Result<Option<IngestWatermark>> {
        let _guard = self.watermark_lock.lock().await;
        let batch_id = batch_id.to_string();
        self.blocking(move |disk| Ok(disk.read_watermarks()?.remove(&batch_id)))
            .await
    }

    async fn update_watermark(
        &self,
        batch_id: &str,
        update: &(dyn for<'w> Fn(&'w mut IngestWatermark) + Send + Sync),
    ) -> Result<IngestWatermark> {
        let _guard = self.watermark_lock.lock().await;
        let mut watermarks = self.blocking(Disk::read_watermarks).await?;
        let entry = watermarks
            .entry(batch_id.to_string())
            .or_insert_with(|| IngestWatermark::pending(batch_id));
        update(entry);
        let updated = entry.clone();
        self.blocking(move |disk| disk.write_watermarks(&watermarks))
            .await?;
        Ok(updated)
    }

    async fn watermarks(&self) -> Result<Vec<IngestWatermark>> {
        let _guard = self.watermark_lock.lock().await;
        self.blocking(|disk| Ok(disk.read_watermarks()?.into_values().collect()))
            .await
    }

    async fn health_check(&self) -> Result<()> {
        let _guard = self.watermark_lock.lock().await;
        self.blocking(Disk::health_check).await
    }
}

#[async_trait]
impl SnapshotSink for LocalStorage {
    async fn append_snapshots(&self, snapshots: &[StationSnapshot]) -> Result<()> {
        let mut by_day: BTreeMap<String, Vec<&StationSnapshot>> = BTreeMap::new();
        for snapshot in snapshots {
            by_day
                .entry(Disk::snapshot_key(snapshot))
                .or_default()
                .push(snapshot);
        }
        for (key, day) in by_day {
            self.append_async(&key, &day).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PageSink for LocalStorage {
    async fn append_page(&self, page: &CrawlPage) -> Result<()> {
        self.append_async(PAGES, std::slice::from_ref(page)).await
    }
}
