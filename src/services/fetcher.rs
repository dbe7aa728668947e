// src/services/fetcher.rs

//! Source fetcher service.
//!
//! Downloads historical exports through the governor and stages the raw
//! bytes for replay. Transfers resume from `<staging>/<vintage>.part` with a
//! `Range` request; a completed download is renamed to
//! `<staging>/<vintage>.csv` (or `.zip`) and replayed on later runs.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{ManifestEntry, RawBatch};
use crate::throttle::ResourceGovernor;
use crate::utils::http::{HttpClient, HttpRequest, HttpStream};
use crate::utils::sha256_hex;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Service for retrieving and staging raw batches.
pub struct SourceFetcher {
    governor: Arc<ResourceGovernor>,
    client: Arc<dyn HttpClient>,
    staging_dir: PathBuf,
    refresh: bool,
}

impl SourceFetcher {
    pub fn new(
        governor: Arc<ResourceGovernor>,
        client: Arc<dyn HttpClient>,
        staging_dir: impl Into<PathBuf>,
        refresh: bool,
    ) -> Self {
        Self {
            governor,
            client,
            staging_dir: staging_dir.into(),
            refresh,
        }
    }

    fn part_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.staging_dir.join(format!("{}.part", entry.vintage))
    }

    fn staged_path(&self, entry: &ManifestEntry, ext: &str) -> PathBuf {
        self.staging_dir.join(format!("{}.{}", entry.vintage, ext))
    }

    /// Fetch one manifest entry, replaying a staged copy when present.
    pub async fn fetch(&self, entry: &ManifestEntry) -> Result<RawBatch> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        if !self.refresh {
            if let Some(batch) = self.replay(entry).await? {
                return Ok(batch);
            }
        }

        log::info!("Downloading batch {} from {}", entry.vintage, entry.url);
        let (bytes, staged) = self
            .governor
            .execute(&entry.url, |attempt| self.download_attempt(entry, attempt))
            .await?;

        self.into_batch(entry, bytes, staged)
    }

    /// Load a previously staged download, discarding it if it fails the checksum.
    async fn replay(&self, entry: &ManifestEntry) -> Result<Option<RawBatch>> {
        for ext in ["csv", "zip"] {
            let path = self.staged_path(entry, ext);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(expected) = &entry.checksum {
                let actual = sha256_hex(&bytes);
                if !actual.eq_ignore_ascii_case(expected) {
                    log::warn!(
                        "Staged copy of {} fails its checksum; downloading again",
                        entry.vintage
                    );
                    tokio::fs::remove_file(&path).await?;
                    continue;
                }
            }
            log::info!("Replaying staged batch {} from {}", entry.vintage, path.display());
            return self.into_batch(entry, bytes, path).map(Some);
        }
        Ok(None)
    }

    /// One governed attempt: resume or restart the `.part` file, verify, stage.
    async fn download_attempt(
        &self,
        entry: &ManifestEntry,
        attempt: u32,
    ) -> Result<(Vec<u8>, PathBuf)> {
        let part = self.part_path(entry);
        let offset = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = HttpRequest::get(&entry.url);
        if offset > 0 {
            log::debug!(
                "Resuming {} at byte {} (attempt {})",
                entry.vintage,
                offset,
                attempt + 1
            );
            request = request.with_range_from(offset);
        }

        let HttpStream { head, mut body } = self.client.stream(request).await?;
        if head.status == 416 && offset > 0 {
            // Range past the end: the partial file is already complete.
            log::debug!("{} already fully transferred", entry.vintage);
        } else {
            let head = head.error_for_status()?;
            if head.is_html() {
                return Err(AppError::UnexpectedContent {
                    url: entry.url.clone(),
                    content_type: head.content_type.unwrap_or_default(),
                });
            }
            let resumed = head.status == 206 && offset > 0;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(resumed)
                .truncate(!resumed)
                .open(&part)
                .await?;

            // Received chunks stay in `.part` even when the transfer breaks.
            let mut copied = Ok(());
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => file.write_all(&chunk).await?,
                    Err(e) => {
                        copied = Err(e);
                        break;
                    }
                }
            }
            file.flush().await?;
            copied?;
        }

        let bytes = tokio::fs::read(&part).await?;
        let actual = sha256_hex(&bytes);
        if let Some(expected) = &entry.checksum {
            if !actual.eq_ignore_ascii_case(expected) {
                tokio::fs::remove_file(&part).await?;
                return Err(AppError::ChecksumMismatch {
                    batch_id: entry.vintage.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let ext = if bytes.starts_with(ZIP_MAGIC) { "zip" } else { "csv" };
        let staged = self.staged_path(entry, ext);
        tokio::fs::rename(&part, &staged).await?;
        Ok((bytes, staged))
    }

    fn into_batch(&self, entry: &ManifestEntry, bytes: Vec<u8>, staged: PathBuf) -> Result<RawBatch> {
        let checksum = sha256_hex(&bytes);
        let content = if bytes.starts_with(ZIP_MAGIC) {
            unpack_csv(&bytes, &staged)?
        } else {
            bytes
        };
        Ok(RawBatch {
            batch_id: entry.vintage.clone(),
            source_url: entry.url.clone(),
            fetched_at: Utc::now(),
            checksum,
            content,
            staged_path: Some(staged),
        })
    }
}

/// Extract the first `.csv` member of a ZIP archive.
fn unpack_csv(bytes: &[u8], origin: &Path) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let name = archive
        .file_names()
        .filter(|n| !n.starts_with("__MACOSX/"))
        .find(|n| n.to_ascii_lowercase().ends_with(".csv"))
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::validation(format!("{} contains no CSV member", origin.display()))
        })?;

    let mut member = archive.by_name(&name)?;
    let mut content = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut content)?;
    log::debug!("Unpacked {} ({} bytes) from {}", name, content.len(), origin.display());
    Ok(content)
}
