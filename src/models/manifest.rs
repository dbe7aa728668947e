//! Historical batch manifest and fetched raw batches.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// List of remote monthly exports to ingest.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ManifestEntry>,
}

/// One remote export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Vintage label, also the batch id (e.g. `2023-01`)
    pub vintage: String,

    /// Download location
    pub url: String,

    /// Expected SHA-256 of the downloaded bytes, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ManifestEntry {
    pub fn new(vintage: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            vintage: vintage.into(),
            url: url.into(),
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn batch_id(&self) -> &str {
        &self.vintage
    }
}

impl Manifest {
    pub fn new(resources: Vec<ManifestEntry>) -> Self {
        Self { resources }
    }

    /// Load a manifest from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write the manifest as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject manifests the pipeline cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(AppError::config("Manifest lists no resources"));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.resources {
            if entry.vintage.trim().is_empty() {
                return Err(AppError::config(format!(
                    "Manifest entry for {} has an empty vintage",
                    entry.url
                )));
            }
            if !is_safe_file_stem(&entry.vintage) {
                return Err(AppError::config(format!(
                    "Vintage '{}' cannot name a staging file",
                    entry.vintage
                )));
            }
            if !seen.insert(entry.vintage.as_str()) {
                return Err(AppError::config(format!(
                    "Vintage {} listed more than once",
                    entry.vintage
                )));
            }
            url::Url::parse(&entry.url)?;
        }
        Ok(())
    }
}

/// Vintages name staging files: no separators, no `..`, no leading dot.
fn is_safe_file_stem(vintage: &str) -> bool {
    !vintage.starts_with('.')
        && !vintage.contains("..")
        && vintage
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Bytes of one export as retrieved. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub batch_id: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,

    /// SHA-256 of the downloaded bytes
    pub checksum: String,

    /// CSV payload (unpacked when the download was an archive)
    pub content: Vec<u8>,

    /// Staged copy kept for replay
    pub staged_path: Option<PathBuf>,
}

impl RawBatch {
    /// Build a batch from in-memory CSV bytes.
    pub fn from_bytes(batch_id: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            batch_id: batch_id.into(),
            source_url: String::new(),
            fetched_at: Utc::now(),
            checksum: crate::utils::sha256_hex(&content),
            content,
            staged_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manifest_is_a_config_error() {
        let err = Manifest::default().validate().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn vintages_that_escape_the_staging_dir_are_rejected() {
        for vintage in ["../x", "2023/01", "..", ".hidden", "a\\b", "2023-01 "] {
            let manifest = Manifest::new(vec![ManifestEntry::new(vintage, "https://data.test/x.csv")]);
            assert!(manifest.validate().is_err(), "{vintage:?} accepted");
        }
        let manifest = Manifest::new(vec![ManifestEntry::new(
            "2023-01_v2",
            "https://data.test/x.csv",
        )]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn duplicate_vintages_are_rejected() {
        let manifest = Manifest::new(vec![
            ManifestEntry::new("2023-01", "https://data.test/a.csv"),
            ManifestEntry::new("2023-01", "https://data.test/b.csv"),
        ]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn manifest_round_trips_through_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("manifest.toml");
        let manifest = Manifest::new(vec![
            ManifestEntry::new("2023-01", "https://data.test/2023-01.csv").with_checksum("abc"),
        ]);
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.validate().is_ok());
    }
}
