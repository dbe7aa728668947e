// src/config.rs

//! Configuration loading utilities.
//!
//! This module provides convenience functions for loading the configuration
//! and the historical manifest from a base directory.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::{Config, Manifest};

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file is missing or unreadable.
pub fn load_config(path: &Path) -> Config {
    Config::load_or_default(path)
}

/// Resolve a configured path against `base_path` unless it is absolute.
pub fn resolve_path(base_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_path.join(path)
    }
}

/// Load the manifest a configuration points at.
pub fn load_manifest(base_path: &Path, config: &Config) -> Result<Manifest> {
    let path = resolve_path(base_path, &config.paths.manifest_file);
    if !path.exists() {
        return Err(AppError::config(format!(
            "Manifest not found at {}",
            path.display()
        )));
    }
    Manifest::load(&path)
}

/// Load and validate both config and manifest.
///
/// Storage and staging paths in the returned config are resolved against
/// `base_path`.
pub fn load_all(base_path: &Path) -> Result<(Config, Manifest)> {
    let mut config = load_config(&base_path.join("config.toml"));
    config
        .validate()
        .map_err(|e| AppError::config(format!("Invalid configuration: {e}")))?;

    config.paths.storage_dir = resolve_path(base_path, &config.paths.storage_dir);
    config.paths.staging_dir = resolve_path(base_path, &config.paths.staging_dir);

    let manifest = load_manifest(base_path, &config)?;
    manifest
        .validate()
        .map_err(|e| AppError::config(format!("Invalid manifest: {e}")))?;

    Ok((config, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_all_resolves_paths_and_validates_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[paths]\nstorage_dir = \"out\"\nmanifest_file = \"manifest.toml\"\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("manifest.toml"),
            "[[resources]]\nvintage = \"2023-01\"\nurl = \"https://data.test/2023-01.csv\"\n",
        )
        .unwrap();

        let (config, manifest) = load_all(tmp.path()).unwrap();
        assert_eq!(config.paths.storage_dir, tmp.path().join("out"));
        assert_eq!(manifest.resources.len(), 1);
    }

    #[test]
    fn empty_manifest_is_a_configuration_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[paths]\nmanifest_file = \"manifest.toml\"\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("manifest.toml"), "resources = []\n").unwrap();

        let err = load_all(tmp.path()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
