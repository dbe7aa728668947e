// src/error.rs

//! Unified error handling for the ingestion pipeline.

use std::fmt;

use thiserror::Error;

use crate::models::RejectReason;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network failure worth retrying (timeouts, connect errors, 408/429/5xx)
    #[error("Transient network error for {url}: {message}")]
    TransientNetwork { url: String, message: String },

    /// Non-retryable HTTP status
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Batch header matched none of the known layouts
    #[error("Unrecognized schema for batch {batch_id}: [{header}]")]
    SchemaUnrecognized { batch_id: String, header: String },

    /// Row-level validation failure
    #[error("Invalid record in batch {batch_id} at row {row}: {reason}")]
    RecordValidation {
        batch_id: String,
        row: usize,
        reason: RejectReason,
    },

    /// Station feed has failed repeatedly
    #[error("Station feed degraded after {consecutive_failures} consecutive failures")]
    FeedDegraded { consecutive_failures: u32 },

    /// URL excluded by the crawl disallow list or robots.txt
    #[error("Disallowed path: {url}")]
    DisallowedPath { url: String },

    /// Downloaded bytes did not match the manifest checksum
    #[error("Checksum mismatch for batch {batch_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        batch_id: String,
        expected: String,
        actual: String,
    },

    /// Remote served something other than a data file
    #[error("Unexpected content from {url}: {content_type}")]
    UnexpectedContent { url: String, content_type: String },

    /// Run-level cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// Trip log, watermark or snapshot store failure
    #[error("Store error: {0}")]
    Store(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// CSV reading failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// ZIP archive could not be read
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a transient network error.
    pub fn transient(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::TransientNetwork {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a storage error.
    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the governor should spend another attempt on this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } | Self::ChecksumMismatch { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether the error means the run cannot continue at all.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Cancelled | Self::Config(_))
    }

    /// Short machine-readable kind, used in watermarks and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork { .. } | Self::Http(_) => "transient-network",
            Self::HttpStatus { .. } => "http-status",
            Self::SchemaUnrecognized { .. } => "schema-unrecognized",
            Self::RecordValidation { .. } => "record-validation",
            Self::FeedDegraded { .. } => "feed-degraded",
            Self::DisallowedPath { .. } => "disallowed-path",
            Self::ChecksumMismatch { .. } => "checksum-mismatch",
            Self::UnexpectedContent { .. } => "unexpected-content",
            Self::Cancelled => "cancelled",
            Self::Store(_) => "store",
            Self::Csv(_) | Self::Zip(_) => "unreadable-batch",
            Self::Io(_) => "io",
            Self::Json(_) | Self::Toml(_) | Self::TomlSerialize(_) => "serialization",
            Self::Url(_) => "invalid-url",
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
        }
    }
}
