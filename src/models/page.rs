//! Crawled page records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One fetch of one URL. History is keyed by `(url, fetched_at)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlPage {
    /// Normalized URL
    pub url: String,
    pub fetched_at: DateTime<Utc>,

    /// SHA-256 of `content`, hex encoded (empty when the fetch failed)
    #[serde(default)]
    pub content_hash: String,

    #[serde(default)]
    pub content: String,

    /// HTTP status, absent when no response was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// First `h1`/`h2` heading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_heading: Option<String>,

    /// Readable text of the main content, one block per line
    #[serde(default)]
    pub text: String,

    /// Crawl depth at which the page was reached
    #[serde(default)]
    pub depth: usize,

    #[serde(default)]
    pub outbound_links: Vec<String>,
}

impl CrawlPage {
    /// A page whose fetch failed; kept so the failure is auditable.
    pub fn failed(
        url: impl Into<String>,
        depth: usize,
        http_status: Option<u16>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            fetched_at: Utc::now(),
            content_hash: String::new(),
            content: String::new(),
            http_status,
            error: Some(error.into()),
            title: None,
            description: None,
            main_heading: None,
            text: String::new(),
            depth,
            outbound_links: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
