// src/services/discovery.rs

//! Manifest discovery from the publisher's system-data page.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use scraper::{Html, Selector};

use crate::error::Result;
use crate::models::{Manifest, ManifestEntry};
use crate::throttle::ResourceGovernor;
use crate::utils::http::HttpClient;
use crate::utils::url::resolve;

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const MONTH_YEAR: &str = r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{4})\b";
const HREF_YEAR_MONTH: &str = r"(\d{4})[-_]?(\d{2})";
const DRIVE_FILE_ID: &str = r"/file/d/([^/?#]+)";

static PATTERNS: OnceLock<Option<LinkPatterns>> = OnceLock::new();

/// Link-classification regexes, compiled once per process.
struct LinkPatterns {
    month_year: Regex,
    href_year_month: Regex,
    drive_file_id: Regex,
}

impl LinkPatterns {
    fn get() -> Option<&'static Self> {
        PATTERNS
            .get_or_init(|| {
                Some(Self {
                    month_year: Regex::new(MONTH_YEAR).ok()?,
                    href_year_month: Regex::new(HREF_YEAR_MONTH).ok()?,
                    drive_file_id: Regex::new(DRIVE_FILE_ID).ok()?,
                })
            })
            .as_ref()
    }

    /// `"January 2023"` -> `2023-01`.
    fn vintage_from_text(&self, text: &str) -> Option<String> {
        let caps = self.month_year.captures(text)?;
        let month_name = caps[1].to_ascii_lowercase();
        let month = MONTHS.iter().position(|m| *m == month_name)? + 1;
        Some(format!("{}-{:02}", &caps[2], month))
    }

    /// `.../Mobi_System_Data_2023-01.csv` -> `2023-01`.
    fn vintage_from_href(&self, href: &str) -> Option<String> {
        self.href_year_month.captures_iter(href).find_map(|caps| {
            let month: u32 = caps[2].parse().ok()?;
            (1..=12)
                .contains(&month)
                .then(|| format!("{}-{:02}", &caps[1], month))
        })
    }

    /// Direct-download form of a link: Drive viewer links are rewritten.
    fn download_url(&self, base_url: &str, href: &str, is_drive: bool) -> Option<String> {
        if is_drive {
            if let Some(caps) = self.drive_file_id.captures(href) {
                return Some(format!(
                    "https://drive.google.com/uc?export=download&id={}",
                    &caps[1]
                ));
            }
        }
        resolve(base_url, href)
    }
}

pub struct ManifestDiscovery {
    page_url: String,
    governor: Arc<ResourceGovernor>,
    client: Arc<dyn HttpClient>,
}

impl ManifestDiscovery {
    pub fn new(
        page_url: impl Into<String>,
        governor: Arc<ResourceGovernor>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            page_url: page_url.into(),
            governor,
            client,
        }
    }

    /// Fetch the listing page and build a manifest from its data links.
    pub async fn discover(&self) -> Result<Manifest> {
        log::info!("Discovering monthly exports on {}", self.page_url);
        let response = self
            .governor
            .get(self.client.as_ref(), &self.page_url, self.governor.retry_policy())
            .await?;
        let manifest = parse_listing(&self.page_url, &response.text());
        log::info!("Found {} monthly exports", manifest.resources.len());
        Ok(manifest)
    }
}

/// Extract data-file links from a listing page, sorted by vintage.
///
/// The first link seen for a vintage wins; links whose vintage cannot be
/// derived are logged and ignored.
pub fn parse_listing(base_url: &str, html: &str) -> Manifest {
    let document = Html::parse_document(html);
    let (Some(patterns), Ok(selector)) = (LinkPatterns::get(), Selector::parse("a[href]")) else {
        return Manifest::default();
    };

    let mut by_vintage: BTreeMap<String, ManifestEntry> = BTreeMap::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href").map(str::trim) else {
            continue;
        };
        let lower = href.to_ascii_lowercase();
        let is_drive = lower.contains("drive.google.com");
        if !is_drive && !lower.contains(".csv") && !lower.contains(".zip") {
            continue;
        }

        let text = element.text().collect::<String>();
        let Some(vintage) = patterns
            .vintage_from_text(&text)
            .or_else(|| patterns.vintage_from_href(href))
        else {
            log::warn!("Cannot derive a vintage for data link {href}");
            continue;
        };
        let Some(url) = patterns.download_url(base_url, href, is_drive) else {
            continue;
        };
        by_vintage
            .entry(vintage.clone())
            .or_insert_with(|| ManifestEntry::new(vintage, url));
    }

    Manifest::new(by_vintage.into_values().collect())
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::models::GovernorConfig;
    use crate::utils::http::{Scripted, ScriptedHttpClient};

    const PAGE: &str = "https://www.bikes.test/en/system-data";
    const LISTING: &str = r#"
        <ul>
          <li><a href="https://drive.google.com/file/d/1AbC_xyz/view?usp=sharing">February 2023</a></li>
          <li><a href="/files/Mobi_System_Data_2023-01.csv">Download</a></li>
          <li><a href="/files/Mobi_System_Data_2022_12.zip">December 2022 (zip)</a></li>
          <li><a href="/files/Mobi_System_Data_2023-01-copy.csv">January 2023</a></li>
          <li><a href="/about">About</a></li>
          <li><a href="/files/legacy.csv">Legacy export</a></li>
        </ul>"#;

    #[test]
    fn derives_vintages_and_download_urls() {
        let manifest = parse_listing(PAGE, LISTING);
        let vintages: Vec<_> = manifest.resources.iter().map(|r| r.vintage.as_str()).collect();
        assert_eq!(vintages, vec!["2022-12", "2023-01", "2023-02"]);

        assert_eq!(
            manifest.resources[1].url,
            "https://www.bikes.test/files/Mobi_System_Data_2023-01.csv"
        );
        assert_eq!(
            manifest.resources[2].url,
            "https://drive.google.com/uc?export=download&id=1AbC_xyz"
        );
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn month_names_are_case_insensitive() {
        let patterns = LinkPatterns::get().unwrap();
        assert_eq!(
            patterns.vintage_from_text("  SEPTEMBER 2019 data").as_deref(),
            Some("2019-09")
        );
        assert_eq!(patterns.vintage_from_href("/x/2021-13.csv"), None);
    }

    #[test]
    fn link_patterns_are_compiled_once() {
        let first = LinkPatterns::get().unwrap();
        parse_listing(PAGE, LISTING);
        assert!(std::ptr::eq(first, LinkPatterns::get().unwrap()));
    }

    #[tokio::test]
    async fn discover_fetches_the_listing() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.always(PAGE, Scripted::html(PAGE, LISTING));
        let governor = Arc::new(ResourceGovernor::new(
            &GovernorConfig::default(),
            CancellationToken::new(),
        ));
        let http: Arc<dyn HttpClient> = client.clone();

        let manifest = ManifestDiscovery::new(PAGE, governor, http)
            .discover()
            .await
            .unwrap();
        assert_eq!(manifest.resources.len(), 3);
    }
}
