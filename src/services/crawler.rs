// src/services/crawler.rs

//! Polite breadth-first crawler.
//!
//! Traverses an explicit frontier level by level. Every URL passes the
//! disallow list and the origin's robots.txt before it is fetched, and every
//! fetch goes through the shared governor with a single attempt.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use texting_robots::Robot;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{CrawlPage, CrawlSummary, CrawlerConfig, SkipReason, SkippedUrl};
use crate::storage::PageSink;
use crate::throttle::{ResourceGovernor, RetryPolicy};
use crate::utils::http::{HttpClient, HttpRequest, HttpResponse};
use crate::utils::sha256_hex;
use crate::utils::url::{has_extension, normalize, path_of, resolve, same_origin};

/// Subtrees that never hold page content.
const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer",
];

/// Elements that start a new line of extracted text.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "li", "tr", "br", "h1", "h2", "h3", "h4", "h5", "h6",
    "blockquote", "pre", "dd", "dt",
];

/// Extracted page metadata.
#[derive(Debug, Default)]
struct PageMeta {
    title: Option<String>,
    description: Option<String>,
    main_heading: Option<String>,
    text: String,
    links: Vec<String>,
}

pub struct PoliteCrawler {
    config: CrawlerConfig,
    disallow: Vec<Regex>,
    user_agent: String,
    governor: Arc<ResourceGovernor>,
    client: Arc<dyn HttpClient>,
}

impl PoliteCrawler {
    pub fn new(
        config: &CrawlerConfig,
        user_agent: impl Into<String>,
        governor: Arc<ResourceGovernor>,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        Ok(Self {
            disallow: config.disallow_patterns()?,
            config: config.clone(),
            user_agent: user_agent.into(),
            governor,
            client,
        })
    }

    /// Crawl from `seeds`, appending every fetched page to `sink`.
    ///
    /// Returns `Err` only when the sink fails; cancellation stops the crawl
    /// and is reported in the summary.
    pub async fn crawl<S>(&self, seeds: &[String], sink: &S) -> Result<CrawlSummary>
    where
        S: PageSink + ?Sized,
    {
        let mut summary = CrawlSummary::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut unvisited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        let mut robots: HashMap<String, Option<Robot>> = HashMap::new();
        let mut budget = self.config.max_pages;

        for seed in seeds {
            match normalize(seed) {
                Some(url) if visited.insert(url.clone()) => frontier.push_back((url, 0)),
                Some(_) => {}
                None => log::warn!("Ignoring invalid seed URL: {seed}"),
            }
        }
        log::info!("Crawling from {} seeds (max depth {})", frontier.len(), self.config.max_depth);

        'levels: while !frontier.is_empty() {
            let mut level = Vec::new();
            for (url, depth) in std::mem::take(&mut frontier) {
                if self.governor.is_cancelled() {
                    summary.cancelled = true;
                    break 'levels;
                }
                let blocked = match self.blocked(&url, &mut robots).await {
                    Ok(blocked) => blocked,
                    Err(AppError::Cancelled) => {
                        summary.cancelled = true;
                        break 'levels;
                    }
                    Err(error) => return Err(error),
                };
                let reason = match blocked {
                    Some(reason) => Some(reason),
                    None if budget == 0 => Some(SkipReason::PageBudget),
                    None => None,
                };
                if let Some(reason) = reason {
                    log::info!("Skipping {url}: {reason}");
                    summary.skipped.push(SkippedUrl { url, reason });
                    continue;
                }
                budget -= 1;
                level.push((url, depth));
            }

            let mut pages = stream::iter(level)
                .map(|(url, depth)| self.fetch_page(url, depth))
                .buffer_unordered(self.governor.max_concurrent());

            while let Some(result) = pages.next().await {
                let page = match result {
                    Ok(page) => page,
                    Err(_) => {
                        summary.cancelled = true;
                        break 'levels;
                    }
                };
                sink.append_page(&page).await?;

                if !page.is_success() {
                    log::warn!(
                        "Fetch failed for {}: {}",
                        page.url,
                        page.error.as_deref().unwrap_or("unknown error")
                    );
                    summary.failed.push(page.url);
                    continue;
                }

                for link in &page.outbound_links {
                    if visited.contains(link) {
                        continue;
                    }
                    if page.depth < self.config.max_depth {
                        visited.insert(link.clone());
                        frontier.push_back((link.clone(), page.depth + 1));
                    } else if unvisited.insert(link.clone()) {
                        summary.unvisited_links.push(link.clone());
                    }
                }
                summary.fetched.push(page.url);
            }
        }

        if summary.cancelled {
            log::warn!("Crawl cancelled after {} pages", summary.fetched.len());
        }
        log::info!(
            "Crawl finished: {} fetched, {} failed, {} skipped",
            summary.fetched.len(),
            summary.failed.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }

    /// Check the disallow list, then robots.txt for the URL's origin.
    async fn blocked(
        &self,
        url: &str,
        robots: &mut HashMap<String, Option<Robot>>,
    ) -> Result<Option<SkipReason>> {
        let path = path_of(url);
        if self.disallow.iter().any(|re| re.is_match(&path)) {
            let skip = AppError::DisallowedPath {
                url: url.to_string(),
            };
            log::debug!("{skip}");
            return Ok(Some(SkipReason::Disallowed));
        }
        if !self.config.respect_robots_txt {
            return Ok(None);
        }

        let Some(origin) = origin_of(url) else {
            return Ok(None);
        };
        if !robots.contains_key(&origin) {
            let robot = self.fetch_robots(&origin).await?;
            robots.insert(origin.clone(), robot);
        }
        let allowed = robots
            .get(&origin)
            .and_then(Option::as_ref)
            .is_none_or(|robot| robot.allowed(url));
        Ok((!allowed).then_some(SkipReason::RobotsTxt))
    }

    /// Fetch and parse `<origin>/robots.txt`; any failure allows everything.
    async fn fetch_robots(&self, origin: &str) -> Result<Option<Robot>> {
        let robots_url = format!("{origin}/robots.txt");
        let response = match self
            .governor
            .get(self.client.as_ref(), &robots_url, RetryPolicy::single())
            .await
        {
            Ok(response) => response,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(error) => {
                log::debug!("No robots.txt for {origin}: {error}");
                return Ok(None);
            }
        };
        match Robot::new(&self.user_agent, &response.body) {
            Ok(robot) => Ok(Some(robot)),
            Err(error) => {
                log::warn!("Unparseable robots.txt at {robots_url}: {error}");
                Ok(None)
            }
        }
    }

    /// Fetch one page. Failures become error pages; only cancellation is `Err`.
    async fn fetch_page(&self, url: String, depth: usize) -> Result<CrawlPage> {
        let result = self
            .governor
            .execute_with(&url, RetryPolicy::single(), |_| {
                self.client.execute(HttpRequest::get(&url))
            })
            .await;

        match result {
            Ok(response) if response.is_success() => Ok(self.page_from(url, depth, &response)),
            Ok(response) => {
                let status = response.status;
                Ok(CrawlPage::failed(url, depth, Some(status), format!("HTTP {status}")))
            }
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(error) => Ok(CrawlPage::failed(url, depth, None, error.to_string())),
        }
    }

    fn page_from(&self, url: String, depth: usize, response: &HttpResponse) -> CrawlPage {
        let content = response.text();
        let meta = if response.is_html() || response.content_type.is_none() {
            self.extract(&url, &content)
        } else {
            PageMeta::default()
        };
        log::debug!("Fetched {url} ({} links)", meta.links.len());

        CrawlPage {
            fetched_at: Utc::now(),
            content_hash: sha256_hex(&response.body),
            content,
            http_status: Some(response.status),
            error: None,
            title: meta.title,
            description: meta.description,
            main_heading: meta.main_heading,
            text: meta.text,
            depth,
            outbound_links: meta.links,
            url,
        }
    }

    /// Metadata, readable text and followable links of an HTML document.
    fn extract(&self, base_url: &str, html: &str) -> PageMeta {
        let document = Html::parse_document(html);
        let mut meta = PageMeta::default();

        if let Ok(selector) = Selector::parse("title") {
            meta.title = document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty());
        }
        if let Ok(selector) = Selector::parse(r#"meta[name="description"]"#) {
            meta.description = document
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("content"))
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty());
        }
        if let Ok(selector) = Selector::parse("h1, h2") {
            meta.main_heading = document
                .select(&selector)
                .filter(|el| !in_skipped_subtree(*el))
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .find(|h| !h.is_empty());
        }
        meta.text = readable_text(&document);

        let Ok(link_selector) = Selector::parse("a[href]") else {
            return meta;
        };
        let mut seen = HashSet::new();
        for element in document.select(&link_selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Some(link) = resolve(base_url, href).and_then(|l| normalize(&l)) else {
                continue;
            };
            if has_extension(&link, &self.config.skip_extensions) {
                continue;
            }
            if !self.config.follow_cross_origin && !same_origin(base_url, &link) {
                continue;
            }
            if seen.insert(link.clone()) {
                meta.links.push(link);
            }
        }
        meta
    }
}

/// Text of `<main>` (or `<body>`) with layout chrome and scripts removed.
fn readable_text(document: &Html) -> String {
    let root = ["main", "body"]
        .iter()
        .filter_map(|tag| Selector::parse(tag).ok())
        .find_map(|selector| document.select(&selector).next())
        .unwrap_or_else(|| document.root_element());

    let mut raw = String::new();
    push_text(root, &mut raw);
    raw.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.extend(text.chars().map(|c| if c.is_whitespace() { ' ' } else { c }));
        } else if let Some(child) = ElementRef::wrap(child) {
            let name = child.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            let block = BLOCK_ELEMENTS.contains(&name);
            if block {
                out.push('\n');
            }
            push_text(child, out);
            if block {
                out.push('\n');
            }
        }
    }
}

fn in_skipped_subtree(element: ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| SKIPPED_ELEMENTS.contains(&a.value().name()))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::models::{GovernorConfig, RateLimitConfig};
    use crate::storage::MemoryStore;
    use crate::utils::http::{Scripted, ScriptedHttpClient};

    const SEED: &str = "https://bikes.test/";

    fn crawler(client: &Arc<ScriptedHttpClient>, config: CrawlerConfig) -> PoliteCrawler {
        crawler_with(client, config, CancellationToken::new())
    }

    fn crawler_with(
        client: &Arc<ScriptedHttpClient>,
        config: CrawlerConfig,
        cancel: CancellationToken,
    ) -> PoliteCrawler {
        let governor = GovernorConfig {
            default_rate: RateLimitConfig {
                requests: 1000,
                window_ms: 1000,
                burst: 10,
            },
            ..GovernorConfig::default()
        };
        let client: Arc<dyn HttpClient> = client.clone();
        PoliteCrawler::new(
            &config,
            "bikeshare-test",
            Arc::new(ResourceGovernor::new(&governor, cancel)),
            client,
        )
        .unwrap()
    }

    fn config() -> CrawlerConfig {
        CrawlerConfig {
            seeds: vec![SEED.into()],
            max_depth: 2,
            max_pages: 50,
            disallow: vec!["^/admin".into()],
            skip_extensions: vec![".pdf".into()],
            follow_cross_origin: false,
            respect_robots_txt: true,
        }
    }

    #[tokio::test]
    async fn follows_same_origin_links_breadth_first() {
        let client = Arc::new(ScriptedHttpClient::new());
        client
            .always(
                SEED,
                Scripted::html(
                    SEED,
                    r#"<html><head><title>Home</title>
                    <meta name="description" content="Bike share news"></head>
                    <body><a href="/news#top">News</a><a href="/map.pdf">Map</a>
                    <a href="https://other.test/x">Other</a><a href="/news">Again</a></body></html>"#,
                ),
            )
            .always(
                "https://bikes.test/news",
                Scripted::html("https://bikes.test/news", "<a href='/'>home</a>"),
            );
        let store = MemoryStore::new();

        let summary = crawler(&client, config())
            .crawl(&[SEED.to_string()], &store)
            .await
            .unwrap();

        assert_eq!(summary.fetched, vec![SEED, "https://bikes.test/news"]);
        let pages = store.pages();
        assert_eq!(pages[0].title.as_deref(), Some("Home"));
        assert_eq!(pages[0].description.as_deref(), Some("Bike share news"));
        assert_eq!(pages[0].outbound_links, vec!["https://bikes.test/news"]);
        assert_eq!(client.request_count(SEED), 1);
    }

    #[test]
    fn readable_text_skips_layout_and_scripts() {
        let crawler = crawler(&Arc::new(ScriptedHttpClient::new()), config());
        let meta = crawler.extract(
            SEED,
            r#"<html><head><title>Pricing</title><style>p { color: red }</style></head>
            <body>
              <header><h1>Site banner</h1></header>
              <nav><a href="/a">Menu</a></nav>
              <main>
                <h2>Day   passes</h2>
                <!-- pricing table -->
                <p>Unlimited 30-minute rides
                   for 24 hours.</p>
                <script>track();</script>
                <ul><li>Classic bikes</li><li>E-bikes</li></ul>
              </main>
              <footer>Copyright</footer>
            </body></html>"#,
        );

        assert_eq!(meta.main_heading.as_deref(), Some("Day passes"));
        assert_eq!(
            meta.text,
            "Day passes\nUnlimited 30-minute rides for 24 hours.\nClassic bikes\nE-bikes"
        );
    }

    #[test]
    fn body_is_used_when_there_is_no_main() {
        let crawler = crawler(&Arc::new(ScriptedHttpClient::new()), config());
        let meta = crawler.extract(
            SEED,
            "<body><footer>skip</footer><h1>Stations</h1><p>Find a dock.</p></body>",
        );
        assert_eq!(meta.main_heading.as_deref(), Some("Stations"));
        assert_eq!(meta.text, "Stations\nFind a dock.");
    }

    #[tokio::test]
    async fn disallowed_paths_are_skipped_without_fetching() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.always(
            SEED,
            Scripted::html(SEED, "<a href='/admin/login'>a</a><a href='/about'>b</a>"),
        );
        client.always(
            "https://bikes.test/about",
            Scripted::html("https://bikes.test/about", "about"),
        );
        let store = MemoryStore::new();

        let summary = crawler(&client, config())
            .crawl(&[SEED.to_string()], &store)
            .await
            .unwrap();

        assert!(summary.was_skipped("https://bikes.test/admin/login"));
        assert_eq!(client.request_count("https://bikes.test/admin/login"), 0);
        assert_eq!(store.pages().len(), 2);
    }

    #[tokio::test]
    async fn robots_txt_is_honoured() {
        let client = Arc::new(ScriptedHttpClient::new());
        client
            .always(
                "https://bikes.test/robots.txt",
                Scripted::ok(
                    "https://bikes.test/robots.txt",
                    "User-agent: *\nDisallow: /private\n",
                ),
            )
            .always(SEED, Scripted::html(SEED, "<a href='/private/x'>p</a>"));
        let store = MemoryStore::new();

        let summary = crawler(&client, config())
            .crawl(&[SEED.to_string()], &store)
            .await
            .unwrap();

        assert_eq!(
            summary.skipped,
            vec![SkippedUrl {
                url: "https://bikes.test/private/x".into(),
                reason: SkipReason::RobotsTxt,
            }]
        );
        assert_eq!(client.request_count("https://bikes.test/robots.txt"), 1);
    }

    #[tokio::test]
    async fn errors_are_recorded_and_not_retried() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.always(SEED, Scripted::status(SEED, 503));
        let store = MemoryStore::new();

        let summary = crawler(&client, config())
            .crawl(&[SEED.to_string()], &store)
            .await
            .unwrap();

        assert_eq!(summary.failed, vec![SEED]);
        assert_eq!(client.request_count(SEED), 1);
        let pages = store.pages();
        assert_eq!(pages[0].http_status, Some(503));
        assert!(!pages[0].is_success());
    }

    #[tokio::test]
    async fn depth_and_page_budget_bound_the_crawl() {
        let client = Arc::new(ScriptedHttpClient::new());
        client
            .always(SEED, Scripted::html(SEED, "<a href='/a'>a</a><a href='/b'>b</a>"))
            .always(
                "https://bikes.test/a",
                Scripted::html("https://bikes.test/a", "<a href='/deep'>d</a>"),
            );
        let store = MemoryStore::new();
        let config = CrawlerConfig {
            max_depth: 1,
            max_pages: 2,
            respect_robots_txt: false,
            ..config()
        };

        let summary = crawler(&client, config)
            .crawl(&[SEED.to_string()], &store)
            .await
            .unwrap();

        assert_eq!(summary.fetched.len(), 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].reason, SkipReason::PageBudget);
        assert_eq!(summary.unvisited_links, vec!["https://bikes.test/deep"]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_crawl() {
        let client = Arc::new(ScriptedHttpClient::new());
        client.always(SEED, Scripted::html(SEED, "home"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let store = MemoryStore::new();

        let summary = crawler_with(&client, config(), cancel)
            .crawl(&[SEED.to_string()], &store)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(store.pages().is_empty());
    }
}
