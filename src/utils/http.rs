// src/utils/http.rs

//! HTTP client utilities.
//!
//! Network access goes through the [`HttpClient`] trait so the governor,
//! fetcher, poller and crawler can run against [`ReqwestHttpClient`] in
//! production and [`ScriptedHttpClient`] in tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::error::{AppError, Result};
use crate::models::GovernorConfig;

/// Outgoing GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    /// Lower-cased header names
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Ask for the remainder of a resource starting at `offset`.
    pub fn with_range_from(self, offset: u64) -> Self {
        self.with_header("range", format!("bytes={offset}-"))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Map non-2xx statuses onto the error taxonomy.
    ///
    /// 408, 429 and 5xx are transient; anything else is final.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        if is_transient_status(self.status) {
            return Err(AppError::transient(
                self.url,
                format!("HTTP {}", self.status),
            ));
        }
        Err(AppError::HttpStatus {
            url: self.url,
            status: self.status,
        })
    }
}

/// Response whose body arrives as a chunk stream.
///
/// `head.body` is empty; chunks are yielded as they come off the wire and a
/// failed transfer surfaces as an `Err` item after the chunks already read.
pub struct HttpStream {
    pub head: HttpResponse,
    pub body: BoxStream<'static, Result<Vec<u8>>>,
}

impl HttpStream {
    /// Wrap an already buffered response.
    pub fn buffered(mut response: HttpResponse) -> Self {
        let body = std::mem::take(&mut response.body);
        let chunks = if body.is_empty() { Vec::new() } else { vec![Ok(body)] };
        Self {
            head: response,
            body: stream::iter(chunks).boxed(),
        }
    }
}

pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// Transport contract shared by all network-bound components.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform one GET. Non-2xx statuses are returned, not raised.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Perform one GET without buffering the body.
    async fn stream(&self, request: HttpRequest) -> Result<HttpStream> {
        self.execute(request).await.map(HttpStream::buffered)
    }
}

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &GovernorConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.request_timeout())
        .build()?;
    Ok(client)
}

/// Production transport backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(config: &GovernorConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn header_map(request: &HttpRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AppError::validation(format!("Invalid header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AppError::validation(format!("Invalid header value: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn send(&self, request: &HttpRequest) -> Result<reqwest::Response> {
        let headers = Self::header_map(request)?;
        self.client
            .get(&request.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| transport_error(&request.url, e))
    }
}

fn head_of(url: String, response: &reqwest::Response) -> HttpResponse {
    HttpResponse {
        url,
        status: response.status().as_u16(),
        content_type: response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: Vec::new(),
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.send(&request).await?;
        let mut head = head_of(request.url, &response);
        head.body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&head.url, e))?
            .to_vec();
        Ok(head)
    }

    async fn stream(&self, request: HttpRequest) -> Result<HttpStream> {
        let response = self.send(&request).await?;
        let head = head_of(request.url.clone(), &response);
        let url = request.url;
        let body = stream::try_unfold(response, move |mut response| {
            let url = url.clone();
            async move {
                match response.chunk().await {
                    Ok(Some(chunk)) => Ok(Some((chunk.to_vec(), response))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(transport_error(&url, e)),
                }
            }
        })
        .boxed();
        Ok(HttpStream { head, body })
    }
}

fn transport_error(url: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        AppError::transient(url, error)
    } else {
        AppError::Http(error)
    }
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(HttpResponse),
    /// Transport failure (connection reset, DNS, ...)
    Fail(String),
    /// Reply after a delay
    Delayed(Duration, HttpResponse),
    /// Never reply; only a timeout ends the call
    Hang,
    /// Send the head and `response.body`, then drop the connection
    Interrupted(HttpResponse, String),
}

impl Scripted {
    pub fn ok(url: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::Respond(HttpResponse::new(url, 200, body))
    }

    pub fn html(url: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::Respond(HttpResponse::new(url, 200, body).with_content_type("text/html; charset=utf-8"))
    }

    pub fn status(url: &str, status: u16) -> Self {
        Self::Respond(HttpResponse::new(url, status, Vec::new()))
    }
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Scripted>>,
    fallback: HashMap<String, Scripted>,
    requests: Vec<(Instant, HttpRequest)>,
}

/// Deterministic transport serving queued replies per URL.
///
/// Queued replies are consumed in order; once a URL's queue is empty its
/// fallback (if any) is served, otherwise 404. Every request is recorded
/// with the instant it reached the transport.
#[derive(Default)]
pub struct ScriptedHttpClient {
    script: Mutex<Script>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for `url`.
    pub fn enqueue(&self, url: &str, reply: Scripted) -> &Self {
        self.with_script(|s| {
            s.queued.entry(url.to_string()).or_default().push_back(reply);
        });
        self
    }

    /// Serve `reply` for `url` whenever its queue is empty.
    pub fn always(&self, url: &str, reply: Scripted) -> &Self {
        self.with_script(|s| {
            s.fallback.insert(url.to_string(), reply);
        });
        self
    }

    pub fn requests(&self) -> Vec<(Instant, HttpRequest)> {
        self.with_script(|s| s.requests.clone())
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.with_script(|s| s.requests.iter().filter(|(_, r)| r.url == url).count())
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.with_script(|s| s.requests.iter().map(|(_, r)| r.url.clone()).collect())
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut guard = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl ScriptedHttpClient {
    fn next_reply(&self, request: HttpRequest) -> Option<Scripted> {
        let url = request.url.clone();
        self.with_script(|s| {
            s.requests.push((Instant::now(), request));
            s.queued
                .get_mut(&url)
                .and_then(VecDeque::pop_front)
                .or_else(|| s.fallback.get(&url).cloned())
        })
    }

    async fn reply(url: String, reply: Option<Scripted>) -> Result<HttpResponse> {
        match reply {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) | Some(Scripted::Interrupted(_, message)) => {
                Err(AppError::transient(url, message))
            }
            Some(Scripted::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Scripted::Hang) => std::future::pending::<Result<HttpResponse>>().await,
            None => Ok(HttpResponse::new(url, 404, Vec::new())),
        }
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        let reply = self.next_reply(request);
        Self::reply(url, reply).await
    }

    async fn stream(&self, request: HttpRequest) -> Result<HttpStream> {
        let url = request.url.clone();
        match self.next_reply(request) {
            Some(Scripted::Interrupted(mut head, message)) => {
                let delivered = std::mem::take(&mut head.body);
                let chunks = vec![Ok(delivered), Err(AppError::transient(url, message))];
                Ok(HttpStream {
                    head,
                    body: stream::iter(chunks).boxed(),
                })
            }
            reply => Self::reply(url, reply).await.map(HttpStream::buffered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let ok = HttpResponse::new("u", 206, b"x".to_vec());
        assert!(ok.error_for_status().is_ok());

        let err = HttpResponse::new("u", 503, Vec::new())
            .error_for_status()
            .unwrap_err();
        assert!(err.is_transient());

        let err = HttpResponse::new("u", 429, Vec::new())
            .error_for_status()
            .unwrap_err();
        assert!(err.is_transient());

        let err = HttpResponse::new("u", 404, Vec::new())
            .error_for_status()
            .unwrap_err();
        assert!(matches!(err, AppError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn html_detection_ignores_charset() {
        let resp = HttpResponse::new("u", 200, Vec::new()).with_content_type("Text/HTML; charset=utf-8");
        assert!(resp.is_html());
        assert!(!HttpResponse::new("u", 200, Vec::new()).is_html());
    }

    #[tokio::test]
    async fn scripted_client_serves_queue_then_fallback() {
        let client = ScriptedHttpClient::new();
        client
            .enqueue("https://a.test/x", Scripted::status("https://a.test/x", 500))
            .always("https://a.test/x", Scripted::ok("https://a.test/x", "fine"));

        let first = client.execute(HttpRequest::get("https://a.test/x")).await.unwrap();
        let second = client.execute(HttpRequest::get("https://a.test/x")).await.unwrap();
        let missing = client.execute(HttpRequest::get("https://a.test/y")).await.unwrap();

        assert_eq!(first.status, 500);
        assert_eq!(second.text(), "fine");
        assert_eq!(missing.status, 404);
        assert_eq!(client.request_count("https://a.test/x"), 2);
    }

    #[tokio::test]
    async fn interrupted_stream_yields_delivered_bytes_then_fails() {
        let client = ScriptedHttpClient::new();
        client.enqueue(
            "https://a.test/big",
            Scripted::Interrupted(
                HttpResponse::new("https://a.test/big", 200, b"first half".to_vec()),
                "connection reset".into(),
            ),
        );

        let mut response = client
            .stream(HttpRequest::get("https://a.test/big"))
            .await
            .unwrap();
        assert_eq!(response.head.status, 200);
        assert_eq!(response.body.next().await.unwrap().unwrap(), b"first half");
        assert!(response.body.next().await.unwrap().unwrap_err().is_transient());
        assert!(response.body.next().await.is_none());
    }

    #[test]
    fn range_header_is_lower_cased() {
        let req = HttpRequest::get("u").with_range_from(128);
        assert_eq!(req.header("Range"), Some("bytes=128-"));
    }
}
