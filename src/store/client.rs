//! HTTP backing store client
//!
//! Talks to the upstream file bridge, the service that holds the chat-session
//! credentials and exposes remote objects over plain HTTP:
//!
//! - `GET {base}/files/{id}` returns JSON metadata (`fileSize`, `mimeType`, `fileName`)
//! - `GET {base}/files/{id}/content` with a `Range` header returns the bytes

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::errors::StoreError;
use super::types::{ByteStream, FileId, FileMetadata, RemoteFileInfo};
use super::BackingStore;

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Backoff between attempts
const BACKOFF_MS: [u64; 3] = [250, 500, 1000];

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub operation: String,
    pub file_id: String,
    pub error: String,
}

/// Upstream bridge client
#[derive(Clone)]
pub struct HttpStore {
    http_client: Client,
    base_url: String,
    token: Option<String>,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl HttpStore {
    /// Build a client for the bridge at `base_url`
    ///
    /// `connect_timeout` bounds connection setup only; per-read deadlines are
    /// enforced by the caller so that long bodies are not cut off.
    pub fn new(base_url: &str, token: Option<String>, connect_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!(upstream = %base_url, "Upstream file bridge client ready");

        Ok(Self {
            http_client,
            base_url,
            token,
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::new())),
        })
    }

    fn file_url(&self, id: &FileId, suffix: &str) -> String {
        format!(
            "{}/files/{}{}",
            self.base_url,
            urlencoding::encode(id.as_str()),
            suffix
        )
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http_client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, id: &FileId, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(result) => {
                    self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt == MAX_RETRIES {
                        match e {
                            StoreError::Network(_) | StoreError::Timeout => {
                                self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed)
                            }
                            StoreError::RateLimited | StoreError::Server(_, _) => {
                                self.health.store(HEALTH_DEGRADED, Ordering::Relaxed)
                            }
                            _ => {}
                        }
                        self.log_error(operation, id, &e.to_string());
                        return Err(e);
                    }

                    let delay = BACKOFF_MS.get(attempt as usize).copied().unwrap_or(1000);
                    warn!(
                        operation = operation,
                        file_id = %id,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "Retrying upstream operation"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, operation: &str, id: &FileId, error: &str) {
        let entry = ErrorEntry {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            operation: operation.to_string(),
            file_id: id.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().unwrap_or_else(|e| e.into_inner());
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// First byte offset of a `Content-Range: bytes a-b/n` header
fn content_range_start(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::CONTENT_RANGE)?.to_str().ok()?;
    let (first, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    first.trim().parse().ok()
}

#[async_trait]
impl BackingStore for HttpStore {
    async fn fetch_metadata(&self, id: &FileId) -> Result<FileMetadata, StoreError> {
        let url = self.file_url(id, "");
        debug!(file_id = %id, url = %url, "Fetching file metadata from upstream");

        let url = url.as_str();
        let info = self
            .with_retry("fetch_metadata", id, || async move {
                let response = self.request(url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(StoreError::from_status(status.as_u16(), &body));
                }
                response
                    .json::<RemoteFileInfo>()
                    .await
                    .map_err(|e| StoreError::Request(format!("invalid metadata body: {}", e)))
            })
            .await?;

        Ok(info.into_metadata(id.clone()))
    }

    async fn open_range(
        &self,
        id: &FileId,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, StoreError> {
        let url = self.file_url(id, "/content");
        debug!(file_id = %id, start, end, "Opening upstream range");

        let url = url.as_str();
        let response = self
            .with_retry("open_range", id, || async move {
                let response = self
                    .request(url)
                    .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end))
                    .send()
                    .await?;
                let status = response.status();
                match status {
                    StatusCode::PARTIAL_CONTENT => match content_range_start(response.headers()) {
                        Some(served) if served == start => Ok(response),
                        Some(served) => Err(StoreError::Request(format!(
                            "asked for bytes {}-{}, upstream answered from offset {}",
                            start, end, served
                        ))),
                        None => Err(StoreError::Request(
                            "partial response without a usable Content-Range".to_string(),
                        )),
                    },
                    // A bridge that ignores Range is only usable from offset zero
                    StatusCode::OK if start == 0 => Ok(response),
                    StatusCode::OK => Err(StoreError::Request(
                        "upstream ignored Range header".to_string(),
                    )),
                    _ => {
                        let body = response.text().await.unwrap_or_default();
                        Err(StoreError::from_status(status.as_u16(), &body))
                    }
                }
            })
            .await?;

        Ok(Box::pin(response.bytes_stream().map_err(StoreError::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve one canned response per connection and report the raw requests
    async fn canned_server(responses: Vec<String>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let mut request = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&request).to_string());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (format!("http://{}", addr), rx)
    }

    fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {}\r\nconnection: close\r\ncontent-length: {}\r\n", status, body.len());
        for (k, v) in headers {
            out.push_str(&format!("{}: {}\r\n", k, v));
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }

    #[test]
    fn test_file_url_encoding() {
        let store = HttpStore::new("http://bridge:9000/", None, Duration::from_secs(1)).unwrap();
        let id = FileId::parse("abc:1").unwrap();
        assert_eq!(store.file_url(&id, ""), "http://bridge:9000/files/abc%3A1");
        assert_eq!(
            store.file_url(&id, "/content"),
            "http://bridge:9000/files/abc%3A1/content"
        );
    }

    #[tokio::test]
    async fn test_fetch_metadata() {
        let body = r#"{"fileSize":"2048","mimeType":"audio/mpeg","fileName":"song.mp3"}"#;
        let (base, mut requests) = canned_server(vec![http_response(
            "200 OK",
            &[("content-type", "application/json")],
            body,
        )])
        .await;

        let store = HttpStore::new(&base, Some("secret".into()), Duration::from_secs(2)).unwrap();
        let id = FileId::parse("-100_7").unwrap();
        let meta = store.fetch_metadata(&id).await.unwrap();

        assert_eq!(meta.size, 2048);
        assert_eq!(meta.content_type, "audio/mpeg");
        assert_eq!(meta.display_name(), "song.mp3");

        let request = requests.recv().await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /files/-100_7 "));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_fetch_metadata_not_found_is_not_retried() {
        let (base, mut requests) =
            canned_server(vec![http_response("404 Not Found", &[], "no such message")]).await;

        let store = HttpStore::new(&base, None, Duration::from_secs(2)).unwrap();
        let id = FileId::parse("1_404").unwrap();
        let result = store.fetch_metadata(&id).await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(requests.recv().await.is_some());
        let errors = store.recent_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].operation, "fetch_metadata");
        assert_eq!(errors[0].file_id, "1_404");
        assert!(errors[0].error.contains("no such message"));
        assert!(errors[0].timestamp > 0);
        assert_eq!(store.health_status(), "healthy");
    }

    #[tokio::test]
    async fn test_open_range_sends_range_header() {
        let (base, mut requests) = canned_server(vec![http_response(
            "206 Partial Content",
            &[("content-range", "bytes 10-14/100")],
            "hello",
        )])
        .await;

        let store = HttpStore::new(&base, None, Duration::from_secs(2)).unwrap();
        let id = FileId::parse("1_1").unwrap();
        let mut stream = store.open_range(&id, 10, 14).await.unwrap();

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"hello");

        let request = requests.recv().await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /files/1_1/content "));
        assert!(request.contains("range: bytes=10-14"));
    }

    #[tokio::test]
    async fn test_open_range_rejects_ignored_range() {
        let (base, _requests) =
            canned_server(vec![http_response("200 OK", &[], "whole file")]).await;

        let store = HttpStore::new(&base, None, Duration::from_secs(2)).unwrap();
        let id = FileId::parse("1_1").unwrap();
        let result = store.open_range(&id, 5, 9).await;
        assert!(matches!(result, Err(StoreError::Request(_))));
    }

    #[tokio::test]
    async fn test_open_range_rejects_misplaced_partial() {
        let (base, _requests) = canned_server(vec![
            http_response(
                "206 Partial Content",
                &[("content-range", "bytes 0-4/100")],
                "wrong",
            ),
            http_response("206 Partial Content", &[], "bare!"),
        ])
        .await;

        let store = HttpStore::new(&base, None, Duration::from_secs(2)).unwrap();
        let id = FileId::parse("1_1").unwrap();

        let result = store.open_range(&id, 10, 14).await;
        assert!(matches!(result, Err(StoreError::Request(ref msg)) if msg.contains("offset 0")));

        let result = store.open_range(&id, 10, 14).await;
        assert!(matches!(result, Err(StoreError::Request(_))));
    }

    #[test]
    fn test_content_range_start() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(content_range_start(&headers), None);

        headers.insert(reqwest::header::CONTENT_RANGE, "bytes 10-14/100".parse().unwrap());
        assert_eq!(content_range_start(&headers), Some(10));

        headers.insert(reqwest::header::CONTENT_RANGE, "bytes */100".parse().unwrap());
        assert_eq!(content_range_start(&headers), None);
    }
}
