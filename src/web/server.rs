//! HTTP Server - accepts client connections and routes requests
//!
//! One task per connection, one logical request handler per request.
//! Handlers share only the metadata cache and the fetch coordinator.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use http::header;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::protocol::{ErrorResponse, HealthResponse};
use super::response::{self, Disposition, ResponseBody};
use crate::cache::MetadataCache;
use crate::config::Config;
use crate::error::StreamError;
use crate::store::{BackingStore, FileId};
use crate::stream::{negotiate, FetchCoordinator};

/// How long shutdown waits for in-flight responses
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a request handler needs, constructed once at startup
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: MetadataCache,
    pub fetcher: FetchCoordinator,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn BackingStore>) -> Self {
        let cache = MetadataCache::new(
            Arc::clone(&store),
            &config.cache,
            config.fetch.upstream_timeout,
        );
        let fetcher = FetchCoordinator::new(store, config.fetch.clone());
        Self {
            config: Arc::new(config),
            cache,
            fetcher,
        }
    }
}

/// Routes served by the gateway
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    File {
        disposition: Disposition,
        id: &'a str,
        name_hint: Option<&'a str>,
    },
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        [""] | ["health"] => Route::Health,
        [kind, id] | [kind, id, _] if *kind == "stream" || *kind == "download" => {
            let disposition = if *kind == "stream" {
                Disposition::Inline
            } else {
                Disposition::Attachment
            };
            Route::File {
                disposition,
                id: *id,
                name_hint: segments.get(2).copied(),
            }
        }
        _ => Route::Unknown,
    }
}

/// HTTP server bound to a TCP listener
pub struct HttpServer {
    state: Arc<AppState>,
    listener: Option<TcpListener>,
    active_connections: Arc<AtomicUsize>,
}

impl HttpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            listener: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the listener; returns the bound address
    pub async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local = listener.local_addr().context("Failed to read bound address")?;

        info!(addr = %local, "HTTP server started");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accept connections until `shutdown` resolves, then drain
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.listener.as_ref().context("Server not started")?;
        tokio::pin!(shutdown);
        let (closing_tx, closing_rx) = watch::channel(false);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let state = Arc::clone(&self.state);
                        let active = Arc::clone(&self.active_connections);
                        let count = active.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(peer = %peer, count, "New connection");
                        tokio::spawn(serve_connection(stream, peer, state, active, closing_rx.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    let _ = closing_tx.send(true);
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let started = std::time::Instant::now();
        while self.active_connections.load(Ordering::Relaxed) > 0 && started.elapsed() < DRAIN_TIMEOUT {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!(remaining, "Stopped with connections still active");
        } else {
            info!("All connections drained");
        }
    }
}

/// Serve one client connection
///
/// When `closing` flips the connection finishes its in-flight response and
/// closes instead of waiting for another keep-alive request.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
    active: Arc<AtomicUsize>,
    mut closing: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(req, &state).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut signalled = *closing.borrow();
    if signalled {
        conn.as_mut().graceful_shutdown();
    }
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = closing.changed(), if !signalled => {
                signalled = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(err) = result {
        if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
            debug!(peer = %peer, error = %err, "Client disconnected");
        } else {
            // Torn bodies after a mid-stream upstream failure land here too
            debug!(peer = %peer, error = %err, "Connection ended with error");
        }
    }

    let count = active.fetch_sub(1, Ordering::Relaxed) - 1;
    debug!(peer = %peer, count, "Connection ended");
}

/// Route and answer one request
pub async fn handle_request(req: Request<Incoming>, state: &AppState) -> Response<ResponseBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match route(&path) {
        Route::Health => match method {
            Method::GET | Method::HEAD => response::json_response(
                StatusCode::OK,
                &HealthResponse::healthy(&state.config.service_name),
            ),
            _ => method_not_allowed(),
        },
        Route::File {
            disposition,
            id,
            name_hint,
        } => {
            if method != Method::GET && method != Method::HEAD {
                return method_not_allowed();
            }
            let range = req
                .headers()
                .get(header::RANGE)
                // Non-ASCII values fail the syntax check below
                .map(|v| v.to_str().unwrap_or(""));
            let name_hint = name_hint.and_then(|n| urlencoding::decode(n).ok());

            match serve_file(state, &method, disposition, id, name_hint.as_deref(), range).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(path = %path, error = %e, "Request failed before body");
                    response::error_response(&e)
                }
            }
        }
        Route::Unknown => response::json_response(
            StatusCode::NOT_FOUND,
            &ErrorResponse {
                error: "not_found".to_string(),
                message: format!("No route for {}", path),
            },
        ),
    }
}

fn method_not_allowed() -> Response<ResponseBody> {
    let mut response = response::json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &ErrorResponse {
            error: "method_not_allowed".to_string(),
            message: "Only GET and HEAD are supported".to_string(),
        },
    );
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static("GET, HEAD"));
    response
}

/// Negotiate and start a file response
///
/// Every error returned from here is rendered as a clean status response.
async fn serve_file(
    state: &AppState,
    method: &Method,
    disposition: Disposition,
    raw_id: &str,
    name_hint: Option<&str>,
    range: Option<&str>,
) -> Result<Response<ResponseBody>, StreamError> {
    let id = FileId::parse(raw_id)
        .ok_or_else(|| StreamError::NotFound(format!("malformed identifier {:?}", raw_id)))?;

    // Snapshot: later cache refreshes cannot change this response
    let meta = state.cache.get(&id).await?;

    if meta.size > state.config.max_file_size {
        return Err(StreamError::FileTooLarge {
            size: meta.size,
            limit: state.config.max_file_size,
        });
    }

    let framing = negotiate(range, meta.size, state.config.multi_range)?;
    let builder = response::file_headers(&framing, &meta, disposition, name_hint);

    if *method == Method::HEAD {
        return Ok(response::headers_only(builder));
    }

    let Some(span) = framing.byte_range() else {
        return Ok(response::empty(builder));
    };

    let fetch = state.fetcher.begin(&id, span).await?;
    info!(
        file_id = %id,
        status = framing.status(),
        start = span.start,
        end = span.end,
        size = meta.size,
        "Streaming file"
    );
    Ok(response::streaming(builder, fetch, id.to_string()))
}
