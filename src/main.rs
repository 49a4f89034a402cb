//! Filelink Gateway - range-aware HTTP streaming for remotely stored files
//!
//! Serves files held by a chat storage backend over plain HTTP, with
//! byte-range support, a shared metadata cache and per-file fetch limits.

mod cache;
mod config;
mod error;
mod store;
mod stream;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use store::{BackingStore, HttpStore};
use web::{AppState, HttpServer};

/// How often cache and upstream statistics are logged
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run the HTTP gateway (default)
    Serve,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Filelink Gateway - stream remotely stored files over HTTP

USAGE:
    filelink-gateway                     # Run the gateway (default)
    filelink-gateway serve
    filelink-gateway help

ROUTES:
    GET|HEAD /health                     Liveness probe (also /)
    GET|HEAD /stream/<id>[/<name>]       Inline content, Range aware
    GET|HEAD /download/<id>[/<name>]     Attachment content, Range aware

ENVIRONMENT:
    UPSTREAM_URL             Base URL of the storage bridge (required)
    UPSTREAM_TOKEN           Bearer token for the storage bridge
    HOST, PORT               Listen address (default 0.0.0.0:8080)
    SERVICE_NAME             Name reported by /health
    CACHE_TTL_SECS           Metadata cache lifetime (default 300)
    CACHE_MAX_ENTRIES        Metadata cache bound, 0 = unbounded (default 10000)
    CHUNK_SIZE               Upstream chunk size in bytes (default 1048576)
    MAX_FILE_SIZE            Largest file served in bytes (default 4 GiB)
    MAX_FETCHES_PER_FILE     Concurrent upstream reads per file (default 4)
    FETCH_QUEUE_TIMEOUT_MS   Wait for a busy file, 0 = reject (default 2000)
    FETCH_QUEUE_DEPTH        Waiters allowed per busy file (default 32)
    UPSTREAM_TIMEOUT_SECS    Upstream deadline (default 30)
    MULTI_RANGE_POLICY       full | reject (default full)
    RUST_LOG / LOG_LEVEL     Log filter (default info)
"#
    );
}

fn parse_args() -> Command {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("serve") => Command::Serve,
        Some("help" | "--help" | "-h") => Command::Help,
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            Command::Help
        }
    }
}

fn init_logging() -> Result<()> {
    let filter = match (env::var("RUST_LOG"), env::var("LOG_LEVEL")) {
        (Ok(spec), _) => EnvFilter::try_new(spec).context("Invalid RUST_LOG")?,
        (Err(_), Ok(level)) => {
            EnvFilter::try_new(level.to_lowercase()).context("Invalid LOG_LEVEL")?
        }
        _ => EnvFilter::new("info"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    match parse_args() {
        Command::Serve => serve().await,
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;
    let upstream = Arc::new(HttpStore::new(
        config.require_upstream_url()?,
        config.upstream_token.clone(),
        config.fetch.upstream_timeout,
    )?);

    info!(
        service = %config.service_name,
        addr = %config.listen_addr,
        chunk_size = config.fetch.chunk_size,
        max_per_file = config.fetch.max_per_file,
        cache_ttl = ?config.cache.ttl,
        "Starting gateway"
    );

    let addr = config.listen_addr;
    let store: Arc<dyn BackingStore> = upstream.clone();
    let state = Arc::new(AppState::new(config, store));

    let mut server = HttpServer::new(Arc::clone(&state));
    if let Err(e) = server.start(addr).await {
        error!(error = %e, "Failed to start HTTP server");
        return Err(e);
    }

    let metrics_state = Arc::clone(&state);
    let metrics_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            metrics_state.cache.log_metrics();
            match upstream.health_status() {
                "healthy" => debug!(active_files = metrics_state.fetcher.active_files(), "Upstream healthy"),
                status => {
                    let errors = upstream.recent_errors();
                    match errors.last() {
                        Some(last) => warn!(
                            status,
                            recent_errors = errors.len(),
                            last_error_at = last.timestamp,
                            operation = %last.operation,
                            file_id = %last.file_id,
                            error = %last.error,
                            "Upstream not healthy"
                        ),
                        None => warn!(status, "Upstream not healthy"),
                    }
                }
            }
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    let result = server.run(shutdown).await;
    metrics_handle.abort();

    info!("Shutdown complete.");
    result
}
