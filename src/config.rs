//! Service configuration
//!
//! Everything is read from environment variables once at startup. Bad values
//! are reported with the offending variable name and abort startup; nothing is
//! clamped into range behind the operator's back.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Upper bound on a single upstream chunk
const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be set")]
    Missing { var: &'static str },

    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// What to do with `Range` headers naming more than one span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiRangePolicy {
    /// Ignore the header and serve the full content with 200
    Full,
    /// Refuse with 400
    Reject,
}

impl FromStr for MultiRangePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(MultiRangePolicy::Full),
            "reject" => Ok(MultiRangePolicy::Reject),
            other => Err(format!("expected \"full\" or \"reject\", got {:?}", other)),
        }
    }
}

/// Metadata cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Entry bound, `None` for unbounded
    pub max_entries: Option<u64>,
}

/// Fetch coordinator settings
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub chunk_size: usize,
    pub max_per_file: usize,
    /// How long a request may wait for a busy slot; zero rejects immediately
    pub queue_timeout: Duration,
    /// Requests allowed to wait on one identifier at a time
    pub max_queued_per_file: usize,
    /// Deadline for opening a range and for each chunk read
    pub upstream_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub service_name: String,
    pub upstream_url: Option<String>,
    pub upstream_token: Option<String>,
    pub max_file_size: u64,
    pub multi_range: MultiRangePolicy,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            service_name: "filelink-gateway".to_string(),
            upstream_url: None,
            upstream_token: None,
            max_file_size: 4 * 1024 * 1024 * 1024,
            multi_range: MultiRangePolicy::Full,
            cache: CacheConfig {
                ttl: Duration::from_secs(300),
                max_entries: Some(10_000),
            },
            fetch: FetchConfig {
                chunk_size: 1024 * 1024,
                max_per_file: 4,
                queue_timeout: Duration::from_millis(2000),
                max_queued_per_file: 32,
                upstream_timeout: Duration::from_secs(30),
            },
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let host: IpAddr = parse_var(&get, "HOST", defaults.listen_addr.ip())?;
        let port: u16 = parse_var(&get, "PORT", defaults.listen_addr.port())?;

        let ttl_secs: u64 = parse_var(&get, "CACHE_TTL_SECS", defaults.cache.ttl.as_secs())?;
        require_positive("CACHE_TTL_SECS", ttl_secs)?;

        let max_entries: u64 = parse_var(
            &get,
            "CACHE_MAX_ENTRIES",
            defaults.cache.max_entries.unwrap_or(0),
        )?;

        let chunk_size: usize = parse_var(&get, "CHUNK_SIZE", defaults.fetch.chunk_size)?;
        require_positive("CHUNK_SIZE", chunk_size as u64)?;
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid {
                var: "CHUNK_SIZE",
                value: chunk_size.to_string(),
                reason: format!("must not exceed {} bytes", MAX_CHUNK_SIZE),
            });
        }

        let max_file_size: u64 = parse_var(&get, "MAX_FILE_SIZE", defaults.max_file_size)?;
        require_positive("MAX_FILE_SIZE", max_file_size)?;

        let max_per_file: usize =
            parse_var(&get, "MAX_FETCHES_PER_FILE", defaults.fetch.max_per_file)?;
        require_positive("MAX_FETCHES_PER_FILE", max_per_file as u64)?;

        let queue_ms: u64 = parse_var(
            &get,
            "FETCH_QUEUE_TIMEOUT_MS",
            defaults.fetch.queue_timeout.as_millis() as u64,
        )?;

        let max_queued_per_file: usize = parse_var(
            &get,
            "FETCH_QUEUE_DEPTH",
            defaults.fetch.max_queued_per_file,
        )?;

        let upstream_secs: u64 = parse_var(
            &get,
            "UPSTREAM_TIMEOUT_SECS",
            defaults.fetch.upstream_timeout.as_secs(),
        )?;
        require_positive("UPSTREAM_TIMEOUT_SECS", upstream_secs)?;

        let multi_range = parse_var(&get, "MULTI_RANGE_POLICY", defaults.multi_range)?;

        let upstream_url = get("UPSTREAM_URL");
        if let Some(url) = &upstream_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    var: "UPSTREAM_URL",
                    value: url.clone(),
                    reason: "must be an http:// or https:// URL".to_string(),
                });
            }
        }

        Ok(Self {
            listen_addr: SocketAddr::new(host, port),
            service_name: get("SERVICE_NAME").unwrap_or(defaults.service_name),
            upstream_url,
            upstream_token: get("UPSTREAM_TOKEN"),
            max_file_size,
            multi_range,
            cache: CacheConfig {
                ttl: Duration::from_secs(ttl_secs),
                max_entries: (max_entries > 0).then_some(max_entries),
            },
            fetch: FetchConfig {
                chunk_size,
                max_per_file,
                queue_timeout: Duration::from_millis(queue_ms),
                max_queued_per_file,
                upstream_timeout: Duration::from_secs(upstream_secs),
            },
        })
    }

    /// Upstream URL, required when serving against a real bridge
    pub fn require_upstream_url(&self) -> Result<&str, ConfigError> {
        self.upstream_url
            .as_deref()
            .ok_or(ConfigError::Missing { var: "UPSTREAM_URL" })
    }
}

fn parse_var<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn require_positive(var: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
