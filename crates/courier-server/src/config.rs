//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_service::ServiceConfig;
use courier_shared::constants::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_HTTP_PORT, DEFAULT_PAGE_SIZE, DEFAULT_STORE_TIMEOUT_MS,
    MAX_PAGE_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: the platform data directory (see `Database::default_path`).
    pub database_path: Option<PathBuf>,

    /// Upper bound on a single store round-trip.
    /// Env: `STORE_TIMEOUT_MS`
    pub store_timeout: Duration,

    /// Per-topic buffer of the subscription hub.
    /// Env: `HUB_CHANNEL_CAPACITY`
    pub channel_capacity: usize,

    /// History window size when a request does not give `limit`.
    /// Env: `DEFAULT_PAGE_SIZE`
    pub default_page_size: u32,

    /// Sustained sends per second allowed per participant.
    /// Env: `SEND_RATE_PER_SEC`
    pub send_rate_per_sec: f64,

    /// Sends a participant may burst before being throttled.
    /// Env: `SEND_BURST`
    pub send_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_page_size: DEFAULT_PAGE_SIZE,
            send_rate_per_sec: 5.0,
            send_burst: 20.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parsed::<SocketAddr>(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(ms) = parsed::<u64>(&lookup, "STORE_TIMEOUT_MS").filter(|&ms| ms > 0) {
            config.store_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = parsed::<usize>(&lookup, "HUB_CHANNEL_CAPACITY").filter(|&n| n > 0) {
            config.channel_capacity = n;
        }

        if let Some(n) = parsed::<u32>(&lookup, "DEFAULT_PAGE_SIZE") {
            config.default_page_size = n.clamp(1, MAX_PAGE_SIZE);
        }

        if let Some(rate) = parsed::<f64>(&lookup, "SEND_RATE_PER_SEC").filter(|r| *r > 0.0) {
            config.send_rate_per_sec = rate;
        }

        if let Some(burst) = parsed::<f64>(&lookup, "SEND_BURST").filter(|b| *b >= 1.0) {
            config.send_burst = burst;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Facade tunables derived from this configuration.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            store_timeout: self.store_timeout,
            channel_capacity: self.channel_capacity,
            default_page_size: self.default_page_size,
            ..ServiceConfig::default()
        }
    }
}

/// Parse variable `name`, logging and ignoring values that do not parse.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
