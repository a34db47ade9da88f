use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_PAGE_SIZE, DEFAULT_STORE_TIMEOUT_MS, MAX_PAGE_SIZE,
};

/// Tunables of the messaging facade.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Upper bound on one store round-trip. Exceeding it fails the call
    /// with `Transient`.
    pub store_timeout: Duration,

    /// Per-subscriber buffer of the subscription hub.
    pub channel_capacity: usize,

    /// History window size when the caller does not ask for one.
    pub default_page_size: u32,

    /// Messages loaded per store read while a stream catches up.
    pub resync_batch: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_page_size: DEFAULT_PAGE_SIZE,
            resync_batch: MAX_PAGE_SIZE,
        }
    }
}
