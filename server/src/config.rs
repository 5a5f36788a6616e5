//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a [`crate::network::Server`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Silence tolerated before a client is evicted. Also the interval
    /// between liveness scans.
    pub client_timeout: Duration,
    /// Length of one bandwidth sampling window
    pub bandwidth_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_millis(12_000),
            bandwidth_interval: Duration::from_millis(1_000),
        }
    }
}

impl ServerConfig {
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_bandwidth_interval(mut self, interval: Duration) -> Self {
        self.bandwidth_interval = interval;
        self
    }
}
