//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for [`crate::network::Client`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Period between ALIVE messages. Must stay well below the server's
    /// client timeout.
    pub alive_interval: Duration,
    /// How long to wait for a CONNECT acknowledgment per attempt
    pub connect_timeout: Duration,
    /// CONNECT requests sent before giving up
    pub connect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            alive_interval: Duration::from_millis(4_000),
            connect_timeout: Duration::from_millis(3_000),
            connect_attempts: 3,
        }
    }
}

impl ClientConfig {
    pub fn with_alive_interval(mut self, interval: Duration) -> Self {
        self.alive_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }
}
