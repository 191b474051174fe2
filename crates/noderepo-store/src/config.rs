use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection parameters for a coordination store session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store address, e.g. `"zk-1:2181,zk-2:2181"` or `"memory:local"`.
    pub address: String,
    pub connect_timeout_ms: u64,
    pub session_timeout_ms: u64,
    /// Attempts made after the first failed one before giving up.
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
}

impl StoreConfig {
    /// Default settings pointed at `address`.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2181".into(),
            connect_timeout_ms: 5000,
            session_timeout_ms: 5000,
            retry_count: 3,
            retry_backoff_ms: 1000,
        }
    }
}
