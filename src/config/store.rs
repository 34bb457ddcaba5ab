use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Connection parameters for the key-value store
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Store endpoints, e.g. `http://127.0.0.1:2379`
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Connection establishment timeout
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_in_ms: u64,

    /// Deadline for short bookkeeping calls (diagnostic reads, session
    /// release after a failed campaign)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            dial_timeout_in_ms: default_dial_timeout(),
            request_timeout_in_ms: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(Error::Config(ConfigError::Message(
                "store.endpoints must contain at least one endpoint".into(),
            )));
        }

        if self.dial_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "store.dial_timeout_in_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_in_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_in_ms)
    }
}

/// Splits a comma-separated endpoint list, dropping blank segments.
pub fn parse_endpoints(endpoints: &str) -> Vec<String> {
    endpoints
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect()
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_dial_timeout() -> u64 {
    3000
}
fn default_request_timeout() -> u64 {
    1000
}
