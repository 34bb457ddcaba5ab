use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_PROBE_KEY;
use crate::constants::MAX_LEASE_TTL_IN_SECS;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElectionConfig {
    /// Lease ttl of a campaign session
    #[serde(default = "default_session_ttl")]
    pub session_ttl_in_secs: i64,

    /// Used when a campaign call passes no timeout of its own; 0 means
    /// campaign waits until elected
    #[serde(default)]
    pub campaign_timeout_in_ms: u64,

    /// Observe probes the store every `heartbeat / 5`
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_in_ms: u64,

    /// Delay between keepalive attempts after a failed lease refresh
    #[serde(default = "default_keepalive_retry_interval")]
    pub keepalive_retry_interval_in_ms: u64,

    #[serde(default = "default_probe_key")]
    pub probe_key: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            session_ttl_in_secs: default_session_ttl(),
            campaign_timeout_in_ms: 0,
            heartbeat_interval_in_ms: default_heartbeat_interval(),
            keepalive_retry_interval_in_ms: default_keepalive_retry_interval(),
            probe_key: default_probe_key(),
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_in_secs <= 0 || self.session_ttl_in_secs > MAX_LEASE_TTL_IN_SECS {
            return Err(Error::Config(ConfigError::Message(format!(
                "election.session_ttl_in_secs must be within 1..={MAX_LEASE_TTL_IN_SECS}"
            ))));
        }

        if self.heartbeat_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "election.heartbeat_interval_in_ms must be greater than 0".into(),
            )));
        }

        if self.keepalive_retry_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "election.keepalive_retry_interval_in_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_session_ttl() -> i64 {
    5
}
// in ms
fn default_heartbeat_interval() -> u64 {
    1000
}
fn default_keepalive_retry_interval() -> u64 {
    500
}
fn default_probe_key() -> String {
    DEFAULT_PROBE_KEY.to_string()
}
