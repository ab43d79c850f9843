use crate::calls::PeerConfig;
use amcore::calls::BusyPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 45;

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-user call settings. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Seconds an unanswered call rings before giving up. 0 disables it.
    pub ring_timeout_secs: u64,
    pub busy_policy: BusyPolicy,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: DEFAULT_RING_TIMEOUT_SECS,
            busy_policy: BusyPolicy::default(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CallConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.busy_policy, BusyPolicy::Ignore);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_partial_override() {
        let config =
            CallConfig::from_json_str(r#"{"busy_policy": "auto_decline", "ring_timeout_secs": 0}"#)
                .unwrap();
        assert_eq!(config.busy_policy, BusyPolicy::AutoDecline);
        assert_eq!(config.ring_timeout(), None);
        assert_eq!(config.ice_servers, CallConfig::default().ice_servers);
    }

    #[test]
    fn test_rejects_unknown_policy() {
        assert!(matches!(
            CallConfig::from_json_str(r#"{"busy_policy": "queue"}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
