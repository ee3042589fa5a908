//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::keepalive::KeepaliveConfig;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Display name carried through every log line.
    pub name: String,
    /// Timeout for the whole connect-to-Ready sequence.
    pub connect_timeout: Duration,
    /// Keepalive tuning.
    pub keepalive: KeepaliveConfig,
    /// Known-hosts file loaded on the Initialize transition.
    pub known_hosts_file: Option<PathBuf>,
    /// Abort the connection on a known-hosts mismatch instead of logging it.
    pub enforce_known_hosts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "ssh".to_string(),
            connect_timeout: Duration::from_secs(60),
            keepalive: KeepaliveConfig::default(),
            known_hosts_file: None,
            enforce_known_hosts: false,
        }
    }
}

impl SessionConfig {
    /// Create a config with a display name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keepalive config.
    #[must_use]
    pub fn keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the known-hosts file to load at Initialize.
    #[must_use]
    pub fn known_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }

    /// Abort connections whose host key mismatches the known-hosts store.
    #[must_use]
    pub const fn enforce_known_hosts(mut self, enforce: bool) -> Self {
        self.enforce_known_hosts = enforce;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert!(!config.enforce_known_hosts);
        assert!(config.known_hosts_file.is_none());
        assert_eq!(config.keepalive.interval_secs, 5);
    }

    #[test]
    fn config_builder() {
        let config = SessionConfig::new("edge-router")
            .connect_timeout(Duration::from_secs(10))
            .known_hosts_file("/tmp/known_hosts")
            .enforce_known_hosts(true);

        assert_eq!(config.name, "edge-router");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.enforce_known_hosts);
        assert!(config.known_hosts_file.is_some());
    }
}
