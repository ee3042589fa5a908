//! Error types for sshlink.
//!
//! All failures surface to callers as a state transition plus a notification;
//! the types here exist for diagnostics and for the fallible bookkeeping
//! operations (known-hosts persistence, channel creation helpers).

use std::time::Duration;

use thiserror::Error;

/// The main error type for sshlink operations.
#[derive(Debug, Error)]
pub enum SshError {
    /// TCP connection failed.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connection {
        /// The host that could not be connected to.
        host: String,
        /// The port that was used.
        port: u16,
        /// The reason for the failure.
        reason: String,
    },

    /// Protocol handshake failed.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// The reason for the failure.
        reason: String,
    },

    /// Authentication failed.
    #[error("authentication failed for user '{user}': {reason}")]
    Authentication {
        /// The user that failed to authenticate.
        user: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Host key verification failed.
    #[error("host key verification failed for {host}: {reason}")]
    HostKeyVerification {
        /// The host whose key verification failed.
        host: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Known-hosts store error.
    #[error("known_hosts error: {reason}")]
    KnownHosts {
        /// The reason for the failure.
        reason: String,
    },

    /// Session error.
    #[error("session error: {reason}")]
    Session {
        /// The reason for the session error.
        reason: String,
    },

    /// Timeout during an SSH operation.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// The duration that elapsed.
        duration: Duration,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for sshlink operations.
pub type Result<T> = std::result::Result<T, SshError>;

impl SshError {
    /// Create a connection error.
    pub fn connection(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    /// Create a handshake error.
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(user: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authentication {
            user: user.into(),
            reason: reason.into(),
        }
    }

    /// Create a host key verification error.
    pub fn host_key_verification(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HostKeyVerification {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a known-hosts error.
    pub fn known_hosts(reason: impl Into<String>) -> Self {
        Self::KnownHosts {
            reason: reason.into(),
        }
    }

    /// Create a session error.
    pub fn session(reason: impl Into<String>) -> Self {
        Self::Session {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Check if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SshError::connection("example.com", 22, "refused");
        let msg = err.to_string();
        assert!(msg.contains("example.com:22"));
        assert!(msg.contains("refused"));
    }

    #[test]
    fn error_is_timeout() {
        let timeout = SshError::timeout(Duration::from_secs(60));
        assert!(timeout.is_timeout());

        let other = SshError::session("closed");
        assert!(!other.is_timeout());
    }

    #[test]
    fn authentication_error_display() {
        let err = SshError::authentication("admin", "all methods exhausted");
        let msg = err.to_string();
        assert!(msg.contains("admin"));
        assert!(msg.contains("exhausted"));
    }
}
