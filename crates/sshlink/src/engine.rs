//! The opaque protocol engine boundary.
//!
//! All SSH framing and cryptography live behind [`ProtocolEngine`]. The
//! session layer only drives the engine: every operation either completes,
//! reports [`Step::WouldBlock`] (retry verbatim on the next readiness event),
//! or fails with an [`EngineError`]. The engine reads and writes raw bytes
//! exclusively through the [`TransportIo`] hooks it is handed on each call.

use crate::transport::TransportIo;

/// Outcome of a single non-blocking engine step.
///
/// `WouldBlock` is not an error: the caller must re-enter the same operation
/// after the next readiness event, without any intervening side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// The operation completed.
    Ready(T),
    /// The operation could not complete yet; retry after the next event.
    WouldBlock,
}

impl<T> Step<T> {
    /// Check if this step would block.
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Outcome of a single authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The server accepted the attempt.
    Accepted,
    /// The server rejected the attempt; the next candidate method is tried.
    Rejected,
}

/// Error reported by the protocol engine.
///
/// Engine error codes are translated to a human-readable string for
/// diagnostics only; they never cross the session boundary as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Engine-specific error code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl EngineError {
    /// Create a new engine error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for EngineError {}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Host key kind captured during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyKind {
    /// RSA host key.
    Rsa,
    /// DSS host key.
    Dss,
    /// Unrecognized key type.
    Unknown,
}

impl HostKeyKind {
    /// The key-type label used in the known-hosts file format.
    #[must_use]
    pub const fn label(self) -> Option<&'static str> {
        match self {
            Self::Rsa => Some("ssh-rsa"),
            Self::Dss => Some("ssh-dss"),
            Self::Unknown => None,
        }
    }

    /// Parse a known-hosts key-type label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label {
            "ssh-rsa" => Self::Rsa,
            "ssh-dss" => Self::Dss,
            _ => Self::Unknown,
        }
    }
}

/// Host key record captured once per handshake, read-only afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key kind.
    pub kind: HostKeyKind,
    /// Fixed-size fingerprint digest of the key.
    pub fingerprint: Vec<u8>,
    /// Raw public key bytes.
    pub key: Vec<u8>,
}

/// Key pair material used for `publickey` authentication.
///
/// Held as in-memory PEM material; the session never touches the filesystem
/// for credentials.
#[derive(Debug, Clone, Default)]
pub struct KeyPair {
    /// Public key material.
    pub public_key: String,
    /// Private key material.
    pub private_key: String,
}

/// The non-blocking SSH protocol engine driven by the session state machine.
///
/// One engine instance exists per connected session; it is created on the
/// Initialize transition and dropped exactly once on the FreeSession
/// transition, on every exit path.
pub trait ProtocolEngine: Send {
    /// Run one handshake step. On completion returns the server host key.
    fn handshake(&mut self, io: &mut dyn TransportIo) -> EngineResult<Step<HostKey>>;

    /// Query the authentication methods the server offers for `user`.
    fn list_auth_methods(
        &mut self,
        io: &mut dyn TransportIo,
        user: &str,
    ) -> EngineResult<Step<Vec<String>>>;

    /// Attempt `publickey` authentication with in-memory key material.
    fn auth_publickey(
        &mut self,
        io: &mut dyn TransportIo,
        user: &str,
        keys: &KeyPair,
        passphrase: &str,
    ) -> EngineResult<Step<AuthOutcome>>;

    /// Attempt `password` authentication.
    fn auth_password(
        &mut self,
        io: &mut dyn TransportIo,
        user: &str,
        password: &str,
    ) -> EngineResult<Step<AuthOutcome>>;

    /// Whether an authentication attempt has succeeded on this session.
    fn is_authenticated(&self) -> bool;

    /// Configure the engine's internal keepalive (interval in seconds).
    fn configure_keepalive(&mut self, want_reply: bool, interval_secs: u32);

    /// Send a keepalive probe. On completion returns the number of seconds
    /// until the next probe is due, as advertised by the engine.
    fn send_keepalive(&mut self, io: &mut dyn TransportIo) -> EngineResult<Step<u32>>;

    /// Send a protocol-level disconnect to the peer.
    fn disconnect(&mut self, io: &mut dyn TransportIo, description: &str)
    -> EngineResult<Step<()>>;

    /// The server identification banner, once the handshake has completed.
    fn banner(&self) -> Option<String> {
        None
    }
}

/// Factory producing a fresh engine for each connected window.
///
/// The session calls this on the Initialize transition; the returned engine
/// is the single-owner resource released on FreeSession.
pub type EngineFactory = Box<dyn FnMut() -> Box<dyn ProtocolEngine> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_would_block() {
        let step: Step<()> = Step::WouldBlock;
        assert!(step.is_would_block());
        assert!(!Step::Ready(()).is_would_block());
    }

    #[test]
    fn host_key_kind_labels() {
        assert_eq!(HostKeyKind::Rsa.label(), Some("ssh-rsa"));
        assert_eq!(HostKeyKind::Dss.label(), Some("ssh-dss"));
        assert_eq!(HostKeyKind::Unknown.label(), None);

        assert_eq!(HostKeyKind::from_label("ssh-rsa"), HostKeyKind::Rsa);
        assert_eq!(HostKeyKind::from_label("ssh-ed25519"), HostKeyKind::Unknown);
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::new(-43, "authentication rejected");
        let msg = err.to_string();
        assert!(msg.contains("authentication rejected"));
        assert!(msg.contains("-43"));
    }
}
