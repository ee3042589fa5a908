//! sshlink: Asynchronous single-session SSH transport client
//!
//! This crate manages the life of one SSH session over TCP: connect,
//! handshake, authenticate, stay alive, and tear down gracefully. The SSH
//! protocol itself (framing, crypto) lives behind the [`ProtocolEngine`]
//! trait; sshlink supplies everything around it.
//!
//! # Features
//!
//! - **Single driver task** owning the protocol engine; callers interact
//!   through a cloneable [`SshClient`] handle
//! - **Non-blocking discipline**: every engine step either completes or is
//!   retried verbatim after the next socket readiness event
//! - **Ordered authentication** over server-offered or caller-chosen methods
//! - **Keepalive liveness monitoring** with a dead-man's-switch threshold
//! - **Known-hosts verification** with OpenSSH-style file persistence
//! - **Channel registry and creation arbiter** for protocol channels built
//!   on top of the session
//!
//! # Example
//!
//! ```ignore
//! use sshlink::{SessionConfig, SshClient, SshState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sshlink::SshError> {
//!     let client = SshClient::new(SessionConfig::new("build-host"), engine_factory());
//!     client.set_passphrase("hunter2").await?;
//!     client.connect("admin", "build.example.com", 22).await?;
//!     if client.wait_for_state(SshState::Ready).await {
//!         println!("banner: {:?}", client.banner().await?);
//!     }
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod keepalive;
pub mod known_hosts;
pub mod session;
pub mod transport;

/// Scripted engine and transport doubles for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use arbiter::{ChannelCreationArbiter, ChannelId};
pub use channel::{ChannelKind, ChannelRegistry, SshChannel};
pub use config::SessionConfig;
pub use engine::{
    AuthOutcome, EngineError, EngineFactory, EngineResult, HostKey, HostKeyKind, KeyPair,
    ProtocolEngine, Step,
};
pub use error::{Result, SshError};
pub use keepalive::{KeepaliveConfig, KeepaliveMonitor, KeepaliveVerdict, MAX_LOST_KEEP_ALIVE};
pub use known_hosts::{KnownHostCheck, KnownHostsStore};
pub use session::{Notification, SessionCore, SshClient, SshState};
pub use transport::{TcpTransport, TransportIo};
