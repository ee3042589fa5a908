//! Session lifecycle: the synchronous state machine and its async driver.
//!
//! [`state::SessionCore`] holds every rule of the connect, authenticate, and
//! teardown sequence; [`driver::SshClient`] owns the socket, the timers, and
//! the task that feeds events through the core.

pub mod driver;
pub mod state;

pub use driver::SshClient;
pub use state::{Action, Notification, SessionCore, SessionEvent, SshState};
