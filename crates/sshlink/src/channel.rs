//! Channel capability interface and live-set registry.
//!
//! Concrete channel behaviors (tunnels, exec, copy, file transfer) live
//! outside this crate. The session only needs each channel to identify
//! itself and to initiate its own graceful shutdown, so the registry depends
//! on the [`SshChannel`] trait alone and holds weak references: membership,
//! never ownership.

use std::sync::{Arc, Weak};

use crate::arbiter::ChannelId;

/// The kinds of channel a session multiplexes, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Remote-to-local port-forward tunnel.
    TunnelIn,
    /// Local-to-remote port-forward tunnel.
    TunnelOut,
    /// Remote command execution.
    Exec,
    /// File copy, sending.
    CopySend,
    /// File copy, receiving.
    CopyGet,
    /// File-transfer (SFTP-style) session.
    FileTransfer,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::TunnelIn => "tunnel-in",
            Self::TunnelOut => "tunnel-out",
            Self::Exec => "exec",
            Self::CopySend => "copy-send",
            Self::CopyGet => "copy-get",
            Self::FileTransfer => "file-transfer",
        };
        f.write_str(label)
    }
}

/// Capability interface every channel variant implements.
pub trait SshChannel: Send + Sync {
    /// Identity token, also used with the channel creation arbiter.
    fn id(&self) -> ChannelId;

    /// Diagnostic name.
    fn name(&self) -> String;

    /// Initiate graceful shutdown. The channel unregisters itself once its
    /// own teardown completes; close must not block.
    fn close(&self);
}

/// The live set of channels attached to a session.
///
/// Register/unregister are bookkeeping only; the registry force-closes
/// channels solely when the session asks it to during teardown.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Vec<(ChannelId, Weak<dyn SshChannel>)>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("len", &self.channels.len())
            .finish()
    }
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Append a channel to the live set.
    pub fn register(&mut self, channel: &Arc<dyn SshChannel>) {
        tracing::debug!(channel = %channel.name(), "registering channel");
        self.channels.push((channel.id(), Arc::downgrade(channel)));
    }

    /// Remove a channel from the live set.
    ///
    /// Returns false when the channel was not registered, which is a caller
    /// error reported at warning level.
    pub fn unregister(&mut self, id: ChannelId) -> bool {
        let before = self.channels.len();
        self.channels.retain(|(cid, _)| *cid != id);
        if self.channels.len() == before {
            tracing::warn!(channel = %id, "unregister of a channel that was never registered");
            false
        } else {
            true
        }
    }

    /// Ask every registered channel to close.
    ///
    /// Channels unregister themselves as their teardown completes; dropped
    /// channels that never unregistered are pruned here.
    pub fn close_all(&mut self) {
        self.channels.retain(|(id, weak)| match weak.upgrade() {
            Some(channel) => {
                tracing::debug!(channel = %channel.name(), "asking channel to close");
                channel.close();
                true
            }
            None => {
                tracing::warn!(channel = %id, "pruning dropped channel from registry");
                false
            }
        });
    }
}
