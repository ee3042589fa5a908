//! Channel creation arbiter.
//!
//! The protocol engine cannot interleave two channel-open operations on one
//! session, and a single open may span several would-block retries. The
//! arbiter is a non-blocking try-lock keyed by an opaque token: the holder
//! may re-acquire idempotently (so a retrying creator never deadlocks
//! itself), everyone else is told to come back later.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Opaque identity token for channels and channel creators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a fresh, process-unique token.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Serializes the one engine operation that must not interleave: opening a
/// new channel.
#[derive(Debug, Default)]
pub struct ChannelCreationArbiter {
    owner: Mutex<Option<ChannelId>>,
}

impl ChannelCreationArbiter {
    /// Create a free arbiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the creation lock for `identity`.
    ///
    /// Returns true if the lock was free or already held by `identity`;
    /// returns false immediately otherwise. Never blocks.
    pub fn acquire(&self, identity: ChannelId) -> bool {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match *owner {
            None => {
                *owner = Some(identity);
                true
            }
            Some(current) if current == identity => true,
            Some(current) => {
                tracing::debug!(
                    holder = %current,
                    requester = %identity,
                    "channel creation already in progress, come back later"
                );
                false
            }
        }
    }

    /// Release the creation lock held by `identity`.
    ///
    /// Releasing a lock one does not hold is a caller error: it is reported
    /// and ignored, the current owner keeps the lock.
    pub fn release(&self, identity: ChannelId) -> bool {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(identity) {
            *owner = None;
            true
        } else {
            tracing::error!(
                requester = %identity,
                "trying to release the channel creation lock without holding it"
            );
            false
        }
    }

    /// The current owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<ChannelId> {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
