//! Keepalive liveness monitoring.
//!
//! Timer-driven prober with a dead-man's-switch: each probe compares elapsed
//! time since the last proof-of-live against a multiple of the engine's
//! advertised keepalive interval. The verdict computation is pure so the
//! threshold and reschedule rules are testable without timers.

use std::time::Duration;

/// Keepalive cycles without proof-of-live before the connection is
/// considered lost. With the default 5 s interval this allows 30 s.
pub const MAX_LOST_KEEP_ALIVE: u32 = 6;

/// Floor for the computed reschedule delay, in seconds.
const MIN_RESCHEDULE_SECS: u64 = 2;

/// Keepalive configuration.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval configured into the protocol engine, in seconds.
    pub interval_secs: u32,
    /// Multiplier of the advertised interval tolerated without proof-of-live.
    pub max_lost: u32,
    /// Delay before the first probe after reaching Ready.
    pub initial_delay: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_lost: MAX_LOST_KEEP_ALIVE,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl KeepaliveConfig {
    /// Create new config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine keepalive interval in seconds.
    #[must_use]
    pub const fn interval_secs(mut self, secs: u32) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Set the tolerated lost-cycle multiplier.
    #[must_use]
    pub const fn max_lost(mut self, max_lost: u32) -> Self {
        self.max_lost = max_lost;
        self
    }
}

/// Verdict of one keepalive probe evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveVerdict {
    /// No proof-of-live within the tolerated window; close the transport.
    ConnectionLost,
    /// Connection looks alive; schedule the next probe after this delay.
    Reschedule(Duration),
}

/// Pure liveness evaluator.
#[derive(Debug, Clone)]
pub struct KeepaliveMonitor {
    max_lost: u32,
}

impl KeepaliveMonitor {
    /// Create a monitor from config.
    #[must_use]
    pub const fn new(config: &KeepaliveConfig) -> Self {
        Self {
            max_lost: config.max_lost,
        }
    }

    /// Evaluate a completed probe.
    ///
    /// `elapsed` is the wall-clock time since the last proof-of-live and
    /// `advertised_interval_secs` is the seconds-to-next value reported by
    /// the engine. The reschedule delay is `advertised - 1` clamped to a 2 s
    /// floor.
    #[must_use]
    pub fn evaluate(&self, elapsed: Duration, advertised_interval_secs: u32) -> KeepaliveVerdict {
        let threshold = u64::from(self.max_lost) * u64::from(advertised_interval_secs);
        if elapsed.as_secs() > threshold {
            return KeepaliveVerdict::ConnectionLost;
        }
        let next = u64::from(advertised_interval_secs)
            .saturating_sub(1)
            .max(MIN_RESCHEDULE_SECS);
        KeepaliveVerdict::Reschedule(Duration::from_secs(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> KeepaliveMonitor {
        KeepaliveMonitor::new(&KeepaliveConfig::default())
    }

    #[test]
    fn disconnects_past_threshold() {
        // last proof-of-live = now - (6 * interval + 1)
        let elapsed = Duration::from_secs(6 * 5 + 1);
        assert_eq!(
            monitor().evaluate(elapsed, 5),
            KeepaliveVerdict::ConnectionLost
        );
    }

    #[test]
    fn reschedules_within_threshold() {
        let elapsed = Duration::from_secs(6 * 5 - 1);
        assert_eq!(
            monitor().evaluate(elapsed, 5),
            KeepaliveVerdict::Reschedule(Duration::from_secs(4))
        );
    }

    #[test]
    fn threshold_is_strict() {
        // Exactly at the boundary still counts as alive.
        let elapsed = Duration::from_secs(6 * 5);
        assert!(matches!(
            monitor().evaluate(elapsed, 5),
            KeepaliveVerdict::Reschedule(_)
        ));
    }

    #[test]
    fn reschedule_floor_applies_for_short_intervals() {
        for interval in [1, 2, 3] {
            match monitor().evaluate(Duration::ZERO, interval) {
                KeepaliveVerdict::Reschedule(d) => {
                    assert_eq!(d, Duration::from_secs(2), "interval {interval}");
                }
                KeepaliveVerdict::ConnectionLost => panic!("unexpected disconnect"),
            }
        }
    }

    #[test]
    fn custom_max_lost() {
        let config = KeepaliveConfig::new().interval_secs(10).max_lost(2);
        let monitor = KeepaliveMonitor::new(&config);
        assert_eq!(
            monitor.evaluate(Duration::from_secs(21), 10),
            KeepaliveVerdict::ConnectionLost
        );
        assert!(matches!(
            monitor.evaluate(Duration::from_secs(19), 10),
            KeepaliveVerdict::Reschedule(_)
        ));
    }
}
