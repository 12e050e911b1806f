//! Server-alive probing (`ServerAliveInterval` / `ServerAliveCountMax`).
//!
//! Every interval the driver asks [`Keepalive::on_tick`] what to do: send a
//! `keepalive@openssh.com` global request, or give up because too many
//! probes went unanswered. Any REQUEST_SUCCESS or REQUEST_FAILURE counts as
//! an answer; OpenSSH servers reply with a failure.

use std::time::Duration;

/// What the driver does on a keepalive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send a probe.
    Probe,
    /// `count_max` probes are unanswered; the server is gone.
    Expired,
}

/// Unanswered-probe bookkeeping.
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    count_max: u32,
    outstanding: u32,
}

impl Keepalive {
    /// A zero `interval` disables probing.
    pub fn new(interval: Duration, count_max: u32) -> Self {
        Self {
            interval,
            count_max,
            outstanding: 0,
        }
    }

    /// Returns `true` if probes are sent at all.
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Time between probes.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probes sent and not yet answered.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// How long the server has been silent when [`KeepaliveAction::Expired`]
    /// is returned.
    pub fn deadline(&self) -> Duration {
        self.interval.saturating_mul(self.count_max.max(1))
    }

    /// Called once per interval.
    pub fn on_tick(&mut self) -> KeepaliveAction {
        if self.outstanding >= self.count_max {
            return KeepaliveAction::Expired;
        }
        self.outstanding += 1;
        KeepaliveAction::Probe
    }

    /// Called for every global request reply.
    pub fn on_reply(&mut self) {
        self.outstanding = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_after_count_max_unanswered() {
        let mut keepalive = Keepalive::new(Duration::from_secs(10), 3);
        assert!(keepalive.enabled());
        for _ in 0..3 {
            assert_eq!(keepalive.on_tick(), KeepaliveAction::Probe);
        }
        assert_eq!(keepalive.outstanding(), 3);
        assert_eq!(keepalive.on_tick(), KeepaliveAction::Expired);
        assert_eq!(keepalive.deadline(), Duration::from_secs(30));
    }

    #[test]
    fn test_reply_resets() {
        let mut keepalive = Keepalive::new(Duration::from_secs(1), 2);
        keepalive.on_tick();
        keepalive.on_tick();
        keepalive.on_reply();
        assert_eq!(keepalive.on_tick(), KeepaliveAction::Probe);
        assert_eq!(keepalive.on_tick(), KeepaliveAction::Probe);
        assert_eq!(keepalive.on_tick(), KeepaliveAction::Expired);
    }

    #[test]
    fn test_zero_interval_disables() {
        assert!(!Keepalive::new(Duration::ZERO, 3).enabled());
    }
}
