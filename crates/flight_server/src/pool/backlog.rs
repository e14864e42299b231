//! Overflow backlog escalation policy.
//!
//! The pool never rejects work, so the only signal that it is falling behind
//! is the overflow queue. [`BacklogMonitor`] turns (size, oldest wait)
//! observations into at most one escalated alert per backlog episode and
//! rate-limited light warnings otherwise. It is pure state; the pool does the
//! actual logging.

use std::time::{Duration, Instant};

/// What the pool should report for one backlog observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogAlert {
    /// Nothing is queued
    Clear,
    /// Work is queued; emit a light warning
    Warn,
    /// The backlog crossed both thresholds for the first time this episode
    Escalate,
    /// Work is queued but a report was already made recently
    Suppressed,
}

/// Hysteresis state for backlog reporting.
#[derive(Debug, Clone)]
pub struct BacklogMonitor {
    escalate_size: usize,
    escalate_wait: Duration,
    warn_interval: Duration,
    escalated: bool,
    last_warn: Option<Instant>,
}

impl BacklogMonitor {
    pub fn new(escalate_size: usize, escalate_wait: Duration, warn_interval: Duration) -> Self {
        Self {
            escalate_size,
            escalate_wait,
            warn_interval,
            escalated: false,
            last_warn: None,
        }
    }

    /// Whether an escalated episode is currently open.
    pub fn is_escalated(&self) -> bool {
        self.escalated
    }

    /// Feeds one observation of the overflow queue.
    ///
    /// An episode opens when `queued > escalate_size` and the oldest entry
    /// has waited longer than `escalate_wait`; it closes only once `queued`
    /// drops below `escalate_size`.
    pub fn observe(&mut self, queued: usize, oldest_wait: Duration, now: Instant) -> BacklogAlert {
        if queued < self.escalate_size {
            self.escalated = false;
        }

        if queued == 0 {
            return BacklogAlert::Clear;
        }

        if queued > self.escalate_size && oldest_wait > self.escalate_wait {
            if self.escalated {
                return BacklogAlert::Suppressed;
            }
            self.escalated = true;
            self.last_warn = Some(now);
            return BacklogAlert::Escalate;
        }

        if self.escalated {
            return BacklogAlert::Suppressed;
        }

        match self.last_warn {
            Some(last) if now.saturating_duration_since(last) < self.warn_interval => {
                BacklogAlert::Suppressed
            }
            _ => {
                self.last_warn = Some(now);
                BacklogAlert::Warn
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BacklogMonitor {
        BacklogMonitor::new(40, Duration::from_millis(1500), Duration::from_millis(2500))
    }

    #[test]
    fn test_escalates_once_per_episode() {
        let mut m = monitor();
        let t0 = Instant::now();
        let slow = Duration::from_secs(2);

        assert_eq!(m.observe(41, slow, t0), BacklogAlert::Escalate);
        assert_eq!(m.observe(60, slow, t0 + Duration::from_secs(1)), BacklogAlert::Suppressed);
        assert_eq!(m.observe(45, slow, t0 + Duration::from_secs(10)), BacklogAlert::Suppressed);
        // Exactly at the threshold does not close the episode.
        assert_eq!(m.observe(40, slow, t0 + Duration::from_secs(11)), BacklogAlert::Suppressed);
        assert!(m.is_escalated());

        // Dropping below the threshold closes it; a recurrence escalates again.
        assert_ne!(m.observe(12, slow, t0 + Duration::from_secs(12)), BacklogAlert::Escalate);
        assert!(!m.is_escalated());
        assert_eq!(m.observe(41, slow, t0 + Duration::from_secs(13)), BacklogAlert::Escalate);
    }

    #[test]
    fn test_size_alone_does_not_escalate() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert_eq!(m.observe(100, Duration::from_millis(200), t0), BacklogAlert::Warn);
        assert!(!m.is_escalated());
    }

    #[test]
    fn test_light_warning_is_rate_limited() {
        let mut m = monitor();
        let t0 = Instant::now();
        let fast = Duration::from_millis(10);

        assert_eq!(m.observe(5, fast, t0), BacklogAlert::Warn);
        assert_eq!(m.observe(6, fast, t0 + Duration::from_millis(1000)), BacklogAlert::Suppressed);
        assert_eq!(m.observe(7, fast, t0 + Duration::from_millis(2600)), BacklogAlert::Warn);
    }

    #[test]
    fn test_empty_queue_is_clear() {
        let mut m = monitor();
        assert_eq!(m.observe(0, Duration::ZERO, Instant::now()), BacklogAlert::Clear);
    }
}
