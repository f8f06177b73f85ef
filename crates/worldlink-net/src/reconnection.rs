//! Reconnect policy and the sliding attempt window.
//!
//! A join sequence retries a failed socket at a fixed interval. Attempts are
//! counted in an [`AttemptWindow`] that is cleared once more than
//! `attempt_window` has passed since it opened, so a connection that was
//! stable for hours does not inherit old failure counts, while a burst of
//! rapid failures still runs out of budget.

use std::time::Duration;

use tokio::time::Instant;

/// Configuration for client-side reconnection behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retry failed attempts and rejoin after unexpected drops. Default: true.
    pub enabled: bool,
    /// Retries allowed inside one window, on top of the first attempt. Default: 5.
    pub max_attempts: u32,
    /// Delay between failed attempts. Default: 4 s.
    pub retry_interval: Duration,
    /// Age after which the attempt count starts over. Default: 10 s.
    pub attempt_window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            retry_interval: Duration::from_secs(4),
            attempt_window: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Attempt counter for one session.
#[derive(Debug, Clone, Default)]
pub struct AttemptWindow {
    window_start: Option<Instant>,
    count: u32,
}

impl AttemptWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or keep) the window at the start of a join sequence. The count
    /// is cleared when the previous window is older than `window`.
    pub fn begin(&mut self, now: Instant, window: Duration) {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) <= window => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
    }

    /// Record an attempt. Returns `false` once `max_attempts` retries have
    /// been spent, i.e. after `max_attempts + 1` attempts in total.
    pub fn try_attempt(&mut self, max_attempts: u32) -> bool {
        if self.count > max_attempts {
            return false;
        }
        self.count += 1;
        true
    }

    /// Whether another attempt would be allowed.
    pub fn has_budget(&self, max_attempts: u32) -> bool {
        self.count <= max_attempts
    }

    /// Attempts recorded in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_client_settings() {
        let policy = ReconnectPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_interval, Duration::from_secs(4));
        assert_eq!(policy.attempt_window, Duration::from_secs(10));
        assert!(!ReconnectPolicy::disabled().enabled);
    }

    #[test]
    fn test_budget_is_initial_plus_retries() {
        let mut window = AttemptWindow::new();
        window.begin(Instant::now(), Duration::from_secs(10));

        assert!(window.try_attempt(2)); // initial
        assert!(window.try_attempt(2)); // retry 1
        assert!(window.try_attempt(2)); // retry 2
        assert!(!window.try_attempt(2), "Fourth attempt must be refused");
        assert_eq!(window.count(), 3);
        assert!(!window.has_budget(2));
    }

    #[test]
    fn test_count_never_exceeds_max_plus_one() {
        let mut window = AttemptWindow::new();
        window.begin(Instant::now(), Duration::from_secs(10));
        for _ in 0..20 {
            window.try_attempt(4);
        }
        assert_eq!(window.count(), 5);
    }

    #[test]
    fn test_window_resets_after_long_gap() {
        let start = Instant::now();
        let span = Duration::from_secs(10);
        let mut window = AttemptWindow::new();

        window.begin(start, span);
        window.try_attempt(5);
        window.try_attempt(5);
        assert_eq!(window.count(), 2);

        // Within the window: count carries over.
        window.begin(start + Duration::from_secs(9), span);
        assert_eq!(window.count(), 2);

        // Long idle gap: count starts over.
        window.begin(start + Duration::from_secs(60), span);
        assert_eq!(window.count(), 0);
        assert!(window.has_budget(5));
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let start = Instant::now();
        let span = Duration::from_secs(10);
        let mut window = AttemptWindow::new();
        window.begin(start, span);
        window.try_attempt(1);

        window.begin(start + span, span);
        assert_eq!(window.count(), 1, "Exactly one window later is still the same window");
        window.begin(start + span + Duration::from_millis(1), span);
        assert_eq!(window.count(), 0);
    }
}
