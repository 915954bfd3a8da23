//! Sliding-window failure counter with lockout.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    /// Still allowed; `remaining` failures before lockout.
    Counting { remaining: u32 },
    LockedOut { until: DateTime<Utc> },
}

/// Tracks failed attempts within a window. After `max_failures` inside the
/// window, every attempt is refused until the lockout elapses.
///
/// Not synchronized; the owner serializes access.
#[derive(Debug, Clone)]
pub struct FailedAttemptTracker {
    max_failures: u32,
    window: Duration,
    lockout: Duration,
    failures: VecDeque<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

impl FailedAttemptTracker {
    pub fn new(max_failures: u32, window_secs: i64, lockout_secs: i64) -> Self {
        Self {
            max_failures: max_failures.max(1),
            window: Duration::seconds(window_secs),
            lockout: Duration::seconds(lockout_secs),
            failures: VecDeque::new(),
            locked_until: None,
        }
    }

    /// `Some(until)` while locked out.
    pub fn locked_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| *until > now)
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) -> AttemptStatus {
        if let Some(until) = self.locked_until(now) {
            return AttemptStatus::LockedOut { until };
        }
        self.prune(now);
        self.failures.push_back(now);

        let count = self.failures.len() as u32;
        if count >= self.max_failures {
            let until = now + self.lockout;
            self.locked_until = Some(until);
            self.failures.clear();
            AttemptStatus::LockedOut { until }
        } else {
            AttemptStatus::Counting {
                remaining: self.max_failures - count,
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.locked_until = None;
    }

    pub fn recent_failures(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.failures.len() as u32
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.failures.front().is_some_and(|t| *t <= cutoff) {
            self.failures.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockout_after_max_failures() {
        let mut tracker = FailedAttemptTracker::new(3, 900, 1800);
        let now = Utc::now();

        assert_eq!(
            tracker.record_failure(now),
            AttemptStatus::Counting { remaining: 2 }
        );
        assert_eq!(
            tracker.record_failure(now),
            AttemptStatus::Counting { remaining: 1 }
        );
        let status = tracker.record_failure(now);
        assert_eq!(
            status,
            AttemptStatus::LockedOut {
                until: now + Duration::seconds(1800)
            }
        );
        assert!(tracker.locked_until(now + Duration::seconds(60)).is_some());
        assert!(tracker.locked_until(now + Duration::seconds(1801)).is_none());
    }

    #[test]
    fn test_failures_outside_window_forgotten() {
        let mut tracker = FailedAttemptTracker::new(3, 60, 600);
        let start = Utc::now();

        tracker.record_failure(start);
        tracker.record_failure(start + Duration::seconds(10));
        // First two have aged out.
        let status = tracker.record_failure(start + Duration::seconds(120));
        assert_eq!(status, AttemptStatus::Counting { remaining: 2 });
        assert_eq!(tracker.recent_failures(start + Duration::seconds(120)), 1);
    }

    #[test]
    fn test_success_resets() {
        let mut tracker = FailedAttemptTracker::new(2, 60, 600);
        let now = Utc::now();
        tracker.record_failure(now);
        tracker.record_success();
        assert_eq!(
            tracker.record_failure(now),
            AttemptStatus::Counting { remaining: 1 }
        );
    }
}
