use std::time::{Duration, Instant};

/// Rolling limit on restart attempts.
///
/// The attempt count drops back to zero once more than `reset_window` has
/// passed since the previous attempt, so an engine that crashes rarely is
/// restarted indefinitely while a crash loop is cut off.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_attempts: u32,
    reset_window: Duration,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl RestartBudget {
    pub fn new(max_attempts: u32, reset_window: Duration) -> Self {
        Self {
            max_attempts,
            reset_window,
            attempts: 0,
            last_attempt: None,
        }
    }

    /// Take one restart attempt at `now`. Returns `false` when exhausted.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) > self.reset_window {
                self.attempts = 0;
            }
        }

        if self.attempts >= self.max_attempts {
            return false;
        }

        self.attempts += 1;
        self.last_attempt = Some(now);
        true
    }

    /// Attempts taken in the current window.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut budget = RestartBudget::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(budget.try_acquire(now));
        assert!(budget.try_acquire(now + Duration::from_secs(1)));
        assert!(budget.try_acquire(now + Duration::from_secs(2)));
        assert!(!budget.try_acquire(now + Duration::from_secs(3)));
        assert_eq!(budget.attempts(), 3);
    }

    #[test]
    fn test_resets_after_quiet_window() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(budget.try_acquire(start));
        assert!(budget.try_acquire(start + Duration::from_secs(10)));
        assert!(!budget.try_acquire(start + Duration::from_secs(20)));

        // More than a window after the last successful attempt.
        let later = start + Duration::from_secs(71);
        assert!(budget.try_acquire(later));
        assert_eq!(budget.attempts(), 1);
    }

    #[test]
    fn test_window_boundary_does_not_reset() {
        let mut budget = RestartBudget::new(1, Duration::from_secs(60));
        let start = Instant::now();

        assert!(budget.try_acquire(start));
        assert!(!budget.try_acquire(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut budget = RestartBudget::new(0, Duration::from_secs(60));
        assert!(!budget.try_acquire(Instant::now()));
    }
}
