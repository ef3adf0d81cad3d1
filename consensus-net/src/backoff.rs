//! Idle backoff for the gossip loops.

use std::{thread, time::Duration};

/// Puts a gossip loop to sleep. Tests swap in one that does not block.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Sleep policy of a loop with nothing to send: start at `base`, double
/// after every idle pass up to `max`, and go back to `base` as soon as the
/// loop finds work.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// How long to sleep after this idle pass.
    pub fn idle(&mut self) -> Duration {
        let sleep = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        sleep
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_max() {
        let mut backoff = IdleBackoff::new(Duration::from_millis(10), Duration::from_millis(35));
        let sleeps: Vec<u128> = (0..4).map(|_| backoff.idle().as_millis()).collect();
        assert_eq!(sleeps, vec![10, 20, 35, 35]);
    }

    #[test]
    fn test_reset_after_work() {
        let mut backoff = IdleBackoff::new(Duration::from_millis(10), Duration::from_millis(80));
        backoff.idle();
        backoff.idle();
        backoff.reset();
        assert_eq!(backoff.idle(), Duration::from_millis(10));
    }

    #[test]
    fn test_max_below_base() {
        let mut backoff = IdleBackoff::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(backoff.idle(), Duration::from_millis(50));
        assert_eq!(backoff.idle(), Duration::from_millis(50));
    }
}
