//! Sleeping and frame cadence.
//!
//! Both the transport backoff and the driver cadence sleep through a
//! [`Sleeper`], so tests can record requested delays instead of waiting.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested sleeps without blocking.
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|slept| slept.clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.recorded().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

/// Holds a loop to a target cadence by sleeping whatever is left of the
/// interval after each iteration's work.
pub struct Pacer {
    interval: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl Pacer {
    pub fn new(interval: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { interval, sleeper }
    }

    /// Sleep out the rest of the interval that began at `started`.
    pub fn pace(&self, started: Instant) {
        let remaining = self.interval.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            self.sleeper.sleep(remaining);
        }
    }

    /// Sleep for an explicit delay (used for retrying failed reads).
    pub fn pause(&self, delay: Duration) {
        self.sleeper.sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_sleeps_only_the_remainder() {
        let sleeper = RecordingSleeper::new();
        let pacer = Pacer::new(Duration::from_secs(1), Arc::new(sleeper.clone()));

        pacer.pace(Instant::now());
        let slept = sleeper.recorded();
        assert_eq!(slept.len(), 1);
        assert!(slept[0] <= Duration::from_secs(1));
        assert!(slept[0] > Duration::from_millis(900));
    }

    #[test]
    fn pacer_does_not_sleep_when_over_budget() {
        let sleeper = RecordingSleeper::new();
        let pacer = Pacer::new(Duration::from_millis(1), Arc::new(sleeper.clone()));
        let started = Instant::now() - Duration::from_millis(50);
        pacer.pace(started);
        assert!(sleeper.recorded().is_empty());
    }
}
