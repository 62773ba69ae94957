//! Explicit backoff state machines
//!
//! Both machines take the current time as an argument or return a delay,
//! so they can be driven under `tokio::time::pause()` without real sleeps.

use std::time::Duration;

use tokio::time::Instant;

/// Grow `base` by `multiplier^steps`, saturating at `cap`.
fn scaled(base: Duration, multiplier: f64, steps: u32, cap: Duration) -> Duration {
    let factor = multiplier.max(1.0).powi(steps.min(64) as i32);
    let nanos = (base.as_nanos() as f64 * factor).round();
    if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
        cap
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

// ============================================================================
// Reconnect backoff
// ============================================================================

/// Connect attempts spaced `initial × multiplier^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            failures: 0,
            next_attempt: None,
        }
    }

    /// Time left until a connect may be attempted; `None` when allowed now.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_attempt
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    /// Record a failed connect; returns the delay before the next one.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let delay = scaled(self.initial, self.multiplier, self.failures, self.max);
        self.failures = self.failures.saturating_add(1);
        self.next_attempt = Some(now + delay);
        delay
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }

    #[inline]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ============================================================================
// Cycle backoff
// ============================================================================

/// How one poll cycle went, as far as backoff is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every batch succeeded
    AllSucceeded,
    /// Some batches failed
    Partial,
    /// Every batch failed (or the channel could not connect)
    AllFailed,
}

/// Polling interval state: `normal → backoff(interval × k^n, capped) → normal`.
#[derive(Debug, Clone)]
pub struct CycleBackoff {
    normal: Duration,
    multiplier: f64,
    cap: Duration,
    failed_cycles: u32,
}

impl CycleBackoff {
    pub fn new(normal: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            normal,
            multiplier,
            cap: cap.max(normal),
            failed_cycles: 0,
        }
    }

    /// Interval to wait before the next cycle starts.
    pub fn interval(&self) -> Duration {
        if self.failed_cycles == 0 {
            self.normal
        } else {
            scaled(self.normal, self.multiplier, self.failed_cycles, self.cap)
        }
    }

    #[inline]
    pub fn is_backing_off(&self) -> bool {
        self.failed_cycles > 0
    }

    #[inline]
    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    /// Apply a cycle outcome and return the next interval.
    ///
    /// A partial cycle keeps whatever interval is in effect.
    pub fn on_cycle(&mut self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::AllSucceeded => self.failed_cycles = 0,
            CycleOutcome::AllFailed => self.failed_cycles = self.failed_cycles.saturating_add(1),
            CycleOutcome::Partial => {}
        }
        self.interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_backoff_progression() {
        let mut backoff = CycleBackoff::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
        );
        assert_eq!(backoff.interval(), Duration::from_secs(1));

        let seen: Vec<Duration> = (0..5)
            .map(|_| backoff.on_cycle(CycleOutcome::AllFailed))
            .collect();
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
        assert!(backoff.is_backing_off());

        assert_eq!(
            backoff.on_cycle(CycleOutcome::Partial),
            Duration::from_secs(10)
        );
        assert_eq!(
            backoff.on_cycle(CycleOutcome::AllSucceeded),
            Duration::from_secs(1)
        );
        assert!(!backoff.is_backing_off());
    }

    #[test]
    fn test_partial_cycle_at_normal_interval_stays_normal() {
        let mut backoff = CycleBackoff::new(Duration::from_millis(500), 3.0, Duration::from_secs(5));
        assert_eq!(
            backoff.on_cycle(CycleOutcome::Partial),
            Duration::from_millis(500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_under_paused_clock() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let start = Instant::now();
        assert_eq!(backoff.remaining(start), None);

        assert_eq!(backoff.record_failure(start), Duration::from_millis(100));
        assert_eq!(
            backoff.remaining(Instant::now()),
            Some(Duration::from_millis(100))
        );

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(backoff.remaining(Instant::now()), None);

        assert_eq!(
            backoff.record_failure(Instant::now()),
            Duration::from_millis(200)
        );
        assert_eq!(
            backoff.record_failure(Instant::now()),
            Duration::from_millis(350)
        );
        assert_eq!(backoff.failures(), 3);

        backoff.record_success();
        assert_eq!(backoff.remaining(Instant::now()), None);
        assert_eq!(backoff.failures(), 0);
    }
}
