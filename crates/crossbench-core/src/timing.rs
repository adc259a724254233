//! Time unit handling and backoff polling.
//!
//! All engine waits are expressed in [`Timing`] units so tests can compress
//! real durations to near-zero without touching the polling logic.

use std::time::Duration;

/// Conversion between abstract time units and wall-clock durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Mandatory pause before every run.
    pub cool_down_time: Duration,
    /// Wall-clock length of one time unit.
    pub unit: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            cool_down_time: Duration::from_secs(1),
            unit: Duration::from_secs(1),
        }
    }
}

impl Timing {
    pub fn new(cool_down_time: Duration, unit: Duration) -> Self {
        assert!(!unit.is_zero(), "Timing unit must be non-zero");
        Self {
            cool_down_time,
            unit,
        }
    }

    /// How many units a wall-clock duration spans.
    pub fn units(&self, duration: Duration) -> f64 {
        duration.as_secs_f64() / self.unit.as_secs_f64()
    }

    /// Scales `units` into a wall-clock duration.
    pub fn duration(&self, units: f64) -> Duration {
        assert!(units >= 0.0, "Unexpected negative time: {units}");
        self.unit.mul_f64(units)
    }

    /// Interprets `seconds` as wall-clock time, ignoring the unit.
    pub fn absolute(&self, seconds: f64) -> Duration {
        assert!(seconds >= 0.0, "Unexpected negative time: {seconds}s");
        Duration::from_secs_f64(seconds)
    }
}

/// Bounded wait interval for backoff polls.
#[derive(Debug, Clone, Copy)]
pub struct WaitRange {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl WaitRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            factor: 1.5,
        }
    }

    /// Yields the sleep slices of an exponential backoff whose total does
    /// not exceed `max`. Always yields at least one slice.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let mut current = self.min.max(Duration::from_millis(10));
        let mut left = self.max;
        let factor = self.factor;
        std::iter::from_fn(move || {
            if left.is_zero() {
                return None;
            }
            let slice = current.min(left);
            left -= slice;
            current = current.mul_f64(factor);
            Some(slice)
        })
    }
}

/// Polls `condition` with exponential backoff until it reports done or the
/// range is exhausted. Returns whether the condition was met in time.
pub async fn wait_with_backoff<F>(range: WaitRange, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    if condition() {
        return true;
    }
    for slice in range.backoff() {
        tokio::time::sleep(slice).await;
        if condition() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversion_round_trips() {
        let timing = Timing::new(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(timing.duration(2.0), Duration::from_millis(200));
        assert!((timing.units(Duration::from_millis(250)) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn absolute_ignores_unit() {
        let timing = Timing::new(Duration::ZERO, Duration::from_millis(1));
        assert_eq!(timing.absolute(1.5), Duration::from_millis(1500));
    }

    #[test]
    #[should_panic(expected = "negative")]
    fn negative_units_panic() {
        let timing = Timing::default();
        let _ = timing.duration(-1.0);
    }

    #[test]
    fn backoff_slices_sum_to_max() {
        let range = WaitRange::new(Duration::from_millis(10), Duration::from_millis(100));
        let total: Duration = range.backoff().sum();
        assert_eq!(total, Duration::from_millis(100));
    }

    #[test]
    fn backoff_slices_grow() {
        let range = WaitRange::new(Duration::from_millis(10), Duration::from_secs(10));
        let slices: Vec<_> = range.backoff().take(3).collect();
        assert!(slices[1] > slices[0]);
        assert!(slices[2] > slices[1]);
    }

    #[tokio::test]
    async fn wait_with_backoff_detects_condition() {
        let range = WaitRange::new(Duration::from_millis(1), Duration::from_millis(50));
        let mut calls = 0;
        let done = wait_with_backoff(range, || {
            calls += 1;
            calls >= 3
        })
        .await;
        assert!(done);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn wait_with_backoff_times_out() {
        let range = WaitRange::new(Duration::from_millis(1), Duration::from_millis(10));
        let done = wait_with_backoff(range, || false).await;
        assert!(!done);
    }
}
