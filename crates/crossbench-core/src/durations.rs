//! Per-run duration ledger.

use std::time::{Duration, Instant};

use serde_json::{Map, Value};

/// Ordered label → elapsed-time ledger. Labels are recorded once; timing
/// the same label again accumulates.
#[derive(Debug, Default)]
pub struct Durations {
    entries: Vec<(String, Duration)>,
}

impl Durations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn record(&mut self, label: &str, elapsed: Duration) {
        if let Some((_, total)) = self.entries.iter_mut().find(|(l, _)| l == label) {
            *total += elapsed;
        } else {
            self.entries.push((label.to_string(), elapsed));
        }
    }

    /// Starts a timer for `label`; call [`DurationTimer::commit`] to record.
    pub fn start(&self, label: &str) -> DurationTimer {
        DurationTimer {
            label: label.to_string(),
            started: Instant::now(),
        }
    }

    pub fn get(&self, label: &str) -> Option<Duration> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, d)| *d)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (label, duration) in &self.entries {
            map.insert(label.clone(), Value::from(duration.as_secs_f64()));
        }
        Value::Object(map)
    }
}

#[derive(Debug)]
pub struct DurationTimer {
    label: String,
    started: Instant,
}

impl DurationTimer {
    pub fn commit(self, durations: &mut Durations) {
        durations.record(&self.label, self.started.elapsed());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_lookup() {
        let mut durations = Durations::new();
        durations.record("browser-setup", Duration::from_millis(120));
        assert_eq!(
            durations.get("browser-setup"),
            Some(Duration::from_millis(120))
        );
        assert_eq!(durations.get("missing"), None);
    }

    #[test]
    fn repeated_labels_accumulate() {
        let mut durations = Durations::new();
        durations.record("run", Duration::from_millis(100));
        durations.record("run", Duration::from_millis(50));
        assert_eq!(durations.get("run"), Some(Duration::from_millis(150)));
        assert_eq!(durations.len(), 1);
    }

    #[test]
    fn timer_commits_elapsed() {
        let mut durations = Durations::new();
        let timer = durations.start("probes-setup");
        timer.commit(&mut durations);
        assert!(durations.get("probes-setup").is_some());
    }

    #[test]
    fn json_shape() {
        let mut durations = Durations::new();
        durations.record("run", Duration::from_secs(2));
        let json = durations.to_json();
        assert_eq!(json["run"], 2.0);
    }
}
