//! Typed engine errors and the error annotator.
//!
//! Dozens of independent runs execute per invocation; a failure in one must
//! not abort its siblings. The [`ErrorAnnotator`] is the collection point:
//! every fallible phase is captured together with a stack of human-readable
//! context labels, and aggregation points collapse the accumulated entries
//! into a single composite error.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("flag {name} already set to {existing:?}, refusing {new:?} without override")]
    Conflict {
        name: String,
        existing: Option<String>,
        new: Option<String>,
    },
    #[error("flag {name} conflicts with {counterpart}")]
    NegatedPair { name: String, counterpart: String },
    #[error("feature {feature} is both enabled and disabled")]
    FeatureConflict { feature: String },
    #[error("flag {name} requires a value")]
    MissingValue { name: String },
    #[error("flag {name} carries an inline value, pass it separately")]
    InlineValue { name: String },
    #[error("duplicate flag {name}")]
    Duplicate { name: String },
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

#[derive(Debug, Error)]
#[error("config conflict for {field}: {left} vs {right}")]
pub struct ConfigConflict {
    pub field: &'static str,
    pub left: String,
    pub right: String,
}

/// Raised by actions that ran out of time. Kept as a distinct type so the
/// run loop can tell a slow page (possibly a background-throttled browser)
/// apart from genuine automation failures.
#[derive(Debug, Error)]
#[error("timed out after {seconds:.1}s: {label}")]
pub struct TimeoutError {
    pub label: String,
    pub seconds: f64,
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser binary not found: {0}")]
    BinaryNotFound(String),
    #[error("invalid browser state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
    #[error("browser {name} is not running")]
    NotRunning { name: String },
    #[error("driver error: {0}")]
    Driver(String),
}

/// Composite failure surfaced by [`crate::runner::Runner::run`].
#[derive(Debug, Error)]
#[error("{message} ({} captured errors)", .entries.len())]
pub struct RunnerError {
    pub message: String,
    pub entries: Vec<ErrorEntry>,
}

/// One captured failure: the context stack active at capture time plus the
/// rendered error chain.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub info_stack: Vec<String>,
    pub message: String,
}

/// Collects errors instead of propagating them, annotated with a stack of
/// context labels. With `throw` set every captured error propagates
/// immediately instead (used by the test harness to fail fast).
#[derive(Debug, Default)]
pub struct ErrorAnnotator {
    throw: bool,
    stack: Vec<String>,
    entries: Vec<ErrorEntry>,
}

impl ErrorAnnotator {
    pub fn new(throw: bool) -> Self {
        Self {
            throw,
            stack: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn throw(&self) -> bool {
        self.throw
    }

    pub fn is_success(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    /// Pushes a context label. Pair with [`ErrorAnnotator::pop_info`]; the
    /// label annotates every error captured while it is on the stack.
    pub fn push_info(&mut self, label: impl Into<String>) {
        self.stack.push(label.into());
    }

    pub fn pop_info(&mut self) {
        self.stack.pop();
    }

    /// Captures a failed result under `label`. Returns `Ok(Some(v))` on
    /// success, `Ok(None)` when the error was recorded, and `Err` when the
    /// annotator is in throw mode.
    pub fn capture<T>(
        &mut self,
        label: &str,
        result: anyhow::Result<T>,
    ) -> anyhow::Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                if self.throw {
                    return Err(error.context(label.to_string()));
                }
                self.append_with_label(label, &error);
                Ok(None)
            }
        }
    }

    /// Records an error without the throw escape hatch. Used on cleanup
    /// paths where propagation would mask the original failure.
    pub fn append(&mut self, error: &anyhow::Error) {
        let entry = ErrorEntry {
            info_stack: self.stack.clone(),
            message: format!("{error:#}"),
        };
        debug!(stack = ?entry.info_stack, error = %entry.message, "captured error");
        self.entries.push(entry);
    }

    fn append_with_label(&mut self, label: &str, error: &anyhow::Error) {
        let mut info_stack = self.stack.clone();
        info_stack.push(label.to_string());
        let entry = ErrorEntry {
            info_stack,
            message: format!("{error:#}"),
        };
        debug!(stack = ?entry.info_stack, error = %entry.message, "captured error");
        self.entries.push(entry);
    }

    /// Copies another annotator's entries into this one. Nested entries
    /// keep their own stacks prefixed by the current one.
    pub fn extend(&mut self, other: &ErrorAnnotator, nested: bool) {
        for entry in &other.entries {
            let info_stack = if nested {
                let mut stack = self.stack.clone();
                stack.extend(entry.info_stack.iter().cloned());
                stack
            } else {
                entry.info_stack.clone()
            };
            self.entries.push(ErrorEntry {
                info_stack,
                message: entry.message.clone(),
            });
        }
    }

    /// Collapses the accumulated entries into a composite error.
    pub fn assert_success(&self, message: &str) -> Result<(), RunnerError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        Err(RunnerError {
            message: message.to_string(),
            entries: self.entries.clone(),
        })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.entries).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn empty_annotator_is_success() {
        let annotator = ErrorAnnotator::new(false);
        assert!(annotator.is_success());
        assert!(annotator.assert_success("all good").is_ok());
    }

    #[test]
    fn capture_records_stack_and_label() {
        let mut annotator = ErrorAnnotator::new(false);
        annotator.push_info("Run(story[0])");
        let captured = annotator
            .capture::<()>("Probe trace setup", Err(anyhow!("boom")))
            .unwrap();
        assert!(captured.is_none());
        annotator.pop_info();
        assert_eq!(annotator.entries().len(), 1);
        let entry = &annotator.entries()[0];
        assert_eq!(entry.info_stack, ["Run(story[0])", "Probe trace setup"]);
        assert!(entry.message.contains("boom"));
    }

    #[test]
    fn capture_passes_through_success() {
        let mut annotator = ErrorAnnotator::new(false);
        let value = annotator.capture("label", Ok(42)).unwrap();
        assert_eq!(value, Some(42));
        assert!(annotator.is_success());
    }

    #[test]
    fn throw_mode_propagates() {
        let mut annotator = ErrorAnnotator::new(true);
        let result = annotator.capture::<()>("label", Err(anyhow!("boom")));
        assert!(result.is_err());
        assert!(annotator.is_success());
    }

    #[test]
    fn assert_success_collapses_entries() {
        let mut annotator = ErrorAnnotator::new(false);
        annotator
            .capture::<()>("first", Err(anyhow!("a")))
            .unwrap();
        annotator
            .capture::<()>("second", Err(anyhow!("b")))
            .unwrap();
        let error = annotator.assert_success("2 failures").unwrap_err();
        assert_eq!(error.entries.len(), 2);
        assert!(error.to_string().contains("2 captured errors"));
    }

    #[test]
    fn extend_nested_prefixes_stack() {
        let mut outer = ErrorAnnotator::new(false);
        outer.push_info("outer");
        let mut inner = ErrorAnnotator::new(false);
        inner
            .capture::<()>("inner", Err(anyhow!("boom")))
            .unwrap();
        outer.extend(&inner, true);
        assert_eq!(outer.entries()[0].info_stack, ["outer", "inner"]);
    }
}
