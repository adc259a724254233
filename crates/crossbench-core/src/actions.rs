//! Named, timed, error-annotated spans inside a story.
//!
//! Stories wrap each logical step in an [`Actions`] span: the label scopes
//! error annotations, the elapsed time lands in the run's duration ledger,
//! and the browser operations are exposed with timeouts expressed in
//! timing units.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail, ensure};
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::TimeoutError;
use crate::run::Run;
use crate::timing::WaitRange;

pub struct Actions<'a> {
    run: &'a mut Run,
    label: String,
    started: Instant,
}

impl<'a> Actions<'a> {
    pub fn new(run: &'a mut Run, label: &str) -> Self {
        assert!(!label.is_empty(), "Actions need a name");
        run.errors_mut().push_info(format!("Action: {label}"));
        debug!(action = label, "action begin");
        info!("   {label}");
        Self {
            run,
            label: label.to_string(),
            started: Instant::now(),
        }
    }

    pub fn run(&mut self) -> &mut Run {
        self.run
    }

    /// Runs JS in the active browser; `timeout_units` is scaled by the
    /// runner's timing unit.
    pub async fn js(&mut self, code: &str, timeout_units: f64, args: &[Value]) -> Result<Value> {
        ensure!(!code.is_empty(), "js code must be a valid script");
        let timeout = self.run.timing().duration(timeout_units);
        let browser = Arc::clone(self.run.browser());
        browser.js(code, timeout, args).await
    }

    /// Polls `code` (which must `return` a boolean) with exponential
    /// backoff until it returns true or `timeout_units` elapses.
    pub async fn wait_js_condition(
        &mut self,
        code: &str,
        min_units: f64,
        timeout_units: f64,
    ) -> Result<()> {
        ensure!(
            code.contains("return"),
            "missing return statement in js-wait code: {code}"
        );
        let timing = self.run.timing();
        let range = WaitRange::new(timing.duration(min_units), timing.duration(timeout_units));
        let deadline = Instant::now() + range.max;
        let mut slices = range.backoff();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let result = self.js(code, timing.units(left).max(0.1), &[]).await?;
            match result {
                Value::Bool(true) => return Ok(()),
                Value::Bool(false) => {}
                other => bail!("js condition did not return a bool, but got: {other}"),
            }
            let Some(slice) = slices.next() else {
                return Err(TimeoutError {
                    label: format!("js condition: {code}"),
                    seconds: range.max.as_secs_f64(),
                }
                .into());
            };
            self.run.wait_absolute(slice).await;
        }
    }

    pub async fn navigate_to(&mut self, url: &str) -> Result<()> {
        let browser = Arc::clone(self.run.browser());
        browser.navigate_to(url).await
    }

    /// Sleeps for `units` timing units.
    pub async fn wait(&mut self, units: f64) {
        self.run.wait(units).await;
    }

    /// Ends the span. Dropping without calling this commits the span too;
    /// `finish` exists to make the end of the measured region explicit.
    pub fn finish(self) {}
}

impl Drop for Actions<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.run
            .durations_mut()
            .record(&format!("action:{}", self.label), elapsed);
        self.run.errors_mut().pop_info();
        debug!(action = %self.label, ?elapsed, "action end");
    }
}
