//! The probe contract.
//!
//! A probe is a reusable measurement module: attached once per runner to
//! every compatible browser, activated once per run as a [`ProbeScope`],
//! and consulted during aggregation through the three merge hooks. The
//! engine drives the lifecycle; probes only produce artifact paths.

pub mod helpers;
pub mod meta;
mod results;

pub use results::{ProbeResult, ProbeResultDict};

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::browser::Browser;
use crate::groups::{BrowsersRunGroup, RepetitionsRunGroup, StoriesRunGroup};
use crate::run::Run;

/// Where a probe writes its per-run artifact before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultLocation {
    /// Directly into the run's local output directory.
    #[default]
    Local,
    /// Into the browser-side tmp dir; transferred during teardown.
    Browser,
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// Unique within one runner.
    fn name(&self) -> &str;

    /// Whether the engine should expect an artifact from every run. Probes
    /// returning false are excluded from the missing-data warning.
    fn produces_data(&self) -> bool {
        true
    }

    /// User-selectable probes; meta-probes return false.
    fn is_general_purpose(&self) -> bool {
        true
    }

    /// Probes that only make sense on battery power (e.g. power sampling).
    fn battery_only(&self) -> bool {
        false
    }

    fn result_location(&self) -> ResultLocation {
        ResultLocation::Local
    }

    /// File name of this probe's artifact inside a run or group directory.
    fn result_file_name(&self) -> String {
        self.name().to_string()
    }

    fn is_compatible(&self, _browser: &Browser) -> bool {
        true
    }

    /// One-way binding to a browser. May mutate the browser's flags.
    fn attach(&self, _browser: &Browser) -> Result<()> {
        Ok(())
    }

    /// Produces the per-run activation. Called during run setup.
    fn get_scope(&self, run: &mut Run) -> Result<Box<dyn ProbeScope>>;

    /// Merges the per-run artifacts of all repetitions of one story.
    async fn merge_repetitions(&self, _group: &RepetitionsRunGroup) -> Result<ProbeResult> {
        Ok(ProbeResult::empty())
    }

    /// Merges the repetition-level artifacts of all stories of one browser.
    async fn merge_stories(&self, _group: &StoriesRunGroup) -> Result<ProbeResult> {
        Ok(ProbeResult::empty())
    }

    /// Merges the story-level artifacts across browsers.
    async fn merge_browsers(&self, _group: &BrowsersRunGroup) -> Result<ProbeResult> {
        Ok(ProbeResult::empty())
    }
}

/// Per-run activation of a probe.
///
/// Hook order per run: `setup` → `start` → story → `stop` → `tear_down`,
/// with teardown guaranteed in reverse setup order even after failures.
#[async_trait]
pub trait ProbeScope: Send {
    fn probe_name(&self) -> &str;

    /// Destination of this scope's primary artifact.
    fn result_path(&self) -> &Path;

    /// Shared timestamp taken right before all scopes start.
    fn set_start_time(&mut self, _time: DateTime<Utc>) {}

    /// Before browser start. May mutate `run.extra_flags` /
    /// `run.extra_js_flags`.
    async fn setup(&mut self, _run: &mut Run) -> Result<()> {
        Ok(())
    }

    /// After browser setup, before the story.
    async fn start(&mut self, _run: &Run) -> Result<()> {
        Ok(())
    }

    /// After the story, before teardown.
    async fn stop(&mut self, _run: &Run) -> Result<()> {
        Ok(())
    }

    /// Always invoked; returns the produced artifacts.
    async fn tear_down(&mut self, run: &Run) -> Result<ProbeResult>;
}

/// Common bookkeeping embedded by scope implementations.
#[derive(Debug, Clone)]
pub struct ScopeContext {
    pub probe_name: String,
    pub result_path: PathBuf,
    pub start_time: Option<DateTime<Utc>>,
}

impl ScopeContext {
    pub fn new(probe_name: impl Into<String>, result_path: PathBuf) -> Self {
        Self {
            probe_name: probe_name.into(),
            result_path,
            start_time: None,
        }
    }
}
