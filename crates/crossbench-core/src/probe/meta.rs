//! Runner-internal meta-probes.
//!
//! Attached before any user probe so that, with merges running in reverse
//! attach order, the results summary merges last and sees every other
//! probe's merged output.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::groups::{BrowsersRunGroup, RepetitionsRunGroup, StoriesRunGroup};
use crate::logging::{LogSinkGuard, register_sink};
use crate::probe::helpers::{read_json_file, write_json_file};
use crate::probe::{Probe, ProbeResult, ProbeScope, ScopeContext};
use crate::run::Run;
use crate::story;

/// Collects the engine's own log output into a per-run `runner.log`.
pub struct RunnerLogProbe;

impl RunnerLogProbe {
    pub const NAME: &'static str = "runner.log";
}

#[async_trait]
impl Probe for RunnerLogProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_general_purpose(&self) -> bool {
        false
    }

    fn get_scope(&self, run: &mut Run) -> Result<Box<dyn ProbeScope>> {
        let result_path = run.local_result_path(&self.result_file_name())?;
        Ok(Box::new(RunnerLogScope {
            ctx: ScopeContext::new(Self::NAME, result_path),
            guard: None,
        }))
    }
}

struct RunnerLogScope {
    ctx: ScopeContext,
    guard: Option<LogSinkGuard>,
}

#[async_trait]
impl ProbeScope for RunnerLogScope {
    fn probe_name(&self) -> &str {
        &self.ctx.probe_name
    }

    fn result_path(&self) -> &Path {
        &self.ctx.result_path
    }

    async fn setup(&mut self, _run: &mut Run) -> Result<()> {
        self.guard = Some(register_sink(&self.ctx.result_path)?);
        Ok(())
    }

    async fn tear_down(&mut self, _run: &Run) -> Result<ProbeResult> {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
        ProbeResult::single_file(self.ctx.result_path.clone())
    }
}

/// Emits the run's duration ledger. All work happens in late teardown so
/// the ledger includes the teardown phases of the other probes.
pub struct RunDurationsProbe;

impl RunDurationsProbe {
    pub const NAME: &'static str = "durations";
}

#[async_trait]
impl Probe for RunDurationsProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_general_purpose(&self) -> bool {
        false
    }

    fn result_file_name(&self) -> String {
        format!("{}.json", Self::NAME)
    }

    fn get_scope(&self, run: &mut Run) -> Result<Box<dyn ProbeScope>> {
        let result_path = run.local_result_path(&self.result_file_name())?;
        Ok(Box::new(RunDurationsScope {
            ctx: ScopeContext::new(Self::NAME, result_path),
        }))
    }
}

struct RunDurationsScope {
    ctx: ScopeContext,
}

#[async_trait]
impl ProbeScope for RunDurationsScope {
    fn probe_name(&self) -> &str {
        &self.ctx.probe_name
    }

    fn result_path(&self) -> &Path {
        &self.ctx.result_path
    }

    async fn tear_down(&mut self, run: &Run) -> Result<ProbeResult> {
        let path = write_json_file(&self.ctx.result_path, &run.durations().to_json())?;
        ProbeResult::single_json(path)
    }
}

/// Emits a per-run `results.json` with all run information including the
/// artifact paths of every attached probe, and folds these summaries up
/// the aggregation tree.
pub struct RunResultsSummaryProbe;

impl RunResultsSummaryProbe {
    pub const NAME: &'static str = "results";

    fn summary_json(run: &Run) -> Value {
        json!({
            "name": run.name(),
            "cwd": run.out_dir().to_string_lossy(),
            "story": run.story_details_json(),
            "browser": run.browser_details_json(),
            "durations": run.durations().to_json(),
            "probes": run.results().to_json(),
            "errors": run.errors().to_json(),
        })
    }

    fn read_summary(result: Option<&ProbeResult>, what: &str) -> Result<Value> {
        let result = result.with_context(|| format!("no summary for {what}"))?;
        read_json_file(result.json()?)
    }
}

#[async_trait]
impl Probe for RunResultsSummaryProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    // A meta-probe summarizing the other probes' data; excluded from the
    // default result lists.
    fn produces_data(&self) -> bool {
        false
    }

    fn is_general_purpose(&self) -> bool {
        false
    }

    fn result_file_name(&self) -> String {
        format!("{}.json", Self::NAME)
    }

    fn get_scope(&self, run: &mut Run) -> Result<Box<dyn ProbeScope>> {
        let result_path = run.local_result_path(&self.result_file_name())?;
        Ok(Box::new(RunResultsSummaryScope {
            ctx: ScopeContext::new(Self::NAME, result_path),
        }))
    }

    async fn merge_repetitions(&self, group: &RepetitionsRunGroup) -> Result<ProbeResult> {
        let mut browser = Value::Null;
        let mut repetitions = Vec::new();
        for run in group.runs() {
            let summary = Self::read_summary(
                run.results().get(Self::NAME),
                &format!("run {}", run.name()),
            )?;
            if browser.is_null() {
                browser = summary["browser"].clone();
                if let Some(object) = browser.as_object_mut() {
                    // The per-run browser log path makes no sense at the
                    // group level.
                    object.remove("log");
                }
            }
            repetitions.push(json!({
                "cwd": summary["cwd"],
                "probes": summary["probes"],
                "errors": summary["errors"],
            }));
        }
        let merged = json!({
            "cwd": group.path().to_string_lossy(),
            "story": story::details_json(group.story().as_ref()),
            "browser": browser,
            "repetitions": repetitions,
            "probes": group.results().to_json(),
            "errors": group.errors().to_json(),
        });
        let path = group.local_result_path(&self.result_file_name())?;
        ProbeResult::single_json(write_json_file(&path, &merged)?)
    }

    async fn merge_stories(&self, group: &StoriesRunGroup) -> Result<ProbeResult> {
        let mut browser = Value::Null;
        let mut stories = Map::new();
        for repetitions_group in group.repetitions_groups() {
            let summary = Self::read_summary(
                repetitions_group.results().get(Self::NAME),
                &format!("story {}", repetitions_group.story().name()),
            )?;
            if browser.is_null() {
                browser = summary["browser"].clone();
            }
            let story_info = &summary["story"];
            let name = story_info["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            stories.insert(
                name,
                json!({
                    "cwd": summary["cwd"],
                    "duration": story_info["duration"],
                    "probes": summary["probes"],
                    "errors": summary["errors"],
                }),
            );
        }
        let merged = json!({
            "cwd": group.path().to_string_lossy(),
            "browser": browser,
            "stories": stories,
            "probes": group.results().to_json(),
            "errors": group.errors().to_json(),
        });
        let path = group.local_result_path(&self.result_file_name())?;
        ProbeResult::single_json(write_json_file(&path, &merged)?)
    }

    async fn merge_browsers(&self, group: &BrowsersRunGroup) -> Result<ProbeResult> {
        let mut browsers = Map::new();
        for story_group in group.story_groups() {
            let summary = Self::read_summary(
                story_group.results().get(Self::NAME),
                &format!("browser {}", story_group.browser().unique_name()),
            )?;
            browsers.insert(
                story_group.browser().unique_name(),
                json!({
                    "cwd": summary["cwd"],
                    "browser": summary["browser"],
                    "stories": summary["stories"],
                    "errors": summary["errors"],
                }),
            );
        }
        let merged = json!({
            "cwd": group.path().to_string_lossy(),
            "browsers": browsers,
            "probes": group.results().to_json(),
            "errors": group.errors().to_json(),
        });
        let path = group.local_result_path(&self.result_file_name())?;
        ProbeResult::single_json(write_json_file(&path, &merged)?)
    }
}

struct RunResultsSummaryScope {
    ctx: ScopeContext,
}

#[async_trait]
impl ProbeScope for RunResultsSummaryScope {
    fn probe_name(&self) -> &str {
        &self.ctx.probe_name
    }

    fn result_path(&self) -> &Path {
        &self.ctx.result_path
    }

    async fn tear_down(&mut self, run: &Run) -> Result<ProbeResult> {
        // Extract late, when all other probes have produced their data.
        let summary = RunResultsSummaryProbe::summary_json(run);
        let path = write_json_file(&self.ctx.result_path, &summary)?;
        ProbeResult::single_json(path)
    }
}
