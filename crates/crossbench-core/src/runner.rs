//! Top-level orchestration.
//!
//! The runner expands (repetitions × stories × browsers) into runs,
//! validates the host, executes the runs in thread groups and drives the
//! bottom-up merge cascade. Failure isolation is the guiding rule: one
//! failing run must never abort its siblings, and every captured error
//! must surface in the final report.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::benchmark::Benchmark;
use crate::browser::Browser;
use crate::env::{HostEnvironment, HostEnvironmentConfig, ValidationMode};
use crate::errors::{ErrorAnnotator, RunnerError};
use crate::groups::{BrowsersRunGroup, RepetitionsRunGroup, StoriesRunGroup};
use crate::platform::{self, Platform, SleepInhibitor};
use crate::probe::Probe;
use crate::probe::meta::{RunDurationsProbe, RunResultsSummaryProbe, RunnerLogProbe};
use crate::run::Run;
use crate::story::Story;
use crate::timing::Timing;

const LOG_SEPARATOR: &str =
    "================================================================================";

/// Partitioning policy turning the run list into concurrent groups.
///
/// `Browser` and `Run` maximize parallelism at the cost of interference;
/// don't use them for time-critical measurements. `Sequential` is the
/// measurement-safe default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    /// All runs sequentially in one group.
    #[default]
    Sequential,
    /// One group per platform.
    Platform,
    /// One group per browser.
    Browser,
    /// One group per run.
    Run,
}

impl std::str::FromStr for ThreadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::Sequential),
            "platform" => Ok(Self::Platform),
            "browser" => Ok(Self::Browser),
            "run" => Ok(Self::Run),
            other => Err(format!("unknown thread mode: {other}")),
        }
    }
}

impl ThreadMode {
    fn group(self, runs: Vec<Run>) -> Vec<Vec<Run>> {
        match self {
            ThreadMode::Sequential => vec![runs],
            ThreadMode::Run => runs.into_iter().map(|run| vec![run]).collect(),
            ThreadMode::Browser => {
                group_by(runs, |run| Arc::as_ptr(run.browser()) as usize)
            }
            ThreadMode::Platform => {
                group_by(runs, |run| Arc::as_ptr(run.platform()) as *const () as usize)
            }
        }
    }
}

fn group_by<K: PartialEq>(runs: Vec<Run>, key: impl Fn(&Run) -> K) -> Vec<Vec<Run>> {
    let mut keys: Vec<K> = Vec::new();
    let mut groups: Vec<Vec<Run>> = Vec::new();
    for run in runs {
        let k = key(&run);
        match keys.iter().position(|existing| *existing == k) {
            Some(index) => groups[index].push(run),
            None => {
                keys.push(k);
                groups.push(vec![run]);
            }
        }
    }
    groups
}

/// One worker executing its runs strictly sequentially.
pub struct RunThreadGroup {
    runs: Vec<Run>,
    total_runs: usize,
    is_dry_run: bool,
}

impl RunThreadGroup {
    fn new(runs: Vec<Run>, total_runs: usize, is_dry_run: bool) -> Self {
        Self {
            runs,
            total_runs,
            is_dry_run,
        }
    }

    async fn run(mut self) -> (Vec<Run>, Result<()>) {
        let mut outcome = Ok(());
        for index in 0..self.runs.len() {
            let is_dry_run = self.is_dry_run;
            let total = self.total_runs;
            let run = &mut self.runs[index];
            info!("{LOG_SEPARATOR}");
            info!("RUN {}/{}", run.index() + 1, total);
            info!("{LOG_SEPARATOR}");
            if let Err(error) = run.run(is_dry_run).await {
                // Only reachable in throw mode; stop this worker.
                outcome = Err(error);
                break;
            }
        }
        (self.runs, outcome)
    }
}

pub struct RunnerOptions {
    pub platform: Arc<dyn Platform>,
    pub env_config: HostEnvironmentConfig,
    pub env_validation_mode: ValidationMode,
    pub repetitions: usize,
    pub timing: Timing,
    pub thread_mode: ThreadMode,
    /// Propagate errors immediately instead of collecting them.
    pub throw: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            platform: platform::default_platform(),
            env_config: HostEnvironmentConfig::default(),
            env_validation_mode: ValidationMode::default(),
            repetitions: 1,
            timing: Timing::default(),
            thread_mode: ThreadMode::default(),
            throw: false,
        }
    }
}

pub struct Runner {
    out_dir: PathBuf,
    browsers: Vec<Arc<Browser>>,
    benchmark: Box<dyn Benchmark>,
    stories: Vec<Arc<dyn Story>>,
    probes: Vec<Arc<dyn Probe>>,
    repetitions: usize,
    timing: Timing,
    thread_mode: ThreadMode,
    platform: Arc<dyn Platform>,
    env: HostEnvironment,
    errors: ErrorAnnotator,
    runs: Vec<Arc<Run>>,
    browser_group: Option<BrowsersRunGroup>,
}

impl Runner {
    /// Default output directory: `<cwd>/results/<timestamp>_<label>`.
    pub fn default_out_dir(cwd: &Path, label: &str) -> PathBuf {
        let timestamp = Local::now().format("%Y-%m-%d_%H%M%S");
        let suffix = if label.is_empty() {
            String::new()
        } else {
            format!("_{label}")
        };
        cwd.join("results").join(format!("{timestamp}{suffix}"))
    }

    pub fn new(
        out_dir: PathBuf,
        browsers: Vec<Arc<Browser>>,
        benchmark: Box<dyn Benchmark>,
        options: RunnerOptions,
    ) -> Result<Self> {
        if out_dir.exists() {
            bail!("out_dir={} exists already", out_dir.display());
        }
        if browsers.is_empty() {
            bail!("no browsers provided");
        }
        if options.repetitions == 0 {
            bail!("invalid repetitions=0");
        }
        let stories = benchmark.stories();
        if stories.is_empty() {
            bail!("benchmark {} has no stories", benchmark.name());
        }
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("creating out_dir {}", out_dir.display()))?;

        let env = HostEnvironment::new(options.env_config, options.env_validation_mode);
        let mut runner = Self {
            out_dir,
            browsers,
            benchmark,
            stories,
            probes: Vec::new(),
            repetitions: options.repetitions,
            timing: options.timing,
            thread_mode: options.thread_mode,
            platform: options.platform,
            env,
            errors: ErrorAnnotator::new(options.throw),
            runs: Vec::new(),
            browser_group: None,
        };
        runner.attach_default_probes()?;
        Ok(runner)
    }

    fn attach_default_probes(&mut self) -> Result<()> {
        self.attach_probe(Arc::new(RunResultsSummaryProbe), false)?;
        self.attach_probe(Arc::new(RunDurationsProbe), false)?;
        self.attach_probe(Arc::new(RunnerLogProbe), false)?;
        Ok(())
    }

    /// Adds a probe and binds it to every compatible browser.
    pub fn attach_probe(
        &mut self,
        probe: Arc<dyn Probe>,
        matching_browser_only: bool,
    ) -> Result<()> {
        if self.probes.iter().any(|p| p.name() == probe.name()) {
            bail!("cannot add the same probe twice: {}", probe.name());
        }
        for browser in &self.browsers {
            if !probe.is_compatible(browser) {
                if matching_browser_only {
                    warn!(
                        probe = probe.name(),
                        browser = %browser.unique_name(),
                        "skipping incompatible probe"
                    );
                    continue;
                }
                bail!(
                    "probe '{}' is not compatible with browser {}",
                    probe.name(),
                    browser.browser_type()
                );
            }
            probe.attach(browser)?;
            browser.attach_probe(probe.name());
        }
        self.probes.push(probe);
        Ok(())
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn browsers(&self) -> &[Arc<Browser>] {
        &self.browsers
    }

    pub fn stories(&self) -> &[Arc<dyn Story>] {
        &self.stories
    }

    /// Probes in attach order. Merging iterates this in reverse; see
    /// [`crate::groups::merge_probes`].
    pub fn probes(&self) -> &[Arc<dyn Probe>] {
        &self.probes
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn errors(&self) -> &ErrorAnnotator {
        &self.errors
    }

    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    pub fn browser_group(&self) -> Option<&BrowsersRunGroup> {
        self.browser_group.as_ref()
    }

    pub fn is_success(&self) -> bool {
        !self.runs.is_empty() && self.errors.is_success()
    }

    /// Executes the full pipeline: setup, thread groups, merge cascade,
    /// report. The system-sleep inhibitor is held for the whole call.
    pub async fn run(&mut self, is_dry_run: bool) -> Result<(), RunnerError> {
        let _inhibitor = SleepInhibitor::acquire();

        let pending_runs = match self.setup(is_dry_run).await {
            Ok(runs) => runs,
            Err(error) => {
                self.errors.append(&error);
                return Err(RunnerError {
                    message: "Setup failed".to_string(),
                    entries: self.errors.entries().to_vec(),
                });
            }
        };

        self.execute(pending_runs, is_dry_run).await?;

        if !is_dry_run {
            self.merge().await?;
        }

        self.report();
        let failed = self.failed_runs().len();
        if self.runs.is_empty() {
            self.errors.append(&anyhow!("no runs were executed"));
        }
        self.errors.assert_success(&format!(
            "Runs Failed: {failed}/{} runs failed.",
            self.runs.len()
        ))
    }

    async fn setup(&mut self, is_dry_run: bool) -> Result<Vec<Run>> {
        info!("{LOG_SEPARATOR}");
        info!("SETUP");
        info!("{LOG_SEPARATOR}");

        info!("PREPARING {} BROWSER(S)", self.browsers.len());
        for browser in &self.browsers {
            let label = format!(
                "Preparing browser type={} label={}",
                browser.browser_type(),
                browser.label()
            );
            let result = browser.setup_binary().await;
            self.errors.capture(&label, result)?;
        }
        self.errors.assert_success("Browser setup failed")?;
        self.validate_browsers()?;
        self.validate_story_probes()?;

        let runs = self.build_runs();
        if runs.is_empty() {
            bail!("no runs were produced");
        }
        info!("DISCOVERED {} RUN(S)", runs.len());

        if !is_dry_run {
            self.env.validate(self).await?;
        }
        let benchmark_setup = self.benchmark.setup(self).await;
        self.errors.capture(
            &format!("Preparing benchmark: {}", self.benchmark.name()),
            benchmark_setup,
        )?;

        self.collect_system_details().await?;
        self.errors.assert_success("Setup failed")?;
        Ok(runs)
    }

    fn validate_browsers(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for browser in &self.browsers {
            let name = browser.unique_name();
            if !seen.insert(name.clone()) {
                bail!("duplicated browser unique_name: {name}");
            }
        }
        Ok(())
    }

    /// Every probe a story declares must have been attached up front.
    fn validate_story_probes(&self) -> Result<()> {
        let first = &self.stories[0];
        let expected = first.probe_names();
        for story in &self.stories {
            if story.probe_names() != expected {
                bail!(
                    "story {} declares different probes than {}",
                    story.name(),
                    first.name()
                );
            }
        }
        for name in &expected {
            if !self.probes.iter().any(|probe| probe.name() == name) {
                bail!("story-required probe '{name}' is not attached");
            }
        }
        Ok(())
    }

    fn build_runs(&self) -> Vec<Run> {
        let probes = Arc::new(self.probes.clone());
        let mut runs = Vec::new();
        let mut index = 0;
        for repetition in 0..self.repetitions {
            for story in &self.stories {
                for browser in &self.browsers {
                    runs.push(Run::new(
                        Arc::clone(browser),
                        Arc::clone(story),
                        Arc::clone(&probes),
                        Arc::clone(&self.platform),
                        self.timing,
                        repetition,
                        index,
                        &self.out_dir,
                        self.errors.throw(),
                    ));
                    index += 1;
                }
            }
        }
        runs
    }

    async fn collect_system_details(&self) -> Result<()> {
        let details = platform::system_details(self.platform.as_ref()).await;
        let path = self.out_dir.join("system_details.json");
        let rendered = serde_json::to_string_pretty(&details)?;
        std::fs::write(&path, rendered)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn execute(&mut self, runs: Vec<Run>, is_dry_run: bool) -> Result<(), RunnerError> {
        let total = runs.len();
        let groups = self.thread_mode.group(runs);
        debug!(groups = groups.len(), total, "starting thread groups");

        let mut handles = Vec::new();
        for group_runs in groups {
            let group = RunThreadGroup::new(group_runs, total, is_dry_run);
            handles.push(tokio::spawn(group.run()));
        }

        let mut throw_error = None;
        for handle in handles {
            match handle.await {
                Ok((finished_runs, outcome)) => {
                    for run in finished_runs {
                        if !run.is_success() {
                            self.errors.extend(run.errors(), false);
                        }
                        self.runs.push(Arc::new(run));
                    }
                    if let Err(error) = outcome {
                        throw_error.get_or_insert(error);
                    }
                }
                Err(join_error) => {
                    self.errors
                        .append(&anyhow!("thread group panicked: {join_error}"));
                }
            }
        }
        self.runs.sort_by_key(|run| run.index());

        if let Some(error) = throw_error {
            self.errors.append(&error);
            return Err(RunnerError {
                message: "Run failed in throw mode".to_string(),
                entries: self.errors.entries().to_vec(),
            });
        }
        Ok(())
    }

    async fn merge(&mut self) -> Result<(), RunnerError> {
        info!("{LOG_SEPARATOR}");
        info!("RUNS COMPLETED");
        info!("MERGING PROBE DATA");
        let throw = self.errors.throw();

        debug!("MERGING PROBE DATA: repetitions");
        let mut repetitions_groups = match RepetitionsRunGroup::group(&self.runs, throw) {
            Ok(groups) => groups,
            Err(error) => {
                self.errors.append(&error);
                Vec::new()
            }
        };
        self.errors
            .push_info("Merging results from multiple repetitions");
        for group in &mut repetitions_groups {
            if let Err(error) = group.merge(&self.probes).await {
                self.errors.pop_info();
                self.errors.append(&error);
                return self.merge_failure();
            }
            self.errors.extend(group.errors(), true);
        }
        self.errors.pop_info();

        debug!("MERGING PROBE DATA: stories");
        let mut story_groups = match StoriesRunGroup::group(repetitions_groups, throw) {
            Ok(groups) => groups,
            Err(error) => {
                self.errors.append(&error);
                Vec::new()
            }
        };
        self.errors
            .push_info("Merging results from multiple stories");
        for group in &mut story_groups {
            if let Err(error) = group.merge(&self.probes).await {
                self.errors.pop_info();
                self.errors.append(&error);
                return self.merge_failure();
            }
            self.errors.extend(group.errors(), true);
        }
        self.errors.pop_info();

        debug!("MERGING PROBE DATA: browsers");
        if !story_groups.is_empty() {
            match BrowsersRunGroup::new(story_groups, throw) {
                Ok(mut browser_group) => {
                    self.errors
                        .push_info("Merging results from multiple browsers");
                    if let Err(error) = browser_group.merge(&self.probes).await {
                        self.errors.pop_info();
                        self.errors.append(&error);
                        return self.merge_failure();
                    }
                    self.errors.extend(browser_group.errors(), true);
                    self.errors.pop_info();
                    self.browser_group = Some(browser_group);
                }
                Err(error) => self.errors.append(&error),
            }
        }
        Ok(())
    }

    fn merge_failure(&self) -> Result<(), RunnerError> {
        self.errors.assert_success("Merging probe data failed")
    }

    fn failed_runs(&self) -> Vec<&Arc<Run>> {
        self.runs.iter().filter(|run| !run.is_success()).collect()
    }

    /// One box with the failure summary plus debugging hints for the
    /// first failed run.
    fn report(&self) {
        let failed = self.failed_runs();
        if failed.is_empty() {
            info!("{LOG_SEPARATOR}");
            info!("RUNS SUCCEEDED: {}/{}", self.runs.len(), self.runs.len());
            return;
        }
        error!("{LOG_SEPARATOR}");
        error!("RUNS FAILED: {}/{}", failed.len(), self.runs.len());
        if let Some(first) = failed.first() {
            error!("first failed run dir: {}", first.out_dir().display());
            for entry in walkdir::WalkDir::new(first.out_dir())
                .into_iter()
                .flatten()
            {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("log") {
                    error!("  log: {}", entry.path().display());
                }
            }
        }
        error!("rerun with --throw to fail fast, -vv for verbose logging");
        error!("{LOG_SEPARATOR}");
    }
}
