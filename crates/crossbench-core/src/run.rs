//! One (browser, story, repetition) execution.
//!
//! A run owns its output directory, its error annotator and the lifecycle
//! of its probe scopes. The state machine is strict: states advance
//! monotonically and teardown is entered on every path that made it past
//! the prepare phase, so browser sessions and temp dirs cannot leak.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::durations::Durations;
use crate::errors::{ErrorAnnotator, TimeoutError};
use crate::flags::{Flags, JsFlags};
use crate::platform::Platform;
use crate::probe::{Probe, ProbeResult, ProbeResultDict, ProbeScope, ResultLocation};
use crate::story::{self, Story};
use crate::timing::{Timing, WaitRange};

pub const BROWSER_LOG_FILE: &str = "browser.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Initial,
    Prepare,
    Run,
    Done,
}

impl RunState {
    fn name(self) -> &'static str {
        match self {
            RunState::Initial => "initial",
            RunState::Prepare => "prepare",
            RunState::Run => "run",
            RunState::Done => "done",
        }
    }
}

pub struct Run {
    state: RunState,
    browser: Arc<Browser>,
    story: Arc<dyn Story>,
    probes: Arc<Vec<Arc<dyn Probe>>>,
    platform: Arc<dyn Platform>,
    timing: Timing,
    repetition: usize,
    index: usize,
    name: String,
    out_dir: PathBuf,
    results: ProbeResultDict,
    extra_flags: Flags,
    extra_js_flags: JsFlags,
    durations: Durations,
    errors: ErrorAnnotator,
    browser_tmp_dir: Option<PathBuf>,
}

impl Run {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        browser: Arc<Browser>,
        story: Arc<dyn Story>,
        probes: Arc<Vec<Arc<dyn Probe>>>,
        platform: Arc<dyn Platform>,
        timing: Timing,
        repetition: usize,
        index: usize,
        root_dir: &Path,
        throw: bool,
    ) -> Self {
        let name = format!("{}[{repetition}]", story.name());
        let out_dir = root_dir
            .join(browser.unique_name())
            .join(story.name())
            .join(repetition.to_string());
        let results = ProbeResultDict::new(out_dir.clone());
        Self {
            state: RunState::Initial,
            browser,
            story,
            probes,
            platform,
            timing,
            repetition,
            index,
            name,
            out_dir,
            results,
            extra_flags: Flags::new(),
            extra_js_flags: JsFlags::new(),
            durations: Durations::new(),
            errors: ErrorAnnotator::new(throw),
            browser_tmp_dir: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn repetition(&self) -> usize {
        self.repetition
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Directory shared by all repetitions of this (browser, story) pair.
    pub fn group_dir(&self) -> &Path {
        self.out_dir.parent().unwrap_or(&self.out_dir)
    }

    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    pub fn story(&self) -> &Arc<dyn Story> {
        &self.story
    }

    pub fn probes(&self) -> &[Arc<dyn Probe>] {
        &self.probes
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn durations(&self) -> &Durations {
        &self.durations
    }

    pub fn durations_mut(&mut self) -> &mut Durations {
        &mut self.durations
    }

    pub fn results(&self) -> &ProbeResultDict {
        &self.results
    }

    pub fn errors(&self) -> &ErrorAnnotator {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorAnnotator {
        &mut self.errors
    }

    pub fn extra_flags_mut(&mut self) -> &mut Flags {
        &mut self.extra_flags
    }

    pub fn extra_js_flags_mut(&mut self) -> &mut JsFlags {
        &mut self.extra_js_flags
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_success()
    }

    /// Lazily created scratch dir on the browser platform, removed during
    /// teardown.
    pub fn browser_tmp_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.browser_tmp_dir {
            return Ok(dir.clone());
        }
        let dir = self.platform.mkdtemp("cb_run_results")?;
        self.browser_tmp_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Result path inside the local output directory; taken paths fail.
    pub fn local_result_path(&self, file_name: &str) -> Result<PathBuf> {
        let path = self.out_dir.join(file_name);
        if path.exists() {
            bail!("probe result file exists already: {}", path.display());
        }
        Ok(path)
    }

    /// Local or browser-side result path, per the probe's declared
    /// location.
    pub fn result_path_for(&mut self, probe: &dyn Probe) -> Result<PathBuf> {
        match probe.result_location() {
            ResultLocation::Local => self.local_result_path(&probe.result_file_name()),
            ResultLocation::Browser => {
                let dir = self.browser_tmp_dir()?;
                Ok(dir.join(probe.result_file_name()))
            }
        }
    }

    pub fn story_details_json(&self) -> Value {
        story::details_json(self.story.as_ref())
    }

    /// Browser identity plus the run-specific extra flags.
    pub fn browser_details_json(&self) -> Value {
        let mut details = self.browser.details_json();
        if let Some(object) = details.as_object_mut() {
            object.insert(
                "extra_flags".to_string(),
                Value::from(self.extra_flags.to_list()),
            );
            object.insert(
                "extra_js_flags".to_string(),
                Value::from(self.extra_js_flags.to_list()),
            );
        }
        details
    }

    fn advance_state(&mut self, expected: RunState, next: RunState) -> Result<()> {
        if self.state != expected {
            bail!(
                "invalid run state: got={} expected={}",
                self.state.name(),
                expected.name()
            );
        }
        self.state = next;
        Ok(())
    }

    /// Executes the full lifecycle. Run failures are captured in the run's
    /// own annotator; `Err` is only returned in throw mode.
    pub async fn run(&mut self, is_dry_run: bool) -> Result<()> {
        std::fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("creating run dir {}", self.out_dir.display()))?;
        self.errors.push_info(format!("Run({})", self.name));
        self.errors.push_info(format!(
            "browser={} binary={}",
            self.browser.unique_name(),
            self.browser.path().display()
        ));

        let outcome = self.run_inner(is_dry_run).await;

        self.errors.pop_info();
        self.errors.pop_info();
        outcome
    }

    async fn run_inner(&mut self, is_dry_run: bool) -> Result<()> {
        let mut scopes = match self.setup(is_dry_run).await {
            Ok(scopes) => scopes,
            Err(error) => {
                if self.errors.throw() {
                    return Err(error);
                }
                self.errors.append(&error);
                return Ok(());
            }
        };
        self.advance_state(RunState::Prepare, RunState::Run)?;

        let run_result = self.run_phase(&mut scopes, is_dry_run).await;
        let teardown_result = if is_dry_run {
            Ok(())
        } else {
            self.tear_down(scopes, false).await
        };
        run_result.and(teardown_result)
    }

    async fn setup(&mut self, is_dry_run: bool) -> Result<Vec<Box<dyn ProbeScope>>> {
        self.advance_state(RunState::Initial, RunState::Prepare)?;
        info!(story = %self.story.name(), "STORY");
        info!(
            duration = self.story.duration().as_secs_f64(),
            "STORY DURATION"
        );
        info!(dir = %self.out_dir.display(), "RUN DIR");

        if is_dry_run {
            info!(browser = %self.browser.path().display(), "BROWSER (dry run)");
            return Ok(Vec::new());
        }

        let browser_log = self.out_dir.join(BROWSER_LOG_FILE);
        if browser_log.exists() {
            bail!(
                "browser log file exists already: {}",
                browser_log.display()
            );
        }
        std::fs::File::create(&browser_log)
            .with_context(|| format!("creating {}", browser_log.display()))?;
        self.browser.set_log_file(&browser_log);

        let timer = self.durations.start("runner-cooldown");
        self.platform.sleep(self.timing.cool_down_time).await;
        self.cool_down().await;
        timer.commit(&mut self.durations);

        let timer = self.durations.start("probes-creation");
        let mut scopes: Vec<Box<dyn ProbeScope>> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let probes = Arc::clone(&self.probes);
        for probe in probes.iter() {
            if !seen.insert(probe.name().to_string()) {
                bail!("duplicate probe name: {}", probe.name());
            }
            if probe.produces_data() {
                // Seed with an empty result so probes that never produce
                // data stay visible in the summary.
                self.results.insert(probe.name(), ProbeResult::empty());
            }
            scopes.push(probe.get_scope(self)?);
        }
        timer.commit(&mut self.durations);

        let timer = self.durations.start("probes-setup");
        for scope in &mut scopes {
            let label = format!("Probe {} setup", scope.probe_name());
            let result = scope.setup(self).await;
            self.errors.capture(&label, result)?;
        }
        timer.commit(&mut self.durations);

        let timer = self.durations.start("browser-setup");
        let setup_result = self
            .browser
            .setup(&self.extra_flags, &self.extra_js_flags)
            .await;
        timer.commit(&mut self.durations);
        if let Err(error) = setup_result {
            // Clean up half-set-up browser sessions.
            self.browser.force_quit().await;
            return Err(error);
        }
        Ok(scopes)
    }

    /// Waits out thermal throttling with exponential backoff.
    async fn cool_down(&mut self) {
        if !self.platform.is_thermal_throttled().await {
            return;
        }
        info!("COOLDOWN");
        let range = WaitRange::new(self.timing.duration(1.0), self.timing.duration(100.0));
        for slice in range.backoff() {
            if !self.platform.is_thermal_throttled().await {
                return;
            }
            info!("COOLDOWN: still hot, waiting some more");
            self.platform.sleep(slice).await;
        }
        warn!("giving up on cooldown, host is still thermal throttled");
    }

    async fn run_phase(
        &mut self,
        scopes: &mut [Box<dyn ProbeScope>],
        is_dry_run: bool,
    ) -> Result<()> {
        let probe_start_time = Utc::now();
        let timer = self.durations.start("probes-start");
        for scope in scopes.iter_mut() {
            scope.set_start_time(probe_start_time);
            let label = format!("Probe {} start", scope.probe_name());
            let result = scope.start(self).await;
            self.errors.capture(&label, result)?;
        }
        timer.commit(&mut self.durations);

        if !is_dry_run {
            info!("RUNNING STORY");
            let timer = self.durations.start("run");
            let story = Arc::clone(&self.story);
            match story.run(self).await {
                Ok(()) => {}
                Err(error) => {
                    if error.is::<TimeoutError>() {
                        // Timeouts are often caused by a background-throttled
                        // browser rather than the page itself.
                        warn!(%error, "story timed out");
                    }
                    if self.errors.throw() {
                        timer.commit(&mut self.durations);
                        return Err(error);
                    }
                    self.errors.append(&error);
                }
            }
            timer.commit(&mut self.durations);
        }

        for scope in scopes.iter_mut().rev() {
            let label = format!("Probe {} stop", scope.probe_name());
            let result = scope.stop(self).await;
            self.errors.capture(&label, result)?;
        }

        let foreground = self.check_browser_foreground().await;
        self.errors.capture("Browser foreground check", foreground)?;
        Ok(())
    }

    /// A browser hidden behind another window gets throttled by the OS,
    /// which would skew any measurement.
    async fn check_browser_foreground(&self) -> Result<()> {
        let Some(pid) = self.browser.pid() else {
            return Ok(());
        };
        if self.browser.is_headless() {
            return Ok(());
        }
        let Some(foreground) = self.platform.foreground_process().await else {
            return Ok(());
        };
        if foreground.pid != pid {
            return Err(anyhow!(
                "browser {} (pid={pid}) was not in the foreground at the end \
                 of the benchmark; background apps and tabs can be heavily throttled",
                self.browser.unique_name()
            ));
        }
        Ok(())
    }

    pub(crate) async fn tear_down(
        &mut self,
        mut scopes: Vec<Box<dyn ProbeScope>>,
        is_shutdown: bool,
    ) -> Result<()> {
        self.advance_state(RunState::Run, RunState::Done)?;
        debug!("TEARDOWN");

        let timer = self.durations.start("browser-tear_down");
        if !self.browser.is_running() {
            warn!("browser is no longer running (crashed or closed)");
        } else if is_shutdown {
            // Forced shutdown: swallow quit errors, nothing can act on
            // them anymore.
            if let Err(error) = self.browser.quit().await {
                warn!(%error, "error quitting browser");
            }
        } else {
            let result = self.browser.quit().await;
            self.errors.capture("Quit browser", result)?;
        }
        timer.commit(&mut self.durations);

        let timer = self.durations.start("probes-tear_down");
        for scope in scopes.iter_mut().rev() {
            let label = format!("Probe {} teardown", scope.probe_name());
            let name = scope.probe_name().to_string();
            let result = scope.tear_down(self).await;
            if let Some(probe_result) = self.errors.capture(&label, result)? {
                if probe_result.is_empty() && self.probe_produces_data(&name) {
                    warn!(probe = %name, run = %self.name, "probe did not extract any data");
                }
                self.results.insert(&name, probe_result);
            }
        }
        timer.commit(&mut self.durations);

        if let Some(dir) = self.browser_tmp_dir.take()
            && let Err(error) = self.platform.rm_dir(&dir)
        {
            warn!(%error, "could not remove browser tmp dir");
        }
        Ok(())
    }

    fn probe_produces_data(&self, probe_name: &str) -> bool {
        self.probes
            .iter()
            .any(|probe| probe.name() == probe_name && probe.produces_data())
    }

    /// Sleep helper respecting the timing unit.
    pub async fn wait(&self, units: f64) {
        self.platform.sleep(self.timing.duration(units)).await;
    }

    /// Sleep helper for absolute wall-clock time.
    pub async fn wait_absolute(&self, duration: Duration) {
        self.platform.sleep(duration).await;
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPlatform, MockStory, mock_browser};

    async fn make_run(root: &Path) -> Run {
        let browser = mock_browser("stable");
        browser.setup_binary().await.unwrap();
        Run::new(
            browser,
            MockStory::new("story_a"),
            Arc::new(Vec::new()),
            MockPlatform::new(),
            Timing::new(Duration::ZERO, Duration::from_millis(1)),
            0,
            0,
            root,
            false,
        )
    }

    #[tokio::test]
    async fn states_advance_monotonically() {
        let root = tempfile::tempdir().unwrap();
        let mut run = make_run(root.path()).await;
        assert_eq!(run.state(), RunState::Initial);
        run.run(false).await.unwrap();
        assert_eq!(run.state(), RunState::Done);
        assert!(run.is_success());
    }

    #[tokio::test]
    async fn repeating_the_lifecycle_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut run = make_run(root.path()).await;
        run.run(false).await.unwrap();
        assert!(run.is_success());

        // A second pass hits the state machine, not the browser.
        run.run(false).await.unwrap();
        assert!(!run.is_success());
        assert!(
            run.errors()
                .entries()
                .iter()
                .any(|e| e.message.contains("invalid run state"))
        );
    }

    #[tokio::test]
    async fn cooldown_polls_until_cool() {
        let root = tempfile::tempdir().unwrap();
        let mut run = make_run(root.path()).await;
        let mock = MockPlatform::new();
        mock.throttled_polls
            .store(3, std::sync::atomic::Ordering::Relaxed);
        run.platform = mock.clone();
        run.run(false).await.unwrap();
        assert!(run.is_success());
        assert_eq!(
            mock.throttled_polls
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
        // The cooldown slept between polls.
        assert!(!mock.slept.lock().is_empty());
    }

    #[tokio::test]
    async fn browser_tmp_dir_is_created_once() {
        let root = tempfile::tempdir().unwrap();
        let mut run = make_run(root.path()).await;
        let first = run.browser_tmp_dir().unwrap();
        let second = run.browser_tmp_dir().unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        std::fs::remove_dir_all(first).unwrap();
    }
}
