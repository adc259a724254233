//! Mock collaborators for engine tests.
//!
//! A scriptable driver, a controllable platform, and story/probe doubles
//! that record their lifecycle, so the scheduler and aggregation logic can
//! be exercised without a real browser.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::browser::{Browser, BrowserConfig, BrowserDriver, StartRequest, Viewport};
use crate::errors::TimeoutError;
use crate::platform::{Platform, ProcessInfo};
use crate::probe::{Probe, ProbeResult, ProbeScope, ScopeContext};
use crate::run::Run;
use crate::story::Story;

/// Scriptable automation adapter.
#[derive(Default)]
pub struct MockDriver {
    running: AtomicBool,
    /// Scripted `js` results, popped front first; defaults to `true`.
    pub js_results: Mutex<VecDeque<Value>>,
    /// Every URL passed to `navigate_to`.
    pub url_log: Mutex<Vec<String>>,
    /// Fail the next `start` call.
    pub fail_start: AtomicBool,
}

impl MockDriver {
    pub fn with_js_results(results: impl IntoIterator<Item = Value>) -> Self {
        Self {
            js_results: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn binary_version(&self, _binary: &Path) -> Result<String> {
        Ok("100.0.0.0".to_string())
    }

    async fn start(&self, _request: StartRequest<'_>) -> Result<u32> {
        if self.fail_start.load(Ordering::Relaxed) {
            bail!("mock driver start failure");
        }
        self.running.store(true, Ordering::Relaxed);
        Ok(std::process::id())
    }

    async fn js(&self, code: &str, _timeout: Duration, _args: &[Value]) -> Result<Value> {
        if !self.running.load(Ordering::Relaxed) {
            bail!("mock browser not running");
        }
        if code.contains("timeout!") {
            return Err(TimeoutError {
                label: code.to_string(),
                seconds: 0.0,
            }
            .into());
        }
        Ok(self
            .js_results
            .lock()
            .pop_front()
            .unwrap_or(Value::Bool(true)))
    }

    async fn navigate_to(&self, url: &str) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) {
            bail!("mock browser not running");
        }
        self.url_log.lock().push(url.to_string());
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn force_quit(&self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }
}

// Shared-handle delegation so tests can keep inspecting a driver that a
// browser owns.
#[async_trait]
impl BrowserDriver for Arc<MockDriver> {
    async fn binary_version(&self, binary: &Path) -> Result<String> {
        self.as_ref().binary_version(binary).await
    }

    async fn start(&self, request: StartRequest<'_>) -> Result<u32> {
        self.as_ref().start(request).await
    }

    async fn js(&self, code: &str, timeout: Duration, args: &[Value]) -> Result<Value> {
        self.as_ref().js(code, timeout, args).await
    }

    async fn navigate_to(&self, url: &str) -> Result<()> {
        self.as_ref().navigate_to(url).await
    }

    async fn quit(&self) -> Result<()> {
        self.as_ref().quit().await
    }

    async fn force_quit(&self) -> Result<()> {
        self.as_ref().force_quit().await
    }
}

/// Creates a headless mock browser whose binary is a scratch file.
pub fn mock_browser(label: &str) -> Arc<Browser> {
    mock_browser_with_driver(label, Box::new(MockDriver::default()))
}

pub fn mock_browser_with_driver(label: &str, driver: Box<dyn BrowserDriver>) -> Arc<Browser> {
    let binary = std::env::temp_dir().join("cb-mock-browser-binary");
    let _ = std::fs::write(&binary, b"#!/bin/sh\n");
    Arc::new(Browser::new(
        BrowserConfig {
            browser_type: "chrome".to_string(),
            label: label.to_string(),
            path: binary,
            viewport: Viewport::headless(),
            cache_dir: None,
        },
        crate::flags::ChromeFlags::new(),
        driver,
    ))
}

/// Controllable host platform. Sleeps are skipped entirely so tests run
/// at full speed.
pub struct MockPlatform {
    pub battery_powered: AtomicBool,
    /// Remaining polls that report thermal throttling.
    pub throttled_polls: AtomicUsize,
    pub cpu_usage: Mutex<f64>,
    pub disk_free: Mutex<u64>,
    pub known_binaries: Mutex<Vec<String>>,
    pub foreground: Mutex<Option<ProcessInfo>>,
    pub slept: Mutex<Vec<Duration>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            battery_powered: AtomicBool::new(false),
            throttled_polls: AtomicUsize::new(0),
            cpu_usage: Mutex::new(0.0),
            disk_free: Mutex::new(u64::MAX),
            known_binaries: Mutex::new(Vec::new()),
            foreground: Mutex::new(None),
            slept: Mutex::new(Vec::new()),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn version(&self) -> String {
        "1.0".to_string()
    }

    fn device(&self) -> String {
        "mock device".to_string()
    }

    fn cpu(&self) -> String {
        "mock cpu".to_string()
    }

    fn has_display(&self) -> bool {
        true
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        self.known_binaries
            .lock()
            .iter()
            .any(|known| known == name)
            .then(|| PathBuf::from(format!("/usr/bin/{name}")))
    }

    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        Vec::new()
    }

    async fn foreground_process(&self) -> Option<ProcessInfo> {
        self.foreground.lock().clone()
    }

    async fn relative_cpu_speed(&self) -> f64 {
        if self.throttled_polls.load(Ordering::Relaxed) > 0 {
            0.5
        } else {
            1.0
        }
    }

    async fn is_thermal_throttled(&self) -> bool {
        let remaining = self.throttled_polls.load(Ordering::Relaxed);
        if remaining == 0 {
            return false;
        }
        self.throttled_polls.store(remaining - 1, Ordering::Relaxed);
        true
    }

    fn is_battery_powered(&self) -> bool {
        self.battery_powered.load(Ordering::Relaxed)
    }

    fn cpu_usage_percent(&self) -> f64 {
        *self.cpu_usage.lock()
    }

    async fn disk_free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(*self.disk_free.lock())
    }
}

/// What a [`MockStory`] does when executed.
#[derive(Debug, Clone)]
pub enum StoryBehavior {
    Succeed,
    Fail(String),
    TimeOut,
}

pub struct MockStory {
    name: String,
    duration: Duration,
    behavior: StoryBehavior,
    pub run_count: Arc<AtomicUsize>,
}

impl MockStory {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_behavior(name, StoryBehavior::Succeed)
    }

    pub fn with_behavior(name: &str, behavior: StoryBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            duration: Duration::from_millis(10),
            behavior,
            run_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Story for MockStory {
    fn name(&self) -> &str {
        &self.name
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    async fn run(&self, run: &mut Run) -> Result<()> {
        self.run_count.fetch_add(1, Ordering::Relaxed);
        match &self.behavior {
            StoryBehavior::Succeed => {
                run.browser().navigate_to("about:blank").await?;
                Ok(())
            }
            StoryBehavior::Fail(message) => bail!("{message}"),
            StoryBehavior::TimeOut => Err(TimeoutError {
                label: format!("story {}", self.name),
                seconds: self.duration.as_secs_f64(),
            }
            .into()),
        }
    }
}

/// Which lifecycle hook of a [`MockProbe`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailingHook {
    Setup,
    Start,
    Stop,
    TearDown,
}

/// Records its scope lifecycle as `"{probe}:{hook}"` entries into a shared
/// event log and emits one artifact file per run.
pub struct MockProbe {
    name: String,
    pub events: Arc<Mutex<Vec<String>>>,
    pub failing_hook: Option<FailingHook>,
    pub battery_only: bool,
    pub compatible: bool,
}

impl MockProbe {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Arc::new(Mutex::new(Vec::new())),
            failing_hook: None,
            battery_only: false,
            compatible: true,
        })
    }

    pub fn with_events(name: &str, events: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events,
            failing_hook: None,
            battery_only: false,
            compatible: true,
        })
    }

    pub fn failing(name: &str, hook: FailingHook, events: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events,
            failing_hook: Some(hook),
            battery_only: false,
            compatible: true,
        })
    }
}

#[async_trait]
impl Probe for MockProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn battery_only(&self) -> bool {
        self.battery_only
    }

    fn is_compatible(&self, _browser: &Browser) -> bool {
        self.compatible
    }

    fn result_file_name(&self) -> String {
        format!("{}.txt", self.name)
    }

    fn get_scope(&self, run: &mut Run) -> Result<Box<dyn ProbeScope>> {
        let result_path = run.local_result_path(&self.result_file_name())?;
        Ok(Box::new(MockProbeScope {
            ctx: ScopeContext::new(self.name.clone(), result_path),
            events: Arc::clone(&self.events),
            failing_hook: self.failing_hook,
        }))
    }

    async fn merge_repetitions(
        &self,
        group: &crate::groups::RepetitionsRunGroup,
    ) -> Result<ProbeResult> {
        self.events.lock().push(format!("{}:merge_repetitions", self.name));
        let mut merged = String::new();
        for run in group.runs() {
            if let Some(result) = run.results().get(&self.name) {
                for file in result.all_files() {
                    merged.push_str(&std::fs::read_to_string(file)?);
                }
            }
        }
        let path = group.local_result_path(&self.result_file_name())?;
        std::fs::write(&path, merged)?;
        ProbeResult::single_file(path)
    }

    async fn merge_stories(&self, group: &crate::groups::StoriesRunGroup) -> Result<ProbeResult> {
        self.events.lock().push(format!("{}:merge_stories", self.name));
        let mut merged = String::new();
        for repetitions_group in group.repetitions_groups() {
            if let Some(result) = repetitions_group.results().get(&self.name) {
                for file in result.all_files() {
                    merged.push_str(&std::fs::read_to_string(file)?);
                }
            }
        }
        let path = group.local_result_path(&self.result_file_name())?;
        std::fs::write(&path, merged)?;
        ProbeResult::single_file(path)
    }

    async fn merge_browsers(&self, group: &crate::groups::BrowsersRunGroup) -> Result<ProbeResult> {
        self.events.lock().push(format!("{}:merge_browsers", self.name));
        let mut merged = String::new();
        for story_group in group.story_groups() {
            if let Some(result) = story_group.results().get(&self.name) {
                for file in result.all_files() {
                    merged.push_str(&std::fs::read_to_string(file)?);
                }
            }
        }
        let path = group.local_result_path(&self.result_file_name())?;
        std::fs::write(&path, merged)?;
        ProbeResult::single_file(path)
    }
}

struct MockProbeScope {
    ctx: ScopeContext,
    events: Arc<Mutex<Vec<String>>>,
    failing_hook: Option<FailingHook>,
}

impl MockProbeScope {
    fn record(&self, hook: &str, failing: FailingHook) -> Result<()> {
        self.events
            .lock()
            .push(format!("{}:{hook}", self.ctx.probe_name));
        if self.failing_hook == Some(failing) {
            bail!("mock probe {} {hook} failure", self.ctx.probe_name);
        }
        Ok(())
    }
}

#[async_trait]
impl ProbeScope for MockProbeScope {
    fn probe_name(&self) -> &str {
        &self.ctx.probe_name
    }

    fn result_path(&self) -> &Path {
        &self.ctx.result_path
    }

    async fn setup(&mut self, _run: &mut Run) -> Result<()> {
        self.record("setup", FailingHook::Setup)
    }

    async fn start(&mut self, _run: &Run) -> Result<()> {
        self.record("start", FailingHook::Start)
    }

    async fn stop(&mut self, _run: &Run) -> Result<()> {
        self.record("stop", FailingHook::Stop)
    }

    async fn tear_down(&mut self, run: &Run) -> Result<ProbeResult> {
        self.record("tear_down", FailingHook::TearDown)?;
        std::fs::write(&self.ctx.result_path, format!("{}\n", run.name()))?;
        ProbeResult::single_file(self.ctx.result_path.clone())
    }
}
