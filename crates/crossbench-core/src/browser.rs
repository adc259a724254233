//! Browser session state machine.
//!
//! One [`Browser`] wraps one binary plus one flag set and is shared by all
//! runs of that variant; the actual automation (WebDriver, AppleScript,
//! plain process control) lives behind the [`BrowserDriver`] seam so the
//! engine never talks to a protocol directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::errors::BrowserError;
use crate::flags::{ChromeFlags, Flags, JsFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub is_headless: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1500,
            height: 1000,
            is_headless: false,
        }
    }
}

impl Viewport {
    pub fn headless() -> Self {
        Self {
            is_headless: true,
            ..Self::default()
        }
    }
}

/// Static identity and configuration of one browser variant.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Browser family: `chrome`, `chromium`, `firefox`, `safari`, ...
    pub browser_type: String,
    /// User-chosen label distinguishing variants of the same binary.
    pub label: String,
    pub path: PathBuf,
    pub viewport: Viewport,
    pub cache_dir: Option<PathBuf>,
}

/// Everything a driver needs to bring up one browser session.
pub struct StartRequest<'a> {
    pub binary: &'a Path,
    pub args: Vec<String>,
    pub viewport: Viewport,
    pub log_file: Option<&'a Path>,
}

/// Automation adapter contract. Implementations own the underlying
/// session (process handle, driver connection) behind `&self`.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Probes the binary's version string without starting a session.
    async fn binary_version(&self, binary: &Path) -> Result<String>;

    /// Starts a session and returns the browser process id.
    async fn start(&self, request: StartRequest<'_>) -> Result<u32>;

    async fn js(&self, code: &str, timeout: Duration, args: &[Value]) -> Result<Value>;

    async fn navigate_to(&self, url: &str) -> Result<()>;

    /// Graceful shutdown.
    async fn quit(&self) -> Result<()>;

    /// Hard kill; must not fail on an already-dead session.
    async fn force_quit(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    Running,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Ready => "ready",
            Phase::Running => "running",
        }
    }
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    version: String,
    pid: Option<u32>,
    log_file: Option<PathBuf>,
}

pub struct Browser {
    config: BrowserConfig,
    driver: Box<dyn BrowserDriver>,
    flags: Mutex<ChromeFlags>,
    state: Mutex<SessionState>,
    attached_probes: Mutex<Vec<String>>,
}

impl Browser {
    pub fn new(config: BrowserConfig, flags: ChromeFlags, driver: Box<dyn BrowserDriver>) -> Self {
        Self {
            config,
            driver,
            flags: Mutex::new(flags),
            state: Mutex::new(SessionState {
                phase: Phase::Created,
                version: String::new(),
                pid: None,
                log_file: None,
            }),
            attached_probes: Mutex::new(Vec::new()),
        }
    }

    pub fn browser_type(&self) -> &str {
        &self.config.browser_type
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn viewport(&self) -> Viewport {
        self.config.viewport
    }

    pub fn is_headless(&self) -> bool {
        self.config.viewport.is_headless
    }

    pub fn version(&self) -> String {
        self.state.lock().version.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().phase == Phase::Running
    }

    /// Identity used for output directories; distinct across one runner.
    pub fn unique_name(&self) -> String {
        let version = self.version();
        let version = if version.is_empty() {
            "unknown"
        } else {
            version.as_str()
        };
        sanitize_path_component(&format!(
            "{}_{}_{}",
            self.config.browser_type, version, self.config.label
        ))
    }

    pub fn flags(&self) -> parking_lot::MutexGuard<'_, ChromeFlags> {
        self.flags.lock()
    }

    pub fn set_log_file(&self, path: &Path) {
        self.state.lock().log_file = Some(path.to_path_buf());
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.state.lock().log_file.clone()
    }

    pub fn attach_probe(&self, probe_name: &str) {
        self.attached_probes.lock().push(probe_name.to_string());
    }

    pub fn attached_probes(&self) -> Vec<String> {
        self.attached_probes.lock().clone()
    }

    fn advance(&self, expected: Phase, next: Phase) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        if state.phase != expected {
            return Err(BrowserError::InvalidState {
                expected: expected.name().to_string(),
                actual: state.phase.name().to_string(),
            });
        }
        state.phase = next;
        Ok(())
    }

    /// Resolves the binary and probes its version. Must run before any
    /// session is started; browsers with unresolvable binaries fail here
    /// instead of mid-benchmark.
    pub async fn setup_binary(&self) -> Result<()> {
        if !self.config.path.exists() {
            return Err(
                BrowserError::BinaryNotFound(self.config.path.display().to_string()).into(),
            );
        }
        let version = self
            .driver
            .binary_version(&self.config.path)
            .await
            .with_context(|| format!("probing version of {}", self.config.path.display()))?;
        let mut state = self.state.lock();
        state.version = version.trim().to_string();
        drop(state);
        self.advance(Phase::Created, Phase::Ready)?;
        info!(
            browser = %self.unique_name(),
            path = %self.config.path.display(),
            "browser binary ready"
        );
        Ok(())
    }

    /// The full argv for one session: variant flags plus the run's extra
    /// flags, with standard geometry/profile switches folded in.
    pub fn session_args(&self, extra_flags: &Flags, extra_js_flags: &JsFlags) -> Result<Vec<String>> {
        let mut flags = self.flags.lock().clone();
        flags.update(extra_flags)?;
        flags.js_flags_mut().update(extra_js_flags)?;
        if self.config.viewport.is_headless {
            flags.set("--headless")?;
        }
        flags.set_value(
            "--window-size",
            Some(&format!(
                "{},{}",
                self.config.viewport.width, self.config.viewport.height
            )),
        )?;
        if let Some(cache_dir) = &self.config.cache_dir {
            flags.set_value("--user-data-dir", Some(&cache_dir.to_string_lossy()))?;
        }
        Ok(flags.to_list())
    }

    /// Brings up a session for one run.
    pub async fn setup(&self, extra_flags: &Flags, extra_js_flags: &JsFlags) -> Result<()> {
        let args = self.session_args(extra_flags, extra_js_flags)?;
        self.advance(Phase::Ready, Phase::Running)?;
        let log_file = self.log_file();
        debug!(browser = %self.unique_name(), ?args, "starting browser");
        let started = self
            .driver
            .start(StartRequest {
                binary: &self.config.path,
                args,
                viewport: self.config.viewport,
                log_file: log_file.as_deref(),
            })
            .await;
        match started {
            Ok(pid) => {
                self.state.lock().pid = Some(pid);
                Ok(())
            }
            Err(error) => {
                // Roll back so a later run can retry the variant.
                self.state.lock().phase = Phase::Ready;
                Err(error)
            }
        }
    }

    pub async fn js(&self, code: &str, timeout: Duration, args: &[Value]) -> Result<Value> {
        self.expect_running()?;
        self.driver.js(code, timeout, args).await
    }

    pub async fn navigate_to(&self, url: &str) -> Result<()> {
        self.expect_running()?;
        self.driver.navigate_to(url).await
    }

    pub async fn quit(&self) -> Result<()> {
        self.advance(Phase::Running, Phase::Ready)?;
        let result = self.driver.quit().await;
        self.state.lock().pid = None;
        result
    }

    /// Hard shutdown for half-set-up sessions. Never fails.
    pub async fn force_quit(&self) {
        if let Err(error) = self.driver.force_quit().await {
            warn!(browser = %self.unique_name(), %error, "force quit failed");
        }
        let mut state = self.state.lock();
        state.pid = None;
        if state.phase == Phase::Running {
            state.phase = Phase::Ready;
        }
    }

    fn expect_running(&self) -> Result<(), BrowserError> {
        if !self.is_running() {
            return Err(BrowserError::NotRunning {
                name: self.unique_name(),
            });
        }
        Ok(())
    }

    pub fn details_json(&self) -> Value {
        let flags = self.flags.lock();
        json!({
            "label": self.config.label,
            "browser": self.config.browser_type,
            "version": self.version(),
            "binary": self.config.path.to_string_lossy(),
            "flags": flags.to_list(),
            "js_flags": flags.js_flags().to_list(),
            "log": self.log_file().map(|p| p.to_string_lossy().into_owned()),
        })
    }
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("type", &self.config.browser_type)
            .field("label", &self.config.label)
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

fn sanitize_path_component(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    fn test_browser(label: &str) -> Browser {
        let dir = std::env::temp_dir();
        let binary = dir.join("cb-mock-browser");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        Browser::new(
            BrowserConfig {
                browser_type: "chrome".to_string(),
                label: label.to_string(),
                path: binary,
                viewport: Viewport::headless(),
                cache_dir: None,
            },
            ChromeFlags::new(),
            Box::new(MockDriver::default()),
        )
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let browser = test_browser("stable");
        assert!(!browser.is_running());
        browser.setup_binary().await.unwrap();
        assert_eq!(browser.unique_name(), "chrome_100.0.0.0_stable");

        browser.setup(&Flags::new(), &JsFlags::new()).await.unwrap();
        assert!(browser.is_running());
        assert!(browser.pid().is_some());

        browser.quit().await.unwrap();
        assert!(!browser.is_running());
        assert!(browser.pid().is_none());
    }

    #[tokio::test]
    async fn setup_requires_binary_setup() {
        let browser = test_browser("stable");
        assert!(browser.setup(&Flags::new(), &JsFlags::new()).await.is_err());
    }

    #[tokio::test]
    async fn quit_requires_running_session() {
        let browser = test_browser("stable");
        browser.setup_binary().await.unwrap();
        assert!(browser.quit().await.is_err());
    }

    #[tokio::test]
    async fn session_args_merge_run_flags() {
        let browser = test_browser("stable");
        let mut extra = Flags::new();
        extra.set_value("--enable-benchmarking", None).unwrap();
        let args = browser.session_args(&extra, &JsFlags::new()).unwrap();
        assert!(args.contains(&"--enable-benchmarking".to_string()));
        assert!(args.contains(&"--headless".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--window-size=")));
    }

    #[tokio::test]
    async fn js_fails_when_not_running() {
        let browser = test_browser("stable");
        browser.setup_binary().await.unwrap();
        let result = browser
            .js("return 1", Duration::from_secs(1), &[])
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn unique_name_is_path_safe() {
        let browser = test_browser("Dev Channel/β");
        assert!(!browser.unique_name().contains('/'));
        assert!(!browser.unique_name().contains(' '));
    }
}
