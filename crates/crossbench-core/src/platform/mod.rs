//! Host platform capability bag.
//!
//! The engine never branches on the operating system; everything
//! OS-specific goes through the [`Platform`] trait. The concrete
//! implementation is selected once at startup via [`default_platform`].

mod inhibitor;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod win;

pub use inhibitor::SleepInhibitor;
#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
#[cfg(target_os = "macos")]
pub use macos::MacOsPlatform;
#[cfg(target_os = "windows")]
pub use win::WinPlatform;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Short platform identifier: `linux`, `macos`, `win`.
    fn name(&self) -> &'static str;

    fn version(&self) -> String;

    /// Hardware model string, best effort.
    fn device(&self) -> String;

    fn cpu(&self) -> String;

    fn is_remote(&self) -> bool {
        false
    }

    fn has_display(&self) -> bool;

    /// Resolves a binary on the search path.
    fn which(&self, name: &str) -> Option<PathBuf>;

    /// Runs a command and returns its stdout; non-zero exit is an error.
    async fn sh_stdout(&self, program: &str, args: &[&str]) -> Result<String> {
        sh_stdout(program, args).await
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn processes(&self) -> Vec<ProcessInfo>;

    /// The process currently owning the foreground / focused window, if
    /// the platform can tell.
    async fn foreground_process(&self) -> Option<ProcessInfo>;

    /// Current CPU frequency relative to the maximum; `< 1.0` while the
    /// machine is throttling.
    async fn relative_cpu_speed(&self) -> f64;

    async fn is_thermal_throttled(&self) -> bool {
        self.relative_cpu_speed().await < 1.0
    }

    fn is_battery_powered(&self) -> bool;

    /// Rough current CPU usage in percent across all cores.
    fn cpu_usage_percent(&self) -> f64;

    async fn disk_free_bytes(&self, path: &Path) -> Result<u64>;

    /// Extra OS-specific details merged into `system_details.json`.
    async fn extra_system_details(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Creates a temporary directory that outlives its handle; the caller
    /// is responsible for removal.
    fn mkdtemp(&self, prefix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(dir.keep())
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating directory {}", path.display()))
    }

    fn rm_dir(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("removing directory {}", path.display()))
    }
}

/// Full system snapshot written once per invocation.
pub async fn system_details(platform: &dyn Platform) -> Value {
    let mut details = Map::new();
    details.insert("name".into(), json!(platform.name()));
    details.insert("version".into(), json!(platform.version()));
    details.insert("device".into(), json!(platform.device()));
    details.insert("cpu".into(), json!(platform.cpu()));
    details.insert("cores".into(), json!(num_cpus::get()));
    for (key, value) in platform.extra_system_details().await {
        details.insert(key, value);
    }
    Value::Object(details)
}

/// Selects the platform implementation for the current OS.
pub fn default_platform() -> Arc<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxPlatform::new())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacOsPlatform::new())
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(WinPlatform::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        compile_error!("unsupported host platform");
    }
}

pub(crate) async fn sh_stdout(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "sh");
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("spawning {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn which_binary(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Reads a small pseudo-file, returning an empty string when missing.
pub(crate) fn cat(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// POSIX free-space query via `df`; shared by the unix adapters.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) async fn df_free_bytes(path: &Path) -> Result<u64> {
    let path = path.to_string_lossy().into_owned();
    let output = sh_stdout("df", &["-kP", &path])
        .await
        .context("querying free disk space")?;
    let line = output.lines().nth(1).context("unexpected df output")?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        bail!("unexpected df output: {line}");
    }
    let kib: u64 = fields[3].parse().context("parsing df free column")?;
    Ok(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sh_stdout_captures_output() {
        let out = sh_stdout("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn sh_stdout_fails_on_nonzero_exit() {
        assert!(sh_stdout("false", &[]).await.is_err());
    }

    #[tokio::test]
    async fn system_details_has_base_keys() {
        let platform = default_platform();
        let details = system_details(platform.as_ref()).await;
        assert!(details["name"].is_string());
        assert!(details["cpu"].is_string());
        assert!(details["cores"].as_u64().unwrap() > 0);
    }

    #[test]
    fn mkdtemp_outlives_handle() {
        let platform = default_platform();
        let dir = platform.mkdtemp("cb_test").unwrap();
        assert!(dir.is_dir());
        platform.rm_dir(&dir).unwrap();
        assert!(!dir.exists());
    }
}
