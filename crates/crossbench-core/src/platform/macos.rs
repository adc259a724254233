//! macOS host adapter backed by `sysctl`, `pmset` and `lsappinfo`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{Platform, ProcessInfo, df_free_bytes, sh_stdout, which_binary};

pub struct MacOsPlatform;

impl MacOsPlatform {
    pub fn new() -> Self {
        Self
    }

    fn sh_stdout_sync(program: &str, args: &[&str]) -> Option<String> {
        let output = std::process::Command::new(program).args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for MacOsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MacOsPlatform {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn version(&self) -> String {
        Self::sh_stdout_sync("sw_vers", &["-productVersion"])
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn device(&self) -> String {
        Self::sh_stdout_sync("sysctl", &["-n", "hw.model"])
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn cpu(&self) -> String {
        let brand = Self::sh_stdout_sync("sysctl", &["-n", "machdep.cpu.brand_string"])
            .unwrap_or_default();
        format!("{} {} cores", brand.trim(), num_cpus::get())
    }

    fn has_display(&self) -> bool {
        true
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        which_binary(name)
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        let Some(output) = Self::sh_stdout_sync("ps", &["-axo", "pid=,comm="]) else {
            return Vec::new();
        };
        output
            .lines()
            .filter_map(|line| {
                let (pid, name) = line.trim().split_once(' ')?;
                Some(ProcessInfo {
                    pid: pid.trim().parse().ok()?,
                    name: name.trim().to_string(),
                })
            })
            .collect()
    }

    async fn foreground_process(&self) -> Option<ProcessInfo> {
        let front = sh_stdout("lsappinfo", &["front"]).await.ok()?;
        let front = front.trim();
        if front.is_empty() {
            return None;
        }
        let info = sh_stdout("lsappinfo", &["info", "-only", "pid", front])
            .await
            .ok()?;
        let (_, pid) = info.trim().split_once('=')?;
        let pid: u32 = pid.trim().trim_matches('"').parse().ok()?;
        let name = self
            .processes()
            .into_iter()
            .find(|p| p.pid == pid)
            .map(|p| p.name)
            .unwrap_or_default();
        Some(ProcessInfo { pid, name })
    }

    async fn relative_cpu_speed(&self) -> f64 {
        // `pmset -g therm` reports CPU_Speed_Limit in percent while
        // thermal pressure is active.
        let Ok(output) = sh_stdout("pmset", &["-g", "therm"]).await else {
            return 1.0;
        };
        let tokens: Vec<&str> = output.split_whitespace().collect();
        for (index, token) in tokens.iter().enumerate() {
            if *token == "CPU_Speed_Limit"
                && let Some(value) = tokens.get(index + 2)
                && let Ok(limit) = value.parse::<f64>()
            {
                return limit / 100.0;
            }
        }
        1.0
    }

    fn is_battery_powered(&self) -> bool {
        Self::sh_stdout_sync("pmset", &["-g", "batt"])
            .is_some_and(|output| output.contains("Battery Power"))
    }

    fn cpu_usage_percent(&self) -> f64 {
        let Some(output) = Self::sh_stdout_sync("sysctl", &["-n", "vm.loadavg"]) else {
            return 0.0;
        };
        // "{ 1.23 1.45 1.67 }"
        let load: f64 = output
            .trim()
            .trim_start_matches('{')
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        (load / num_cpus::get() as f64 * 100.0).min(100.0)
    }

    async fn disk_free_bytes(&self, path: &Path) -> Result<u64> {
        df_free_bytes(path).await
    }

    async fn extra_system_details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        if let Ok(output) = sh_stdout("system_profiler", &["SPHardwareDataType"]).await {
            details.insert("system_profiler".into(), json!(output));
        }
        if let Ok(output) = sh_stdout("sysctl", &["machdep.cpu"]).await {
            details.insert("sysctl_machdep_cpu".into(), json!(output));
        }
        if let Ok(output) = sh_stdout("sysctl", &["hw"]).await {
            details.insert("sysctl_hw".into(), json!(output));
        }
        details
    }
}
