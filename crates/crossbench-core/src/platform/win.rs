//! Windows host adapter. Best effort: the measurement-critical checks
//! (thermal, battery) degrade to permissive defaults where the query has
//! no cheap Windows equivalent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Platform, ProcessInfo, sh_stdout, which_binary};

pub struct WinPlatform;

impl WinPlatform {
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

impl Default for WinPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for WinPlatform {
    fn name(&self) -> &'static str {
        "win"
    }

    fn version(&self) -> String {
        Self::sh_stdout_sync("cmd", &["/c", "ver"])
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn device(&self) -> String {
        Self::sh_stdout_sync("wmic", &["computersystem", "get", "model", "/value"])
            .unwrap_or_default()
            .trim()
            .trim_start_matches("Model=")
            .to_string()
    }

    fn cpu(&self) -> String {
        let brand = Self::sh_stdout_sync("wmic", &["cpu", "get", "name", "/value"])
            .unwrap_or_default();
        let brand = brand.trim().trim_start_matches("Name=");
        format!("{brand} {} cores", num_cpus::get())
    }

    fn has_display(&self) -> bool {
        true
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        which_binary(name)
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        let Some(output) = Self::sh_stdout_sync("tasklist", &["/fo", "csv", "/nh"]) else {
            return Vec::new();
        };
        output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split("\",\"");
                let name = fields.next()?.trim_matches('"').to_string();
                let pid = fields.next()?.trim_matches('"').parse().ok()?;
                Some(ProcessInfo { pid, name })
            })
            .collect()
    }

    async fn foreground_process(&self) -> Option<ProcessInfo> {
        None
    }

    async fn relative_cpu_speed(&self) -> f64 {
        1.0
    }

    fn is_battery_powered(&self) -> bool {
        Self::sh_stdout_sync(
            "wmic",
            &["path", "Win32_Battery", "get", "BatteryStatus", "/value"],
        )
        .is_some_and(|output| output.contains("BatteryStatus=1"))
    }

    fn cpu_usage_percent(&self) -> f64 {
        Self::sh_stdout_sync("wmic", &["cpu", "get", "loadpercentage", "/value"])
            .and_then(|output| {
                output
                    .trim()
                    .trim_start_matches("LoadPercentage=")
                    .parse()
                    .ok()
            })
            .unwrap_or(0.0)
    }

    async fn disk_free_bytes(&self, path: &Path) -> Result<u64> {
        let root = path
            .ancestors()
            .last()
            .context("resolving drive root")?
            .to_string_lossy()
            .into_owned();
        let output = sh_stdout(
            "wmic",
            &[
                "logicaldisk",
                "where",
                &format!("DeviceID='{}'", root.trim_end_matches('\\')),
                "get",
                "FreeSpace",
                "/value",
            ],
        )
        .await?;
        output
            .trim()
            .trim_start_matches("FreeSpace=")
            .parse()
            .context("parsing FreeSpace")
    }
}
