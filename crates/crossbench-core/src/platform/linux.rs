//! Linux host adapter backed by procfs and sysfs.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{Platform, ProcessInfo, cat, df_free_bytes, sh_stdout, which_binary};

pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }

    fn cpu_freq_ratio() -> Option<f64> {
        let cur = cat("/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq");
        let max = cat("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq");
        let cur: f64 = cur.trim().parse().ok()?;
        let max: f64 = max.trim().parse().ok()?;
        if max <= 0.0 {
            return None;
        }
        Some(cur / max)
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn version(&self) -> String {
        let release = cat("/proc/sys/kernel/osrelease");
        release.trim().to_string()
    }

    fn device(&self) -> String {
        let vendor = cat("/sys/devices/virtual/dmi/id/sys_vendor");
        let product = cat("/sys/devices/virtual/dmi/id/product_name");
        format!("{} {}", vendor.trim(), product.trim())
            .trim()
            .to_string()
    }

    fn cpu(&self) -> String {
        let mut model = String::new();
        for line in cat("/proc/cpuinfo").lines() {
            if let Some((_, value)) = line.split_once(':')
                && line.starts_with("model name")
            {
                model = value.trim().to_string();
                break;
            }
        }
        format!("{model} {} cores", num_cpus::get())
    }

    fn has_display(&self) -> bool {
        std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some()
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        which_binary(name)
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        let mut processes = Vec::new();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return processes;
        };
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let comm = cat(&format!("/proc/{pid}/comm"));
            if comm.is_empty() {
                continue;
            }
            processes.push(ProcessInfo {
                pid,
                name: comm.trim().to_string(),
            });
        }
        processes
    }

    async fn foreground_process(&self) -> Option<ProcessInfo> {
        // Only resolvable under X11 with xdotool installed.
        self.which("xdotool")?;
        let pid = sh_stdout("xdotool", &["getactivewindow", "getwindowpid"])
            .await
            .ok()?;
        let pid: u32 = pid.trim().parse().ok()?;
        let name = cat(&format!("/proc/{pid}/comm")).trim().to_string();
        Some(ProcessInfo { pid, name })
    }

    async fn relative_cpu_speed(&self) -> f64 {
        Self::cpu_freq_ratio().unwrap_or(1.0)
    }

    async fn is_thermal_throttled(&self) -> bool {
        // Below-max frequency alone is normal power management; only treat
        // a heavily clamped clock as throttling.
        Self::cpu_freq_ratio().is_some_and(|ratio| ratio < 0.8)
    }

    fn is_battery_powered(&self) -> bool {
        let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") else {
            return false;
        };
        for entry in entries.flatten() {
            let status = cat(&format!("{}/status", entry.path().display()));
            if status.trim() == "Discharging" {
                return true;
            }
        }
        false
    }

    fn cpu_usage_percent(&self) -> f64 {
        let loadavg = cat("/proc/loadavg");
        let load: f64 = loadavg
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
        for info_bin in ["lscpu", "inxi"] {
            if self.which(info_bin).is_some()
                && let Ok(output) = sh_stdout(info_bin, &[]).await
            {
                details.insert(info_bin.to_string(), json!(output));
            }
        }
        details
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_table_contains_self() {
        let platform = LinuxPlatform::new();
        let pid = std::process::id();
        assert!(platform.processes().iter().any(|p| p.pid == pid));
    }

    #[tokio::test]
    async fn disk_free_is_positive() {
        let platform = LinuxPlatform::new();
        let free = platform.disk_free_bytes(Path::new("/")).await.unwrap();
        assert!(free > 0);
    }

    #[test]
    fn cpu_usage_is_bounded() {
        let platform = LinuxPlatform::new();
        let usage = platform.cpu_usage_percent();
        assert!((0.0..=100.0).contains(&usage));
    }
}
