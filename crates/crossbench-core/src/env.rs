//! Host environment validation gate.
//!
//! Benchmarks are only as good as the machine they run on: a throttled
//! CPU, a busy host or a browser hidden behind another window all skew
//! measurements. The validator checks the configured preconditions before
//! the first run and routes every violation through the validation-mode
//! policy.

use std::io::{BufRead, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ConfigConflict, ValidationError};
use crate::runner::Runner;

/// How environment warnings are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Fail on the first violated precondition.
    #[default]
    Throw,
    /// Ask interactively whether to continue.
    Prompt,
    /// Log and continue.
    Warn,
    /// No checks at all.
    Skip,
}

impl std::str::FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "throw" => Ok(Self::Throw),
            "prompt" => Ok(Self::Prompt),
            "warn" => Ok(Self::Warn),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown validation mode: {other}")),
        }
    }
}

/// Sparse precondition record. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostEnvironmentConfig {
    /// Demand the host runs on battery (true) or mains (false).
    pub power_use_battery: Option<bool>,
    /// Demand all browsers are headless (true) or headful (false).
    pub browser_is_headless: Option<bool>,
    /// Lower bound on the relative CPU frequency (1.0 = full speed).
    pub cpu_min_relative_speed: Option<f64>,
    /// Upper bound on current CPU usage in percent.
    pub cpu_max_usage_percent: Option<f64>,
    /// Demand at least one user-attached probe.
    pub require_probes: Option<bool>,
    /// Minimum free bytes on the output directory's filesystem.
    pub disk_min_free_bytes: Option<u64>,
    /// Binaries that must be resolvable on the search path.
    pub installed_binaries: Vec<String>,
}

impl HostEnvironmentConfig {
    /// Combines two configs. Disagreeing booleans conflict; numeric bounds
    /// keep the stricter side (max of lower bounds, min of upper bounds).
    pub fn merge(&self, other: &Self) -> Result<Self, ConfigConflict> {
        fn merge_bool(
            field: &'static str,
            left: Option<bool>,
            right: Option<bool>,
        ) -> Result<Option<bool>, ConfigConflict> {
            match (left, right) {
                (Some(a), Some(b)) if a != b => Err(ConfigConflict {
                    field,
                    left: a.to_string(),
                    right: b.to_string(),
                }),
                (a, b) => Ok(a.or(b)),
            }
        }
        fn stricter<T: PartialOrd + Copy>(
            left: Option<T>,
            right: Option<T>,
            pick: fn(T, T) -> T,
        ) -> Option<T> {
            match (left, right) {
                (Some(a), Some(b)) => Some(pick(a, b)),
                (a, b) => a.or(b),
            }
        }
        let mut installed_binaries = self.installed_binaries.clone();
        for binary in &other.installed_binaries {
            if !installed_binaries.contains(binary) {
                installed_binaries.push(binary.clone());
            }
        }
        Ok(Self {
            power_use_battery: merge_bool(
                "power_use_battery",
                self.power_use_battery,
                other.power_use_battery,
            )?,
            browser_is_headless: merge_bool(
                "browser_is_headless",
                self.browser_is_headless,
                other.browser_is_headless,
            )?,
            cpu_min_relative_speed: stricter(
                self.cpu_min_relative_speed,
                other.cpu_min_relative_speed,
                f64::max,
            ),
            cpu_max_usage_percent: stricter(
                self.cpu_max_usage_percent,
                other.cpu_max_usage_percent,
                f64::min,
            ),
            require_probes: merge_bool("require_probes", self.require_probes, other.require_probes)?,
            disk_min_free_bytes: stricter(
                self.disk_min_free_bytes,
                other.disk_min_free_bytes,
                u64::max,
            ),
            installed_binaries,
        })
    }
}

/// Number of sibling result directories after which we assume the user
/// forgot to clean up.
const OUT_DIR_SIBLINGS_WARN: usize = 30;
const OUT_DIR_SIBLINGS_ERROR: usize = 100;

type PromptHandler = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct HostEnvironment {
    config: HostEnvironmentConfig,
    mode: ValidationMode,
    prompt_handler: Option<PromptHandler>,
}

impl HostEnvironment {
    pub fn new(config: HostEnvironmentConfig, mode: ValidationMode) -> Self {
        Self {
            config,
            mode,
            prompt_handler: None,
        }
    }

    /// Replaces the interactive stdin prompt, for embedding and tests.
    pub fn with_prompt_handler(mut self, handler: PromptHandler) -> Self {
        self.prompt_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &HostEnvironmentConfig {
        &self.config
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Routes one violated precondition through the policy.
    pub fn handle_warning(&self, message: &str) -> Result<(), ValidationError> {
        match self.mode {
            ValidationMode::Skip => Ok(()),
            ValidationMode::Warn => {
                warn!("{message}");
                Ok(())
            }
            ValidationMode::Throw => Err(ValidationError(message.to_string())),
            ValidationMode::Prompt => {
                if self.prompt(message) {
                    Ok(())
                } else {
                    Err(ValidationError(message.to_string()))
                }
            }
        }
    }

    fn prompt(&self, message: &str) -> bool {
        if let Some(handler) = &self.prompt_handler {
            return handler(message);
        }
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{message}\nContinue anyway? [y/N] ");
        let _ = stdout.flush();
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }

    /// Runs every configured check. In `Skip` mode this is a no-op.
    pub async fn validate(&self, runner: &Runner) -> Result<(), ValidationError> {
        if self.mode == ValidationMode::Skip {
            return Ok(());
        }
        debug!("validating host environment");
        self.check_power(runner)?;
        self.check_headless(runner)?;
        self.check_cpu_speed(runner).await?;
        self.check_cpu_usage(runner)?;
        self.check_probes(runner)?;
        self.check_disk_space(runner).await?;
        self.check_installed_binaries(runner)?;
        self.check_results_dir(runner)?;
        Ok(())
    }

    fn check_power(&self, runner: &Runner) -> Result<(), ValidationError> {
        let Some(use_battery) = self.config.power_use_battery else {
            return Ok(());
        };
        for probe in runner.probes() {
            if probe.battery_only() && !use_battery {
                self.handle_warning(&format!(
                    "Probe '{}' can only run on battery power, \
                     but the environment demands mains power",
                    probe.name()
                ))?;
            }
        }
        let on_battery = runner.platform().is_battery_powered();
        if on_battery != use_battery {
            let expected = if use_battery { "battery" } else { "mains" };
            self.handle_warning(&format!(
                "Expected host on {expected} power, but is_battery_powered={on_battery}"
            ))?;
        }
        Ok(())
    }

    fn check_headless(&self, runner: &Runner) -> Result<(), ValidationError> {
        let Some(is_headless) = self.config.browser_is_headless else {
            return Ok(());
        };
        if !is_headless && !runner.platform().has_display() {
            // No display means the browser cannot be headful anyway.
            debug!("no display present, skipping headful requirement");
            return Ok(());
        }
        for browser in runner.browsers() {
            if browser.is_headless() != is_headless {
                self.handle_warning(&format!(
                    "Browser {} has is_headless={}, but the environment demands {}",
                    browser.unique_name(),
                    browser.is_headless(),
                    is_headless
                ))?;
            }
        }
        Ok(())
    }

    async fn check_cpu_speed(&self, runner: &Runner) -> Result<(), ValidationError> {
        let Some(min_speed) = self.config.cpu_min_relative_speed else {
            return Ok(());
        };
        let speed = runner.platform().relative_cpu_speed().await;
        if speed < min_speed {
            self.handle_warning(&format!(
                "CPU is throttled: relative speed {speed:.2} below required {min_speed:.2}"
            ))?;
        }
        Ok(())
    }

    fn check_cpu_usage(&self, runner: &Runner) -> Result<(), ValidationError> {
        let Some(max_usage) = self.config.cpu_max_usage_percent else {
            return Ok(());
        };
        let usage = runner.platform().cpu_usage_percent();
        if usage >= max_usage {
            self.handle_warning(&format!(
                "CPU usage {usage:.0}% exceeds the allowed {max_usage:.0}%"
            ))?;
        }
        Ok(())
    }

    fn check_probes(&self, runner: &Runner) -> Result<(), ValidationError> {
        if self.config.require_probes != Some(true) {
            return Ok(());
        }
        let has_user_probes = runner
            .probes()
            .iter()
            .any(|probe| probe.is_general_purpose());
        if !has_user_probes {
            self.handle_warning("No probes attached, results will be mostly empty")?;
        }
        Ok(())
    }

    async fn check_disk_space(&self, runner: &Runner) -> Result<(), ValidationError> {
        let Some(min_free) = self.config.disk_min_free_bytes else {
            return Ok(());
        };
        match runner.platform().disk_free_bytes(runner.out_dir()).await {
            Ok(free) if free < min_free => self.handle_warning(&format!(
                "Only {free} bytes free on the output filesystem, need {min_free}"
            )),
            Ok(_) => Ok(()),
            Err(error) => self.handle_warning(&format!("Could not query free disk space: {error}")),
        }
    }

    fn check_installed_binaries(&self, runner: &Runner) -> Result<(), ValidationError> {
        let missing: Vec<&str> = self
            .config
            .installed_binaries
            .iter()
            .filter(|name| runner.platform().which(name).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            self.handle_warning(&format!(
                "Required binaries not installed: {}",
                missing.join(", ")
            ))?;
        }
        Ok(())
    }

    fn check_results_dir(&self, runner: &Runner) -> Result<(), ValidationError> {
        let Some(parent) = runner.out_dir().parent() else {
            return Ok(());
        };
        let Ok(entries) = std::fs::read_dir(parent) else {
            return Ok(());
        };
        let siblings = entries.count();
        if siblings >= OUT_DIR_SIBLINGS_ERROR {
            self.handle_warning(&format!(
                "{siblings} result directories in {}, clean up before benchmarking",
                parent.display()
            ))?;
        } else if siblings >= OUT_DIR_SIBLINGS_WARN {
            warn!(
                "{siblings} result directories in {}, consider cleaning up",
                parent.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_disjoint_fields_is_commutative() {
        let a = HostEnvironmentConfig {
            power_use_battery: Some(true),
            ..Default::default()
        };
        let b = HostEnvironmentConfig {
            cpu_max_usage_percent: Some(50.0),
            ..Default::default()
        };
        let ab = a.merge(&b).unwrap();
        let ba = b.merge(&a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.power_use_battery, Some(true));
        assert_eq!(ab.cpu_max_usage_percent, Some(50.0));
    }

    #[test]
    fn merge_keeps_stricter_bounds() {
        let a = HostEnvironmentConfig {
            cpu_min_relative_speed: Some(0.5),
            cpu_max_usage_percent: Some(80.0),
            disk_min_free_bytes: Some(1 << 20),
            ..Default::default()
        };
        let b = HostEnvironmentConfig {
            cpu_min_relative_speed: Some(0.9),
            cpu_max_usage_percent: Some(50.0),
            disk_min_free_bytes: Some(1 << 10),
            ..Default::default()
        };
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.cpu_min_relative_speed, Some(0.9));
        assert_eq!(merged.cpu_max_usage_percent, Some(50.0));
        assert_eq!(merged.disk_min_free_bytes, Some(1 << 20));
    }

    #[test]
    fn merge_conflicting_bools_fails() {
        let a = HostEnvironmentConfig {
            browser_is_headless: Some(true),
            ..Default::default()
        };
        let b = HostEnvironmentConfig {
            browser_is_headless: Some(false),
            ..Default::default()
        };
        let error = a.merge(&b).unwrap_err();
        assert_eq!(error.field, "browser_is_headless");
    }

    #[test]
    fn merge_unions_binaries() {
        let a = HostEnvironmentConfig {
            installed_binaries: vec!["gsutil".into()],
            ..Default::default()
        };
        let b = HostEnvironmentConfig {
            installed_binaries: vec!["ffmpeg".into(), "gsutil".into()],
            ..Default::default()
        };
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.installed_binaries, ["gsutil", "ffmpeg"]);
    }

    #[test]
    fn handle_warning_skip_mode() {
        let env = HostEnvironment::new(HostEnvironmentConfig::default(), ValidationMode::Skip);
        env.handle_warning("anything").unwrap();
    }

    #[test]
    fn handle_warning_warn_mode() {
        let env = HostEnvironment::new(HostEnvironmentConfig::default(), ValidationMode::Warn);
        env.handle_warning("custom env check warning").unwrap();
    }

    #[test]
    fn handle_warning_throw_mode() {
        let env = HostEnvironment::new(HostEnvironmentConfig::default(), ValidationMode::Throw);
        let error = env.handle_warning("custom env check warning").unwrap_err();
        assert!(error.to_string().contains("custom env check warning"));
    }

    #[test]
    fn handle_warning_prompt_mode() {
        let env = HostEnvironment::new(HostEnvironmentConfig::default(), ValidationMode::Prompt)
            .with_prompt_handler(Arc::new(|_| true));
        env.handle_warning("warning").unwrap();

        let env = HostEnvironment::new(HostEnvironmentConfig::default(), ValidationMode::Prompt)
            .with_prompt_handler(Arc::new(|_| false));
        assert!(env.handle_warning("warning").is_err());
    }

    #[test]
    fn config_deserializes_from_env_file_shape() {
        let config: HostEnvironmentConfig = serde_json::from_str(
            r#"{
                "power_use_battery": false,
                "cpu_max_usage_percent": 75.0,
                "installed_binaries": ["ffmpeg"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.power_use_battery, Some(false));
        assert_eq!(config.cpu_max_usage_percent, Some(75.0));
        assert!(config.browser_is_headless.is_none());
    }

    #[test]
    fn unknown_config_fields_are_rejected() {
        let result: Result<HostEnvironmentConfig, _> =
            serde_json::from_str(r#"{"no_such_setting": 1}"#);
        assert!(result.is_err());
    }
}
