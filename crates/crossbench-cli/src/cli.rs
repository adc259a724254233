use std::path::PathBuf;

use clap::Parser;
use crossbench_core::env::ValidationMode;
use crossbench_core::runner::ThreadMode;

fn parse_thread_mode(value: &str) -> Result<ThreadMode, String> {
    value.parse()
}

fn parse_validation_mode(value: &str) -> Result<ValidationMode, String> {
    value.parse()
}

/// Cross-browser page-load benchmark runner.
#[derive(Debug, Parser)]
#[command(name = "crossbench", version, about)]
pub struct Cli {
    /// URLs to benchmark, one page-load story each.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Number of times each story is repeated.
    #[arg(long, short = 'r', default_value_t = 1)]
    pub repeat: usize,

    /// How runs are partitioned into parallel workers. `browser` and
    /// `run` maximize parallelism but interfere with measurements.
    #[arg(long, default_value = "none", value_parser = parse_thread_mode)]
    pub parallel: ThreadMode,

    /// Results directory; must not exist yet.
    #[arg(long, short = 'o', conflicts_with = "label")]
    pub out_dir: Option<PathBuf>,

    /// Name suffix for the default results directory.
    #[arg(long, default_value = "loading")]
    pub label: String,

    /// Browser binary path or family name (chrome, chromium, firefox).
    /// Repeat for multiple variants.
    #[arg(long = "browser", default_value = "chrome")]
    pub browsers: Vec<String>,

    /// Seconds each page stays loaded.
    #[arg(long, default_value_t = 10.0)]
    pub duration: f64,

    /// JSON file with an `env` object of host preconditions.
    #[arg(long)]
    pub env_config: Option<PathBuf>,

    /// How violated host preconditions are handled.
    #[arg(long, default_value = "throw", value_parser = parse_validation_mode)]
    pub env_validation: ValidationMode,

    /// Create the output structure without launching a browser.
    #[arg(long)]
    pub dry_run: bool,

    /// Fail fast on the first captured error.
    #[arg(long)]
    pub throw: bool,

    /// Run browsers headless.
    #[arg(long)]
    pub headless: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["crossbench", "https://example.com"]);
        assert_eq!(cli.urls, ["https://example.com"]);
        assert_eq!(cli.repeat, 1);
        assert_eq!(cli.parallel, ThreadMode::Sequential);
        assert_eq!(cli.env_validation, ValidationMode::Throw);
        assert!(!cli.dry_run);
    }

    #[test]
    fn parses_full_invocation() {
        let cli = Cli::parse_from([
            "crossbench",
            "-r",
            "3",
            "--parallel",
            "browser",
            "--browser",
            "chromium",
            "--browser",
            "/opt/bin/chrome-dev",
            "--env-validation",
            "skip",
            "--headless",
            "-vv",
            "https://example.com",
        ]);
        assert_eq!(cli.repeat, 3);
        assert_eq!(cli.parallel, ThreadMode::Browser);
        assert_eq!(cli.browsers, ["chromium", "/opt/bin/chrome-dev"]);
        assert_eq!(cli.env_validation, ValidationMode::Skip);
        assert!(cli.headless);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn out_dir_conflicts_with_label() {
        let result = Cli::try_parse_from([
            "crossbench",
            "-o",
            "/tmp/results",
            "--label",
            "mine",
            "https://example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn urls_are_required() {
        assert!(Cli::try_parse_from(["crossbench"]).is_err());
    }
}
