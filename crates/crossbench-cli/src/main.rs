mod cli;
mod driver;
mod error;
mod setup;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use crossbench_core::benchmark::LoadingBenchmark;
use crossbench_core::env::HostEnvironmentConfig;
use crossbench_core::runner::{Runner, RunnerOptions};
use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const EXIT_INTERRUPTED: i32 = 2;
const EXIT_FAILED: i32 = 3;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        // Per-run runner.log files subscribe through the engine's log tee.
        .with(
            fmt::layer()
                .with_writer(crossbench_core::logging::tee_writer)
                .with_ansi(false)
                .with_target(false),
        )
        .init();
}

/// Shape of `--env-config` files: `{"env": {...}}`.
#[derive(Debug, Deserialize)]
struct EnvConfigFile {
    env: HostEnvironmentConfig,
}

fn load_env_config(path: Option<&PathBuf>) -> Result<HostEnvironmentConfig> {
    let Some(path) = path else {
        return Ok(HostEnvironmentConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading env config {}", path.display()))?;
    let file: EnvConfigFile = serde_json::from_str(&content)
        .with_context(|| format!("parsing env config {}", path.display()))?;
    Ok(file.env)
}

fn build_runner(cli: &Cli) -> Result<Runner> {
    let browsers = setup::build_browsers(&cli.browsers, cli.headless)?;
    let benchmark = LoadingBenchmark::from_urls(&cli.urls, Duration::from_secs_f64(cli.duration))?;
    let out_dir = match &cli.out_dir {
        Some(dir) => dir.clone(),
        None => {
            let cwd = std::env::current_dir().context("resolving current directory")?;
            Runner::default_out_dir(&cwd, &cli.label)
        }
    };
    Runner::new(
        out_dir,
        browsers,
        Box::new(benchmark),
        RunnerOptions {
            env_config: load_env_config(cli.env_config.as_ref())?,
            env_validation_mode: cli.env_validation,
            repetitions: cli.repeat,
            thread_mode: cli.parallel,
            throw: cli.throw,
            ..RunnerOptions::default()
        },
    )
}

async fn run() -> i32 {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut runner = match build_runner(&cli) {
        Ok(runner) => runner,
        Err(err) => {
            error::report(&err);
            return EXIT_FAILED;
        }
    };

    // Interrupting abandons in-flight runs; their teardown is best-effort
    // and temp dirs may be left behind.
    tokio::select! {
        result = runner.run(cli.dry_run) => match result {
            Ok(()) => 0,
            Err(err) => {
                error::report(&err);
                EXIT_FAILED
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            EXIT_INTERRUPTED
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
