//! Plain-process automation adapter.
//!
//! Starts the browser binary directly and navigates by re-invoking it
//! (which opens a tab in the running session). Good enough for page-load
//! benchmarking; richer automation (JS execution) needs a WebDriver-based
//! adapter and is reported as unsupported here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use crossbench_core::browser::{BrowserDriver, StartRequest};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Default)]
pub struct ProcessDriver {
    session: Mutex<Option<Session>>,
}

struct Session {
    binary: PathBuf,
    child: tokio::process::Child,
}

impl ProcessDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrowserDriver for ProcessDriver {
    async fn binary_version(&self, binary: &Path) -> Result<String> {
        let output = tokio::process::Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running {} --version", binary.display()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // "Google Chrome 120.0.6099.71" -> "120.0.6099.71"
        let version = stdout
            .split_whitespace()
            .rev()
            .find(|token| token.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .unwrap_or("unknown");
        Ok(version.to_string())
    }

    async fn start(&self, request: StartRequest<'_>) -> Result<u32> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            bail!("browser session already running");
        }
        let mut command = tokio::process::Command::new(request.binary);
        command.args(&request.args).stdin(Stdio::null());
        match request.log_file {
            Some(log_file) => {
                let log = std::fs::File::create(log_file)
                    .with_context(|| format!("creating {}", log_file.display()))?;
                let log_err = log.try_clone()?;
                command.stdout(log).stderr(log_err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        let child = command
            .spawn()
            .with_context(|| format!("starting {}", request.binary.display()))?;
        let pid = child
            .id()
            .context("browser process exited before reporting a pid")?;
        debug!(pid, binary = %request.binary.display(), "browser process started");
        *session = Some(Session {
            binary: request.binary.to_path_buf(),
            child,
        });
        Ok(pid)
    }

    async fn js(&self, _code: &str, _timeout: Duration, _args: &[Value]) -> Result<Value> {
        bail!("the process driver cannot execute javascript, use a webdriver-based adapter")
    }

    async fn navigate_to(&self, url: &str) -> Result<()> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            bail!("no browser session running");
        };
        // Re-invoking the binary makes the running session open the URL in
        // a tab and exit.
        let status = tokio::process::Command::new(&session.binary)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("navigating to {url}"))?;
        if !status.success() {
            bail!("navigation to {url} exited with {status}");
        }
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(mut session) = session.take() else {
            bail!("no browser session running");
        };
        session.child.start_kill().context("terminating browser")?;
        let _ = tokio::time::timeout(Duration::from_secs(10), session.child.wait())
            .await
            .context("waiting for browser exit")??;
        Ok(())
    }

    async fn force_quit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(mut session) = session.take() {
            if let Err(error) = session.child.start_kill() {
                warn!(%error, "force kill failed");
            }
            let _ = session.child.wait().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbench_core::browser::Viewport;

    #[tokio::test]
    async fn version_probing_extracts_number() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-browser");
        std::fs::write(&script, "#!/bin/sh\necho \"Fake Browser 42.0.1\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let driver = ProcessDriver::new();
        let version = driver.binary_version(&script).await.unwrap();
        assert_eq!(version, "42.0.1");
    }

    #[tokio::test]
    async fn start_and_quit_round_trip() {
        let driver = ProcessDriver::new();
        let pid = driver
            .start(StartRequest {
                binary: Path::new("/bin/sleep"),
                args: vec!["30".to_string()],
                viewport: Viewport::headless(),
                log_file: None,
            })
            .await
            .unwrap();
        assert!(pid > 0);
        driver.quit().await.unwrap();
        // A second quit has no session to act on.
        assert!(driver.quit().await.is_err());
    }

    #[tokio::test]
    async fn js_is_unsupported() {
        let driver = ProcessDriver::new();
        assert!(driver
            .js("return 1", Duration::from_secs(1), &[])
            .await
            .is_err());
    }
}
