//! Scoped system-sleep prevention.
//!
//! Held by the runner for the whole benchmark so the host cannot suspend
//! between runs. The inhibitor is a child process (`caffeinate` on macOS,
//! `systemd-inhibit` on Linux) that is killed when the guard drops.

use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

/// Keeps the host awake while alive. Platforms without a known inhibitor
/// binary get a no-op guard.
pub struct SleepInhibitor {
    child: Option<Child>,
}

impl SleepInhibitor {
    pub fn acquire() -> Self {
        let child = Self::spawn();
        if child.is_none() {
            debug!("no sleep inhibitor available on this host");
        }
        Self { child }
    }

    #[cfg(target_os = "macos")]
    fn spawn() -> Option<Child> {
        Self::spawn_command(Command::new("caffeinate").args(["-d", "-i"]))
    }

    #[cfg(target_os = "linux")]
    fn spawn() -> Option<Child> {
        which::which("systemd-inhibit").ok()?;
        Self::spawn_command(
            Command::new("systemd-inhibit")
                .args(["--what=sleep:idle", "--who=crossbench", "--why=benchmarking"])
                .args(["sleep", "infinity"]),
        )
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    fn spawn() -> Option<Child> {
        None
    }

    #[allow(dead_code)]
    fn spawn_command(command: &mut Command) -> Option<Child> {
        match command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                debug!(pid = child.id(), "sleep inhibitor started");
                Some(child)
            }
            Err(error) => {
                warn!(%error, "could not start sleep inhibitor");
                None
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for SleepInhibitor {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let inhibitor = SleepInhibitor::acquire();
        // Never fails, even when no inhibitor binary exists.
        drop(inhibitor);
    }
}
