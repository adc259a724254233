//! Browser resolution and runner assembly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use crossbench_core::browser::{Browser, BrowserConfig, Viewport};
use crossbench_core::flags::ChromeFlags;
use tracing::debug;

use crate::driver::ProcessDriver;

/// Well-known install locations per browser family, tried before PATH.
fn known_locations(family: &str) -> &'static [&'static str] {
    match family {
        "chrome" => &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/opt/google/chrome/chrome",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "C:/Program Files/Google/Chrome/Application/chrome.exe",
        ],
        "chromium" => &[
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ],
        "firefox" => &[
            "/usr/bin/firefox",
            "/Applications/Firefox.app/Contents/MacOS/firefox",
            "C:/Program Files/Mozilla Firefox/firefox.exe",
        ],
        _ => &[],
    }
}

fn path_names(family: &str) -> &'static [&'static str] {
    match family {
        "chrome" => &["google-chrome", "google-chrome-stable", "chrome"],
        "chromium" => &["chromium", "chromium-browser"],
        "firefox" => &["firefox"],
        _ => &[],
    }
}

/// Resolves a `--browser` value: an existing binary path, or a browser
/// family name searched in well-known locations and on PATH.
pub fn resolve_browser_binary(spec: &str) -> Result<(String, PathBuf)> {
    let as_path = PathBuf::from(spec);
    if as_path.is_file() {
        let family = as_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "custom".to_string());
        return Ok((family, as_path));
    }
    for location in known_locations(spec) {
        let path = PathBuf::from(location);
        if path.is_file() {
            debug!(browser = spec, path = %path.display(), "resolved browser");
            return Ok((spec.to_string(), path));
        }
    }
    for name in path_names(spec) {
        if let Ok(path) = which::which(name) {
            debug!(browser = spec, path = %path.display(), "resolved browser on PATH");
            return Ok((spec.to_string(), path));
        }
    }
    bail!(
        "browser binary not found: {spec} \
         (pass an absolute path or install the browser)"
    )
}

/// Builds one browser variant per `--browser` value. Labels are derived
/// from the spec and de-duplicated by position.
pub fn build_browsers(specs: &[String], headless: bool) -> Result<Vec<Arc<Browser>>> {
    let mut browsers = Vec::new();
    for (position, spec) in specs.iter().enumerate() {
        let (family, path) =
            resolve_browser_binary(spec).with_context(|| format!("--browser={spec}"))?;
        let label = if specs.len() == 1 {
            "default".to_string()
        } else {
            format!("variant{position}")
        };
        let viewport = if headless {
            Viewport::headless()
        } else {
            Viewport::default()
        };
        browsers.push(Arc::new(Browser::new(
            BrowserConfig {
                browser_type: family,
                label,
                path,
                viewport,
                cache_dir: None,
            },
            ChromeFlags::new(),
            Box::new(ProcessDriver::new()),
        )));
    }
    Ok(browsers)
}
