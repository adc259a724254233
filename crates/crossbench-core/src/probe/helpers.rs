//! Shared probe plumbing: JSON file I/O used by scopes and merge hooks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

/// Writes pretty-printed JSON and returns the path for result bookkeeping.
pub fn write_json_file(path: &Path, value: &Value) -> Result<PathBuf> {
    let rendered = serde_json::to_string_pretty(value)?;
    std::fs::write(path, rendered)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path.to_path_buf())
}

pub fn read_json_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))
}

/// Copies a browser-side artifact into the local output directory and
/// returns the local path. Identity when source already lives there.
pub fn transfer_to_local(source: &Path, local_dir: &Path) -> Result<PathBuf> {
    if source.parent() == Some(local_dir) {
        return Ok(source.to_path_buf());
    }
    let file_name = source
        .file_name()
        .with_context(|| format!("artifact without file name: {}", source.display()))?;
    let dest = local_dir.join(file_name);
    std::fs::copy(source, &dest)
        .with_context(|| format!("transferring {}", source.display()))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let value = json!({"a": 1, "b": [true, null]});
        write_json_file(&path, &value).unwrap();
        assert_eq!(read_json_file(&path).unwrap(), value);
    }

    #[test]
    fn transfer_is_identity_for_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();
        let result = transfer_to_local(&path, dir.path()).unwrap();
        assert_eq!(result, path);
    }

    #[test]
    fn transfer_copies_remote_files() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("trace.txt");
        std::fs::write(&src, b"data").unwrap();
        let dest = transfer_to_local(&src, dest_dir.path()).unwrap();
        assert_eq!(dest, dest_dir.path().join("trace.txt"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }
}
