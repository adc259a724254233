//! Probe artifact bookkeeping.
//!
//! A probe's output is a set of artifact paths, not interpreted data; the
//! engine only moves these between runs and aggregation levels. Typed
//! lists keep `.json`/`.csv` artifacts findable by downstream tooling.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde_json::{Map, Value, json};

/// Artifacts produced by one probe for one run or group: generic files,
/// JSON files, CSV files and URLs. Value-like; immutable after
/// construction except through [`ProbeResult::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    file_list: Vec<PathBuf>,
    json_list: Vec<PathBuf>,
    csv_list: Vec<PathBuf>,
    url_list: Vec<String>,
}

impl ProbeResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validating constructor: typed lists must carry matching extensions
    /// and every listed file must exist on disk.
    pub fn new(
        file_list: Vec<PathBuf>,
        json_list: Vec<PathBuf>,
        csv_list: Vec<PathBuf>,
        url_list: Vec<String>,
    ) -> Result<Self> {
        let result = Self {
            file_list,
            json_list,
            csv_list,
            url_list,
        };
        result.validate()?;
        Ok(result)
    }

    pub fn single_file(path: PathBuf) -> Result<Self> {
        Self::new(vec![path], Vec::new(), Vec::new(), Vec::new())
    }

    pub fn single_json(path: PathBuf) -> Result<Self> {
        Self::new(Vec::new(), vec![path], Vec::new(), Vec::new())
    }

    pub fn single_csv(path: PathBuf) -> Result<Self> {
        Self::new(Vec::new(), Vec::new(), vec![path], Vec::new())
    }

    pub fn single_url(url: String) -> Self {
        Self {
            url_list: vec![url],
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        for path in &self.file_list {
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") | Some("csv") => {
                    bail!("use the typed list for {}", path.display())
                }
                _ => {}
            }
        }
        for path in &self.json_list {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                bail!("expected .json file but got {}", path.display());
            }
        }
        for path in &self.csv_list {
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                bail!("expected .csv file but got {}", path.display());
            }
        }
        for path in self.all_files() {
            if !path.is_file() {
                bail!("probe result file does not exist: {}", path.display());
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.file_list.is_empty()
            && self.json_list.is_empty()
            && self.csv_list.is_empty()
            && self.url_list.is_empty()
    }

    pub fn merge(&self, other: &ProbeResult) -> ProbeResult {
        let mut merged = self.clone();
        merged.file_list.extend(other.file_list.iter().cloned());
        merged.json_list.extend(other.json_list.iter().cloned());
        merged.csv_list.extend(other.csv_list.iter().cloned());
        merged.url_list.extend(other.url_list.iter().cloned());
        merged
    }

    pub fn all_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.file_list
            .iter()
            .chain(self.json_list.iter())
            .chain(self.csv_list.iter())
    }

    pub fn file_list(&self) -> &[PathBuf] {
        &self.file_list
    }

    pub fn json_list(&self) -> &[PathBuf] {
        &self.json_list
    }

    pub fn csv_list(&self) -> &[PathBuf] {
        &self.csv_list
    }

    pub fn url_list(&self) -> &[String] {
        &self.url_list
    }

    /// The single JSON artifact; errors when there is not exactly one.
    pub fn json(&self) -> Result<&Path> {
        match self.json_list.as_slice() {
            [path] => Ok(path),
            other => bail!("expected exactly one json artifact, got {}", other.len()),
        }
    }

    pub fn file(&self) -> Result<&Path> {
        match self.file_list.as_slice() {
            [path] => Ok(path),
            other => bail!("expected exactly one file artifact, got {}", other.len()),
        }
    }

    /// JSON shape with paths relativized against `base` where possible, so
    /// summaries stay resolvable from their enclosing directory.
    pub fn to_json(&self, base: &Path) -> Value {
        fn paths(list: &[PathBuf], base: &Path) -> Value {
            Value::Array(
                list.iter()
                    .map(|path| {
                        let shown = path.strip_prefix(base).unwrap_or(path);
                        json!(shown.to_string_lossy())
                    })
                    .collect(),
            )
        }
        json!({
            "file": paths(&self.file_list, base),
            "json": paths(&self.json_list, base),
            "csv": paths(&self.csv_list, base),
            "url": self.url_list,
        })
    }
}

/// Probe name → [`ProbeResult`] mapping owned by a run or a run group.
#[derive(Debug, Default)]
pub struct ProbeResultDict {
    path: PathBuf,
    entries: Vec<(String, ProbeResult)>,
}

impl ProbeResultDict {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&mut self, probe_name: &str, result: ProbeResult) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(n, _)| n == probe_name) {
            *existing = result;
        } else {
            self.entries.push((probe_name.to_string(), result));
        }
    }

    pub fn get(&self, probe_name: &str) -> Option<&ProbeResult> {
        self.entries
            .iter()
            .find(|(n, _)| n == probe_name)
            .map(|(_, r)| r)
    }

    pub fn contains(&self, probe_name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == probe_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProbeResult)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    /// Per-probe JSON map; probes that produced no data map to null.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, result) in &self.entries {
            let value = if result.is_empty() {
                Value::Null
            } else {
                result.to_json(&self.path)
            };
            map.insert(name.clone(), value);
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn empty_result() {
        let result = ProbeResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.all_files().count(), 0);
    }

    #[test]
    fn typed_lists_enforce_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let json = touch(dir.path(), "data.json");
        let csv = touch(dir.path(), "data.csv");
        let txt = touch(dir.path(), "data.txt");

        assert!(ProbeResult::single_json(json.clone()).is_ok());
        assert!(ProbeResult::single_csv(csv.clone()).is_ok());
        assert!(ProbeResult::single_file(txt).is_ok());
        // Typed artifacts must not hide in the generic list.
        assert!(ProbeResult::single_file(json.clone()).is_err());
        assert!(ProbeResult::single_file(csv).is_err());
        // Wrong extension in a typed list.
        assert!(ProbeResult::single_json(dir.path().join("data.csv")).is_err());
        assert!(ProbeResult::single_csv(json).is_err());
    }

    #[test]
    fn missing_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(ProbeResult::single_json(missing).is_err());
    }

    #[test]
    fn merge_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let a = ProbeResult::single_json(touch(dir.path(), "a.json")).unwrap();
        let b = ProbeResult::single_json(touch(dir.path(), "b.json")).unwrap();
        let merged = a.merge(&b);
        assert_eq!(merged.json_list().len(), 2);
        assert!(!merged.is_empty());
    }

    #[test]
    fn to_json_relativizes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProbeResult::single_json(touch(dir.path(), "trace.json")).unwrap();
        let json = result.to_json(dir.path());
        assert_eq!(json["json"][0], "trace.json");
    }

    #[test]
    fn dict_null_for_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = ProbeResultDict::new(dir.path().to_path_buf());
        dict.insert("trace", ProbeResult::empty());
        let json = dict.to_json();
        assert!(json["trace"].is_null());

        dict.insert(
            "trace",
            ProbeResult::single_json(touch(dir.path(), "trace.json")).unwrap(),
        );
        assert_eq!(dict.to_json()["trace"]["json"][0], "trace.json");
    }

    #[test]
    fn dict_insert_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = ProbeResultDict::new(dir.path().to_path_buf());
        dict.insert("p", ProbeResult::empty());
        let result = ProbeResult::single_json(touch(dir.path(), "p.json")).unwrap();
        dict.insert("p", result.clone());
        assert_eq!(dict.get("p"), Some(&result));
        assert_eq!(dict.iter().count(), 1);
    }
}
