//! Three-level result aggregation.
//!
//! After the last run completes the runner folds results bottom-up:
//! repetitions of one story, then all stories of one browser, then all
//! browsers. At every level the probes are consulted in reverse attach
//! order ([`merge_probes`]), so the results-summary meta-probe (attached
//! first) merges last and observes every other probe's merged output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::debug;

use crate::browser::Browser;
use crate::errors::ErrorAnnotator;
use crate::probe::{Probe, ProbeResultDict};
use crate::run::Run;
use crate::story::Story;

/// The documented merge iteration order: reverse attach order.
pub fn merge_probes(probes: &[Arc<dyn Probe>]) -> impl Iterator<Item = &Arc<dyn Probe>> {
    probes.iter().rev()
}

/// All runs sharing one (browser, story) pair; one per repetition.
pub struct RepetitionsRunGroup {
    path: PathBuf,
    story: Arc<dyn Story>,
    browser: Arc<Browser>,
    runs: Vec<Arc<Run>>,
    results: ProbeResultDict,
    errors: ErrorAnnotator,
}

impl RepetitionsRunGroup {
    /// Partitions completed runs, preserving first-seen order.
    pub fn group(runs: &[Arc<Run>], throw: bool) -> Result<Vec<Self>> {
        let mut groups: Vec<Self> = Vec::new();
        for run in runs {
            let existing = groups.iter_mut().find(|group| {
                Arc::ptr_eq(&group.story, run.story()) && Arc::ptr_eq(&group.browser, run.browser())
            });
            match existing {
                Some(group) => group.append(Arc::clone(run))?,
                None => {
                    let path = run.group_dir().to_path_buf();
                    groups.push(Self {
                        path: path.clone(),
                        story: Arc::clone(run.story()),
                        browser: Arc::clone(run.browser()),
                        runs: vec![Arc::clone(run)],
                        results: ProbeResultDict::new(path),
                        errors: ErrorAnnotator::new(throw),
                    });
                }
            }
        }
        Ok(groups)
    }

    fn append(&mut self, run: Arc<Run>) -> Result<()> {
        if run.group_dir() != self.path {
            bail!(
                "run {} does not belong to group dir {}",
                run.name(),
                self.path.display()
            );
        }
        self.runs.push(run);
        Ok(())
    }

    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    pub fn story(&self) -> &Arc<dyn Story> {
        &self.story
    }

    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn results(&self) -> &ProbeResultDict {
        &self.results
    }

    pub fn errors(&self) -> &ErrorAnnotator {
        &self.errors
    }

    /// Merged artifact path inside the group directory; taken paths fail.
    pub fn local_result_path(&self, file_name: &str) -> Result<PathBuf> {
        local_result_path(&self.path, file_name)
    }

    pub async fn merge(&mut self, probes: &[Arc<dyn Probe>]) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        self.errors.push_info(format!(
            "browser={} story={}",
            self.browser.unique_name(),
            self.story.name()
        ));
        for probe in merge_probes(probes) {
            debug!(probe = probe.name(), path = %self.path.display(), "merge repetitions");
            let label = format!("Probe {} merge results", probe.name());
            let merged = probe.merge_repetitions(&*self).await;
            let captured = self.errors.capture(&label, merged);
            match captured {
                Ok(Some(result)) => self.results.insert(probe.name(), result),
                Ok(None) => {}
                Err(error) => {
                    self.errors.pop_info();
                    return Err(error);
                }
            }
        }
        self.errors.pop_info();
        Ok(())
    }
}

/// All repetition groups of one browser; one per story.
pub struct StoriesRunGroup {
    path: PathBuf,
    browser: Arc<Browser>,
    repetitions_groups: Vec<RepetitionsRunGroup>,
    results: ProbeResultDict,
    errors: ErrorAnnotator,
}

impl StoriesRunGroup {
    pub fn group(repetitions_groups: Vec<RepetitionsRunGroup>, throw: bool) -> Result<Vec<Self>> {
        let mut groups: Vec<Self> = Vec::new();
        for child in repetitions_groups {
            let existing = groups
                .iter_mut()
                .find(|group| Arc::ptr_eq(&group.browser, &child.browser));
            match existing {
                Some(group) => group.append(child)?,
                None => {
                    let path = parent_path(child.path())?;
                    groups.push(Self {
                        path: path.clone(),
                        browser: Arc::clone(&child.browser),
                        repetitions_groups: vec![child],
                        results: ProbeResultDict::new(path),
                        errors: ErrorAnnotator::new(throw),
                    });
                }
            }
        }
        Ok(groups)
    }

    fn append(&mut self, child: RepetitionsRunGroup) -> Result<()> {
        if parent_path(child.path())? != self.path {
            bail!(
                "repetitions group {} does not belong under {}",
                child.path().display(),
                self.path.display()
            );
        }
        self.repetitions_groups.push(child);
        Ok(())
    }

    pub fn repetitions_groups(&self) -> &[RepetitionsRunGroup] {
        &self.repetitions_groups
    }

    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    pub fn stories(&self) -> impl Iterator<Item = &Arc<dyn Story>> {
        self.repetitions_groups.iter().map(|group| group.story())
    }

    pub fn runs(&self) -> impl Iterator<Item = &Arc<Run>> {
        self.repetitions_groups
            .iter()
            .flat_map(|group| group.runs().iter())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn results(&self) -> &ProbeResultDict {
        &self.results
    }

    pub fn errors(&self) -> &ErrorAnnotator {
        &self.errors
    }

    pub fn local_result_path(&self, file_name: &str) -> Result<PathBuf> {
        local_result_path(&self.path, file_name)
    }

    pub async fn merge(&mut self, probes: &[Arc<dyn Probe>]) -> Result<()> {
        self.errors
            .push_info(format!("browser={}", self.browser.unique_name()));
        for probe in merge_probes(probes) {
            debug!(probe = probe.name(), path = %self.path.display(), "merge stories");
            let label = format!("Probe {} merge results", probe.name());
            let merged = probe.merge_stories(&*self).await;
            let captured = self.errors.capture(&label, merged);
            match captured {
                Ok(Some(result)) => self.results.insert(probe.name(), result),
                Ok(None) => {}
                Err(error) => {
                    self.errors.pop_info();
                    return Err(error);
                }
            }
        }
        self.errors.pop_info();
        Ok(())
    }
}

/// The single terminal aggregation node over all browsers.
pub struct BrowsersRunGroup {
    path: PathBuf,
    story_groups: Vec<StoriesRunGroup>,
    results: ProbeResultDict,
    errors: ErrorAnnotator,
}

impl BrowsersRunGroup {
    pub fn new(story_groups: Vec<StoriesRunGroup>, throw: bool) -> Result<Self> {
        let Some(first) = story_groups.first() else {
            bail!("cannot build a browsers group without story groups");
        };
        let path = parent_path(first.path())?;
        for group in &story_groups {
            if parent_path(group.path())? != path {
                bail!(
                    "story group {} does not belong under {}",
                    group.path().display(),
                    path.display()
                );
            }
        }
        Ok(Self {
            path: path.clone(),
            story_groups,
            results: ProbeResultDict::new(path),
            errors: ErrorAnnotator::new(throw),
        })
    }

    pub fn story_groups(&self) -> &[StoriesRunGroup] {
        &self.story_groups
    }

    pub fn browsers(&self) -> impl Iterator<Item = &Arc<Browser>> {
        self.story_groups.iter().map(|group| group.browser())
    }

    pub fn runs(&self) -> impl Iterator<Item = &Arc<Run>> {
        self.story_groups.iter().flat_map(|group| group.runs())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn results(&self) -> &ProbeResultDict {
        &self.results
    }

    pub fn errors(&self) -> &ErrorAnnotator {
        &self.errors
    }

    pub fn local_result_path(&self, file_name: &str) -> Result<PathBuf> {
        local_result_path(&self.path, file_name)
    }

    pub async fn merge(&mut self, probes: &[Arc<dyn Probe>]) -> Result<()> {
        for probe in merge_probes(probes) {
            debug!(probe = probe.name(), path = %self.path.display(), "merge browsers");
            let label = format!("Probe {} merge results", probe.name());
            let merged = probe.merge_browsers(&*self).await;
            let captured = self.errors.capture(&label, merged);
            match captured {
                Ok(Some(result)) => self.results.insert(probe.name(), result),
                Ok(None) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

fn parent_path(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("group path {} has no parent", path.display()))
}

fn local_result_path(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    if path.exists() {
        bail!("merged result file exists already: {}", path.display());
    }
    Ok(path)
}
