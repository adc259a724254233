//! The benchmark contract and the built-in page-load benchmark.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::actions::Actions;
use crate::run::Run;
use crate::runner::Runner;
use crate::story::Story;

/// A named set of stories plus optional one-time setup.
#[async_trait]
pub trait Benchmark: Send + Sync {
    fn name(&self) -> &str;

    fn stories(&self) -> Vec<Arc<dyn Story>>;

    /// Invoked once after the environment was validated, before the first
    /// run starts.
    async fn setup(&self, _runner: &Runner) -> Result<()> {
        Ok(())
    }
}

/// Loads one page and keeps it in the foreground for a fixed time.
pub struct PageLoadStory {
    name: String,
    url: String,
    duration: Duration,
}

impl PageLoadStory {
    pub fn new(name: impl Into<String>, url: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            duration,
        }
    }

    /// Derives a story per URL, naming it after the host.
    pub fn from_urls(urls: &[String], duration: Duration) -> Result<Vec<Arc<dyn Story>>> {
        if urls.is_empty() {
            bail!("no URLs provided");
        }
        let mut stories: Vec<Arc<dyn Story>> = Vec::new();
        for url in urls {
            let name = url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or(url)
                .replace('.', "_");
            stories.push(Arc::new(Self::new(name, url.clone(), duration)));
        }
        Ok(stories)
    }
}

#[async_trait]
impl Story for PageLoadStory {
    fn name(&self) -> &str {
        &self.name
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    async fn run(&self, run: &mut Run) -> Result<()> {
        let duration = self.duration;
        let url = self.url.clone();
        let mut actions = Actions::new(run, &format!("load {url}"));
        actions.navigate_to(&url).await?;
        actions.wait(duration.as_secs_f64()).await;
        actions.finish();
        Ok(())
    }
}

/// Minimal built-in benchmark: page-load stories over user URLs.
pub struct LoadingBenchmark {
    stories: Vec<Arc<dyn Story>>,
}

impl LoadingBenchmark {
    pub const NAME: &'static str = "loading";

    pub fn new(stories: Vec<Arc<dyn Story>>) -> Self {
        Self { stories }
    }

    pub fn from_urls(urls: &[String], duration: Duration) -> Result<Self> {
        Ok(Self::new(PageLoadStory::from_urls(urls, duration)?))
    }
}

#[async_trait]
impl Benchmark for LoadingBenchmark {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn stories(&self) -> Vec<Arc<dyn Story>> {
        self.stories.clone()
    }

    async fn setup(&self, _runner: &Runner) -> Result<()> {
        info!(stories = self.stories.len(), "loading benchmark ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stories_from_urls_derive_names() {
        let stories = PageLoadStory::from_urls(
            &[
                "https://example.com/page".to_string(),
                "http://test.org".to_string(),
            ],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(stories[0].name(), "example_com");
        assert_eq!(stories[1].name(), "test_org");
    }

    #[test]
    fn empty_url_list_is_rejected() {
        assert!(PageLoadStory::from_urls(&[], Duration::from_secs(1)).is_err());
    }
}
