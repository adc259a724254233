//! The story contract.
//!
//! A story is a scripted page interaction. Its content is opaque to the
//! engine: the runner only needs a name for the output layout, an expected
//! duration for progress reporting, and the names of probes the story
//! depends on.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::run::Run;

#[async_trait]
pub trait Story: Send + Sync {
    fn name(&self) -> &str;

    /// Expected wall-clock duration in timing units.
    fn duration(&self) -> Duration;

    /// Probes this story requires; attached by the runner on construction.
    fn probe_names(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, run: &mut Run) -> Result<()>;
}

pub fn details_json(story: &dyn Story) -> Value {
    json!({
        "name": story.name(),
        "duration": story.duration().as_secs_f64(),
        "probes": story.probe_names(),
    })
}
