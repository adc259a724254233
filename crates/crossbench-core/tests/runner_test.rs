//! End-to-end scheduler and aggregation tests against mock collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use crossbench_core::benchmark::Benchmark;
use crossbench_core::env::{HostEnvironmentConfig, ValidationMode};
use crossbench_core::runner::{Runner, RunnerOptions, ThreadMode};
use crossbench_core::story::Story;
use crossbench_core::testing::{
    FailingHook, MockDriver, MockPlatform, MockProbe, MockStory, StoryBehavior,
    mock_browser, mock_browser_with_driver,
};
use crossbench_core::timing::Timing;

struct TestBenchmark {
    stories: Vec<Arc<dyn Story>>,
}

impl TestBenchmark {
    fn new(stories: Vec<Arc<dyn Story>>) -> Box<Self> {
        Box::new(Self { stories })
    }
}

#[async_trait]
impl Benchmark for TestBenchmark {
    fn name(&self) -> &str {
        "test-benchmark"
    }

    fn stories(&self) -> Vec<Arc<dyn Story>> {
        self.stories.clone()
    }
}

fn fast_options() -> RunnerOptions {
    RunnerOptions {
        platform: MockPlatform::new(),
        env_validation_mode: ValidationMode::Skip,
        timing: Timing::new(Duration::ZERO, Duration::from_millis(1)),
        ..RunnerOptions::default()
    }
}

fn out_dir(root: &Path) -> PathBuf {
    root.join("results")
}

#[tokio::test]
async fn single_browser_three_repetitions() {
    // One browser, one story, three reps, no user probes.
    let root = tempfile::tempdir().unwrap();
    let story = MockStory::new("story_a");
    let browser = mock_browser("stable");
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![browser],
        TestBenchmark::new(vec![story.clone()]),
        RunnerOptions {
            repetitions: 3,
            ..fast_options()
        },
    )
    .unwrap();

    runner.run(false).await.unwrap();

    assert!(runner.is_success());
    assert_eq!(runner.runs().len(), 3);
    assert_eq!(story.run_count.load(Ordering::Relaxed), 3);

    // Runs execute and are reported in index order with unique out dirs.
    let mut seen_dirs = std::collections::HashSet::new();
    for (expected_index, run) in runner.runs().iter().enumerate() {
        assert_eq!(run.index(), expected_index);
        assert!(run.out_dir().is_dir());
        assert!(seen_dirs.insert(run.out_dir().to_path_buf()));
        assert!(run.out_dir().join("results.json").is_file());
        assert!(run.out_dir().join("browser.log").is_file());
    }

    // One aggregation node per level, each with a summary.
    let group = runner.browser_group().expect("browsers group");
    assert_eq!(group.story_groups().len(), 1);
    assert_eq!(group.story_groups()[0].repetitions_groups().len(), 1);
    let repetitions_dir = runner.runs()[0].group_dir();
    assert!(repetitions_dir.join("results.json").is_file());
    assert!(repetitions_dir.parent().unwrap().join("results.json").is_file());
    assert!(out_dir(root.path()).join("results.json").is_file());
    assert!(out_dir(root.path()).join("system_details.json").is_file());
}

#[tokio::test]
async fn browser_thread_mode_builds_full_tree() {
    // Two browsers x two stories x two reps, one worker per browser.
    let root = tempfile::tempdir().unwrap();
    let stories: Vec<Arc<dyn Story>> =
        vec![MockStory::new("story_a"), MockStory::new("story_b")];
    let browsers = vec![mock_browser("alpha"), mock_browser("beta")];
    let mut runner = Runner::new(
        out_dir(root.path()),
        browsers,
        TestBenchmark::new(stories),
        RunnerOptions {
            repetitions: 2,
            thread_mode: ThreadMode::Browser,
            ..fast_options()
        },
    )
    .unwrap();

    runner.run(false).await.unwrap();

    assert_eq!(runner.runs().len(), 8);
    assert!(runner.is_success());
    let group = runner.browser_group().expect("browsers group");
    assert_eq!(group.story_groups().len(), 2);
    for story_group in group.story_groups() {
        assert_eq!(story_group.repetitions_groups().len(), 2);
        for repetitions_group in story_group.repetitions_groups() {
            assert_eq!(repetitions_group.runs().len(), 2);
        }
    }
}

#[tokio::test]
async fn failing_story_does_not_abort_siblings() {
    let root = tempfile::tempdir().unwrap();
    let good = MockStory::new("good_story");
    let bad = MockStory::with_behavior("bad_story", StoryBehavior::Fail("page crashed".into()));
    let stories: Vec<Arc<dyn Story>> = vec![good.clone(), bad];
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(stories),
        fast_options(),
    )
    .unwrap();

    let error = runner.run(false).await.unwrap_err();
    assert!(error.to_string().contains("1/2"));

    // The sibling run completed untouched.
    assert_eq!(good.run_count.load(Ordering::Relaxed), 1);
    let failed: Vec<_> = runner.runs().iter().filter(|r| !r.is_success()).collect();
    assert_eq!(failed.len(), 1);

    // The failed run still has a populated out_dir with recorded errors.
    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(failed[0].out_dir().join("results.json")).unwrap(),
    )
    .unwrap();
    let errors = summary["errors"].as_array().unwrap();
    assert!(!errors.is_empty());
    assert!(errors.iter().any(|e| e["message"]
        .as_str()
        .unwrap()
        .contains("page crashed")));
}

#[tokio::test]
async fn probe_hooks_run_once_in_order() {
    let root = tempfile::tempdir().unwrap();
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let probe_a = MockProbe::with_events("probe_a", events.clone());
    let probe_b = MockProbe::with_events("probe_b", events.clone());
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![MockStory::new("story_a")]),
        fast_options(),
    )
    .unwrap();
    runner.attach_probe(probe_a, false).unwrap();
    runner.attach_probe(probe_b, false).unwrap();

    runner.run(false).await.unwrap();
    assert!(runner.is_success());

    let events = events.lock().clone();
    let position = |needle: &str| {
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing event {needle} in {events:?}"))
    };
    // Each hook exactly once.
    for hook in ["setup", "start", "stop", "tear_down"] {
        for probe in ["probe_a", "probe_b"] {
            let count = events.iter().filter(|e| **e == format!("{probe}:{hook}")).count();
            assert_eq!(count, 1, "{probe}:{hook} in {events:?}");
        }
    }
    // Setup and start in attach order, stop and teardown reversed.
    assert!(position("probe_a:setup") < position("probe_b:setup"));
    assert!(position("probe_b:setup") < position("probe_a:start"));
    assert!(position("probe_a:start") < position("probe_b:start"));
    assert!(position("probe_b:stop") < position("probe_a:stop"));
    assert!(position("probe_b:tear_down") < position("probe_a:tear_down"));
    assert!(position("probe_a:stop") < position("probe_b:tear_down"));
    // Merge cascade in reverse attach order per level.
    assert!(position("probe_b:merge_repetitions") < position("probe_a:merge_repetitions"));
    assert!(position("probe_b:merge_stories") < position("probe_a:merge_stories"));
    assert!(position("probe_b:merge_browsers") < position("probe_a:merge_browsers"));
    assert!(position("probe_a:merge_repetitions") < position("probe_b:merge_stories"));
}

#[tokio::test]
async fn probe_setup_failure_still_tears_down() {
    let root = tempfile::tempdir().unwrap();
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let failing = MockProbe::failing("flaky", FailingHook::Setup, events.clone());
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![MockStory::new("story_a")]),
        fast_options(),
    )
    .unwrap();
    runner.attach_probe(failing, false).unwrap();

    // The probe failure is captured in the run, surfacing as a runner
    // failure, but the run itself completes its lifecycle.
    let error = runner.run(false).await.unwrap_err();
    assert!(error.to_string().contains("1/1"));

    let events = events.lock().clone();
    assert!(events.contains(&"flaky:setup".to_string()));
    assert!(events.contains(&"flaky:tear_down".to_string()));
}

#[tokio::test]
async fn battery_demand_fails_before_any_run() {
    let root = tempfile::tempdir().unwrap();
    let platform = MockPlatform::new();
    platform.battery_powered.store(false, Ordering::Relaxed);
    let story = MockStory::new("story_a");
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![story.clone()]),
        RunnerOptions {
            platform,
            env_config: HostEnvironmentConfig {
                power_use_battery: Some(true),
                ..Default::default()
            },
            env_validation_mode: ValidationMode::Throw,
            timing: Timing::new(Duration::ZERO, Duration::from_millis(1)),
            ..RunnerOptions::default()
        },
    )
    .unwrap();

    let error = runner.run(false).await.unwrap_err();
    assert!(error.entries.iter().any(|e| e.message.contains("battery")));
    assert_eq!(story.run_count.load(Ordering::Relaxed), 0);

    // No run subdirectories were created.
    let entries: Vec<_> = std::fs::read_dir(out_dir(root.path()))
        .unwrap()
        .flatten()
        .filter(|e| e.path().is_dir())
        .collect();
    assert!(entries.is_empty(), "unexpected dirs: {entries:?}");
}

#[tokio::test]
async fn dry_run_creates_tree_without_browser() {
    let root = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::default());
    let browser = mock_browser_with_driver("stable", Box::new(driver.clone()));
    let story = MockStory::new("story_a");
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![browser],
        TestBenchmark::new(vec![story.clone()]),
        fast_options(),
    )
    .unwrap();

    runner.run(true).await.unwrap();

    assert!(runner.is_success());
    assert_eq!(story.run_count.load(Ordering::Relaxed), 0);
    assert!(driver.url_log.lock().is_empty());
    for run in runner.runs() {
        assert!(run.out_dir().is_dir());
    }
}

#[tokio::test]
async fn duplicate_probe_names_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![MockStory::new("story_a")]),
        fast_options(),
    )
    .unwrap();
    runner.attach_probe(MockProbe::new("trace"), false).unwrap();
    let error = runner.attach_probe(MockProbe::new("trace"), false).unwrap_err();
    assert!(error.to_string().contains("twice"));
}

#[tokio::test]
async fn existing_out_dir_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let dir = out_dir(root.path());
    std::fs::create_dir_all(&dir).unwrap();
    let result = Runner::new(
        dir,
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![MockStory::new("story_a")]),
        fast_options(),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn results_json_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![MockStory::new("story_a")]),
        fast_options(),
    )
    .unwrap();
    runner.run(false).await.unwrap();

    let path = runner.runs()[0].out_dir().join("results.json");
    let raw = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    for key in ["name", "cwd", "story", "browser", "durations", "probes", "errors"] {
        assert!(parsed.get(key).is_some(), "missing key {key}");
    }
    let reparsed: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
    assert_eq!(parsed, reparsed);
}

#[tokio::test]
async fn timed_out_story_is_captured() {
    let root = tempfile::tempdir().unwrap();
    let story = MockStory::with_behavior("slow_story", StoryBehavior::TimeOut);
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![story]),
        fast_options(),
    )
    .unwrap();

    let error = runner.run(false).await.unwrap_err();
    assert!(error.entries.iter().any(|e| e.message.contains("timed out")));
}

#[tokio::test]
async fn throw_mode_propagates_first_failure() {
    let root = tempfile::tempdir().unwrap();
    let story = MockStory::with_behavior("bad_story", StoryBehavior::Fail("boom".into()));
    let mut runner = Runner::new(
        out_dir(root.path()),
        vec![mock_browser("stable")],
        TestBenchmark::new(vec![story]),
        RunnerOptions {
            throw: true,
            ..fast_options()
        },
    )
    .unwrap();

    let error = runner.run(false).await.unwrap_err();
    assert!(error.to_string().contains("throw mode"));
}
