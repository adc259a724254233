pub mod actions;
pub mod benchmark;
pub mod browser;
pub mod durations;
pub mod env;
pub mod errors;
pub mod flags;
pub mod groups;
pub mod logging;
pub mod platform;
pub mod probe;
pub mod run;
pub mod runner;
pub mod story;
pub mod timing;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use browser::{Browser, BrowserConfig, BrowserDriver, Viewport};
pub use env::{HostEnvironment, HostEnvironmentConfig, ValidationMode};
pub use errors::{ErrorAnnotator, RunnerError, ValidationError};
pub use flags::{ChromeFlags, Flags, JsFlags};
pub use probe::{Probe, ProbeResult, ProbeResultDict, ProbeScope, ResultLocation};
pub use run::{Run, RunState};
pub use runner::{Runner, ThreadMode};
pub use story::Story;
pub use timing::Timing;
