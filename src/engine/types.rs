use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::config;
use crate::recorder::{RecorderConfig, RecorderError, RecordingStats};
use crate::remote::RemoteError;
use crate::vlm::VlmError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Hard failure inside a single step
#[derive(Debug, Error)]
pub enum StepFault {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Oracle(#[from] VlmError),

    #[error("cannot save screenshot: {0}")]
    Artifact(#[from] ArtifactError),

    /// Cancellation observed while the step was sleeping or waiting on the
    /// oracle
    #[error("interrupted")]
    Interrupted,
}

/// Errors that end an execution
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another execution holds the engine
    #[error("engine is busy with another execution")]
    Busy,

    /// A step failed hard; `index` is 1-based
    #[error("step {index} ({action}) failed: {source}")]
    Step {
        index: usize,
        action: String,
        #[source]
        source: StepFault,
    },

    /// Operator cancellation, observed at or during step `step`
    #[error("interrupted at step {step}")]
    Interrupted { step: usize },

    /// The recorder could not start
    #[error("recorder failed: {0}")]
    Recorder(#[from] RecorderError),
}

/// Engine behaviour switches
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Save `before_<action>` / `after_<action>` frames around each step
    pub debug_frames: bool,
    /// Pause after every step
    pub settle_delay: Duration,
    /// Record the session while `execute` runs
    pub record: bool,
    pub recorder: RecorderConfig,
    /// Root for screenshots (`<output_dir>/screenshots`)
    pub output_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            debug_frames: false,
            settle_delay: cfg.engine.settle_delay(),
            record: false,
            recorder: RecorderConfig::default(),
            output_dir: cfg.output.dir.clone(),
        }
    }
}

impl EngineOptions {
    /// Point screenshots and recordings at one root
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.recorder.output_dir = dir.clone();
        self.output_dir = dir;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn debug_frames(mut self, enabled: bool) -> Self {
        self.debug_frames = enabled;
        self
    }

    pub fn record(mut self, enabled: bool) -> Self {
        self.record = enabled;
        self
    }
}

/// Variables, soft errors and the step counter of one engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Named values in the order they were first set
    pub variables: IndexMap<String, String>,
    /// Soft errors in the order they happened
    pub errors: Vec<String>,
    pub step_counter: usize,
}

/// Outcome of a completed `execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub label: String,
    pub steps_run: usize,
    pub variables: IndexMap<String, String>,
    pub errors: Vec<String>,
    pub recording: Option<RecordingStats>,
}

impl RunReport {
    /// True when no soft error was recorded
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
