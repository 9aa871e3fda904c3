//! The step interpreter.
//!
//! [`AutomationEngine::execute`] runs a step list strictly in order on the
//! calling thread. Soft failures (not found, verification mismatch, unknown
//! action or position) are collected in [`EngineState::errors`] and the run
//! continues; hard failures from the session or the oracle abort the run.
//! Every exit path, panics included, stops the recorder and disconnects the
//! session before `execute` returns.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use image::RgbImage;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use super::types::{EngineError, EngineOptions, EngineResult, EngineState, RunReport, StepFault};
use crate::artifacts::ArtifactDir;
use crate::cancel::CancelToken;
use crate::detect::{GeometricDetector, Point, QuickAnalysis};
use crate::recorder::{RecordingStats, SessionRecorder};
use crate::remote::{Key, RemoteController, RemoteError};
use crate::script::{CvTargetStep, Step};
use crate::status::{LogLevel, StatusBoard};
use crate::vlm::{SemanticLocator, VisionOracle, VlmResult};

type StepResult = Result<(), StepFault>;

/// Resolve a named screen position against a `width x height` frame
///
/// Accepts `top-left`, `top-center`, `top-right`, `center-left`, `center`,
/// `center-right`, `bottom-left`, `bottom-center` and `bottom-right`.
pub fn resolve_position(token: &str, width: u32, height: u32) -> Option<Point> {
    let (w, h) = (width as i32, height as i32);
    let (x, y) = match token {
        "top-left" => (w / 4, h / 4),
        "top-center" => (w / 2, h / 4),
        "top-right" => (3 * w / 4, h / 4),
        "center-left" => (w / 4, h / 2),
        "center" => (w / 2, h / 2),
        "center-right" => (3 * w / 4, h / 2),
        "bottom-left" => (w / 4, 3 * h / 4),
        "bottom-center" => (w / 2, 3 * h / 4),
        "bottom-right" => (3 * w / 4, 3 * h / 4),
        _ => return None,
    };
    Some(Point::new(x, y))
}

fn show_point(point: Option<Point>) -> String {
    point.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Flatten a quick analysis into `{prefix}_*` variables
fn flatten_analysis(prefix: &str, analysis: &QuickAnalysis, variables: &mut IndexMap<String, String>) {
    let diag = &analysis.diagnostics;
    let entries = [
        ("has_dialog", analysis.has_dialog.to_string()),
        ("dialog_center", show_point(analysis.dialog_center)),
        ("button_count", analysis.button_positions.len().to_string()),
        ("has_text_field", analysis.has_text_field.to_string()),
        ("text_field_position", show_point(analysis.text_field_position)),
        ("window_count", analysis.window_count.to_string()),
        ("unlock_button", show_point(analysis.unlock_button)),
        ("is_blank", diag.is_blank.to_string()),
        ("mean_brightness", format!("{:.1}", diag.mean_brightness)),
        ("edge_count", diag.edge_count.to_string()),
        ("possible_issue", diag.possible_issue.clone().unwrap_or_else(|| "none".to_string())),
    ];
    for (key, value) in entries {
        variables.insert(format!("{}_{}", prefix, key), value);
    }
}

fn captures_before(step: &Step) -> bool {
    !matches!(step, Step::Wait(_) | Step::Disconnect)
}

fn captures_after(step: &Step) -> bool {
    !matches!(step, Step::Wait(_) | Step::Disconnect | Step::Screenshot(_))
}

struct EngineInner {
    state: EngineState,
    artifacts: ArtifactDir,
    last_recording: Option<RecordingStats>,
}

/// Holds the executing flag up for the lifetime of a run
struct Executing<'a>(&'a StatusBoard);

impl<'a> Executing<'a> {
    fn raise(status: &'a StatusBoard) -> Self {
        status.set_executing(true);
        Self(status)
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.0.set_executing(false);
    }
}

/// Stops the recorder and disconnects on every exit path
struct Teardown {
    controller: Arc<dyn RemoteController>,
    status: Arc<StatusBoard>,
    recorder: Option<SessionRecorder>,
    armed: bool,
}

impl Teardown {
    fn new(controller: Arc<dyn RemoteController>, status: Arc<StatusBoard>) -> Self {
        Self {
            controller,
            status,
            recorder: None,
            armed: true,
        }
    }

    fn finish(mut self) -> Option<RecordingStats> {
        self.armed = false;
        self.run()
    }

    fn run(&mut self) -> Option<RecordingStats> {
        let stats = self.recorder.take().and_then(|mut recorder| recorder.stop());
        self.status.set_recording(false);

        if self.controller.is_connected() {
            match self.controller.disconnect() {
                Ok(()) => info!(target = %self.controller.describe(), "disconnected during teardown"),
                Err(e) => warn!(error = %e, "disconnect during teardown failed"),
            }
        }
        self.status.set_connected(false);
        stats
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.armed {
            self.run();
        }
    }
}

/// Sequential step interpreter over one remote session
pub struct AutomationEngine {
    controller: Arc<dyn RemoteController>,
    locator: SemanticLocator,
    detector: GeometricDetector,
    options: EngineOptions,
    status: Arc<StatusBoard>,
    cancel: CancelToken,
    inner: Mutex<EngineInner>,
}

impl AutomationEngine {
    pub fn new(controller: Arc<dyn RemoteController>, oracle: Arc<dyn VisionOracle>, options: EngineOptions) -> Self {
        let artifacts = ArtifactDir::new(&options.output_dir);
        Self {
            controller,
            locator: SemanticLocator::new(oracle),
            detector: GeometricDetector::default(),
            options,
            status: Arc::new(StatusBoard::new()),
            cancel: CancelToken::new(),
            inner: Mutex::new(EngineInner {
                state: EngineState::default(),
                artifacts,
                last_recording: None,
            }),
        }
    }

    pub fn with_detector(mut self, detector: GeometricDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Publish progress, logs and frames to a shared board
    pub fn with_status(mut self, status: Arc<StatusBoard>) -> Self {
        self.status = status;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn status(&self) -> Arc<StatusBoard> {
        self.status.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Variables collected so far (blocks while a run is in flight)
    pub fn variables(&self) -> IndexMap<String, String> {
        self.lock().state.variables.clone()
    }

    /// Soft errors collected so far (blocks while a run is in flight)
    pub fn errors(&self) -> Vec<String> {
        self.lock().state.errors.clone()
    }

    pub fn last_recording(&self) -> Option<RecordingStats> {
        self.lock().last_recording.clone()
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self) -> EngineResult<MutexGuard<'_, EngineInner>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(EngineError::Busy),
        }
    }

    /// Run a whole step list, then tear the session down
    ///
    /// State is reset first. On a hard failure the collected variables and
    /// soft errors remain readable through [`variables`](Self::variables) and
    /// [`errors`](Self::errors).
    pub fn execute(&self, steps: &[Step], label: &str) -> EngineResult<RunReport> {
        let mut inner = self.acquire()?;
        let _executing = Executing::raise(&self.status);
        self.cancel.reset();

        inner.state = EngineState::default();
        inner.last_recording = None;
        self.status.begin_run(label, steps.len());
        self.log(LogLevel::Info, format!("Executing scenario: {} ({} steps)", label, steps.len()));

        let mut teardown = Teardown::new(self.controller.clone(), self.status.clone());
        if self.options.record {
            let mut recorder =
                SessionRecorder::new(self.options.recorder.clone()).with_frame_hub(self.status.frame_hub());
            let controller = self.controller.clone();
            let path = recorder.start(label, move || controller.capture(), self.options.recorder.resolution)?;
            self.status.set_recording(true);
            self.log(LogLevel::Info, format!("Recording to {}", path.display()));
            teardown.recorder = Some(recorder);
        }

        let outcome = self.run_steps(&mut inner, steps);
        let recording = teardown.finish();
        if let Some(stats) = &recording {
            self.log(
                LogLevel::Info,
                format!(
                    "Recording saved: {} ({} frames, {:.1}s)",
                    stats.file.display(),
                    stats.frames,
                    stats.duration_secs
                ),
            );
        }
        inner.last_recording = recording.clone();

        let steps_run = match outcome {
            Ok(steps_run) => steps_run,
            Err(e) => {
                self.log(LogLevel::Error, format!("Scenario aborted: {}", e));
                return Err(e);
            }
        };

        let state = &inner.state;
        if state.errors.is_empty() {
            self.log(LogLevel::Success, format!("Scenario completed: {}", label));
        } else {
            self.log(
                LogLevel::Error,
                format!("Scenario completed with {} error(s): {}", state.errors.len(), label),
            );
        }

        Ok(RunReport {
            label: label.to_string(),
            steps_run,
            variables: state.variables.clone(),
            errors: state.errors.clone(),
            recording,
        })
    }

    /// Run one step without resetting state or tearing down the session
    ///
    /// Fails with [`EngineError::Busy`] while another execution holds the
    /// engine, leaving its progress untouched.
    pub fn execute_step(&self, step: &Step, index: usize) -> EngineResult<()> {
        let mut inner = self.acquire()?;
        let _executing = Executing::raise(&self.status);
        self.cancel.reset();
        self.status.set_current_step(index);
        self.run_one(&mut inner, step, index)
    }

    /// Disconnect if a session is still open
    pub fn shutdown(&self) {
        if self.controller.is_connected() {
            if let Err(e) = self.controller.disconnect() {
                warn!(error = %e, "disconnect on shutdown failed");
            }
        }
        self.status.set_connected(false);
    }

    fn run_steps(&self, inner: &mut EngineInner, steps: &[Step]) -> EngineResult<usize> {
        for (i, step) in steps.iter().enumerate() {
            let index = i + 1;
            if self.cancel.is_cancelled() {
                return Err(EngineError::Interrupted { step: index });
            }
            self.status.set_current_step(index);
            self.run_one(inner, step, index)?;

            if !self.cancel.sleep(self.options.settle_delay) {
                return Err(EngineError::Interrupted { step: index });
            }
        }
        Ok(steps.len())
    }

    fn run_one(&self, inner: &mut EngineInner, step: &Step, index: usize) -> EngineResult<()> {
        inner.state.step_counter += 1;
        let action = step.action_name();
        self.log(LogLevel::Info, format!("Step {}: {}", index, action));

        if self.options.debug_frames && captures_before(step) {
            self.debug_frame(inner, &format!("before_{}", action));
        }

        self.dispatch(inner, step).map_err(|fault| match fault {
            StepFault::Interrupted | StepFault::Remote(RemoteError::Interrupted) => {
                EngineError::Interrupted { step: index }
            }
            source => {
                error!(step = index, action, error = %source, "step failed");
                EngineError::Step {
                    index,
                    action: action.to_string(),
                    source,
                }
            }
        })?;

        if self.options.debug_frames && captures_after(step) {
            self.debug_frame(inner, &format!("after_{}", action));
        }
        Ok(())
    }

    fn dispatch(&self, inner: &mut EngineInner, step: &Step) -> StepResult {
        match step {
            Step::Connect => {
                self.controller.connect()?;
                self.status.set_connected(true);
                self.log(LogLevel::Success, format!("Connected to {}", self.controller.describe()));
            }
            Step::Disconnect => {
                self.controller.disconnect()?;
                self.status.set_connected(false);
                self.log(LogLevel::Info, "Disconnected");
            }
            Step::Wait(wait) => {
                let duration = match Duration::try_from_secs_f64(wait.seconds) {
                    Ok(duration) => duration,
                    Err(_) => {
                        self.log(LogLevel::Error, format!("Invalid wait of {} seconds, not waiting", wait.seconds));
                        Duration::ZERO
                    }
                };
                debug!(seconds = wait.seconds, "waiting");
                if !self.cancel.sleep(duration) {
                    return Err(StepFault::Interrupted);
                }
            }
            Step::Click(click) => {
                self.controller.click(click.x, click.y)?;
                self.log(LogLevel::Info, format!("Clicked at ({}, {})", click.x, click.y));
            }
            Step::ClickPosition(pos) => {
                let frame = self.capture()?;
                match resolve_position(&pos.position, frame.width(), frame.height()) {
                    Some(point) => {
                        self.controller.click(point.x, point.y)?;
                        self.log(LogLevel::Info, format!("Clicked {} at ({}, {})", pos.position, point.x, point.y));
                    }
                    None => self.soft_error(&mut inner.state, format!("Unknown position: {}", pos.position)),
                }
            }
            Step::Type(typed) => {
                self.controller.type_text(&typed.text)?;
                self.log(LogLevel::Info, format!("Typed {} characters", typed.text.chars().count()));
            }
            Step::Key(key) => {
                self.controller.key_press(&Key::parse(&key.key))?;
                self.log(LogLevel::Info, format!("Pressed {}", key.key));
            }
            Step::FindAndClick(find) => {
                let frame = self.capture()?;
                self.log(
                    LogLevel::Debug,
                    format!("Screen size: {}x{}", frame.width(), frame.height()),
                );
                let element = find.element.clone();
                let result = self.ask(frame, move |locator, frame| locator.find_element(frame, &element))?;
                match result.point() {
                    Some(point) => {
                        self.controller.click(point.x, point.y)?;
                        self.log(
                            LogLevel::Success,
                            format!(
                                "Found '{}' at ({}, {}), confidence {}",
                                find.element,
                                point.x,
                                point.y,
                                result.confidence.map(|c| c.to_string()).unwrap_or_else(|| "n/a".to_string())
                            ),
                        );
                    }
                    None => self.soft_error(&mut inner.state, format!("Element not found: {}", find.element)),
                }
            }
            Step::Verify(verify) => {
                let frame = self.capture()?;
                let expected = verify.expected.clone();
                if self.ask(frame, move |locator, frame| locator.verify(frame, &expected))? {
                    self.log(LogLevel::Success, format!("Verification passed: {}", verify.expected));
                } else {
                    self.soft_error(&mut inner.state, format!("Verification failed: {}", verify.expected));
                }
            }
            Step::Analyze(analyze) => {
                let frame = self.capture()?;
                let question = analyze.question.clone();
                let answer = self.ask(frame, move |locator, frame| locator.analyze(frame, &question))?;
                self.log(LogLevel::Info, format!("Analysis: {}", answer));
                if let Some(name) = &analyze.save_to {
                    inner.state.variables.insert(name.clone(), answer);
                }
            }
            Step::Screenshot(shot) => {
                let frame = self.capture()?;
                let path = inner
                    .artifacts
                    .save_screenshot(inner.state.step_counter, &shot.name, &frame)?;
                self.log(LogLevel::Info, format!("Screenshot saved: {}", path.display()));
            }
            Step::CvDetect(detect) => {
                let frame = self.capture()?;
                let analysis = self.detector.quick_analysis(&frame);
                self.log(
                    LogLevel::Info,
                    format!(
                        "CV: dialog={} buttons={} text_field={} windows={}",
                        analysis.has_dialog,
                        analysis.button_positions.len(),
                        analysis.has_text_field,
                        analysis.window_count
                    ),
                );
                if let Some(issue) = &analysis.diagnostics.possible_issue {
                    self.log(LogLevel::Info, format!("CV diagnostics: {}", issue));
                }
                flatten_analysis(&detect.save_to, &analysis, &mut inner.state.variables);
            }
            Step::CvFindDialog(target) => {
                let frame = self.capture()?;
                let hit = self.detector.dialog_box(&frame).map(|rect| rect.center());
                self.cv_target(inner, target, hit, false, "Dialog")?;
            }
            Step::CvFindUnlock(target) => {
                let frame = self.capture()?;
                let hit = self.detector.unlock_button(&frame);
                self.cv_target(inner, target, hit, true, "Unlock button")?;
            }
            Step::CvFindTextField(target) => {
                let frame = self.capture()?;
                let hit = self.detector.text_field(&frame);
                self.cv_target(inner, target, hit, true, "Text field")?;
            }
            Step::Unknown { action } => {
                self.soft_error(&mut inner.state, format!("Unknown action: {}", action));
            }
        }
        Ok(())
    }

    /// Shared tail of the geometric find actions
    fn cv_target(
        &self,
        inner: &mut EngineInner,
        target: &CvTargetStep,
        hit: Option<Point>,
        click_by_default: bool,
        what: &str,
    ) -> StepResult {
        let Some(point) = hit else {
            self.soft_error(&mut inner.state, format!("{} not found", what));
            return Ok(());
        };

        self.log(LogLevel::Success, format!("{} found at ({}, {})", what, point.x, point.y));
        if let Some(name) = &target.save_to {
            inner.state.variables.insert(name.clone(), point.to_string());
        }
        if target.click.unwrap_or(click_by_default) {
            self.controller.click(point.x, point.y)?;
        }
        Ok(())
    }

    /// Run an oracle query off the calling thread so cancellation does not
    /// wait out the request timeout
    fn ask<T, F>(&self, frame: RgbImage, query: F) -> Result<T, StepFault>
    where
        T: Send + 'static,
        F: FnOnce(&SemanticLocator, &RgbImage) -> VlmResult<T> + Send + 'static,
    {
        let locator = self.locator.clone();
        match self.cancel.run(move || query(&locator, &frame)) {
            Some(result) => Ok(result?),
            None => Err(StepFault::Interrupted),
        }
    }

    /// Capture a frame and publish it for live preview
    fn capture(&self) -> Result<RgbImage, RemoteError> {
        let frame = self.controller.capture()?;
        self.status.frame_hub().publish(frame.clone());
        Ok(frame)
    }

    fn debug_frame(&self, inner: &EngineInner, name: &str) {
        let saved = self
            .capture()
            .map_err(|e| e.to_string())
            .and_then(|frame| {
                inner
                    .artifacts
                    .save_screenshot(inner.state.step_counter, name, &frame)
                    .map_err(|e| e.to_string())
            });
        match saved {
            Ok(path) => debug!(path = %path.display(), "debug frame saved"),
            Err(e) => warn!(frame = name, error = %e, "debug frame skipped"),
        }
    }

    fn soft_error(&self, state: &mut EngineState, message: String) {
        self.log(LogLevel::Error, message.clone());
        state.errors.push(message);
    }

    /// Emit through tracing and mirror into the status board
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => info!("{}", message),
            LogLevel::Error => warn!("{}", message),
            LogLevel::Debug => debug!("{}", message),
        }
        self.status.log(level, message);
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockDesktop, RemoteCall};
    use crate::vlm::{ScriptedOracle, VlmError};
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Instant;

    const BACKGROUND: [u8; 3] = [40, 40, 40];

    fn engine_with(desktop: Arc<MockDesktop>, oracle: ScriptedOracle, dir: &std::path::Path) -> AutomationEngine {
        let options = EngineOptions::default()
            .output_dir(dir)
            .settle_delay(Duration::ZERO);
        AutomationEngine::new(desktop, Arc::new(oracle), options)
    }

    fn login_desktop() -> Arc<MockDesktop> {
        let desktop = MockDesktop::with_color(800, 600, BACKGROUND);
        desktop.draw_rect(250, 200, 300, 200, [230, 230, 230]);
        desktop.draw_rect(270, 340, 110, 40, [60, 120, 200]);
        desktop.draw_rect(420, 340, 110, 40, [60, 120, 200]);
        Arc::new(desktop)
    }

    #[test]
    fn test_resolve_position() {
        assert_eq!(resolve_position("top-left", 800, 600), Some(Point::new(200, 150)));
        assert_eq!(resolve_position("center", 801, 601), Some(Point::new(400, 300)));
        assert_eq!(resolve_position("bottom-right", 800, 600), Some(Point::new(600, 450)));
        assert_eq!(resolve_position("top-center", 800, 600), Some(Point::new(400, 150)));
        assert_eq!(resolve_position("middle", 800, 600), None);
    }

    #[test]
    fn test_plain_actions_map_one_to_one() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(64, 48));
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());

        let steps = vec![
            Step::Connect,
            Step::click(10, 20),
            Step::type_text("hunter2"),
            Step::key("enter"),
            Step::key("F5"),
            Step::wait(0.0),
            Step::Disconnect,
        ];
        let report = engine.execute(&steps, "plain").unwrap();

        assert!(report.is_clean());
        assert_eq!(report.steps_run, 7);
        assert_eq!(
            desktop.actions(),
            vec![
                RemoteCall::Connect,
                RemoteCall::Click { x: 10, y: 20 },
                RemoteCall::Type("hunter2".to_string()),
                RemoteCall::Key(Key::Enter),
                RemoteCall::Key(Key::Other("F5".to_string())),
                RemoteCall::Disconnect,
            ]
        );
        assert_eq!(desktop.calls().len(), desktop.actions().len());
    }

    #[test]
    fn test_find_and_click_not_found_records_one_error() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(800, 600));
        let oracle = ScriptedOracle::new().reply("I can't find it").reply("NOT-FOUND");
        let engine = engine_with(desktop.clone(), oracle, tmp.path());

        let steps = vec![Step::Connect, Step::wait(0.01), Step::find_and_click("X"), Step::Disconnect];
        let report = engine.execute(&steps, "missing").unwrap();

        assert_eq!(report.errors, vec!["Element not found: X".to_string()]);
        assert!(!desktop.is_connected());
        assert!(!desktop.actions().iter().any(|c| matches!(c, RemoteCall::Click { .. })));
    }

    #[test]
    fn test_find_and_click_clicks_reported_point() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(800, 600));
        let oracle = ScriptedOracle::new().reply(r#"{"found": true, "x": 120, "y": 45, "confidence": 88}"#);
        let engine = engine_with(desktop.clone(), oracle, tmp.path());

        let report = engine
            .execute(&[Step::Connect, Step::find_and_click("OK button")], "found")
            .unwrap();

        assert!(report.is_clean());
        assert!(desktop.calls().contains(&RemoteCall::Click { x: 120, y: 45 }));
        // Teardown disconnected the session left open by the scenario
        assert_eq!(desktop.actions().last(), Some(&RemoteCall::Disconnect));
    }

    #[test]
    fn test_soft_errors_accumulate_and_run_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(800, 600));
        let oracle = ScriptedOracle::new().reply("No.").reply("A login prompt");
        let engine = engine_with(desktop.clone(), oracle, tmp.path());

        let steps = vec![
            Step::Connect,
            Step::verify("a desktop"),
            Step::click_position("middle"),
            Step::Unknown {
                action: "teleport".to_string(),
            },
            Step::analyze("What is shown?", Some("screen")),
            Step::click_position("bottom-left"),
        ];
        let report = engine.execute(&steps, "soft").unwrap();

        assert_eq!(
            report.errors,
            vec![
                "Verification failed: a desktop".to_string(),
                "Unknown position: middle".to_string(),
                "Unknown action: teleport".to_string(),
            ]
        );
        assert_eq!(report.variables.get("screen").map(String::as_str), Some("A login prompt"));
        assert!(desktop.calls().contains(&RemoteCall::Click { x: 200, y: 450 }));
        assert_eq!(engine.errors(), report.errors);
    }

    #[test]
    fn test_hard_failure_reports_index_and_tears_down() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(800, 600));
        let oracle = ScriptedOracle::new().fail(VlmError::Timeout(Duration::from_secs(120)));
        let engine = engine_with(desktop.clone(), oracle, tmp.path());

        let steps = vec![
            Step::Connect,
            Step::Unknown {
                action: "noop".to_string(),
            },
            Step::verify("anything"),
            Step::click(1, 1),
        ];
        let err = engine.execute(&steps, "hard").unwrap_err();

        match err {
            EngineError::Step { index, action, source } => {
                assert_eq!(index, 3);
                assert_eq!(action, "verify");
                assert!(matches!(source, StepFault::Oracle(VlmError::Timeout(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!desktop.is_connected());
        assert!(!desktop.calls().contains(&RemoteCall::Click { x: 1, y: 1 }));
        assert_eq!(engine.errors(), vec!["Unknown action: noop".to_string()]);
        assert!(!engine.status().snapshot().is_executing);
    }

    #[test]
    fn test_connect_failure_is_hard() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        desktop.fail_connect(true);
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());

        let err = engine.execute(&[Step::Connect, Step::click(1, 1)], "refused").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Step {
                index: 1,
                source: StepFault::Remote(RemoteError::Connect(_)),
                ..
            }
        ));
    }

    #[test]
    fn test_cv_actions() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = login_desktop();
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());

        let steps = vec![
            Step::Connect,
            Step::CvDetect(crate::script::CvDetectStep {
                save_to: "ui".to_string(),
            }),
            Step::CvFindDialog(CvTargetStep {
                click: None,
                save_to: Some("dialog".to_string()),
            }),
            Step::CvFindUnlock(CvTargetStep::default()),
            Step::CvFindTextField(CvTargetStep::default()),
        ];
        let report = engine.execute(&steps, "cv").unwrap();

        assert_eq!(report.errors, vec!["Text field not found".to_string()]);
        assert_eq!(report.variables.get("ui_has_dialog").map(String::as_str), Some("true"));
        assert_eq!(report.variables.get("ui_is_blank").map(String::as_str), Some("false"));
        let dialog: Vec<i32> = report.variables["dialog"]
            .split(',')
            .map(|v| v.parse().unwrap())
            .collect();
        assert!((dialog[0] - 400).abs() <= 3 && (dialog[1] - 300).abs() <= 3, "{dialog:?}");

        let clicks: Vec<_> = desktop
            .actions()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::Click { x, y } => Some((x, y)),
                _ => None,
            })
            .collect();
        // Only the unlock lookup clicks by default
        assert_eq!(clicks.len(), 1);
        let (x, y) = clicks[0];
        assert!((x - 475).abs() <= 3 && (y - 360).abs() <= 3, "click at {x},{y}");
    }

    #[test]
    fn test_cv_find_unlock_without_dialog_is_soft() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::with_color(800, 600, BACKGROUND));
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());

        let report = engine
            .execute(&[Step::Connect, Step::CvFindUnlock(CvTargetStep::default())], "locked")
            .unwrap();
        assert_eq!(report.errors, vec!["Unlock button not found".to_string()]);
    }

    #[test]
    fn test_screenshot_and_debug_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(32, 24));
        let options = EngineOptions::default()
            .output_dir(tmp.path())
            .settle_delay(Duration::ZERO)
            .debug_frames(true);
        let engine = AutomationEngine::new(desktop, Arc::new(ScriptedOracle::new()), options);

        let steps = vec![Step::Connect, Step::screenshot("login page"), Step::Disconnect];
        engine.execute(&steps, "shots").unwrap();

        let names: Vec<String> = ArtifactDir::new(tmp.path())
            .list_screenshots()
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        // before_connect fails (not connected yet) and is skipped
        assert_eq!(names.len(), 3, "{names:?}");
        assert!(names.iter().any(|n| n.ends_with("_001_after_connect.png")));
        assert!(names.iter().any(|n| n.ends_with("_002_before_screenshot.png")));
        assert!(names.iter().any(|n| n.ends_with("_002_login_page.png")));
    }

    #[test]
    fn test_state_resets_between_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        let engine = engine_with(desktop, ScriptedOracle::new(), tmp.path());

        let steps = vec![Step::Unknown { action: "x".into() }];
        assert_eq!(engine.execute(&steps, "a").unwrap().errors.len(), 1);
        assert_eq!(engine.execute(&steps, "b").unwrap().errors.len(), 1);
    }

    #[test]
    fn test_execute_step_accumulates() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());

        engine.execute_step(&Step::Connect, 1).unwrap();
        engine.execute_step(&Step::Unknown { action: "a".into() }, 2).unwrap();
        engine.execute_step(&Step::Unknown { action: "b".into() }, 3).unwrap();

        assert!(desktop.is_connected());
        assert_eq!(engine.errors().len(), 2);
        assert_eq!(engine.status().snapshot().current_step, 3);

        drop(engine);
        assert!(!desktop.is_connected());
    }

    #[test]
    fn test_busy_engine_rejects_second_request() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        let engine = Arc::new(engine_with(desktop, ScriptedOracle::new(), tmp.path()));

        let runner = {
            let engine = engine.clone();
            thread::spawn(move || engine.execute(&[Step::wait(0.0), Step::wait(1.0)], "slow"))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.status().snapshot().current_step != 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let second = engine.execute_step(&Step::click(1, 1), 7);
        assert!(matches!(second, Err(EngineError::Busy)));
        assert_eq!(engine.status().snapshot().current_step, 2);

        assert!(runner.join().unwrap().is_ok());
    }

    #[test]
    fn test_cancellation_interrupts_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());
        let token = engine.cancel_token();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        });
        let started = Instant::now();
        let err = engine
            .execute(&[Step::Connect, Step::wait(30.0), Step::click(1, 1)], "cancel")
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, EngineError::Interrupted { step: 2 }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!desktop.is_connected());
    }

    /// Oracle that takes far longer than any test should wait
    struct SlowOracle(Duration);

    impl VisionOracle for SlowOracle {
        fn generate(&self, _frame: &RgbImage, _prompt: &str) -> VlmResult<String> {
            thread::sleep(self.0);
            Ok("YES".to_string())
        }
    }

    #[test]
    fn test_cancellation_does_not_wait_for_oracle() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(64, 48));
        let options = EngineOptions::default()
            .output_dir(tmp.path())
            .settle_delay(Duration::ZERO);
        let engine = AutomationEngine::new(desktop.clone(), Arc::new(SlowOracle(Duration::from_secs(3))), options);
        let token = engine.cancel_token();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let started = Instant::now();
        let err = engine
            .execute(&[Step::Connect, Step::verify("a login prompt"), Step::click(1, 1)], "slow oracle")
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, EngineError::Interrupted { step: 2 }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        assert!(!desktop.is_connected());
        assert!(!desktop.calls().contains(&RemoteCall::Click { x: 1, y: 1 }));
    }

    #[test]
    fn test_engine_runs_again_after_interruption() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        let engine = engine_with(desktop.clone(), ScriptedOracle::new(), tmp.path());

        let token = engine.cancel_token();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let err = engine
            .execute(&[Step::Connect, Step::wait(30.0)], "first")
            .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, EngineError::Interrupted { step: 2 }), "{err}");
        assert!(engine.cancel_token().is_cancelled());

        let report = engine.execute(&[Step::Connect, Step::Disconnect], "second").unwrap();
        assert_eq!(report.steps_run, 2);
        assert_eq!(
            desktop.actions(),
            vec![
                RemoteCall::Connect,
                RemoteCall::Disconnect,
                RemoteCall::Connect,
                RemoteCall::Disconnect,
            ]
        );

        engine.cancel_token().cancel();
        engine.execute_step(&Step::Connect, 1).unwrap();
        assert!(desktop.is_connected());
    }

    #[test]
    fn test_invalid_wait_is_logged_and_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(8, 8));
        let engine = engine_with(desktop, ScriptedOracle::new(), tmp.path());

        let started = Instant::now();
        let report = engine
            .execute(&[Step::wait(-1.0), Step::wait(f64::NAN)], "typo")
            .unwrap();

        assert!(report.is_clean());
        assert!(started.elapsed() < Duration::from_secs(1));
        let messages: Vec<String> = engine
            .status()
            .snapshot()
            .recent_logs
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(messages.contains(&"Invalid wait of -1 seconds, not waiting".to_string()), "{messages:?}");
        assert!(messages.contains(&"Invalid wait of NaN seconds, not waiting".to_string()), "{messages:?}");
    }

    #[test]
    fn test_recording_is_stopped_on_return() {
        let tmp = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new(32, 24));
        let mut options = EngineOptions::default()
            .output_dir(tmp.path())
            .settle_delay(Duration::ZERO)
            .record(true);
        options.recorder.fps = 20;
        options.recorder.resolution = (32, 24);
        let engine = AutomationEngine::new(desktop, Arc::new(ScriptedOracle::new()), options);

        let report = engine
            .execute(&[Step::Connect, Step::wait(0.3), Step::Disconnect], "recorded")
            .unwrap();

        let stats = report.recording.unwrap();
        assert!(stats.file.exists());
        assert!(stats.file.starts_with(tmp.path().join("videos")));
        assert!(!engine.status().snapshot().recording);
        assert_eq!(engine.last_recording(), Some(stats));
    }
}
