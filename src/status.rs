//! Live status shared with dashboards and other observers.
//!
//! [`FrameHub`] holds the most recently captured frame. [`StatusBoard`]
//! holds run progress plus a bounded log ring. Every accessor takes a short
//! lock and copies out; PNG encoding happens after the lock is released, so a
//! slow reader never stalls the interpreter or the recorder thread.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Number of log entries kept for snapshots
pub const LOG_CAPACITY: usize = 200;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Latest captured frame, shared between producers and readers
#[derive(Debug, Clone, Default)]
pub struct FrameHub {
    latest: Arc<Mutex<Option<Arc<RgbImage>>>>,
}

impl FrameHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the latest frame
    pub fn publish(&self, frame: RgbImage) {
        let frame = Arc::new(frame);
        *lock(&self.latest) = Some(frame);
    }

    pub fn latest(&self) -> Option<Arc<RgbImage>> {
        lock(&self.latest).clone()
    }

    /// Latest frame as PNG bytes
    pub fn latest_png(&self) -> Option<Vec<u8>> {
        let frame = self.latest()?;
        let mut png = Vec::new();
        match frame.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png) {
            Ok(()) => Some(png),
            Err(e) => {
                warn!(error = %e, "failed to encode preview frame");
                None
            }
        }
    }
}

/// Severity of a board log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Error,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Point-in-time copy of the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub recording: bool,
    pub scenario: Option<String>,
    pub current_step: usize,
    pub total_steps: usize,
    pub is_executing: bool,
    pub recent_logs: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct Progress {
    connected: bool,
    recording: bool,
    scenario: Option<String>,
    current_step: usize,
    total_steps: usize,
    is_executing: bool,
}

/// Run progress, log ring and latest frame
#[derive(Debug, Default)]
pub struct StatusBoard {
    progress: Mutex<Progress>,
    logs: Mutex<VecDeque<LogEntry>>,
    frames: FrameHub,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for frame producers (recorder, interpreter captures)
    pub fn frame_hub(&self) -> FrameHub {
        self.frames.clone()
    }

    pub fn begin_run(&self, scenario: &str, total_steps: usize) {
        let mut p = lock(&self.progress);
        p.scenario = Some(scenario.to_string());
        p.total_steps = total_steps;
        p.current_step = 0;
    }

    pub fn set_current_step(&self, step: usize) {
        lock(&self.progress).current_step = step;
    }

    pub fn set_executing(&self, executing: bool) {
        lock(&self.progress).is_executing = executing;
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.progress).connected = connected;
    }

    pub fn set_recording(&self, recording: bool) {
        lock(&self.progress).recording = recording;
    }

    /// Append to the log ring, dropping the oldest entry when full
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        let mut logs = lock(&self.logs);
        if logs.len() == LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(entry);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let recent_logs = lock(&self.logs).iter().cloned().collect();
        let p = lock(&self.progress);
        StatusSnapshot {
            connected: p.connected,
            recording: p.recording,
            scenario: p.scenario.clone(),
            current_step: p.current_step,
            total_steps: p.total_steps,
            is_executing: p.is_executing,
            recent_logs,
        }
    }

    pub fn latest_frame_png(&self) -> Option<Vec<u8>> {
        self.frames.latest_png()
    }
}
