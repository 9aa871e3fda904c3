//! Background screen recorder.
//!
//! A dedicated thread samples a capture function at a fixed rate and appends
//! each frame to an animated GIF. Sampling never blocks the caller; a failed
//! capture only skips that frame. Statistics are computed from wall time and
//! the real frame count so the achieved rate can be compared to the target.

use std::fmt::Display;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::buffer::ConvertBuffer;
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, Frame, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactDir, generate_timestamp, sanitize_name};
use crate::config;
use crate::status::FrameHub;

/// How long `stop` waits for the sampling thread
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type RecorderResult<T> = Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("cannot open recording target {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot start recorder thread: {0}")]
    Spawn(std::io::Error),
}

/// Recorder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Run output root; recordings go to `<output_dir>/videos`
    pub output_dir: PathBuf,
    /// Target sample rate
    pub fps: u32,
    /// Encoded frame size
    pub resolution: (u32, u32),
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            output_dir: cfg.output.dir.clone(),
            fps: cfg.recorder.fps,
            resolution: (cfg.recorder.width, cfg.recorder.height),
        }
    }
}

/// Summary of a finished recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStats {
    pub file: PathBuf,
    pub frames: u64,
    pub duration_secs: f64,
    /// Target rate
    pub fps: u32,
    /// Achieved rate (`frames / duration`)
    pub actual_fps: f64,
    pub size_bytes: u64,
}

struct ActiveRecording {
    path: PathBuf,
    fps: u32,
    started: Instant,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// One recording at a time, sampled on its own thread
pub struct SessionRecorder {
    config: RecorderConfig,
    hub: Option<FrameHub>,
    active: Option<ActiveRecording>,
}

impl SessionRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            hub: None,
            active: None,
        }
    }

    /// Publish every sampled frame to `hub`
    pub fn with_frame_hub(mut self, hub: FrameHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Start sampling `capture` into `<output_dir>/videos/{label}_{timestamp}.gif`
    ///
    /// Frames are scaled to `resolution` before encoding. Returns the output path.
    pub fn start<F, E>(&mut self, label: &str, capture: F, resolution: (u32, u32)) -> RecorderResult<PathBuf>
    where
        F: FnMut() -> Result<RgbImage, E> + Send + 'static,
        E: Display + 'static,
    {
        if self.active.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }

        let dir = ArtifactDir::new(&self.config.output_dir).videos_dir();
        let path = dir.join(format!("{}_{}.gif", sanitize_name(label), generate_timestamp()));
        let open_err = |source| RecorderError::Open {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(open_err)?;
        let file = File::create(&path).map_err(open_err)?;

        let fps = self.config.fps.max(1);
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let (done_tx, done) = mpsc::channel();

        let handle = {
            let stop = stop.clone();
            let frames = frames.clone();
            let hub = self.hub.clone();
            thread::Builder::new()
                .name("session-recorder".to_string())
                .spawn(move || {
                    sample_loop(file, capture, fps, resolution, hub, &stop, &frames);
                    let _ = done_tx.send(());
                })
                .map_err(RecorderError::Spawn)?
        };

        info!(path = %path.display(), fps, width = resolution.0, height = resolution.1, "recording started");
        self.active = Some(ActiveRecording {
            path: path.clone(),
            fps,
            started: Instant::now(),
            stop,
            frames,
            done,
            handle: Some(handle),
        });
        Ok(path)
    }

    /// Stop the active recording and return its statistics (`None` when idle)
    pub fn stop(&mut self) -> Option<RecordingStats> {
        let mut active = self.active.take()?;
        active.stop.store(true, Ordering::SeqCst);

        match active.done.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = active.handle.take() {
                    if handle.join().is_err() {
                        warn!("recorder thread panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?JOIN_TIMEOUT, "recorder thread did not stop in time, detaching");
            }
        }

        let duration_secs = active.started.elapsed().as_secs_f64();
        let frames = active.frames.load(Ordering::SeqCst);
        let size_bytes = fs::metadata(&active.path).map(|m| m.len()).unwrap_or(0);
        let actual_fps = if duration_secs > 0.0 {
            frames as f64 / duration_secs
        } else {
            0.0
        };

        info!(
            path = %active.path.display(),
            frames,
            duration_secs,
            actual_fps,
            size_bytes,
            "recording stopped"
        );

        Some(RecordingStats {
            file: active.path,
            frames,
            duration_secs,
            fps: active.fps,
            actual_fps,
            size_bytes,
        })
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop<F, E>(
    file: File,
    mut capture: F,
    fps: u32,
    resolution: (u32, u32),
    hub: Option<FrameHub>,
    stop: &AtomicBool,
    frames: &AtomicU64,
) where
    F: FnMut() -> Result<RgbImage, E>,
    E: Display,
{
    let interval = Duration::from_secs_f64(1.0 / fps as f64);
    let delay = Delay::from_numer_denom_ms(1000, fps);

    let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 10);
    if let Err(e) = encoder.set_repeat(Repeat::Infinite) {
        warn!(error = %e, "cannot set gif loop flag");
    }

    while !stop.load(Ordering::SeqCst) {
        let tick = Instant::now();

        match capture() {
            Ok(frame) => {
                let frame = fit(frame, resolution);
                if let Some(hub) = &hub {
                    hub.publish(frame.clone());
                }
                let rgba: RgbaImage = frame.convert();
                match encoder.encode_frame(Frame::from_parts(rgba, 0, 0, delay)) {
                    Ok(()) => {
                        frames.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => warn!(error = %e, "failed to encode frame"),
                }
            }
            Err(e) => debug!(error = %e, "frame capture failed, skipping"),
        }

        // Sleep only the residual so per-frame cost does not accumulate drift
        let elapsed = tick.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

/// Scale a frame to the recording resolution
fn fit(frame: RgbImage, (width, height): (u32, u32)) -> RgbImage {
    if frame.dimensions() == (width, height) || width == 0 || height == 0 {
        frame
    } else {
        imageops::resize(&frame, width, height, FilterType::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn recorder(dir: &std::path::Path) -> SessionRecorder {
        SessionRecorder::new(RecorderConfig {
            output_dir: dir.to_path_buf(),
            fps: 20,
            resolution: (32, 24),
        })
    }

    #[test]
    fn test_start_stop_produces_gif() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = FrameHub::new();
        let mut rec = recorder(tmp.path()).with_frame_hub(hub.clone());

        let path = rec
            .start("login flow", || Ok::<_, String>(RgbImage::from_pixel(64, 48, Rgb([200, 10, 10]))), (32, 24))
            .unwrap();
        assert!(rec.is_recording());
        assert!(path.starts_with(tmp.path().join("videos")));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("login_flow_"));

        thread::sleep(Duration::from_millis(300));
        let stats = rec.stop().unwrap();

        assert!(!rec.is_recording());
        assert_eq!(stats.file, path);
        assert_eq!(stats.fps, 20);
        assert!(stats.frames > 0);
        assert!(stats.size_bytes > 0);
        assert!(fs::metadata(&path).unwrap().len() > 0);
        assert_eq!(hub.latest().unwrap().dimensions(), (32, 24));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = recorder(tmp.path());
        rec.start("a", || Ok::<_, String>(RgbImage::new(8, 8)), (8, 8)).unwrap();

        let second = rec.start("b", || Ok::<_, String>(RgbImage::new(8, 8)), (8, 8));
        assert!(matches!(second, Err(RecorderError::AlreadyRecording)));
        assert!(rec.stop().is_some());
    }

    #[test]
    fn test_stop_when_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = recorder(tmp.path());
        assert!(rec.stop().is_none());
    }

    #[test]
    fn test_capture_failures_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = recorder(tmp.path());
        let mut calls = 0u32;
        rec.start(
            "flaky",
            move || {
                calls += 1;
                if calls % 2 == 0 {
                    Err("dropped frame")
                } else {
                    Ok(RgbImage::new(32, 24))
                }
            },
            (32, 24),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        let stats = rec.stop().unwrap();
        assert!(stats.frames >= 1);
    }

    #[test]
    fn test_unwritable_target_is_open_error() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the output directory should be
        let blocker = tmp.path().join("blocked");
        fs::write(&blocker, b"x").unwrap();

        let mut rec = recorder(&blocker);
        let result = rec.start("x", || Ok::<_, String>(RgbImage::new(8, 8)), (8, 8));
        assert!(matches!(result, Err(RecorderError::Open { .. })));
        assert!(!rec.is_recording());
    }
}
