//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for remote-pilot, supporting:
//! - Environment variables for all configurable values
//! - Sensible defaults for a local Ollama instance and a `./results` output tree
//! - A cached global instance read once per process
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REMOTE_PILOT_OLLAMA_URL` | Base URL of the vision oracle | `http://localhost:11434` |
//! | `REMOTE_PILOT_OLLAMA_MODEL` | Vision model name | `llava:7b` |
//! | `REMOTE_PILOT_VLM_TIMEOUT` | Oracle request timeout in seconds | `120` |
//! | `REMOTE_PILOT_OUTPUT_DIR` | Root for screenshots and recordings | `./results` |
//! | `REMOTE_PILOT_SETTLE_MS` | Pause after every step (ms) | `500` |
//! | `REMOTE_PILOT_RECORD_FPS` | Recording sample rate | `10` |
//! | `REMOTE_PILOT_RECORD_SIZE` | Recording resolution (`WxH` or preset) | `1280x720` |
//!
//! # Example
//!
//! ```bash
//! # Use a bigger model on another host
//! export REMOTE_PILOT_OLLAMA_URL="http://gpu-box:11434"
//! export REMOTE_PILOT_OLLAMA_MODEL="llava:13b"
//!
//! # Record at 5 fps in 720p
//! export REMOTE_PILOT_RECORD_FPS=5
//! export REMOTE_PILOT_RECORD_SIZE=hd
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default oracle base URL
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default oracle model
pub const DEFAULT_OLLAMA_MODEL: &str = "llava:7b";

/// Default oracle request timeout (seconds)
pub const DEFAULT_VLM_TIMEOUT: u64 = 120;

/// Default output root
pub const DEFAULT_OUTPUT_DIR: &str = "./results";

/// Default settle delay after each step (milliseconds)
pub const DEFAULT_SETTLE_MS: u64 = 500;

/// Default recording frame rate
pub const DEFAULT_RECORD_FPS: u32 = 10;

/// Default recording width (pixels)
pub const DEFAULT_RECORD_WIDTH: u32 = 1280;

/// Default recording height (pixels)
pub const DEFAULT_RECORD_HEIGHT: u32 = 720;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_OLLAMA_URL: &str = "REMOTE_PILOT_OLLAMA_URL";
pub const ENV_OLLAMA_MODEL: &str = "REMOTE_PILOT_OLLAMA_MODEL";
pub const ENV_VLM_TIMEOUT: &str = "REMOTE_PILOT_VLM_TIMEOUT";
pub const ENV_OUTPUT_DIR: &str = "REMOTE_PILOT_OUTPUT_DIR";
pub const ENV_SETTLE_MS: &str = "REMOTE_PILOT_SETTLE_MS";
pub const ENV_RECORD_FPS: &str = "REMOTE_PILOT_RECORD_FPS";
pub const ENV_RECORD_SIZE: &str = "REMOTE_PILOT_RECORD_SIZE";

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for remote-pilot
#[derive(Debug, Clone)]
pub struct Config {
    /// Vision oracle settings
    pub vlm: VlmSettings,
    /// Output locations
    pub output: OutputSettings,
    /// Step interpreter pacing
    pub engine: EngineSettings,
    /// Screen recording
    pub recorder: RecorderSettings,
}

/// Vision oracle settings
#[derive(Debug, Clone)]
pub struct VlmSettings {
    /// Base URL (without `/api/generate`)
    pub url: String,
    /// Model identifier
    pub model: String,
    /// Whole-request timeout (seconds)
    pub timeout: u64,
}

/// Output locations
#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Root directory; screenshots and videos live in subdirectories
    pub dir: PathBuf,
}

/// Step interpreter pacing
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Settle delay inserted after every step (milliseconds)
    pub settle_ms: u64,
}

/// Screen recording settings
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            vlm: VlmSettings::from_env(),
            output: OutputSettings::from_env(),
            engine: EngineSettings::from_env(),
            recorder: RecorderSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            vlm: VlmSettings::defaults(),
            output: OutputSettings::defaults(),
            engine: EngineSettings::defaults(),
            recorder: RecorderSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl VlmSettings {
    pub fn from_env() -> Self {
        Self {
            url: env::var(ENV_OLLAMA_URL).unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string()),
            model: env::var(ENV_OLLAMA_MODEL).unwrap_or_else(|_| DEFAULT_OLLAMA_MODEL.to_string()),
            timeout: parse_env(ENV_VLM_TIMEOUT).unwrap_or(DEFAULT_VLM_TIMEOUT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_OLLAMA_MODEL.to_string(),
            timeout: DEFAULT_VLM_TIMEOUT,
        }
    }
}

impl OutputSettings {
    pub fn from_env() -> Self {
        Self {
            dir: env::var(ENV_OUTPUT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        }
    }

    pub fn defaults() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            settle_ms: parse_env(ENV_SETTLE_MS).unwrap_or(DEFAULT_SETTLE_MS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl RecorderSettings {
    pub fn from_env() -> Self {
        let (width, height) = env::var(ENV_RECORD_SIZE)
            .ok()
            .and_then(|s| parse_resolution(&s))
            .unwrap_or((DEFAULT_RECORD_WIDTH, DEFAULT_RECORD_HEIGHT));

        Self {
            fps: parse_env(ENV_RECORD_FPS)
                .filter(|fps| *fps > 0)
                .unwrap_or(DEFAULT_RECORD_FPS),
            width,
            height,
        }
    }

    pub fn defaults() -> Self {
        Self {
            fps: DEFAULT_RECORD_FPS,
            width: DEFAULT_RECORD_WIDTH,
            height: DEFAULT_RECORD_HEIGHT,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a resolution string into (width, height)
/// Supports: "vga" (640x480), "svga" (800x600), "hd" (1280x720), "fhd" (1920x1080), or "WxH"
pub fn parse_resolution(size: &str) -> Option<(u32, u32)> {
    match size.trim().to_lowercase().as_str() {
        "vga" => Some((640, 480)),
        "svga" => Some((800, 600)),
        "hd" => Some((1280, 720)),
        "fhd" => Some((1920, 1080)),
        custom => {
            let (w, h) = custom.split_once('x')?;
            let w: u32 = w.parse().ok()?;
            let h: u32 = h.parse().ok()?;
            (w > 0 && h > 0).then_some((w, h))
        }
    }
}
