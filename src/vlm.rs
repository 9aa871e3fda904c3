//! Vision language model client and the semantic element locator.
//!
//! Provides:
//! - [`VisionOracle`]: anything that answers a prompt about a frame
//! - [`OllamaClient`]: the HTTP oracle (`POST {url}/api/generate`)
//! - [`SemanticLocator`]: two-phase element location, yes/no verification and
//!   open questions on top of any oracle
//! - [`ScriptedOracle`]: a queue of canned replies for tests and offline runs
//!
//! # Configuration
//!
//! Defaults come from [`crate::config`]:
//! - `REMOTE_PILOT_OLLAMA_URL`: base URL
//! - `REMOTE_PILOT_OLLAMA_MODEL`: model name
//! - `REMOTE_PILOT_VLM_TIMEOUT`: whole-request timeout (seconds)

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use base64::Engine;
use image::RgbImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config;
use crate::detect::Point;

/// Result type for VLM operations
pub type VlmResult<T> = Result<T, VlmError>;

/// Errors that can occur while talking to the oracle
#[derive(Debug, Error)]
pub enum VlmError {
    /// The request did not complete within the timeout
    #[error("oracle timed out after {0:?} - model may not be pulled or the server is overloaded")]
    Timeout(Duration),

    /// The server could not be reached at all
    #[error("cannot reach oracle at {0} - check that the service is running")]
    Unreachable(String),

    /// The server answered with a non-200 status
    #[error("oracle returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// The body was not the expected JSON shape
    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),

    /// The frame could not be encoded as PNG
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Answers a prompt about a frame
pub trait VisionOracle: Send + Sync {
    fn generate(&self, frame: &RgbImage, prompt: &str) -> VlmResult<String>;
}

/// Configuration for the HTTP oracle client
#[derive(Debug, Clone)]
pub struct VlmConfig {
    /// Base URL, e.g. `http://localhost:11434`
    pub url: String,
    /// Model name to use
    pub model: String,
    /// Whole-request timeout (seconds)
    pub timeout: u64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            url: cfg.vlm.url.clone(),
            model: cfg.vlm.model.clone(),
            timeout: cfg.vlm.timeout,
        }
    }
}

impl VlmConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama-compatible oracle over HTTP
pub struct OllamaClient {
    config: VlmConfig,
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(config: VlmConfig) -> VlmResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| VlmError::Unreachable(format!("{} ({})", config.url, e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &VlmConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.config.url.trim_end_matches('/'))
    }

    fn classify(&self, e: reqwest::Error) -> VlmError {
        if e.is_timeout() {
            VlmError::Timeout(Duration::from_secs(self.config.timeout))
        } else if e.is_connect() {
            VlmError::Unreachable(self.config.url.clone())
        } else {
            VlmError::InvalidResponse(e.to_string())
        }
    }
}

impl VisionOracle for OllamaClient {
    fn generate(&self, frame: &RgbImage, prompt: &str) -> VlmResult<String> {
        let image = encode_png_base64(frame)?;
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            images: vec![image],
            stream: false,
        };

        info!(model = %self.config.model, "querying oracle");
        let started = Instant::now();

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().map_err(|e| self.classify(e))?;
        let elapsed = started.elapsed();

        if !status.is_success() {
            warn!(status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "oracle error");
            return Err(VlmError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).map_err(|e| VlmError::InvalidResponse(e.to_string()))?;
        info!(elapsed_ms = elapsed.as_millis() as u64, "oracle answered");
        Ok(parsed.response)
    }
}

/// PNG-encode a frame and wrap it in base64
pub fn encode_png_base64(frame: &RgbImage) -> VlmResult<String> {
    let mut png = Vec::new();
    frame.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png))
}

/// Check if the oracle answers HTTP at all (`GET {url}/api/tags`).
///
/// Any status counts as reachable; only transport failures return `false`.
pub fn check_health(url: &str, timeout_secs: u64) -> VlmResult<bool> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| VlmError::Unreachable(format!("{} ({})", url, e)))?;

    match client.get(format!("{}/api/tags", url.trim_end_matches('/'))).send() {
        Ok(response) => {
            debug!(status = response.status().as_u16(), "oracle health");
            Ok(true)
        }
        Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
        Err(e) => Err(VlmError::InvalidResponse(e.to_string())),
    }
}

/// Oracle returning queued replies in order, recording every prompt
///
/// Once the queue is empty every call returns an empty reply.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<VlmResult<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    /// Queue a failure
    pub fn fail(self, error: VlmError) -> Self {
        self.push(Err(error));
        self
    }

    pub fn push(&self, reply: VlmResult<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(reply);
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl VisionOracle for ScriptedOracle {
    fn generate(&self, _frame: &RgbImage, prompt: &str) -> VlmResult<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.to_string());
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Outcome of a semantic element search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocateResult {
    pub found: bool,
    pub x: Option<i32>,
    pub y: Option<i32>,
    /// Advisory only, 0..=100
    pub confidence: Option<u8>,
}

impl LocateResult {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn at(point: Point, confidence: u8) -> Self {
        Self {
            found: true,
            x: Some(point.x),
            y: Some(point.y),
            confidence: Some(confidence),
        }
    }

    /// Click target when found
    pub fn point(&self) -> Option<Point> {
        match (self.found, self.x, self.y) {
            (true, Some(x), Some(y)) => Some(Point::new(x, y)),
            _ => None,
        }
    }
}

/// Confidence assigned to a coarse region answer
pub const REGION_CONFIDENCE: u8 = 60;

/// Region tokens in match order ("NOT-FOUND" matches none)
const REGIONS: [&str; 5] = ["TOP-LEFT", "TOP-RIGHT", "BOTTOM-LEFT", "BOTTOM-RIGHT", "CENTER"];

static JSON_OBJECT: OnceLock<Option<Regex>> = OnceLock::new();

/// First brace-delimited span without nested closing braces
pub fn extract_json_object(text: &str) -> Option<&str> {
    let re = JSON_OBJECT.get_or_init(|| Regex::new(r"\{[^}]+\}").ok()).as_ref()?;
    re.find(text).map(|m| m.as_str())
}

/// Parse a phase-1 reply; `None` unless it reports `found: true` with coordinates
pub fn parse_locate_reply(reply: &str) -> Option<LocateResult> {
    let value: serde_json::Value = serde_json::from_str(extract_json_object(reply)?).ok()?;
    if value.get("found").and_then(|v| v.as_bool()) != Some(true) {
        return None;
    }
    let x = value.get("x").and_then(|v| v.as_f64())?;
    let y = value.get("y").and_then(|v| v.as_f64())?;
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|c| c.clamp(0.0, 100.0).round() as u8);

    Some(LocateResult {
        found: true,
        x: Some(x.round() as i32),
        y: Some(y.round() as i32),
        confidence,
    })
}

/// Map a phase-2 region answer to a point on a `width x height` screen
pub fn parse_region_reply(reply: &str, width: u32, height: u32) -> Option<Point> {
    let answer = reply.trim().to_uppercase();
    let (w, h) = (width as i32, height as i32);
    let token = REGIONS.iter().find(|token| answer.contains(*token))?;
    let point = match *token {
        "TOP-LEFT" => Point::new(w / 4, h / 4),
        "TOP-RIGHT" => Point::new(3 * w / 4, h / 4),
        "BOTTOM-LEFT" => Point::new(w / 4, 3 * h / 4),
        "BOTTOM-RIGHT" => Point::new(3 * w / 4, 3 * h / 4),
        _ => Point::new(w / 2, h / 2),
    };
    Some(point)
}

fn locate_prompt(description: &str, width: u32, height: u32) -> String {
    format!(
        r#"Analyze this screenshot (size: {width}x{height} pixels) and locate: {description}

Look carefully at the entire screen. If you can see this element, estimate its center position in pixels.

Respond ONLY with JSON format:
{{"found": true, "x": <pixel_x>, "y": <pixel_y>, "confidence": <0-100>}}

If not visible, respond:
{{"found": false}}

Example responses:
{{"found": true, "x": 150, "y": 80, "confidence": 90}}
{{"found": false}}"#
    )
}

fn region_prompt(description: &str) -> String {
    format!(
        r#"Look at this screenshot. Can you see: {description}?

Answer with ONLY:
- "TOP-LEFT" if it's in the top-left quarter
- "TOP-RIGHT" if it's in the top-right quarter
- "BOTTOM-LEFT" if it's in the bottom-left quarter
- "BOTTOM-RIGHT" if it's in the bottom-right quarter
- "CENTER" if it's in the center
- "NOT-FOUND" if you cannot see it

One word only."#
    )
}

/// Natural-language element location on top of an oracle
#[derive(Clone)]
pub struct SemanticLocator {
    oracle: Arc<dyn VisionOracle>,
}

impl SemanticLocator {
    pub fn new(oracle: Arc<dyn VisionOracle>) -> Self {
        Self { oracle }
    }

    /// Locate an element: exact coordinates first, coarse region second
    ///
    /// A reply the parser cannot use is a normal not-found outcome; only
    /// transport failures are errors.
    pub fn find_element(&self, frame: &RgbImage, description: &str) -> VlmResult<LocateResult> {
        let (width, height) = frame.dimensions();

        let reply = self.oracle.generate(frame, &locate_prompt(description, width, height))?;
        if let Some(result) = parse_locate_reply(&reply) {
            return Ok(result);
        }
        debug!(reply = %reply, "no coordinates in reply, asking for region");

        let reply = self.oracle.generate(frame, &region_prompt(description))?;
        Ok(parse_region_reply(&reply, width, height)
            .map(|p| LocateResult::at(p, REGION_CONFIDENCE))
            .unwrap_or_else(LocateResult::not_found))
    }

    /// Yes/no check; any reply containing "yes" passes
    pub fn verify(&self, frame: &RgbImage, expected: &str) -> VlmResult<bool> {
        let prompt = format!("Check if the screen shows: {}. Answer only YES or NO.", expected);
        let reply = self.oracle.generate(frame, &prompt)?;
        Ok(reply.to_lowercase().contains("yes"))
    }

    /// Open question, raw answer
    pub fn analyze(&self, frame: &RgbImage, question: &str) -> VlmResult<String> {
        self.oracle.generate(frame, question)
    }
}
