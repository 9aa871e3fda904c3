//! Remote Pilot - scripted remote desktop automation.
//!
//! This crate provides:
//! - A step interpreter driving VNC, RDP and SPICE sessions from YAML scenarios
//! - Geometric screen detection (dialogs, buttons, text fields, blank screens)
//! - Vision model fallback for natural-language element location
//! - Background session recording and a live status board
//! - MockDesktop for testing without a remote machine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remote_pilot::cancel::CancelToken;
//! use remote_pilot::engine::{AutomationEngine, EngineOptions};
//! use remote_pilot::remote::controller_for;
//! use remote_pilot::script::load_document;
//! use remote_pilot::vlm::{OllamaClient, VlmConfig};
//!
//! let doc = load_document("scenarios.yaml".as_ref()).unwrap();
//! let oracle = OllamaClient::new(VlmConfig::new(&doc.ollama.url).model(&doc.ollama.model)).unwrap();
//! let cancel = CancelToken::new();
//! let controller = controller_for(&doc.connection, &cancel);
//! let engine = AutomationEngine::new(controller, Arc::new(oracle), EngineOptions::default())
//!     .with_cancel_token(cancel);
//! let report = engine.execute(doc.scenario("hello_world").unwrap(), "hello_world").unwrap();
//! println!("{} soft errors", report.errors.len());
//! ```

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod detect;
pub mod engine;
pub mod recorder;
pub mod remote;
pub mod script;
pub mod status;
pub mod vlm;

// Re-export engine types
pub use engine::{AutomationEngine, CancelToken, EngineError, EngineOptions, EngineResult, RunReport};

// Re-export remote session types
pub use remote::{ConnectionSettings, Key, MockDesktop, Protocol, RemoteController, RemoteError, controller_for};

// Re-export scenario loading
pub use script::{ScenarioDocument, ScriptError, Step, load_document, parse_document};

// Re-export detection
pub use detect::{DetectorConfig, GeometricDetector, Point, QuickAnalysis, Rect, ScreenDiagnostics};

// Re-export VLM client
pub use vlm::{LocateResult, OllamaClient, SemanticLocator, VisionOracle, VlmConfig, VlmError, VlmResult, check_health};

// Re-export recording and status
pub use recorder::{RecorderConfig, RecordingStats, SessionRecorder};
pub use status::{FrameHub, StatusBoard, StatusSnapshot};
