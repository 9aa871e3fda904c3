pub mod interpreter;
pub mod types;

pub use interpreter::{AutomationEngine, resolve_position};
pub use crate::cancel::CancelToken;
pub use types::{EngineError, EngineOptions, EngineResult, EngineState, RunReport, StepFault};
