//! Scenario documents and the typed step model.
//!
//! A document is YAML with three sections:
//!
//! ```yaml
//! connection: { protocol: vnc, host: localhost, port: 5900, password: "" }
//! ollama: { url: "http://localhost:11434", model: "llava:7b" }
//! scenarios:
//!   hello_world:
//!     - action: connect
//!     - action: wait
//!       seconds: 1
//!     - action: disconnect
//! ```
//!
//! Steps are validated while loading: each known `action` is decoded into
//! its own variant with only the fields it uses, and a known action missing a
//! required field is a load error. Unknown actions load as
//! [`Step::Unknown`] and are reported at run time.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config;
use crate::remote::ConnectionSettings;

pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("scenario '{name}' does not exist (available: {})", available.join(", "))]
    UnknownScenario { name: String, available: Vec<String> },
}

/// Dispatch key of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Connect,
    Disconnect,
    Wait,
    Click,
    ClickPosition,
    Type,
    Key,
    FindAndClick,
    Verify,
    Analyze,
    Screenshot,
    CvDetect,
    CvFindDialog,
    CvFindUnlock,
    CvFindTextField,
}

impl ActionKind {
    pub const ALL: [ActionKind; 15] = [
        ActionKind::Connect,
        ActionKind::Disconnect,
        ActionKind::Wait,
        ActionKind::Click,
        ActionKind::ClickPosition,
        ActionKind::Type,
        ActionKind::Key,
        ActionKind::FindAndClick,
        ActionKind::Verify,
        ActionKind::Analyze,
        ActionKind::Screenshot,
        ActionKind::CvDetect,
        ActionKind::CvFindDialog,
        ActionKind::CvFindUnlock,
        ActionKind::CvFindTextField,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Connect => "connect",
            ActionKind::Disconnect => "disconnect",
            ActionKind::Wait => "wait",
            ActionKind::Click => "click",
            ActionKind::ClickPosition => "click_position",
            ActionKind::Type => "type",
            ActionKind::Key => "key",
            ActionKind::FindAndClick => "find_and_click",
            ActionKind::Verify => "verify",
            ActionKind::Analyze => "analyze",
            ActionKind::Screenshot => "screenshot",
            ActionKind::CvDetect => "cv_detect",
            ActionKind::CvFindDialog => "cv_find_dialog",
            ActionKind::CvFindUnlock => "cv_find_unlock",
            ActionKind::CvFindTextField => "cv_find_text_field",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_wait() -> f64 {
    1.0
}

fn default_position() -> String {
    "center".to_string()
}

fn default_screenshot_name() -> String {
    "manual".to_string()
}

fn default_cv_prefix() -> String {
    "cv".to_string()
}

/// Accept any YAML scalar as text (`text: 1234` types "1234")
fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("expected a scalar, got {}", other))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitStep {
    #[serde(default = "default_wait")]
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickStep {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickPositionStep {
    #[serde(default = "default_position")]
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeStep {
    #[serde(deserialize_with = "scalar_string")]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStep {
    #[serde(deserialize_with = "scalar_string")]
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindAndClickStep {
    pub element: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyStep {
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeStep {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotStep {
    #[serde(default = "default_screenshot_name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvDetectStep {
    /// Variable name prefix
    #[serde(default = "default_cv_prefix")]
    pub save_to: String,
}

/// Fields shared by the geometric find actions
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CvTargetStep {
    /// Click the hit; the default depends on the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click: Option<bool>,
    /// Store the hit as `"x,y"` under this variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<String>,
}

/// One scenario step
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Connect,
    Disconnect,
    Wait(WaitStep),
    Click(ClickStep),
    ClickPosition(ClickPositionStep),
    Type(TypeStep),
    Key(KeyStep),
    FindAndClick(FindAndClickStep),
    Verify(VerifyStep),
    Analyze(AnalyzeStep),
    Screenshot(ScreenshotStep),
    CvDetect(CvDetectStep),
    /// Does not click unless `click: true`
    CvFindDialog(CvTargetStep),
    /// Clicks unless `click: false`
    CvFindUnlock(CvTargetStep),
    /// Clicks unless `click: false`
    CvFindTextField(CvTargetStep),
    /// Action name nothing handles
    Unknown { action: String },
}

impl Step {
    pub fn wait(seconds: f64) -> Self {
        Step::Wait(WaitStep { seconds })
    }

    pub fn click(x: i32, y: i32) -> Self {
        Step::Click(ClickStep { x, y })
    }

    pub fn click_position(position: &str) -> Self {
        Step::ClickPosition(ClickPositionStep {
            position: position.to_string(),
        })
    }

    pub fn type_text(text: &str) -> Self {
        Step::Type(TypeStep { text: text.to_string() })
    }

    pub fn key(key: &str) -> Self {
        Step::Key(KeyStep { key: key.to_string() })
    }

    pub fn find_and_click(element: &str) -> Self {
        Step::FindAndClick(FindAndClickStep {
            element: element.to_string(),
        })
    }

    pub fn verify(expected: &str) -> Self {
        Step::Verify(VerifyStep {
            expected: expected.to_string(),
        })
    }

    pub fn analyze(question: &str, save_to: Option<&str>) -> Self {
        Step::Analyze(AnalyzeStep {
            question: question.to_string(),
            save_to: save_to.map(str::to_string),
        })
    }

    pub fn screenshot(name: &str) -> Self {
        Step::Screenshot(ScreenshotStep { name: name.to_string() })
    }

    /// `None` for [`Step::Unknown`]
    pub fn kind(&self) -> Option<ActionKind> {
        Some(match self {
            Step::Connect => ActionKind::Connect,
            Step::Disconnect => ActionKind::Disconnect,
            Step::Wait(_) => ActionKind::Wait,
            Step::Click(_) => ActionKind::Click,
            Step::ClickPosition(_) => ActionKind::ClickPosition,
            Step::Type(_) => ActionKind::Type,
            Step::Key(_) => ActionKind::Key,
            Step::FindAndClick(_) => ActionKind::FindAndClick,
            Step::Verify(_) => ActionKind::Verify,
            Step::Analyze(_) => ActionKind::Analyze,
            Step::Screenshot(_) => ActionKind::Screenshot,
            Step::CvDetect(_) => ActionKind::CvDetect,
            Step::CvFindDialog(_) => ActionKind::CvFindDialog,
            Step::CvFindUnlock(_) => ActionKind::CvFindUnlock,
            Step::CvFindTextField(_) => ActionKind::CvFindTextField,
            Step::Unknown { .. } => return None,
        })
    }

    /// The `action` string as written in the document
    pub fn action_name(&self) -> &str {
        match self {
            Step::Unknown { action } => action,
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }

    fn field_values(&self) -> Vec<(String, Value)> {
        let value = match self {
            Step::Connect | Step::Disconnect | Step::Unknown { .. } => return Vec::new(),
            Step::Wait(d) => serde_json::to_value(d),
            Step::Click(d) => serde_json::to_value(d),
            Step::ClickPosition(d) => serde_json::to_value(d),
            Step::Type(d) => serde_json::to_value(d),
            Step::Key(d) => serde_json::to_value(d),
            Step::FindAndClick(d) => serde_json::to_value(d),
            Step::Verify(d) => serde_json::to_value(d),
            Step::Analyze(d) => serde_json::to_value(d),
            Step::Screenshot(d) => serde_json::to_value(d),
            Step::CvDetect(d) => serde_json::to_value(d),
            Step::CvFindDialog(d) | Step::CvFindUnlock(d) | Step::CvFindTextField(d) => serde_json::to_value(d),
        };
        match value {
            Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            _ => Vec::new(),
        }
    }

    /// Non-action fields rendered for display
    pub fn fields(&self) -> Vec<(String, String)> {
        self.field_values()
            .into_iter()
            .map(|(key, value)| {
                let shown = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, shown)
            })
            .collect()
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("step must be a mapping".to_string());
        };
        let action = match map.remove("action") {
            Some(Value::String(action)) => action,
            Some(other) => return Err(format!("`action` must be a string, got {}", other)),
            None => return Err("step is missing `action`".to_string()),
        };
        let Some(kind) = ActionKind::parse(&action) else {
            return Ok(Step::Unknown { action });
        };

        fn data<T: DeserializeOwned>(kind: ActionKind, map: serde_json::Map<String, Value>) -> Result<T, String> {
            serde_json::from_value(Value::Object(map)).map_err(|e| format!("invalid `{}` step: {}", kind, e))
        }

        Ok(match kind {
            ActionKind::Connect => Step::Connect,
            ActionKind::Disconnect => Step::Disconnect,
            ActionKind::Wait => Step::Wait(data(kind, map)?),
            ActionKind::Click => Step::Click(data(kind, map)?),
            ActionKind::ClickPosition => Step::ClickPosition(data(kind, map)?),
            ActionKind::Type => Step::Type(data(kind, map)?),
            ActionKind::Key => Step::Key(data(kind, map)?),
            ActionKind::FindAndClick => Step::FindAndClick(data(kind, map)?),
            ActionKind::Verify => Step::Verify(data(kind, map)?),
            ActionKind::Analyze => Step::Analyze(data(kind, map)?),
            ActionKind::Screenshot => Step::Screenshot(data(kind, map)?),
            ActionKind::CvDetect => Step::CvDetect(data(kind, map)?),
            ActionKind::CvFindDialog => Step::CvFindDialog(data(kind, map)?),
            ActionKind::CvFindUnlock => Step::CvFindUnlock(data(kind, map)?),
            ActionKind::CvFindTextField => Step::CvFindTextField(data(kind, map)?),
        })
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Step::from_value(value).map_err(de::Error::custom)
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.field_values();
        let mut map = serializer.serialize_map(Some(fields.len() + 1))?;
        map.serialize_entry("action", self.action_name())?;
        for (key, value) in &fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// `ollama` block of a scenario document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub url: String,
    pub model: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            url: cfg.vlm.url.clone(),
            model: cfg.vlm.model.clone(),
        }
    }
}

/// A parsed scenario document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDocument {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub ollama: OllamaSettings,
    /// Scenarios in document order
    #[serde(default)]
    pub scenarios: IndexMap<String, Vec<Step>>,
}

impl ScenarioDocument {
    /// Steps of a named scenario
    pub fn scenario(&self, name: &str) -> ScriptResult<&[Step]> {
        self.scenarios
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ScriptError::UnknownScenario {
                name: name.to_string(),
                available: self.scenarios.keys().cloned().collect(),
            })
    }

    /// Starter document written by `remote-pilot init`
    pub fn sample() -> Self {
        let mut scenarios = IndexMap::new();
        scenarios.insert(
            "hello_world".to_string(),
            vec![
                Step::Connect,
                Step::wait(1.0),
                Step::analyze("What do you see on the screen?", None),
                Step::Disconnect,
            ],
        );
        scenarios.insert(
            "unlock_desktop".to_string(),
            vec![
                Step::Connect,
                Step::wait(2.0),
                Step::CvDetect(CvDetectStep {
                    save_to: default_cv_prefix(),
                }),
                Step::CvFindTextField(CvTargetStep::default()),
                Step::type_text("password"),
                Step::CvFindUnlock(CvTargetStep::default()),
                Step::wait(2.0),
                Step::verify("an unlocked desktop"),
                Step::screenshot("unlocked"),
                Step::Disconnect,
            ],
        );

        Self {
            connection: ConnectionSettings::default(),
            ollama: OllamaSettings {
                url: config::DEFAULT_OLLAMA_URL.to_string(),
                model: config::DEFAULT_OLLAMA_MODEL.to_string(),
            },
            scenarios,
        }
    }

    pub fn to_yaml(&self) -> ScriptResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Parse a document from YAML text
pub fn parse_document(text: &str) -> ScriptResult<ScenarioDocument> {
    Ok(serde_yaml::from_str(text)?)
}

/// Read and parse a document file
pub fn load_document(path: &Path) -> ScriptResult<ScenarioDocument> {
    let text = fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(&text)
}

/// Numbered step listing without touching any session
pub fn render_dry_run(name: &str, steps: &[Step]) -> String {
    let mut out = format!("Dry run: {} ({} steps)\n", name, steps.len());
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("  {}. {}\n", i + 1, step.action_name()));
        for (key, value) in step.fields() {
            out.push_str(&format!("     {}: {}\n", key, value));
        }
    }
    out
}
