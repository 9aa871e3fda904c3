//! Remote desktop controller abstraction.
//!
//! The interpreter only needs six capabilities from a remote session:
//! connect, disconnect, click, type, key press and screen capture. Each
//! protocol implements [`RemoteController`]:
//! - [`VncdoController`] for VNC (one `vncdo` invocation per operation)
//! - [`ViewerController`] for RDP and SPICE (owns the viewer process)
//! - [`MockDesktop`] for tests and dry runs against a synthetic framebuffer

pub mod mock;
pub mod vncdo;
pub mod viewer;

use std::fmt;
use std::process::Command;
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;

pub use mock::{MockDesktop, RemoteCall};
pub use viewer::ViewerController;
pub use vncdo::VncdoController;

/// Result type for remote session operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur while driving a remote session
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Operation requires an established connection
    #[error("not connected to remote desktop")]
    NotConnected,

    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// An external tool exited unsuccessfully
    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    /// Operator cancellation while the session was being set up
    #[error("interrupted")]
    Interrupted,

    /// Screen capture produced no usable image
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// A remote desktop session
///
/// Methods take `&self` so a controller can be shared between the step
/// interpreter and the recorder thread.
pub trait RemoteController: Send + Sync {
    /// Establish the session
    fn connect(&self) -> RemoteResult<()>;

    /// Tear the session down, reaping anything `connect` started
    fn disconnect(&self) -> RemoteResult<()>;

    /// True iff `connect` succeeded and no disconnect has run since
    fn is_connected(&self) -> bool;

    /// Left click at screen coordinates
    fn click(&self, x: i32, y: i32) -> RemoteResult<()>;

    /// Type literal text
    fn type_text(&self, text: &str) -> RemoteResult<()>;

    /// Press and release a single key
    fn key_press(&self, key: &Key) -> RemoteResult<()>;

    /// Grab the current screen
    fn capture(&self) -> RemoteResult<RgbImage>;

    /// Human readable target, e.g. `vnc://host:5900`
    fn describe(&self) -> String;
}

/// A key to press, with the small symbolic set translated up front
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Enter,
    Tab,
    Escape,
    Space,
    /// Anything else is forwarded literally
    Other(String),
}

impl Key {
    /// Translate a script key name (`enter`, `tab`, `esc`, `space`; case-insensitive)
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "enter" => Key::Enter,
            "tab" => Key::Tab,
            "esc" => Key::Escape,
            "space" => Key::Space,
            _ => Key::Other(name.to_string()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Enter => f.write_str("enter"),
            Key::Tab => f.write_str("tab"),
            Key::Escape => f.write_str("esc"),
            Key::Space => f.write_str("space"),
            Key::Other(name) => f.write_str(name),
        }
    }
}

/// Remote desktop protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Vnc,
    Rdp,
    Spice,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vnc => f.write_str("vnc"),
            Protocol::Rdp => f.write_str("rdp"),
            Protocol::Spice => f.write_str("spice"),
        }
    }
}

/// `connection` block of a scenario document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            protocol: Protocol::Vnc,
            host: "localhost".to_string(),
            port: 5900,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ConnectionSettings {
    /// `protocol://host:port`
    pub fn target(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Build the controller matching the configured protocol
///
/// `cancel` aborts a connect that is still waiting for the remote side.
pub fn controller_for(settings: &ConnectionSettings, cancel: &CancelToken) -> Arc<dyn RemoteController> {
    match settings.protocol {
        Protocol::Vnc => Arc::new(VncdoController::new(settings.clone())),
        Protocol::Rdp | Protocol::Spice => {
            Arc::new(ViewerController::new(settings.clone()).with_cancel_token(cancel.clone()))
        }
    }
}

/// Run an external tool to completion and return its stdout
pub(crate) fn run_tool(program: &str, args: &[String]) -> RemoteResult<Vec<u8>> {
    let output = Command::new(program).args(args).output().map_err(|e| RemoteError::Command {
        program: program.to_string(),
        message: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(RemoteError::Command {
            program: program.to_string(),
            message: if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            },
        });
    }

    Ok(output.stdout)
}
