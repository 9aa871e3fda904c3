//! RDP and SPICE controller built on an external viewer window.
//!
//! `connect` launches `xfreerdp` (RDP) or `remote-viewer` (SPICE) and keeps
//! the child handle. Input goes through `xdotool`, captures through
//! ImageMagick `import`. `disconnect` kills and reaps the viewer, so no
//! process or thread outlives the session.

use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use image::RgbImage;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

use super::{ConnectionSettings, Key, Protocol, RemoteController, RemoteError, RemoteResult, run_tool};

/// Time the viewer gets to open its window before the first action
const STARTUP_DELAY: Duration = Duration::from_secs(3);

/// RDP/SPICE session through a viewer process
#[derive(Debug)]
pub struct ViewerController {
    settings: ConnectionSettings,
    child: Mutex<Option<Child>>,
    cancel: CancelToken,
    startup_delay: Duration,
}

impl ViewerController {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            child: Mutex::new(None),
            cancel: CancelToken::new(),
            startup_delay: STARTUP_DELAY,
        }
    }

    /// Abort the startup wait in `connect` when this token fires
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Viewer program and arguments for the configured protocol
    fn viewer_command(&self) -> (&'static str, Vec<String>) {
        let s = &self.settings;
        match s.protocol {
            Protocol::Spice => ("remote-viewer", vec![format!("spice://{}:{}", s.host, s.port)]),
            Protocol::Rdp | Protocol::Vnc => (
                "xfreerdp",
                vec![
                    format!("/v:{}:{}", s.host, s.port),
                    format!("/u:{}", s.username),
                    format!("/p:{}", s.password),
                    "/cert-ignore".to_string(),
                    "/dynamic-resolution".to_string(),
                ],
            ),
        }
    }

    /// Start the viewer and give it time to open its window
    ///
    /// A cancelled wait kills and reaps the child before returning.
    fn launch(&self, program: &str, args: &[String], slot: &mut Option<Child>) -> RemoteResult<()> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RemoteError::Connect(format!("cannot start {}: {}", program, e)))?;

        if !self.cancel.sleep(self.startup_delay) {
            if let Err(e) = child.kill() {
                warn!(error = %e, "viewer kill failed");
            }
            child.wait()?;
            return Err(RemoteError::Interrupted);
        }

        if let Some(status) = child.try_wait()? {
            return Err(RemoteError::Connect(format!(
                "{} exited during startup ({})",
                program, status
            )));
        }

        *slot = Some(child);
        Ok(())
    }

    fn ensure_connected(&self) -> RemoteResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RemoteError::NotConnected)
        }
    }

    fn xdotool(&self, args: &[&str]) -> RemoteResult<()> {
        self.ensure_connected()?;
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        debug!(args = ?args, "xdotool");
        run_tool("xdotool", &args).map(|_| ())
    }
}

fn key_name(key: &Key) -> String {
    match key {
        Key::Enter => "Return".to_string(),
        Key::Tab => "Tab".to_string(),
        Key::Escape => "Escape".to_string(),
        Key::Space => "space".to_string(),
        Key::Other(name) => name.clone(),
    }
}

impl RemoteController for ViewerController {
    fn connect(&self) -> RemoteResult<()> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (program, args) = self.viewer_command();
        self.launch(program, &args, &mut slot)
    }

    fn disconnect(&self) -> RemoteResult<()> {
        let Some(mut child) = self.lock().take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "viewer kill failed");
            }
        }
        child.wait()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    fn click(&self, x: i32, y: i32) -> RemoteResult<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.xdotool(&["mousemove", &x, &y, "click", "1"])
    }

    fn type_text(&self, text: &str) -> RemoteResult<()> {
        self.xdotool(&["type", "--", text])
    }

    fn key_press(&self, key: &Key) -> RemoteResult<()> {
        let name = key_name(key);
        self.xdotool(&["key", &name])
    }

    fn capture(&self) -> RemoteResult<RgbImage> {
        self.ensure_connected()?;
        let png = run_tool("import", &["-window".to_string(), "root".to_string(), "png:-".to_string()])?;
        if png.is_empty() {
            return Err(RemoteError::Capture("import produced no data".to_string()));
        }
        Ok(image::load_from_memory(&png)?.to_rgb8())
    }

    fn describe(&self) -> String {
        self.settings.target()
    }
}

impl Drop for ViewerController {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "viewer teardown failed");
        }
    }
}
