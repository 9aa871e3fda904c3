//! VNC controller driving the `vncdo` command line client.
//!
//! Every operation is one short-lived `vncdo` process, so the controller holds
//! no sockets or worker threads between calls and `disconnect` has nothing
//! left to reap.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use image::RgbImage;
use tracing::debug;

use super::{ConnectionSettings, Key, RemoteController, RemoteError, RemoteResult, run_tool};

const VNCDO: &str = "vncdo";

static CAPTURE_SEQ: AtomicU64 = AtomicU64::new(0);

/// VNC session via `vncdo`
#[derive(Debug)]
pub struct VncdoController {
    settings: ConnectionSettings,
    connected: AtomicBool,
}

impl VncdoController {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            connected: AtomicBool::new(false),
        }
    }

    /// Common server/password arguments (`host::port` selects a raw port)
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            format!("{}::{}", self.settings.host, self.settings.port),
        ];
        if !self.settings.password.is_empty() {
            args.push("-p".to_string());
            args.push(self.settings.password.clone());
        }
        args
    }

    fn run(&self, command: &[&str]) -> RemoteResult<()> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        self.run_unchecked(command)
    }

    fn run_unchecked(&self, command: &[&str]) -> RemoteResult<()> {
        let mut args = self.base_args();
        args.extend(command.iter().map(|s| s.to_string()));
        debug!(command = ?command, "vncdo");
        run_tool(VNCDO, &args).map(|_| ())
    }

    fn grab(&self) -> RemoteResult<RgbImage> {
        let path = capture_path();
        let target = path.to_string_lossy().to_string();
        let result = self
            .run_unchecked(&["--nocursor", "capture", &target])
            .and_then(|_| Ok(image::open(&path)?.to_rgb8()));
        let _ = fs::remove_file(&path);
        result
    }
}

fn capture_path() -> PathBuf {
    let seq = CAPTURE_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("remote-pilot-{}-{}.png", std::process::id(), seq))
}

fn key_name(key: &Key) -> String {
    match key {
        Key::Enter => "enter".to_string(),
        Key::Tab => "tab".to_string(),
        Key::Escape => "esc".to_string(),
        Key::Space => "space".to_string(),
        Key::Other(name) => name.clone(),
    }
}

impl RemoteController for VncdoController {
    fn connect(&self) -> RemoteResult<()> {
        // A first capture proves the server is reachable and the password works
        self.grab()
            .map_err(|e| RemoteError::Connect(format!("{}: {}", self.describe(), e)))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> RemoteResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn click(&self, x: i32, y: i32) -> RemoteResult<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.run(&["move", &x, &y, "click", "1"])
    }

    fn type_text(&self, text: &str) -> RemoteResult<()> {
        self.run(&["type", text])
    }

    fn key_press(&self, key: &Key) -> RemoteResult<()> {
        let name = key_name(key);
        self.run(&["key", &name])
    }

    fn capture(&self) -> RemoteResult<RgbImage> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        self.grab()
    }

    fn describe(&self) -> String {
        self.settings.target()
    }
}
