//! In-memory remote desktop for tests and offline runs.
//!
//! Provides a full drawing API for building synthetic screens:
//! - `fill()` - Fill the whole screen with a color
//! - `draw_rect()` - Draw a filled rectangle
//! - `draw_text()` - Draw text using font8x8 glyphs
//! - `get_pixel()` - Direct pixel access
//!
//! Every controller call is appended to a call log so tests can assert the
//! exact sequence of session effects.

use std::sync::{Mutex, MutexGuard};

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{Rgb, RgbImage, imageops};

use super::{Key, RemoteController, RemoteError, RemoteResult};

/// One recorded controller call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Connect,
    Disconnect,
    Click { x: i32, y: i32 },
    Type(String),
    Key(Key),
    Capture,
}

#[derive(Debug)]
struct MockState {
    screen: RgbImage,
    connected: bool,
    calls: Vec<RemoteCall>,
    fail_connect: bool,
    fail_capture: bool,
}

/// A synthetic remote desktop backed by an RGB framebuffer
#[derive(Debug)]
pub struct MockDesktop {
    state: Mutex<MockState>,
}

impl MockDesktop {
    /// Create a desktop with the given dimensions, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_color(width, height, [0, 0, 0])
    }

    /// Create a desktop filled with a specific color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            state: Mutex::new(MockState {
                screen: RgbImage::from_pixel(width, height, Rgb(color)),
                connected: false,
                calls: Vec::new(),
                fail_connect: false,
                fail_capture: false,
            }),
        }
    }

    /// Create a desktop showing an existing image
    pub fn from_image(screen: RgbImage) -> Self {
        let desktop = Self::new(1, 1);
        desktop.lock().screen = screen;
        desktop
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `connect` calls fail
    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Make `capture` calls fail
    pub fn fail_capture(&self, fail: bool) {
        self.lock().fail_capture = fail;
    }

    /// Fill the entire screen with a color
    pub fn fill(&self, color: [u8; 3]) {
        for pixel in self.lock().screen.pixels_mut() {
            *pixel = Rgb(color);
        }
    }

    /// Draw a filled rectangle, clipped to the screen
    pub fn draw_rect(&self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        let mut state = self.lock();
        let (width, height) = state.screen.dimensions();
        for py in y..(y + h).min(height) {
            for px in x..(x + w).min(width) {
                state.screen.put_pixel(px, py, Rgb(color));
            }
        }
    }

    /// Draw a single line of text in 8x8 glyphs, clipped to the screen
    ///
    /// The label is rendered into its own image first and then pasted, so
    /// `bg` fills the full glyph cells.
    pub fn draw_text(&self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        let glyphs: Vec<[u8; 8]> = text
            .chars()
            .map(|ch| BASIC_FONTS.get(ch).unwrap_or_default())
            .collect();
        let label = RgbImage::from_fn(8 * glyphs.len() as u32, 8, |px, py| {
            let row = glyphs[(px / 8) as usize][py as usize];
            // Bit 0 is the leftmost column
            if (row >> (px % 8)) & 1 == 1 { Rgb(fg) } else { Rgb(bg) }
        });
        imageops::replace(&mut self.lock().screen, &label, x as i64, y as i64);
    }

    /// Get the color of a pixel (black outside the screen)
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let state = self.lock();
        if x >= state.screen.width() || y >= state.screen.height() {
            return [0, 0, 0];
        }
        state.screen.get_pixel(x, y).0
    }

    /// Current screen contents
    pub fn screen(&self) -> RgbImage {
        self.lock().screen.clone()
    }

    /// Every call made so far, captures included
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Calls with visible effect on the desktop (captures filtered out)
    pub fn actions(&self) -> Vec<RemoteCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| **call != RemoteCall::Capture)
            .cloned()
            .collect()
    }

    fn record(&self, call: RemoteCall) -> RemoteResult<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(RemoteError::NotConnected);
        }
        state.calls.push(call);
        Ok(())
    }
}

impl RemoteController for MockDesktop {
    fn connect(&self) -> RemoteResult<()> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(RemoteError::Connect("mock desktop refused connection".to_string()));
        }
        state.connected = true;
        state.calls.push(RemoteCall::Connect);
        Ok(())
    }

    fn disconnect(&self) -> RemoteResult<()> {
        let mut state = self.lock();
        state.connected = false;
        state.calls.push(RemoteCall::Disconnect);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn click(&self, x: i32, y: i32) -> RemoteResult<()> {
        self.record(RemoteCall::Click { x, y })
    }

    fn type_text(&self, text: &str) -> RemoteResult<()> {
        self.record(RemoteCall::Type(text.to_string()))
    }

    fn key_press(&self, key: &Key) -> RemoteResult<()> {
        self.record(RemoteCall::Key(key.clone()))
    }

    fn capture(&self) -> RemoteResult<RgbImage> {
        let mut state = self.lock();
        if !state.connected {
            return Err(RemoteError::NotConnected);
        }
        if state.fail_capture {
            return Err(RemoteError::Capture("mock capture failure".to_string()));
        }
        state.calls.push(RemoteCall::Capture);
        Ok(state.screen.clone())
    }

    fn describe(&self) -> String {
        let state = self.lock();
        format!("mock://{}x{}", state.screen.width(), state.screen.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_desktop_new_is_black() {
        let desktop = MockDesktop::new(100, 50);
        assert_eq!(desktop.get_pixel(0, 0), [0, 0, 0]);
        assert_eq!(desktop.get_pixel(99, 49), [0, 0, 0]);
        assert_eq!(desktop.describe(), "mock://100x50");
    }

    #[test]
    fn test_mock_desktop_draw_rect() {
        let desktop = MockDesktop::new(20, 20);
        desktop.draw_rect(5, 5, 10, 10, [255, 0, 0]);

        assert_eq!(desktop.get_pixel(4, 4), [0, 0, 0]);
        assert_eq!(desktop.get_pixel(5, 5), [255, 0, 0]);
        assert_eq!(desktop.get_pixel(14, 14), [255, 0, 0]);
        assert_eq!(desktop.get_pixel(15, 15), [0, 0, 0]);
    }

    #[test]
    fn test_mock_desktop_draw_text() {
        let desktop = MockDesktop::new(80, 16);
        desktop.draw_text(0, 0, "Hi", [255, 255, 255], [0, 0, 0]);

        // 'H': two posts joined by a bar on the fourth row
        assert_eq!(desktop.get_pixel(0, 0), [255, 255, 255]);
        assert_eq!(desktop.get_pixel(2, 0), [0, 0, 0]);
        assert!((0..6).all(|x| desktop.get_pixel(x, 3) == [255, 255, 255]));
        assert_eq!(desktop.get_pixel(0, 7), [0, 0, 0]);
    }

    #[test]
    fn test_mock_desktop_draw_text_clips_at_edge() {
        let desktop = MockDesktop::with_color(20, 12, [9, 9, 9]);
        desktop.draw_text(16, 8, "HH", [255, 255, 255], [1, 2, 3]);

        assert_eq!(desktop.get_pixel(16, 8), [255, 255, 255]);
        assert_eq!(desktop.get_pixel(18, 8), [1, 2, 3]);
        assert_eq!(desktop.get_pixel(15, 8), [9, 9, 9]);
        assert_eq!(desktop.screen().dimensions(), (20, 12));
    }

    #[test]
    fn test_mock_desktop_requires_connection() {
        let desktop = MockDesktop::new(10, 10);
        assert!(matches!(desktop.click(1, 1), Err(RemoteError::NotConnected)));
        assert!(matches!(desktop.capture(), Err(RemoteError::NotConnected)));

        desktop.connect().unwrap();
        desktop.click(1, 1).unwrap();
        desktop.capture().unwrap();
        desktop.disconnect().unwrap();

        assert!(!desktop.is_connected());
        assert_eq!(
            desktop.calls(),
            vec![
                RemoteCall::Connect,
                RemoteCall::Click { x: 1, y: 1 },
                RemoteCall::Capture,
                RemoteCall::Disconnect,
            ]
        );
        assert_eq!(desktop.actions().len(), 3);
    }

    #[test]
    fn test_mock_desktop_failure_switches() {
        let desktop = MockDesktop::new(10, 10);
        desktop.fail_connect(true);
        assert!(matches!(desktop.connect(), Err(RemoteError::Connect(_))));
        assert!(!desktop.is_connected());

        desktop.fail_connect(false);
        desktop.connect().unwrap();
        desktop.fail_capture(true);
        assert!(matches!(desktop.capture(), Err(RemoteError::Capture(_))));
    }
}
