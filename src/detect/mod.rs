//! Geometric screen analysis without any model calls.
//!
//! Provides fast structural probing of a captured frame:
//! - Canny edge map and rectangle candidates (outermost contour bounding boxes)
//! - Window, button, text field and modal dialog detection
//! - Unlock/confirm button lookup inside a dialog
//! - Blank screen detection and free-text diagnostics
//! - Template matching
//!
//! All thresholds live in [`DetectorConfig`]; the defaults reproduce the
//! behaviour scenarios were tuned against.

mod edges;
mod template;

use std::fmt;
use std::path::PathBuf;

use image::{GrayImage, Rgb, RgbImage, imageops};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A screen coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Axis-aligned rectangle in frame pixel space, top-left origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x + self.width / 2) as i32, (self.y + self.height / 2) as i32)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// `width / height`, `None` for a zero-height rectangle
    pub fn aspect_ratio(&self) -> Option<f64> {
        if self.height == 0 {
            None
        } else {
            Some(self.width as f64 / self.height as f64)
        }
    }

    /// True iff `other` lies inside this rectangle and is not the same box
    pub fn encloses(&self, other: &Rect) -> bool {
        self != other
            && other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }

    fn aspect_within(&self, min: f64, max: f64) -> bool {
        matches!(self.aspect_ratio(), Some(ar) if ar > min && ar < max)
    }
}

/// Detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Canny hysteresis thresholds
    pub canny_low: f32,
    pub canny_high: f32,
    /// Default minimum area for `rectangles`
    pub rect_min_area: u64,
    /// Open interval of accepted rectangle aspect ratios
    pub rect_aspect: (f64, f64),
    pub window_min_area: u64,
    pub button_min_area: u64,
    /// Open intervals for button width, height and aspect ratio
    pub button_width: (u32, u32),
    pub button_height: (u32, u32),
    pub button_aspect: (f64, f64),
    /// Brightness at or above which a pixel may belong to a text field
    pub text_field_brightness: u8,
    pub text_field_min_width: u32,
    pub text_field_height: (u32, u32),
    pub text_field_min_aspect: f64,
    pub dialog_min_area: u64,
    /// Open band (fraction of each axis) a dialog center must fall into
    pub dialog_center_band: (f64, f64),
    /// Dialog extent must stay below this fraction of each axis
    pub dialog_max_extent: f64,
    /// Brightness below which a pixel counts as dark
    pub blank_threshold: u8,
    /// Minimum fraction of dark pixels for a blank screen
    pub blank_dark_ratio: f64,
    pub dark_brightness: f64,
    pub few_edges: usize,
    pub content_edges: usize,
    /// When set, intermediate images are written here
    pub debug_dir: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            canny_low: 50.0,
            canny_high: 150.0,
            rect_min_area: 1000,
            rect_aspect: (0.2, 5.0),
            window_min_area: 5000,
            button_min_area: 500,
            button_width: (50, 300),
            button_height: (20, 100),
            button_aspect: (1.5, 10.0),
            text_field_brightness: 200,
            text_field_min_width: 100,
            text_field_height: (20, 60),
            text_field_min_aspect: 3.0,
            dialog_min_area: 10_000,
            dialog_center_band: (0.3, 0.7),
            dialog_max_extent: 0.8,
            blank_threshold: 30,
            blank_dark_ratio: 0.9,
            dark_brightness: 50.0,
            few_edges: 500,
            content_edges: 1000,
            debug_dir: None,
        }
    }
}

/// Snapshot judgement about screen content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenDiagnostics {
    pub is_blank: bool,
    pub mean_brightness: f64,
    pub has_content: bool,
    pub edge_count: usize,
    pub possible_issue: Option<String>,
}

/// Result bundle of [`GeometricDetector::quick_analysis`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickAnalysis {
    pub has_dialog: bool,
    pub dialog_center: Option<Point>,
    pub has_buttons: bool,
    pub button_positions: Vec<Point>,
    pub has_text_field: bool,
    pub text_field_position: Option<Point>,
    pub window_count: usize,
    pub unlock_button: Option<Point>,
    pub diagnostics: ScreenDiagnostics,
}

/// Stateless geometric detector
#[derive(Debug, Clone, Default)]
pub struct GeometricDetector {
    config: DetectorConfig,
}

impl GeometricDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Edge map with the configured thresholds
    pub fn edges(&self, frame: &RgbImage) -> GrayImage {
        self.edges_with(frame, self.config.canny_low, self.config.canny_high)
    }

    /// Edge map with explicit Canny thresholds (255 = edge)
    pub fn edges_with(&self, frame: &RgbImage, low: f32, high: f32) -> GrayImage {
        let edges = edges::canny(&imageops::grayscale(frame), low, high);
        self.debug_save("debug_edges.png", |path| edges.save(path));
        edges
    }

    /// Rectangle candidates with `area >= min_area`, largest first
    pub fn rectangles(&self, frame: &RgbImage, min_area: u64) -> Vec<Rect> {
        let rects = self.filter_rectangles(&self.candidates(&self.edges(frame)), min_area);
        self.debug_rectangles(frame, &rects);
        rects
    }

    /// Center of the largest window-sized rectangle
    pub fn window_center(&self, frame: &RgbImage) -> Option<Point> {
        self.rectangles(frame, self.config.window_min_area)
            .first()
            .map(Rect::center)
    }

    /// Button-shaped rectangles, top to bottom
    ///
    /// Buttons nested inside a larger outline (a dialog, a window frame) are
    /// not reported; see [`unlock_button`](Self::unlock_button) for those.
    pub fn buttons(&self, frame: &RgbImage) -> Vec<Rect> {
        let candidates = self.candidates(&self.edges(frame));
        self.select_buttons(&candidates)
    }

    /// Center of the first wide, short, bright region
    pub fn text_field(&self, frame: &RgbImage) -> Option<Point> {
        self.text_field_in(&imageops::grayscale(frame))
    }

    /// Centered rectangle smaller than the screen (modal dialog)
    pub fn dialog_box(&self, frame: &RgbImage) -> Option<Rect> {
        let candidates = self.candidates(&self.edges(frame));
        self.select_dialog(&candidates, frame.width(), frame.height())
    }

    /// Right-most button inside the detected dialog, in frame coordinates
    pub fn unlock_button(&self, frame: &RgbImage) -> Option<Point> {
        let components = self.components(&self.edges(frame));
        let candidates = edges::outermost(components.clone());
        let dialog = self.select_dialog(&candidates, frame.width(), frame.height())?;
        self.unlock_in(&components, &dialog)
    }

    /// True iff the frame is dark on average and almost entirely dark pixels
    pub fn is_blank(&self, frame: &RgbImage) -> bool {
        self.blank_from(&imageops::grayscale(frame))
    }

    /// Brightness/edge based guess at what is wrong with the screen
    pub fn diagnostics(&self, frame: &RgbImage) -> ScreenDiagnostics {
        let gray = imageops::grayscale(frame);
        let edge_count = edges::count_nonzero(&self.edges(frame));
        self.diagnose(&gray, edge_count)
    }

    /// Full detection battery in one pass
    ///
    /// The grayscale image, edge map and outline components are computed once
    /// and shared by every detector.
    pub fn quick_analysis(&self, frame: &RgbImage) -> QuickAnalysis {
        let gray = imageops::grayscale(frame);
        let edge_map = edges::canny(&gray, self.config.canny_low, self.config.canny_high);
        self.debug_save("debug_edges.png", |path| edge_map.save(path));

        let components = self.components(&edge_map);
        let candidates = edges::outermost(components.clone());
        let diagnostics = self.diagnose(&gray, edges::count_nonzero(&edge_map));

        let dialog = self.select_dialog(&candidates, frame.width(), frame.height());
        let buttons = self.select_buttons(&candidates);
        let text_field = self.text_field_in(&gray);
        let windows = self.filter_rectangles(&candidates, self.config.window_min_area);
        self.debug_rectangles(frame, &windows);
        let unlock_button = dialog.as_ref().and_then(|d| self.unlock_in(&components, d));

        debug!(
            dialog = dialog.is_some(),
            buttons = buttons.len(),
            windows = windows.len(),
            "quick analysis"
        );

        QuickAnalysis {
            has_dialog: dialog.is_some(),
            dialog_center: dialog.map(|d| d.center()),
            has_buttons: !buttons.is_empty(),
            button_positions: buttons.iter().map(Rect::center).collect(),
            has_text_field: text_field.is_some(),
            text_field_position: text_field,
            window_count: windows.len(),
            unlock_button,
            diagnostics,
        }
    }

    /// Center of the best normalised cross-correlation match scoring at
    /// least `threshold`
    pub fn template_match(&self, frame: &RgbImage, template: &RgbImage, threshold: f64) -> Option<Point> {
        let (x, y, score) = template::best_match(&imageops::grayscale(frame), &imageops::grayscale(template))?;
        debug!(x, y, score, "template match");
        if score >= threshold {
            Some(Point::new(
                (x + template.width() / 2) as i32,
                (y + template.height() / 2) as i32,
            ))
        } else {
            None
        }
    }

    /// Bounding boxes of every outline in an edge map, nested ones included
    fn components(&self, edge_map: &GrayImage) -> Vec<Rect> {
        edges::component_boxes(&edges::dilate(edge_map))
    }

    /// Bounding boxes of the outermost outlines in an edge map
    fn candidates(&self, edge_map: &GrayImage) -> Vec<Rect> {
        edges::outermost(self.components(edge_map))
    }

    fn filter_rectangles(&self, candidates: &[Rect], min_area: u64) -> Vec<Rect> {
        let (lo, hi) = self.config.rect_aspect;
        let mut rects: Vec<Rect> = candidates
            .iter()
            .filter(|r| r.area() >= min_area && r.aspect_within(lo, hi))
            .copied()
            .collect();
        rects.sort_by(|a, b| b.area().cmp(&a.area()));
        rects
    }

    fn select_buttons(&self, candidates: &[Rect]) -> Vec<Rect> {
        let c = &self.config;
        let mut buttons: Vec<Rect> = self
            .filter_rectangles(candidates, c.button_min_area)
            .into_iter()
            .filter(|r| {
                r.width > c.button_width.0
                    && r.width < c.button_width.1
                    && r.height > c.button_height.0
                    && r.height < c.button_height.1
                    && r.aspect_within(c.button_aspect.0, c.button_aspect.1)
            })
            .collect();
        buttons.sort_by_key(|r| r.y);
        buttons
    }

    fn select_dialog(&self, candidates: &[Rect], width: u32, height: u32) -> Option<Rect> {
        let c = &self.config;
        let (w, h) = (width as f64, height as f64);
        let (lo, hi) = c.dialog_center_band;
        self.filter_rectangles(candidates, c.dialog_min_area)
            .into_iter()
            .find(|r| {
                let center = r.center();
                let (cx, cy) = (center.x as f64, center.y as f64);
                cx > w * lo
                    && cx < w * hi
                    && cy > h * lo
                    && cy < h * hi
                    && (r.width as f64) < w * c.dialog_max_extent
                    && (r.height as f64) < h * c.dialog_max_extent
            })
    }

    /// Right-most button among the outermost outlines inside `dialog`
    ///
    /// The dialog's own outline is excluded, so its direct children become
    /// the outer contours of the sub-region.
    fn unlock_in(&self, components: &[Rect], dialog: &Rect) -> Option<Point> {
        let inner: Vec<Rect> = components.iter().filter(|r| dialog.encloses(r)).copied().collect();
        self.select_buttons(&edges::outermost(inner))
            .into_iter()
            .max_by_key(|b| b.x)
            .map(|b| b.center())
    }

    fn text_field_in(&self, gray: &GrayImage) -> Option<Point> {
        let c = &self.config;
        let bright = edges::threshold(gray, c.text_field_brightness);
        edges::outermost(edges::component_boxes(&bright))
            .into_iter()
            .find(|r| {
                r.width > c.text_field_min_width
                    && r.height > c.text_field_height.0
                    && r.height < c.text_field_height.1
                    && matches!(r.aspect_ratio(), Some(ar) if ar > c.text_field_min_aspect)
            })
            .map(|r| r.center())
    }

    fn blank_from(&self, gray: &GrayImage) -> bool {
        let total = gray.as_raw().len();
        if total == 0 {
            return true;
        }
        let dark = gray.as_raw().iter().filter(|&&v| v < self.config.blank_threshold).count();
        mean_brightness(gray) < self.config.blank_threshold as f64
            && dark as f64 / total as f64 >= self.config.blank_dark_ratio
    }

    fn diagnose(&self, gray: &GrayImage, edge_count: usize) -> ScreenDiagnostics {
        let c = &self.config;
        let mean = mean_brightness(gray);
        let is_blank = self.blank_from(gray);

        let possible_issue = if is_blank {
            Some("Screen is blank/black - possible lock screen or VNC not connected")
        } else if mean < c.dark_brightness {
            Some("Screen is very dark - possible screensaver or lock screen")
        } else if edge_count < c.few_edges {
            Some("Very few edges detected - possible empty desktop or loading screen")
        } else if edge_count < c.content_edges {
            Some("Low content - desktop may be minimalist or partially loaded")
        } else {
            None
        };

        ScreenDiagnostics {
            is_blank,
            mean_brightness: mean,
            has_content: edge_count > c.content_edges,
            edge_count,
            possible_issue: possible_issue.map(str::to_string),
        }
    }

    fn debug_rectangles(&self, frame: &RgbImage, rects: &[Rect]) {
        if self.config.debug_dir.is_none() {
            return;
        }
        let mut canvas = frame.clone();
        for rect in rects.iter().take(10) {
            outline(&mut canvas, rect, Rgb([0, 255, 0]), 2);
        }
        self.debug_save("debug_rectangles.png", |path| canvas.save(path));
    }

    fn debug_save<F>(&self, name: &str, save: F)
    where
        F: FnOnce(&std::path::Path) -> image::ImageResult<()>,
    {
        let Some(dir) = &self.config.debug_dir else {
            return;
        };
        let path = dir.join(name);
        let result = std::fs::create_dir_all(dir)
            .map_err(image::ImageError::IoError)
            .and_then(|_| save(&path));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write debug image");
        }
    }
}

fn mean_brightness(gray: &GrayImage) -> f64 {
    let raw = gray.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    raw.iter().map(|&v| v as u64).sum::<u64>() as f64 / raw.len() as f64
}

/// Draw a rectangle outline of the given thickness, clipped to the canvas
fn outline(canvas: &mut RgbImage, rect: &Rect, color: Rgb<u8>, thickness: u32) {
    let (w, h) = canvas.dimensions();
    let x1 = (rect.x + rect.width).min(w);
    let y1 = (rect.y + rect.height).min(h);
    for y in rect.y..y1 {
        for x in rect.x..x1 {
            let on_border = x < rect.x + thickness
                || y < rect.y + thickness
                || x + thickness >= x1
                || y + thickness >= y1;
            if on_border {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}
