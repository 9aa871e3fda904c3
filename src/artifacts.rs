//! Output directory management for run artifacts.
//!
//! Every run writes into one root directory:
//! - `screenshots/` for step screenshots and debug before/after frames
//! - `videos/` for session recordings
//!
//! File names carry a timestamp so repeated runs never overwrite each other.

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

/// Errors raised while persisting artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Root of the artifact tree for a run
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    /// Root directory
    pub root: PathBuf,
}

impl ArtifactDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding screenshots
    pub fn screenshots_dir(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    /// Directory holding recordings
    pub fn videos_dir(&self) -> PathBuf {
        self.root.join("videos")
    }

    /// Path for a screenshot taken at the given step counter
    ///
    /// Format: `{YYYYmmdd_HHMMSS}_{step:03}_{name}.png`
    pub fn screenshot_path(&self, step: usize, name: &str) -> PathBuf {
        let filename = format!("{}_{:03}_{}.png", generate_timestamp(), step, sanitize_name(name));
        self.screenshots_dir().join(filename)
    }

    /// Save a frame as a step screenshot and return where it landed
    pub fn save_screenshot(&self, step: usize, name: &str, frame: &RgbImage) -> ArtifactResult<PathBuf> {
        fs::create_dir_all(self.screenshots_dir())?;
        let path = self.screenshot_path(step, name);
        frame.save(&path)?;
        Ok(path)
    }

    /// List all PNG files under `screenshots/`, sorted by name
    pub fn list_screenshots(&self) -> std::io::Result<Vec<PathBuf>> {
        list_with_extension(&self.screenshots_dir(), "png")
    }
}

fn list_with_extension(dir: &Path, ext: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == ext).unwrap_or(false) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Generate a timestamp string in YYYYMMDD_HHMMSS format
pub fn generate_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a label for use in filenames
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
