//! config — tunables for detection and overlay drawing
//!
//! Every section is `#[serde(default)]`, so a JSON file only needs the keys it
//! wants to change. A file that fails to parse is reported and replaced with
//! defaults; the viewfinder keeps running.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewfinderConfig {
    pub detection: DetectionConfig,
    pub overlay: OverlayStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Upper bound on one detection call.
    pub timeout_ms: u64,
    /// Wipe the overlay when a frame fails (timeout, detector error) instead
    /// of keeping the last good boxes.
    pub clear_overlay_on_failure: bool,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub intra_threads: usize,
}

/// Caption and outline style, in overlay pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayStyle {
    pub stroke_width: f32,
    pub caption_padding: f32,
    pub corner_radius: f32,
    /// Bitmap-font scale; one glyph cell is `4 * text_scale` wide.
    pub text_scale: u32,
    pub box_color: String,        // "#RRGGBB" or "#AARRGGBB"
    pub caption_background: String,
    pub text_color: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            clear_overlay_on_failure: false,
            score_threshold: 0.45,
            iou_threshold: 0.45,
            max_detections: 20,
            intra_threads: 2,
        }
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            stroke_width: 2.0,
            caption_padding: 8.0,
            corner_radius: 4.0,
            text_scale: 4,
            box_color: "#FFFFFF".to_string(),
            caption_background: "#66000000".to_string(),
            text_color: "#FFFFFF".to_string(),
        }
    }
}

impl ViewfinderConfig {
    /// Load from `path`, falling back to defaults on a missing or unparsable
    /// file. Only an unreadable existing file is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Ok(Self::from_json(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), "error parsing config: {e:#}; using defaults");
            Self::default()
        }))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config = serde_json::from_str(content).context("invalid viewfinder config")?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialise config")
    }
}
