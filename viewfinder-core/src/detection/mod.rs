//! detection — detector capability and display-ready results
//!
//! The detector itself is opaque: anything implementing [`ObjectDetector`]
//! takes an upright RGB image and returns [`RawDetection`]s. This module turns
//! those into [`DetectedBox`]es with a caption ready to draw, and defines the
//! recoverable failures of a detection attempt.

pub mod yolo;

use std::time::Duration;

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::geometry::{BBox, Dimensions};

pub use yolo::YoloDetector;

// ── Raw detector output ──────────────────────────────────────────────────────

/// Coarse on-device classifier categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    Unknown,
    HomeGood,
    FashionGood,
    Food,
    Place,
    Plant,
}

impl Category {
    pub fn display_name(self) -> &'static str {
        match self {
            Category::Unknown => "Unknown",
            Category::HomeGood => "Home Goods",
            Category::FashionGood => "Fashion Goods",
            Category::Food => "Food",
            Category::Place => "Place",
            Category::Plant => "Plant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub confidence: Option<f32>,
}

/// Free-text label with its own confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub confidence: f32,
}

/// One object as reported by a detector backend, in upright image pixels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawDetection {
    pub bbox: BBox,
    pub classification: Option<Classification>,
    pub labels: Vec<Label>,
    pub tracking_id: Option<u32>,
}

/// The opaque detection capability.
pub trait ObjectDetector: Send {
    fn name(&self) -> String {
        "detector".to_string()
    }

    fn process(&mut self, image: &RgbImage) -> anyhow::Result<Vec<RawDetection>>;
}

impl<T: ObjectDetector + ?Sized> ObjectDetector for Box<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn process(&mut self, image: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
        (**self).process(image)
    }
}

// ── Display-ready output ─────────────────────────────────────────────────────

/// A box to draw. `bounding_box` is in analysis-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedBox {
    pub label: String,
    pub confidence: Option<f32>,
    pub bounding_box: BBox,
}

impl DetectedBox {
    pub fn new(label: impl Into<String>, confidence: Option<f32>, bounding_box: BBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bounding_box,
        }
    }

    pub fn from_raw(raw: &RawDetection) -> Self {
        let (label, confidence) = match raw.classification {
            Some(Classification {
                category: Category::Unknown,
                ..
            }) => (Category::Unknown.display_name().to_string(), None),
            Some(Classification {
                category,
                confidence: Some(c),
            }) => (format!("{} {}%", category.display_name(), percent(c)), Some(c)),
            Some(Classification {
                category,
                confidence: None,
            }) => (category.display_name().to_string(), None),
            None => {
                let text = raw
                    .labels
                    .iter()
                    .map(|l| format!("{} {}%", l.text, percent(l.confidence)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let best = raw
                    .labels
                    .iter()
                    .map(|l| l.confidence)
                    .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |a| a.max(c))));
                (text, best)
            }
        };

        Self {
            label,
            confidence: confidence.map(|c| c.clamp(0.0, 1.0)),
            bounding_box: raw.bbox,
        }
    }
}

/// Integer percent, truncated.
fn percent(confidence: f32) -> u32 {
    (confidence.clamp(0.0, 1.0) * 100.0) as u32
}

/// Result of analysing one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedBoxes {
    /// Sequence number of the frame these boxes came from.
    pub sequence: u64,
    /// Upright (rotation-corrected) analysis image size.
    pub image_size: Dimensions,
    pub boxes: Vec<DetectedBox>,
}

impl DetectedBoxes {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

// ── Failures ─────────────────────────────────────────────────────────────────

/// Why a frame produced no result. All of these drop the frame and let the
/// pipeline continue with the next one.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detection timed out after {0:?}")]
    Timeout(Duration),
    #[error("detector is still working on an abandoned frame")]
    Busy,
    #[error("frame has no image data")]
    EmptyImage,
    #[error("detector failed")]
    Detector(#[source] anyhow::Error),
    #[error("detector worker is gone")]
    Disconnected,
}

/// Trace every detected object (index, category, tracking id, box, confidence).
pub fn debug_print(detections: &[RawDetection]) {
    for (idx, obj) in detections.iter().enumerate() {
        let b = obj.bbox;
        debug!(
            idx,
            category = obj
                .classification
                .map(|c| c.category.display_name())
                .unwrap_or("-"),
            tracking_id = ?obj.tracking_id,
            x1 = b.x1,
            y1 = b.y1,
            x2 = b.x2,
            y2 = b.y2,
            confidence = ?obj.classification.and_then(|c| c.confidence),
            labels = obj.labels.len(),
            "detected object"
        );
    }
}
