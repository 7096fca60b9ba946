pub mod camera;
pub mod config;
pub mod controller;
pub mod detection;
pub mod geometry;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod scheduler;
#[cfg(feature = "video")]
pub mod video;

// Re-export the error type so callers only need `viewfinder_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;

pub use camera::{CameraFrame, FrameSource, ImageSequence, RgbFrame};
pub use config::ViewfinderConfig;
pub use controller::{ViewfinderController, ViewfinderEvent};
pub use detection::{DetectedBox, DetectedBoxes, DetectionError, ObjectDetector};
pub use geometry::{Dimensions, Rotation, Transform};
pub use rendering::OverlayRenderer;
pub use runtime::{HostHandle, Viewfinder};
