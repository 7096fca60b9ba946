//! camera — frames as the camera hands them over
//!
//! A `CameraFrame` owns one RGB24 buffer in sensor orientation plus the
//! rotation that turns it upright. Whoever drops the frame releases it: the
//! optional release hook (the camera's "close this image" obligation) runs
//! exactly once, on whichever path the frame leaves the pipeline.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use tracing::{debug, info};

use crate::geometry::{Dimensions, Rotation};

/// A single decoded frame in RGB24 format, along with its presentation
/// timestamp (in the source's time-base units).
#[derive(Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    pub fn from_image(image: RgbImage, pts: i64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            pts,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// A zero-sized frame or one whose buffer is shorter than its dimensions
    /// claim has no usable image.
    pub fn is_empty(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.data.len() < (self.width as usize) * (self.height as usize) * 3
    }

    /// Borrow-free conversion into an `image` buffer.
    pub fn into_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data)
    }

    /// Copy the frame turned upright. A buffer sitting `rotation` clockwise
    /// from upright is turned back by the same angle, the way the preview
    /// matrix does it.
    pub fn upright(&self, rotation: Rotation) -> Option<RgbImage> {
        let image = RgbImage::from_raw(self.width, self.height, self.data.clone())?;
        Some(match rotation {
            Rotation::Deg0 => image,
            Rotation::Deg90 => imageops::rotate270(&image),
            Rotation::Deg180 => imageops::rotate180(&image),
            Rotation::Deg270 => imageops::rotate90(&image),
        })
    }
}

impl fmt::Debug for RgbFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RgbFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .field("bytes", &self.data.len())
            .finish()
    }
}

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// One camera frame plus its orientation. Dropping it releases it.
pub struct CameraFrame {
    pub image: RgbFrame,
    pub rotation: Rotation,
    pub sequence: u64,
    on_release: Option<ReleaseHook>,
}

impl CameraFrame {
    pub fn new(image: RgbFrame, rotation: Rotation, sequence: u64) -> Self {
        Self {
            image,
            rotation,
            sequence,
            on_release: None,
        }
    }

    /// Attach a hook that runs once, with the frame's sequence number, when
    /// the frame is released.
    pub fn with_release_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Buffer size in sensor orientation.
    pub fn buffer_size(&self) -> Dimensions {
        self.image.dimensions()
    }

    /// Size of the rotation-corrected image the detector sees.
    pub fn upright_size(&self) -> Dimensions {
        self.rotation.apply(self.buffer_size())
    }
}

impl Drop for CameraFrame {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(self.sequence);
        }
    }
}

impl fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFrame")
            .field("sequence", &self.sequence)
            .field("rotation", &self.rotation)
            .field("image", &self.image)
            .finish()
    }
}

/// Anything that produces frames at its own pace: a video file, a directory
/// of stills, a real camera.
pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbFrame>>;

    /// Nominal frames per second, if known, used to pace replay.
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    /// Total frames the source expects to produce, if known. Only a hint for
    /// progress reporting.
    fn frame_count(&self) -> Option<u64> {
        None
    }
}

/// Directory of still images replayed in file-name order.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    cursor: usize,
    fps: Option<f64>,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

impl ImageSequence {
    pub fn open<P: AsRef<Path>>(dir: P, fps: Option<f64>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("failed to read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();
        info!(dir = %dir.display(), frames = paths.len(), "opened image sequence");
        Ok(Self {
            paths,
            cursor: 0,
            fps,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        let Some(path) = self.paths.get(self.cursor) else {
            return Ok(None);
        };
        let image = image::open(path)
            .with_context(|| format!("failed to decode frame {}", path.display()))?
            .into_rgb8();
        let pts = self.cursor as i64;
        self.cursor += 1;
        debug!(path = %path.display(), pts, "loaded still frame");
        Ok(Some(RgbFrame::from_image(image, pts)))
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.paths.len() as u64)
    }
}
