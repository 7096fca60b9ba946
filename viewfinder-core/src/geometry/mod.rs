//! geometry — preview fit and overlay fit
//!
//! Two transforms live here, both pure:
//!
//! * the **preview fit** maps the raw camera buffer onto the viewfinder. It
//!   rotates about the view centre to cancel the buffer rotation, then scales
//!   so the buffer covers the view on its constrained axis (no letterboxing,
//!   the other axis overflows and is clipped by the view).
//! * the **overlay fit** maps detection boxes from analysis-image pixels into
//!   overlay pixels with one uniform scale and a centre crop on one axis.
//!
//! Undefined inputs (any zero dimension) never divide: every constructor
//! returns `None` and callers keep whatever transform they already had.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use nalgebra::{Matrix3, Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

// ── Dimensions ───────────────────────────────────────────────────────────────

/// Width × height in pixels. Either component being zero means "undefined".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const UNDEFINED: Dimensions = Dimensions {
        width: 0,
        height: 0,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_defined(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Swap width and height.
    pub fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    /// `width / height`, or `None` while undefined.
    pub fn aspect(&self) -> Option<f64> {
        self.is_defined()
            .then(|| self.width as f64 / self.height as f64)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = anyhow::Error;

    /// Parse `"1920x1080"` (an upper-case `X` is accepted too).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w
            .trim()
            .parse()
            .with_context(|| format!("invalid width in {s:?}"))?;
        let height = h
            .trim()
            .parse()
            .with_context(|| format!("invalid height in {s:?}"))?;
        Ok(Self::new(width, height))
    }
}

// ── Rotation ─────────────────────────────────────────────────────────────────

/// Clockwise orientation of the buffer relative to the display's natural
/// orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map a degree value onto a quarter turn. Anything that is not a multiple
    /// of 90 is unknown. Negative and >360 values are normalised first.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// 90° and 270°: width and height trade places.
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// Dimensions of a buffer of size `size` once rotated upright.
    pub fn apply(self, size: Dimensions) -> Dimensions {
        if self.is_quarter_turn() {
            size.transposed()
        } else {
            size
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_degrees(i32::from(value))
            .filter(|_| value < 360)
            .ok_or_else(|| format!("rotation must be 0, 90, 180 or 270, got {value}"))
    }
}

impl From<Rotation> for u16 {
    fn from(value: Rotation) -> Self {
        value.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

impl FromStr for Rotation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let degrees: u16 = s
            .trim()
            .parse()
            .with_context(|| format!("invalid rotation {s:?}"))?;
        Rotation::try_from(degrees).map_err(|e| anyhow!(e))
    }
}

// ── BBox ─────────────────────────────────────────────────────────────────────

/// Axis-aligned rectangle, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }
    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }

    /// Clamp to `[0, width] × [0, height]`.
    pub fn clamped(self, bounds: Dimensions) -> Self {
        let w = bounds.width as f32;
        let h = bounds.height as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

// ── Preview fit ──────────────────────────────────────────────────────────────

/// Size the buffer must be scaled to so that, once rotated upright, it covers
/// `view` on the constrained axis while keeping its aspect ratio.
///
/// The comparison happens in buffer orientation (the view is transposed for
/// quarter turns); the result is reported in view orientation.
pub fn scaled_to_view(buffer: Dimensions, view: Dimensions, rotation: Rotation) -> Option<Dimensions> {
    if !buffer.is_defined() || !view.is_defined() {
        return None;
    }

    let effective = rotation.apply(view);
    let buffer_ratio = buffer.width as f64 / buffer.height as f64;
    let view_ratio = effective.width as f64 / effective.height as f64;

    let scaled = if buffer_ratio > view_ratio {
        // Buffer is relatively wider: match height, width overflows.
        Dimensions::new(
            (effective.height as f64 * buffer_ratio).round() as u32,
            effective.height,
        )
    } else {
        // Match width, height overflows (or matches exactly).
        Dimensions::new(
            effective.width,
            (effective.width as f64 / buffer_ratio).round() as u32,
        )
    };

    Some(rotation.apply(scaled))
}

/// Immutable snapshot of the preview transform.
///
/// `scale_*` is the on-screen extent of the scaled buffer relative to the view,
/// `offset_*` the overflow cropped on each side of the view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Transform {
    pub rotation: Rotation,
    pub scale_x: f32,
    pub scale_y: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    pub scaled_output_size: Dimensions,
    pub buffer_size: Dimensions,
    pub view_size: Dimensions,
}

impl Transform {
    pub fn compute(buffer: Dimensions, view: Dimensions, rotation: Rotation) -> Option<Self> {
        let scaled = scaled_to_view(buffer, view, rotation)?;
        let vw = view.width as f32;
        let vh = view.height as f32;
        Some(Self {
            rotation,
            scale_x: scaled.width as f32 / vw,
            scale_y: scaled.height as f32 / vh,
            offset_x: (scaled.width as f32 - vw) / 2.0,
            offset_y: (scaled.height as f32 - vh) / 2.0,
            scaled_output_size: scaled,
            buffer_size: buffer,
            view_size: view,
        })
    }

    /// Homogeneous 3×3 matrix for the preview surface, in view pixels.
    ///
    /// The surface stretches the buffer to the view first; this matrix then
    /// pre-scales about the view centre and rotates by `-rotation`, so the
    /// pre-scale is expressed in the un-rotated axes.
    pub fn matrix(&self) -> Matrix3<f32> {
        let (cx, cy) = self.view_size.center();
        let vw = self.view_size.width as f32;
        let vh = self.view_size.height as f32;
        let out_w = self.scaled_output_size.width as f32;
        let out_h = self.scaled_output_size.height as f32;

        let (pre_x, pre_y) = if self.rotation.is_quarter_turn() {
            (out_h / vw, out_w / vh)
        } else {
            (out_w / vw, out_h / vh)
        };

        let angle = -(self.rotation.degrees() as f32).to_radians();
        Matrix3::new_translation(&Vector2::new(cx, cy))
            * Rotation2::new(angle).to_homogeneous()
            * Matrix3::new_nonuniform_scaling(&Vector2::new(pre_x, pre_y))
            * Matrix3::new_translation(&Vector2::new(-cx, -cy))
    }

    /// Map a point of the view-stretched buffer through [`Transform::matrix`].
    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        let p = self.matrix().transform_point(&Point2::new(x, y));
        (p.x, p.y)
    }
}

// ── Overlay fit ──────────────────────────────────────────────────────────────

/// Uniform scale plus one-axis centre crop from analysis-image pixels to
/// overlay pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayFit {
    pub scale: f32,
    pub x_offset: f32,
    pub y_offset: f32,
}

impl OverlayFit {
    pub const IDENTITY: OverlayFit = OverlayFit {
        scale: 1.0,
        x_offset: 0.0,
        y_offset: 0.0,
    };

    pub fn compute(image: Dimensions, view: Dimensions) -> Option<Self> {
        let image_aspect = image.aspect()?;
        let view_aspect = view.aspect()?;

        let iw = image.width as f32;
        let ih = image.height as f32;
        let vw = view.width as f32;
        let vh = view.height as f32;

        if view_aspect < image_aspect {
            // View is relatively narrower: match height, crop left/right.
            let scale = vh / ih;
            Some(Self {
                scale,
                x_offset: (iw * scale - vw) / 2.0,
                y_offset: 0.0,
            })
        } else {
            let scale = vw / iw;
            Some(Self {
                scale,
                x_offset: 0.0,
                y_offset: (ih * scale - vh) / 2.0,
            })
        }
    }

    pub fn map_rect(&self, b: BBox) -> BBox {
        BBox {
            x1: b.x1 * self.scale - self.x_offset,
            y1: b.y1 * self.scale - self.y_offset,
            x2: b.x2 * self.scale - self.x_offset,
            y2: b.y2 * self.scale - self.y_offset,
        }
    }
}

impl Default for OverlayFit {
    fn default() -> Self {
        Self::IDENTITY
    }
}
