//! Software preview surface: warps camera buffers into the view with the
//! matrix the controller publishes.

use std::sync::{Mutex, PoisonError};

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::{Matrix3, Vector2};
use tracing::warn;

use crate::controller::PreviewSurface;
use crate::geometry::Dimensions;

/// Holds the latest preview matrix. Until one arrives, buffers are simply
/// stretched to the view, as an untransformed surface would show them.
pub struct PreviewCompositor {
    view: Dimensions,
    matrix: Mutex<Matrix3<f32>>,
}

impl PreviewCompositor {
    pub fn new(view: Dimensions) -> Self {
        Self {
            view,
            matrix: Mutex::new(Matrix3::identity()),
        }
    }

    pub fn view(&self) -> Dimensions {
        self.view
    }

    pub fn matrix(&self) -> Matrix3<f32> {
        *self.matrix.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Render `buffer` as the view would show it. Areas the buffer does not
    /// cover stay black.
    pub fn compose(&self, buffer: &RgbImage) -> RgbImage {
        let mut out = RgbImage::new(self.view.width, self.view.height);
        if !self.view.is_defined() || buffer.width() == 0 || buffer.height() == 0 {
            return out;
        }

        // Buffer pixels → view-stretched buffer → preview matrix.
        let stretch = Matrix3::new_nonuniform_scaling(&Vector2::new(
            self.view.width as f32 / buffer.width() as f32,
            self.view.height as f32 / buffer.height() as f32,
        ));
        let m = self.matrix() * stretch;
        #[rustfmt::skip]
        let row_major = [
            m[(0, 0)], m[(0, 1)], m[(0, 2)],
            m[(1, 0)], m[(1, 1)], m[(1, 2)],
            m[(2, 0)], m[(2, 1)], m[(2, 2)],
        ];
        let Some(projection) = Projection::from_matrix(row_major) else {
            warn!("preview matrix is not invertible; leaving frame black");
            return out;
        };

        warp_into(buffer, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
        out
    }
}

impl PreviewSurface for PreviewCompositor {
    fn set_transform(&self, matrix: Matrix3<f32>) {
        *self.matrix.lock().unwrap_or_else(PoisonError::into_inner) = matrix;
    }
}
