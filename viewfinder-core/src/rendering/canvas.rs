//! `Canvas` over an in-memory image, used to burn overlays into frames.

use image::{Rgba, RgbaImage, RgbImage};
use imageproc::drawing::{self, Blend, Canvas as _};
use imageproc::rect::Rect;

use super::{font, Canvas};
use crate::geometry::BBox;

/// Draws into an RGBA copy of a frame with alpha blending. Overlay pixels map
/// one to one onto image pixels; anything outside the image is clipped.
pub struct ImageCanvas {
    target: Blend<RgbaImage>,
}

impl ImageCanvas {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            target: Blend(image),
        }
    }

    pub fn from_rgb(image: &RgbImage) -> Self {
        Self::new(image::DynamicImage::ImageRgb8(image.clone()).into_rgba8())
    }

    pub fn into_rgba(self) -> RgbaImage {
        self.target.0
    }

    pub fn into_rgb(self) -> RgbImage {
        image::DynamicImage::ImageRgba8(self.target.0).into_rgb8()
    }

    /// Overlay rect to integer image rect, `None` if it has no area.
    fn to_image_rect(&self, rect: BBox) -> Option<Rect> {
        let x1 = rect.x1.round() as i32;
        let y1 = rect.y1.round() as i32;
        let x2 = rect.x2.round() as i32;
        let y2 = rect.y2.round() as i32;
        let (w, h) = (x2 - x1, y2 - y1);
        (w > 0 && h > 0).then(|| Rect::at(x1, y1).of_size(w as u32, h as u32))
    }
}

impl Canvas for ImageCanvas {
    fn stroke_rect(&mut self, rect: BBox, width: f32, color: Rgba<u8>) {
        let Some(outer) = self.to_image_rect(rect) else {
            return;
        };
        // Concentric one-pixel rings, inwards from the box edge.
        let rings = (width.round() as i32).max(1);
        for i in 0..rings {
            let w = outer.width() as i32 - 2 * i;
            let h = outer.height() as i32 - 2 * i;
            if w <= 0 || h <= 0 {
                break;
            }
            let ring = Rect::at(outer.left() + i, outer.top() + i).of_size(w as u32, h as u32);
            drawing::draw_hollow_rect_mut(&mut self.target, ring, color);
        }
    }

    fn fill_round_rect(&mut self, rect: BBox, radius: f32, color: Rgba<u8>) {
        let Some(area) = self.to_image_rect(rect) else {
            return;
        };
        let (img_w, img_h) = self.target.dimensions();
        let r = radius
            .max(0.0)
            .min(area.width() as f32 / 2.0)
            .min(area.height() as f32 / 2.0);

        let x0 = area.left().max(0);
        let y0 = area.top().max(0);
        let x1 = area.right().min(img_w as i32 - 1);
        let y1 = area.bottom().min(img_h as i32 - 1);

        // Per pixel so overlapping corner shapes never blend twice.
        for y in y0..=y1 {
            for x in x0..=x1 {
                let px = x as f32 + 0.5;
                let py = y as f32 + 0.5;
                let left = area.left() as f32;
                let top = area.top() as f32;
                let right = area.right() as f32 + 1.0;
                let bottom = area.bottom() as f32 + 1.0;
                let cx = px.clamp(left + r, right - r);
                let cy = py.clamp(top + r, bottom - r);
                let (dx, dy) = (px - cx, py - cy);
                if dx * dx + dy * dy <= r * r {
                    self.target.draw_pixel(x as u32, y as u32, color);
                }
            }
        }
    }

    fn draw_text(&mut self, x: f32, y: f32, text: &str, scale: u32, color: Rgba<u8>) {
        let scale = scale.max(1);
        let left = x.round() as i32;
        let top = y.round() as i32;
        for (gx, gy) in font::pixels(text) {
            let cell = Rect::at(left + (gx * scale) as i32, top + (gy * scale) as i32)
                .of_size(scale, scale);
            drawing::draw_filled_rect_mut(&mut self.target, cell, color);
        }
    }

    fn measure_text(&self, text: &str, scale: u32) -> (f32, f32) {
        let (w, h) = font::measure(text, scale.max(1));
        (w as f32, h as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    #[test]
    fn stroke_paints_edges_not_interior() {
        let mut canvas = ImageCanvas::new(RgbaImage::new(20, 20));
        canvas.stroke_rect(BBox::new(2.0, 2.0, 12.0, 12.0), 2.0, WHITE);
        let image = canvas.into_rgba();
        assert_eq!(*image.get_pixel(2, 2), WHITE);
        assert_eq!(*image.get_pixel(3, 7), WHITE);
        assert_eq!(image.get_pixel(7, 7).0[3], 0);
    }

    #[test]
    fn translucent_fill_blends_once() {
        let base = RgbImage::from_pixel(10, 10, image::Rgb([200, 200, 200]));
        let mut canvas = ImageCanvas::from_rgb(&base);
        canvas.fill_round_rect(BBox::new(0.0, 0.0, 10.0, 10.0), 4.0, Rgba([0, 0, 0, 0x66]));
        let image = canvas.into_rgb();

        let centre = image.get_pixel(5, 5).0[0];
        assert!(centre < 200 && centre > 100, "centre {centre}");
        // Rounded corner left untouched.
        assert_eq!(image.get_pixel(0, 0).0[0], 200);
    }

    #[test]
    fn boxes_overflowing_the_image_are_clipped() {
        let mut canvas = ImageCanvas::new(RgbaImage::new(10, 10));
        canvas.stroke_rect(BBox::new(-5.0, 0.0, 5.0, 5.0), 1.0, WHITE);
        canvas.stroke_rect(BBox::new(-500.0, -500.0, -400.0, -400.0), 1.0, WHITE);
        let image = canvas.into_rgba();
        assert_eq!(*image.get_pixel(0, 0), WHITE);
        assert_eq!(image.get_pixel(9, 9).0[3], 0);
    }

    #[test]
    fn text_lands_inside_measured_box() {
        let mut canvas = ImageCanvas::new(RgbaImage::new(64, 16));
        let (w, h) = canvas.measure_text("Food", 2);
        canvas.draw_text(1.0, 1.0, "Food", 2, WHITE);
        let image = canvas.into_rgba();
        let painted: Vec<(u32, u32)> = image
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[3] > 0)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert!(!painted.is_empty());
        for (x, y) in painted {
            assert!((x as f32) >= 1.0 && (x as f32) < 1.0 + w);
            assert!((y as f32) >= 1.0 && (y as f32) < 1.0 + h);
        }
    }
}
