//! rendering — detection overlay
//!
//! [`OverlayRenderer`] owns the boxes currently on screen and the fit that
//! places them. Updates replace the whole set under one lock; `draw` copies a
//! snapshot out and paints it onto any [`Canvas`] without holding the lock, so
//! a redraw racing an update sees either the old set or the new one.

mod canvas;
pub mod font;
mod preview;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use image::Rgba;
use tracing::debug;

use crate::config::OverlayStyle;
use crate::controller::TransformSink;
use crate::detection::{DetectedBox, DetectedBoxes};
use crate::geometry::{BBox, Dimensions, OverlayFit, Transform};

pub use canvas::ImageCanvas;
pub use preview::PreviewCompositor;

// ── Style ────────────────────────────────────────────────────────────────────

/// Parse `#RRGGBB` or `#AARRGGBB`.
pub fn parse_color(s: &str) -> Result<Rgba<u8>> {
    let hex = s
        .strip_prefix('#')
        .with_context(|| format!("colour {s:?} must start with '#'"))?;
    let value = u32::from_str_radix(hex, 16).with_context(|| format!("invalid colour {s:?}"))?;
    let [a, r, g, b] = match hex.len() {
        6 => (0xFF00_0000 | value).to_be_bytes(),
        8 => value.to_be_bytes(),
        _ => bail!("colour {s:?} must have 6 or 8 hex digits"),
    };
    Ok(Rgba([r, g, b, a]))
}

/// [`OverlayStyle`] with its colours resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptionStyle {
    pub stroke_width: f32,
    pub padding: f32,
    pub corner_radius: f32,
    pub text_scale: u32,
    pub box_color: Rgba<u8>,
    pub background: Rgba<u8>,
    pub text_color: Rgba<u8>,
}

impl CaptionStyle {
    pub fn from_config(style: &OverlayStyle) -> Result<Self> {
        Ok(Self {
            stroke_width: style.stroke_width.max(0.0),
            padding: style.caption_padding.max(0.0),
            corner_radius: style.corner_radius.max(0.0),
            text_scale: style.text_scale.max(1),
            box_color: parse_color(&style.box_color).context("overlay.box_color")?,
            background: parse_color(&style.caption_background)
                .context("overlay.caption_background")?,
            text_color: parse_color(&style.text_color).context("overlay.text_color")?,
        })
    }
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            stroke_width: 2.0,
            padding: 8.0,
            corner_radius: 4.0,
            text_scale: 4,
            box_color: Rgba([255, 255, 255, 255]),
            background: Rgba([0, 0, 0, 0x66]),
            text_color: Rgba([255, 255, 255, 255]),
        }
    }
}

// ── Collaborators ────────────────────────────────────────────────────────────

/// Drawing surface for the overlay, in overlay pixels.
pub trait Canvas {
    fn stroke_rect(&mut self, rect: BBox, width: f32, color: Rgba<u8>);
    fn fill_round_rect(&mut self, rect: BBox, radius: f32, color: Rgba<u8>);
    /// Draw `text` with its top-left corner at `(x, y)`.
    fn draw_text(&mut self, x: f32, y: f32, text: &str, scale: u32, color: Rgba<u8>);
    /// `(width, height)` of `text` as `draw_text` would paint it.
    fn measure_text(&self, text: &str, scale: u32) -> (f32, f32);
}

/// "Please redraw soon." Called after every change to what the overlay shows.
pub trait RedrawSignal: Send + Sync {
    fn request_redraw(&self);
}

impl<F: Fn() + Send + Sync> RedrawSignal for F {
    fn request_redraw(&self) {
        self()
    }
}

// ── Renderer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct OverlayState {
    boxes: Vec<DetectedBox>,
    image_size: Dimensions,
    view_size: Dimensions,
    fit: Option<OverlayFit>,
}

impl OverlayState {
    /// Recompute the fit; undefined sizes keep the previous one.
    fn refit(&mut self) {
        if let Some(fit) = OverlayFit::compute(self.image_size, self.view_size) {
            self.fit = Some(fit);
        }
    }
}

/// Copy of what the overlay would draw right now.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySnapshot {
    pub boxes: Vec<DetectedBox>,
    pub fit: Option<OverlayFit>,
}

pub struct OverlayRenderer {
    state: Mutex<OverlayState>,
    style: CaptionStyle,
    redraw: Option<Arc<dyn RedrawSignal>>,
}

impl OverlayRenderer {
    pub fn new(style: CaptionStyle) -> Self {
        Self {
            state: Mutex::new(OverlayState::default()),
            style,
            redraw: None,
        }
    }

    pub fn with_redraw(mut self, signal: Arc<dyn RedrawSignal>) -> Self {
        self.redraw = Some(signal);
        self
    }

    pub fn style(&self) -> &CaptionStyle {
        &self.style
    }

    fn lock(&self) -> MutexGuard<'_, OverlayState> {
        // Every writer replaces whole values, so a poisoned state is intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_redraw(&self) {
        if let Some(signal) = &self.redraw {
            signal.request_redraw();
        }
    }

    /// Replace everything drawn with `boxes`. An empty set draws nothing.
    pub fn update(&self, boxes: Vec<DetectedBox>) {
        self.lock().boxes = boxes;
        self.request_redraw();
    }

    /// Publish one analysis result: its image size and its boxes together.
    pub fn apply(&self, result: DetectedBoxes) {
        {
            let mut state = self.lock();
            if result.image_size.is_defined() && result.image_size != state.image_size {
                state.image_size = result.image_size;
                state.refit();
            }
            state.boxes = result.boxes;
        }
        self.request_redraw();
    }

    pub fn clear(&self) {
        self.update(Vec::new());
    }

    pub fn set_image_size(&self, width: u32, height: u32) {
        self.resize(|state| &mut state.image_size, Dimensions::new(width, height));
    }

    pub fn set_view_size(&self, width: u32, height: u32) {
        self.resize(|state| &mut state.view_size, Dimensions::new(width, height));
    }

    fn resize(&self, field: impl FnOnce(&mut OverlayState) -> &mut Dimensions, size: Dimensions) {
        if !size.is_defined() {
            debug!(%size, "ignoring undefined overlay size");
            return;
        }
        let changed = {
            let mut state = self.lock();
            let slot = field(&mut *state);
            if *slot == size {
                false
            } else {
                *slot = size;
                state.refit();
                true
            }
        };
        if changed {
            self.request_redraw();
        }
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        let state = self.lock();
        OverlaySnapshot {
            boxes: state.boxes.clone(),
            fit: state.fit,
        }
    }

    /// Paint the current boxes. Nothing is drawn until both sizes are known.
    pub fn draw(&self, canvas: &mut dyn Canvas) {
        let OverlaySnapshot { boxes, fit } = self.snapshot();
        let Some(fit) = fit else {
            return;
        };
        let style = &self.style;

        for b in &boxes {
            let rect = fit.map_rect(b.bounding_box);
            canvas.stroke_rect(rect, style.stroke_width, style.box_color);
            if b.label.is_empty() {
                continue;
            }

            let (text_w, text_h) = canvas.measure_text(&b.label, style.text_scale);
            // Caption hangs below the box's bottom-left corner.
            let background = BBox::new(
                rect.x1,
                rect.y2 - style.padding,
                rect.x1 + style.padding + text_w + style.padding,
                rect.y2 + text_h + style.padding,
            );
            canvas.fill_round_rect(background, style.corner_radius, style.background);
            canvas.draw_text(
                rect.x1 + style.padding,
                rect.y2,
                &b.label,
                style.text_scale,
                style.text_color,
            );
        }
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(CaptionStyle::default())
    }
}

/// The overlay covers the view; its fit does the same centre crop as the
/// preview transform.
impl TransformSink for OverlayRenderer {
    fn on_transform(&self, transform: &Transform) {
        let size = transform.view_size;
        self.set_view_size(size.width, size.height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum Op {
        Stroke(BBox),
        Fill(BBox),
        Text(f32, f32, String),
    }

    #[derive(Default)]
    struct Recorder(Vec<Op>);

    impl Canvas for Recorder {
        fn stroke_rect(&mut self, rect: BBox, _: f32, _: Rgba<u8>) {
            self.0.push(Op::Stroke(rect));
        }
        fn fill_round_rect(&mut self, rect: BBox, _: f32, _: Rgba<u8>) {
            self.0.push(Op::Fill(rect));
        }
        fn draw_text(&mut self, x: f32, y: f32, text: &str, _: u32, _: Rgba<u8>) {
            self.0.push(Op::Text(x, y, text.to_string()));
        }
        fn measure_text(&self, text: &str, _: u32) -> (f32, f32) {
            (text.len() as f32 * 10.0, 20.0)
        }
    }

    fn counting_overlay() -> (OverlayRenderer, Arc<AtomicUsize>) {
        let redraws = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&redraws);
        let overlay = OverlayRenderer::default().with_redraw(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (overlay, redraws)
    }

    #[test]
    fn parses_hex_colours() {
        assert_eq!(parse_color("#FFFFFF").unwrap(), Rgba([255, 255, 255, 255]));
        assert_eq!(parse_color("#66000000").unwrap(), Rgba([0, 0, 0, 0x66]));
        assert_eq!(parse_color("#1a2B3c").unwrap(), Rgba([0x1a, 0x2b, 0x3c, 255]));
        assert!(parse_color("FFFFFF").is_err());
        assert!(parse_color("#FFF").is_err());
        assert!(parse_color("#GGGGGG").is_err());
    }

    #[test]
    fn default_style_matches_config_defaults() {
        let style = CaptionStyle::from_config(&OverlayStyle::default()).unwrap();
        assert_eq!(style, CaptionStyle::default());
    }

    #[test]
    fn draws_mapped_box_with_caption_below() {
        let overlay = OverlayRenderer::default();
        overlay.set_image_size(1280, 720);
        overlay.set_view_size(1080, 1080);
        overlay.update(vec![DetectedBox::new(
            "cup 91%",
            Some(0.91),
            BBox::new(100.0, 100.0, 200.0, 200.0),
        )]);

        let mut canvas = Recorder::default();
        overlay.draw(&mut canvas);

        let rect = BBox::new(-270.0, 150.0, -120.0, 300.0);
        assert_eq!(
            canvas.0,
            vec![
                Op::Stroke(rect),
                Op::Fill(BBox::new(-270.0, 292.0, -270.0 + 8.0 + 70.0 + 8.0, 328.0)),
                Op::Text(-262.0, 300.0, "cup 91%".to_string()),
            ]
        );
    }

    #[test]
    fn empty_label_is_outline_only() {
        let overlay = OverlayRenderer::default();
        overlay.set_image_size(100, 100);
        overlay.set_view_size(100, 100);
        overlay.update(vec![DetectedBox::new("", None, BBox::new(1.0, 2.0, 3.0, 4.0))]);

        let mut canvas = Recorder::default();
        overlay.draw(&mut canvas);
        assert_eq!(canvas.0, vec![Op::Stroke(BBox::new(1.0, 2.0, 3.0, 4.0))]);
    }

    #[test]
    fn nothing_drawn_until_sizes_known() {
        let overlay = OverlayRenderer::default();
        overlay.update(vec![DetectedBox::new("x", None, BBox::new(0.0, 0.0, 1.0, 1.0))]);
        let mut canvas = Recorder::default();
        overlay.draw(&mut canvas);
        assert!(canvas.0.is_empty());
    }

    #[test]
    fn update_replaces_whole_set_and_signals_redraw() {
        let (overlay, redraws) = counting_overlay();
        let a = DetectedBox::new("a", None, BBox::new(0.0, 0.0, 1.0, 1.0));
        let b = DetectedBox::new("b", None, BBox::new(2.0, 2.0, 3.0, 3.0));

        overlay.update(vec![a.clone(), b.clone()]);
        overlay.update(vec![b.clone()]);
        assert_eq!(overlay.snapshot().boxes, vec![b]);

        overlay.clear();
        assert!(overlay.snapshot().boxes.is_empty());
        assert_eq!(redraws.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unchanged_or_undefined_sizes_do_not_redraw() {
        let (overlay, redraws) = counting_overlay();
        overlay.set_image_size(640, 480);
        overlay.set_view_size(320, 240);
        assert_eq!(redraws.load(Ordering::SeqCst), 2);
        let fit = overlay.snapshot().fit;
        assert_eq!(fit.map(|f| f.scale), Some(0.5));

        overlay.set_view_size(320, 240);
        overlay.set_view_size(0, 240);
        assert_eq!(redraws.load(Ordering::SeqCst), 2);
        assert_eq!(overlay.snapshot().fit, fit);
    }

    #[test]
    fn apply_sets_image_size_and_boxes() {
        let overlay = OverlayRenderer::default();
        overlay.set_view_size(200, 200);
        overlay.apply(DetectedBoxes {
            sequence: 1,
            image_size: Dimensions::new(100, 100),
            boxes: vec![DetectedBox::new("", None, BBox::new(10.0, 10.0, 20.0, 20.0))],
        });
        let mut canvas = Recorder::default();
        overlay.draw(&mut canvas);
        assert_eq!(canvas.0, vec![Op::Stroke(BBox::new(20.0, 20.0, 40.0, 40.0))]);
    }

    #[test]
    fn transform_sink_adopts_view_size() {
        let overlay = OverlayRenderer::default();
        overlay.set_image_size(1080, 1920);
        let transform = Transform::compute(
            Dimensions::new(1920, 1080),
            Dimensions::new(1080, 1920),
            Rotation::Deg90,
        )
        .unwrap();
        overlay.on_transform(&transform);
        assert_eq!(overlay.snapshot().fit, Some(OverlayFit::IDENTITY));
    }

    #[test]
    fn controller_driven_overlay_draws_in_view_pixels() {
        use crate::controller::{ViewfinderController, ViewfinderEvent};

        let overlay = Arc::new(OverlayRenderer::default());
        overlay.set_image_size(1920, 1080);
        let mut controller = ViewfinderController::new(0);
        controller.add_sink(overlay.clone());
        controller.handle(ViewfinderEvent::BufferChanged {
            size: Dimensions::new(1920, 1080),
            rotation: Some(Rotation::Deg0),
        });
        assert!(controller.handle(ViewfinderEvent::ViewLayoutChanged {
            size: Dimensions::new(800, 600),
            rotation: None,
        }));
        let transform = controller.transform().unwrap();

        overlay.update(vec![DetectedBox::new("", None, BBox::new(0.0, 0.0, 1920.0, 1080.0))]);
        let mut canvas = Recorder::default();
        overlay.draw(&mut canvas);

        // The full image lands exactly where the preview puts the buffer:
        // centred on the 800×600 view with the same crop on both sides.
        let [Op::Stroke(rect)] = canvas.0.as_slice() else {
            panic!("expected one outline, got {:?}", canvas.0);
        };
        assert!((rect.x1 + transform.offset_x).abs() <= 1.0, "{rect:?} vs {transform:?}");
        assert!((rect.x2 - 800.0 - transform.offset_x).abs() <= 1.0, "{rect:?}");
        assert!((rect.x1 + 133.33).abs() < 0.01);
        assert!(rect.y1.abs() < 0.01 && (rect.y2 - 600.0).abs() < 0.01, "{rect:?}");
    }

    #[test]
    fn concurrent_updates_never_expose_partial_sets() {
        let overlay = Arc::new(OverlayRenderer::default());
        let full: Vec<DetectedBox> = (0..16)
            .map(|i| DetectedBox::new(format!("{i}"), None, BBox::new(0.0, 0.0, 1.0, 1.0)))
            .collect();

        let writer = {
            let overlay = Arc::clone(&overlay);
            let full = full.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    overlay.update(if i % 2 == 0 { full.clone() } else { Vec::new() });
                }
            })
        };
        for _ in 0..500 {
            let n = overlay.snapshot().boxes.len();
            assert!(n == 0 || n == full.len());
        }
        writer.join().unwrap();
    }
}
