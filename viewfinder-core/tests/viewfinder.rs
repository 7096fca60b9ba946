use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use viewfinder_core::config::ViewfinderConfig;
use viewfinder_core::detection::{Category, Classification, ObjectDetector, RawDetection};
use viewfinder_core::geometry::{BBox, Dimensions, Rotation};
use viewfinder_core::{CameraFrame, OverlayRenderer, RgbFrame, Viewfinder};

/// Scripted detector: each call takes the next delay from the script (zero
/// once the script runs out) and reports one box labelled with the call index.
struct Scripted {
    delays: Vec<Duration>,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(delays: &[u64]) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Self {
            delays: delays.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            calls: Arc::clone(&calls),
        };
        (detector, calls)
    }
}

impl ObjectDetector for Scripted {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    fn process(&mut self, image: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(call) {
            thread::sleep(*delay);
        }
        Ok(vec![RawDetection {
            bbox: BBox::new(0.0, 0.0, image.width() as f32 / 2.0, image.height() as f32 / 2.0),
            classification: Some(Classification {
                category: Category::Plant,
                confidence: Some(0.5 + call as f32 / 100.0),
            }),
            ..Default::default()
        }])
    }
}

fn config(timeout_ms: u64, clear_overlay_on_failure: bool) -> ViewfinderConfig {
    let mut config = ViewfinderConfig::default();
    config.detection.timeout_ms = timeout_ms;
    config.detection.clear_overlay_on_failure = clear_overlay_on_failure;
    config
}

fn frame(sequence: u64, released: &Arc<AtomicU64>) -> CameraFrame {
    let counter = Arc::clone(released);
    CameraFrame::new(
        RgbFrame::from_image(RgbImage::new(64, 48), sequence as i64),
        Rotation::Deg90,
        sequence,
    )
    .with_release_hook(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn detection_results_reach_the_overlay() {
    let (detector, _) = Scripted::new(&[]);
    let overlay = Arc::new(OverlayRenderer::default());
    overlay.set_view_size(96, 128);
    let viewfinder = Viewfinder::start(detector, Arc::clone(&overlay), &config(1_000, false)).unwrap();
    let released = Arc::new(AtomicU64::new(0));

    assert!(viewfinder.submit(frame(0, &released)));
    wait_until("first result", || viewfinder.stats().analyzed == 1);

    let snapshot = overlay.snapshot();
    assert_eq!(snapshot.boxes.len(), 1);
    assert_eq!(snapshot.boxes[0].label, "Plant 50%");
    // Upright 48×64 image into a 96×128 view: uniform 2× scale.
    assert_eq!(snapshot.fit.map(|f| f.scale), Some(2.0));
    assert_eq!(snapshot.boxes[0].bounding_box, BBox::new(0.0, 0.0, 24.0, 32.0));

    let stats = viewfinder.shutdown().unwrap();
    assert_eq!(stats.scheduler.accepted, 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn frames_offered_while_busy_are_released_immediately() {
    let (detector, calls) = Scripted::new(&[200]);
    let overlay = Arc::new(OverlayRenderer::default());
    let viewfinder = Viewfinder::start(detector, Arc::clone(&overlay), &config(2_000, false)).unwrap();
    let released = Arc::new(AtomicU64::new(0));

    assert!(viewfinder.submit(frame(0, &released)));
    wait_until("detector to start", || calls.load(Ordering::SeqCst) == 1);
    // The admitted frame is released as soon as the detector has its copy.
    wait_until("admitted frame release", || released.load(Ordering::SeqCst) == 1);

    for sequence in 1..=20 {
        assert!(!viewfinder.submit(frame(sequence, &released)));
    }
    assert_eq!(released.load(Ordering::SeqCst), 21);

    wait_until("slot to free up", || !viewfinder.is_busy());
    assert!(viewfinder.submit(frame(21, &released)));
    wait_until("second result", || viewfinder.stats().analyzed == 2);

    let stats = viewfinder.shutdown().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(stats.scheduler.dropped, 20);
    assert_eq!(released.load(Ordering::SeqCst), 22);
}

fn timeout_scenario(clear_overlay_on_failure: bool) -> usize {
    // First frame succeeds; second stalls past the 50 ms timeout.
    let (detector, _) = Scripted::new(&[0, 400]);
    let overlay = Arc::new(OverlayRenderer::default());
    overlay.set_view_size(48, 64);
    let viewfinder = Viewfinder::start(
        detector,
        Arc::clone(&overlay),
        &config(50, clear_overlay_on_failure),
    )
    .unwrap();
    let released = Arc::new(AtomicU64::new(0));

    assert!(viewfinder.submit(frame(0, &released)));
    wait_until("first result", || viewfinder.stats().analyzed == 1);
    wait_until("slot to free up", || !viewfinder.is_busy());

    assert!(viewfinder.submit(frame(1, &released)));
    wait_until("timeout", || viewfinder.stats().failed == 1);
    wait_until("slot to free up", || !viewfinder.is_busy());

    let boxes = overlay.snapshot().boxes.len();
    viewfinder.shutdown().unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 2);
    boxes
}

#[test]
fn timeout_keeps_previous_boxes_by_default() {
    assert_eq!(timeout_scenario(false), 1);
}

#[test]
fn timeout_clears_overlay_when_configured() {
    assert_eq!(timeout_scenario(true), 0);
}

#[test]
fn results_arriving_after_shutdown_are_discarded() {
    let (detector, calls) = Scripted::new(&[150]);
    let redraws = Arc::new(Mutex::new(0usize));
    let overlay = {
        let redraws = Arc::clone(&redraws);
        Arc::new(OverlayRenderer::default().with_redraw(Arc::new(move || {
            *redraws.lock().unwrap() += 1;
        })))
    };
    let viewfinder = Viewfinder::start(detector, Arc::clone(&overlay), &config(2_000, false)).unwrap();
    let host = viewfinder.host();
    let released = Arc::new(AtomicU64::new(0));

    assert!(viewfinder.submit(frame(0, &released)));
    wait_until("detector to start", || calls.load(Ordering::SeqCst) == 1);

    let stats = viewfinder.shutdown().unwrap();
    assert!(!host.is_alive());
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.analyzed, 0);
    assert!(overlay.snapshot().boxes.is_empty());
    assert_eq!(*redraws.lock().unwrap(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn rotated_frames_report_upright_image_size() {
    let (detector, _) = Scripted::new(&[]);
    let overlay = Arc::new(OverlayRenderer::default());
    // Same aspect as the upright 48×64 image: the fit is the identity.
    overlay.set_view_size(48, 64);
    let viewfinder = Viewfinder::start(detector, Arc::clone(&overlay), &config(1_000, false)).unwrap();
    let released = Arc::new(AtomicU64::new(0));

    assert!(viewfinder.submit(frame(0, &released)));
    wait_until("result", || viewfinder.stats().analyzed == 1);

    let fit = overlay.snapshot().fit.unwrap();
    assert_eq!(fit.scale, 1.0);
    assert_eq!(Rotation::Deg90.apply(Dimensions::new(64, 48)), Dimensions::new(48, 64));
    viewfinder.shutdown().unwrap();
}
