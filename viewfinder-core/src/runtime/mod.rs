//! runtime — the running viewfinder
//!
//! [`Viewfinder::start`] wires the frame scheduler, one analyzer thread
//! driving the detection orchestrator, and the overlay. The camera side only
//! ever calls [`Viewfinder::submit`]; it never waits on detection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::camera::CameraFrame;
use crate::config::ViewfinderConfig;
use crate::detection::ObjectDetector;
use crate::pipeline::DetectionOrchestrator;
use crate::rendering::OverlayRenderer;
use crate::scheduler::{spawn_consumer, Admission, FrameScheduler, SchedulerStats};

// ── Host liveness ────────────────────────────────────────────────────────────

/// Shared "is the destination still there?" flag. Results are published only
/// while it is alive.
#[derive(Debug, Clone)]
pub struct HostHandle(Arc<AtomicBool>);

impl HostHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the host as torn down. Irreversible.
    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for HostHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ── Viewfinder ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    analyzed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViewfinderStats {
    pub scheduler: SchedulerStats,
    /// Frames whose boxes reached the overlay.
    pub analyzed: u64,
    /// Frames dropped by a detection failure (timeout, busy, detector error).
    pub failed: u64,
    /// Results thrown away because the host was already gone.
    pub discarded: u64,
}

pub struct Viewfinder {
    scheduler: Arc<FrameScheduler<CameraFrame>>,
    overlay: Arc<OverlayRenderer>,
    host: HostHandle,
    counters: Arc<Counters>,
    consumer: Option<JoinHandle<()>>,
}

impl Viewfinder {
    pub fn start<D>(detector: D, overlay: Arc<OverlayRenderer>, config: &ViewfinderConfig) -> Result<Self>
    where
        D: ObjectDetector + 'static,
    {
        let mut orchestrator = DetectionOrchestrator::with_config(detector, &config.detection)?;
        let scheduler = Arc::new(FrameScheduler::new());
        let host = HostHandle::new();
        let counters = Arc::new(Counters::default());
        let clear_on_failure = config.detection.clear_overlay_on_failure;

        let consumer = {
            let overlay = Arc::clone(&overlay);
            let host = host.clone();
            let counters = Arc::clone(&counters);
            spawn_consumer(Arc::clone(&scheduler), "viewfinder-analyzer", move |frame: CameraFrame| {
                let sequence = frame.sequence;
                let outcome = orchestrator.analyze(frame);
                if !host.is_alive() {
                    counters.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(sequence, "host released; discarding detection result");
                    return;
                }
                match outcome {
                    Ok(result) => {
                        debug!(sequence, boxes = result.boxes.len(), "overlay updated");
                        overlay.apply(result);
                        counters.analyzed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(sequence, "frame dropped: {e}");
                        if clear_on_failure {
                            overlay.clear();
                        }
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })?
        };

        info!(clear_on_failure, "viewfinder started");
        Ok(Self {
            scheduler,
            overlay,
            host,
            counters,
            consumer: Some(consumer),
        })
    }

    /// Offer a camera frame. Returns whether it was admitted; a refused frame
    /// is released before this returns.
    pub fn submit(&self, frame: CameraFrame) -> bool {
        match self.scheduler.offer(frame) {
            Admission::Accepted => true,
            Admission::Busy(refused) | Admission::Closed(refused) => {
                drop(refused);
                false
            }
        }
    }

    pub fn overlay(&self) -> &Arc<OverlayRenderer> {
        &self.overlay
    }

    pub fn host(&self) -> HostHandle {
        self.host.clone()
    }

    /// True while a frame is admitted and not yet finished.
    pub fn is_busy(&self) -> bool {
        self.scheduler.is_busy()
    }

    pub fn stats(&self) -> ViewfinderStats {
        ViewfinderStats {
            scheduler: self.scheduler.stats(),
            analyzed: self.counters.analyzed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Tear down: results still in flight are discarded, the analyzer thread
    /// is joined.
    pub fn shutdown(mut self) -> Result<ViewfinderStats> {
        self.stop()?;
        let stats = self.stats();
        info!(?stats, "viewfinder stopped");
        Ok(stats)
    }

    fn stop(&mut self) -> Result<()> {
        self.host.release();
        self.scheduler.close();
        match self.consumer.take() {
            Some(consumer) => consumer
                .join()
                .map_err(|_| anyhow!("viewfinder analyzer thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for Viewfinder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{e:#}");
        }
    }
}

// ── ONNX Runtime discovery ───────────────────────────────────────────────────

#[cfg(target_os = "windows")]
const ORT_LIBRARY: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_LIBRARY: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const ORT_LIBRARY: &str = "libonnxruntime.so";

/// Point `ORT_DYLIB_PATH` at an ONNX Runtime library before the first session
/// is built. Returns the library in use, if any was found.
///
/// Search order: a valid `ORT_DYLIB_PATH`, then `models/` next to the working
/// directory or any ancestor of the executable, then system library dirs.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing = PathBuf::from(existing);
        if existing.is_file() {
            info!(path = %existing.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing);
        }
        warn!(path = %existing.display(), "ORT_DYLIB_PATH does not exist; searching");
    }

    let Some(found) = find_ort_library(&search_roots()) else {
        warn!(library = ORT_LIBRARY, "ONNX Runtime not found; set ORT_DYLIB_PATH");
        return None;
    };
    // SAFETY: called once at startup before any ORT session or detector
    // thread exists, so nothing reads the environment concurrently.
    unsafe {
        std::env::set_var("ORT_DYLIB_PATH", &found);
    }
    info!(path = %found.display(), "configured ORT_DYLIB_PATH");
    Some(found)
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe() {
        roots.extend(exe.ancestors().skip(1).take(7).map(Path::to_path_buf));
    }
    roots
}

/// First existing ONNX Runtime library under `roots`, then system dirs.
fn find_ort_library(roots: &[PathBuf]) -> Option<PathBuf> {
    let local = roots.iter().flat_map(|root| {
        [
            root.join("models/onnxruntime/lib").join(ORT_LIBRARY),
            root.join("models").join(ORT_LIBRARY),
        ]
    });
    let system = ["/opt/homebrew/lib", "/usr/local/lib", "/usr/lib"]
        .into_iter()
        .map(|dir| Path::new(dir).join(ORT_LIBRARY));
    local.chain(system).find(|candidate| candidate.is_file())
}
