//! pipeline — detect-and-wait orchestration
//!
//! The detector runs on its own worker thread. `analyze` hands it the upright
//! image and waits at most the configured timeout for the answer. A request
//! that times out is abandoned: its late response is recognised by id and
//! thrown away, and until it arrives new requests fail fast with
//! [`DetectionError::Busy`] instead of piling up behind a stalled model.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::camera::CameraFrame;
use crate::config::DetectionConfig;
use crate::detection::{
    debug_print, DetectedBox, DetectedBoxes, DetectionError, ObjectDetector, RawDetection,
};
use crate::geometry::Dimensions;

const PROFILE_INTERVAL: u64 = 300;

struct Request {
    id: u64,
    image: RgbImage,
}

struct Response {
    id: u64,
    result: Result<Vec<RawDetection>>,
}

pub struct DetectionOrchestrator {
    requests: Option<SyncSender<Request>>,
    responses: Receiver<Response>,
    worker: Option<JoinHandle<()>>,
    detector_name: String,
    timeout: Duration,
    next_id: u64,
    in_flight: Option<u64>,
    prof_frames: u64,
    prof_failures: u64,
    prof_rotate: Duration,
    prof_detect: Duration,
}

impl DetectionOrchestrator {
    pub fn new<D>(detector: D, timeout: Duration) -> Result<Self>
    where
        D: ObjectDetector + 'static,
    {
        let detector_name = detector.name();
        let (req_tx, req_rx) = mpsc::sync_channel::<Request>(1);
        let (resp_tx, resp_rx) = mpsc::channel::<Response>();

        let worker = thread::Builder::new()
            .name(format!("detector-{detector_name}"))
            .spawn(move || detector_worker(detector, req_rx, resp_tx))
            .context("failed to spawn detector worker")?;

        info!(detector = %detector_name, timeout_ms = timeout.as_millis() as u64, "detection orchestrator started");
        Ok(Self {
            requests: Some(req_tx),
            responses: resp_rx,
            worker: Some(worker),
            detector_name,
            timeout,
            next_id: 0,
            in_flight: None,
            prof_frames: 0,
            prof_failures: 0,
            prof_rotate: Duration::ZERO,
            prof_detect: Duration::ZERO,
        })
    }

    pub fn with_config<D>(detector: D, config: &DetectionConfig) -> Result<Self>
    where
        D: ObjectDetector + 'static,
    {
        Self::new(detector, config.timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run detection on `frame`, which is released before this returns on
    /// every path.
    pub fn analyze(&mut self, frame: CameraFrame) -> Result<DetectedBoxes, DetectionError> {
        let result = self.analyze_inner(frame);

        self.prof_frames += 1;
        if result.is_err() {
            self.prof_failures += 1;
        }
        if self.prof_frames % PROFILE_INTERVAL == 0 {
            info!(
                detector = %self.detector_name,
                frames = self.prof_frames,
                failures = self.prof_failures,
                rotate_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_rotate.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "pipeline analyze timings"
            );
        }
        result
    }

    fn analyze_inner(&mut self, frame: CameraFrame) -> Result<DetectedBoxes, DetectionError> {
        let sequence = frame.sequence;
        if frame.image.is_empty() {
            return Err(DetectionError::EmptyImage);
        }

        let rotate_start = Instant::now();
        let image = frame
            .image
            .upright(frame.rotation)
            .ok_or(DetectionError::EmptyImage)?;
        // The detector works on its own copy; hand the buffer back now.
        drop(frame);
        self.prof_rotate += rotate_start.elapsed();

        let image_size = Dimensions::new(image.width(), image.height());
        let detect_start = Instant::now();
        let raw = self.detect(image);
        self.prof_detect += detect_start.elapsed();
        let raw = raw?;

        debug_print(&raw);
        Ok(DetectedBoxes {
            sequence,
            image_size,
            boxes: raw.iter().map(DetectedBox::from_raw).collect(),
        })
    }

    /// Send `image` to the worker and wait for its answer.
    fn detect(&mut self, image: RgbImage) -> Result<Vec<RawDetection>, DetectionError> {
        self.collect_abandoned()?;
        if self.in_flight.is_some() {
            return Err(DetectionError::Busy);
        }

        let id = self.next_id;
        self.next_id += 1;
        let requests = self.requests.as_ref().ok_or(DetectionError::Disconnected)?;
        requests
            .try_send(Request { id, image })
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => DetectionError::Busy,
                mpsc::TrySendError::Disconnected(_) => DetectionError::Disconnected,
            })?;
        self.in_flight = Some(id);

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) if response.id == id => {
                    self.in_flight = None;
                    return response.result.map_err(DetectionError::Detector);
                }
                Ok(stale) => debug!(id = stale.id, "discarding stale detection result"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(id, timeout_ms = self.timeout.as_millis() as u64, "detection timed out; dropping frame");
                    return Err(DetectionError::Timeout(self.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DetectionError::Disconnected),
            }
        }
    }

    /// Drain late answers to abandoned requests.
    fn collect_abandoned(&mut self) -> Result<(), DetectionError> {
        while self.in_flight.is_some() {
            match self.responses.try_recv() {
                Ok(response) => {
                    debug!(id = response.id, "late detection result discarded");
                    if Some(response.id) == self.in_flight {
                        self.in_flight = None;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(DetectionError::Disconnected),
            }
        }
        Ok(())
    }
}

impl Drop for DetectionOrchestrator {
    fn drop(&mut self) {
        self.requests.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.in_flight.is_some() {
            // The worker is stuck inside the detector; it exits on its own
            // once the call returns and finds the channel closed.
            warn!(detector = %self.detector_name, "detector still busy at shutdown; detaching worker");
            return;
        }
        if worker.join().is_err() {
            warn!(detector = %self.detector_name, "detector worker panicked");
        }
    }
}

fn detector_worker<D: ObjectDetector>(
    mut detector: D,
    requests: Receiver<Request>,
    responses: mpsc::Sender<Response>,
) {
    while let Ok(Request { id, image }) = requests.recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| detector.process(&image)))
            .unwrap_or_else(|_| Err(anyhow!("detector panicked")));
        if responses.send(Response { id, result }).is_err() {
            break;
        }
    }
    debug!("detector worker exiting");
}
