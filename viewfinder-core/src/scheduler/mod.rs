//! scheduler — single-slot frame handoff between camera and detector
//!
//! The producer calls [`FrameScheduler::offer`] for every camera frame at
//! full camera rate. The slot admits a frame only while nothing is in flight;
//! any frame offered while the consumer is busy is handed straight back so the
//! caller can release it. Nothing is ever queued, so the consumer never works
//! through a backlog and memory stays flat no matter how slow detection gets.
//!
//! The busy flag is set when a frame is stored and cleared by
//! [`FrameScheduler::on_processing_complete`], both under the same mutex, so
//! the check-and-store in `offer` is atomic.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// Log the drop ratio every this many offers.
const STATS_LOG_INTERVAL: u64 = 300;

/// Outcome of [`FrameScheduler::offer`]. Refused frames come back to the
/// caller, who owns their release.
#[must_use = "a refused frame must be released by the caller"]
#[derive(Debug)]
pub enum Admission<F> {
    Accepted,
    Busy(F),
    Closed(F),
}

impl<F> Admission<F> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub offered: u64,
    pub accepted: u64,
    pub dropped: u64,
}

struct FrameSlot<F> {
    pending: Option<F>,
    busy: bool,
    closed: bool,
}

pub struct FrameScheduler<F> {
    slot: Mutex<FrameSlot<F>>,
    ready: Condvar,
    offered: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl<F> FrameScheduler<F> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(FrameSlot {
                pending: None,
                busy: false,
                closed: false,
            }),
            ready: Condvar::new(),
            offered: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrameSlot<F>> {
        // The slot holds plain flags and an owned frame; a panic elsewhere
        // cannot leave it half-written.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a new frame to the scheduler.
    pub fn offer(&self, frame: F) -> Admission<F> {
        let offered = self.offered.fetch_add(1, Ordering::Relaxed) + 1;
        if offered % STATS_LOG_INTERVAL == 0 {
            let stats = self.stats();
            debug!(
                offered = stats.offered,
                accepted = stats.accepted,
                dropped = stats.dropped,
                "frame scheduler stats"
            );
        }

        let mut slot = self.lock();
        if slot.closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Admission::Closed(frame);
        }
        if slot.busy {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Admission::Busy(frame);
        }
        slot.pending = Some(frame);
        slot.busy = true;
        drop(slot);

        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        Admission::Accepted
    }

    /// Block until a frame is admitted (returns it) or the scheduler closes
    /// (returns `None`). The slot stays busy until `on_processing_complete`.
    pub fn next_frame(&self) -> Option<F> {
        let mut slot = self.lock();
        loop {
            if let Some(frame) = slot.pending.take() {
                return Some(frame);
            }
            if slot.closed {
                return None;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`FrameScheduler::next_frame`] for hosts that
    /// drive the consumer themselves.
    pub fn try_next_frame(&self) -> Option<F> {
        self.lock().pending.take()
    }

    /// The consumer is done with the current frame, successfully or not.
    pub fn on_processing_complete(&self) {
        self.lock().busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Refuse all further frames and wake a waiting consumer. A frame that was
    /// admitted but not yet picked up is released here.
    pub fn close(&self) {
        let orphan = {
            let mut slot = self.lock();
            slot.closed = true;
            let orphan = slot.pending.take();
            if orphan.is_some() {
                slot.busy = false;
            }
            orphan
        };
        self.ready.notify_all();
        if orphan.is_some() {
            debug!("released admitted frame on close");
        }
        drop(orphan);
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            offered: self.offered.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl<F> Default for FrameScheduler<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the busy flag when the consumer leaves its handler, on every path.
pub struct CompletionGuard<'a, F> {
    scheduler: &'a FrameScheduler<F>,
}

impl<'a, F> CompletionGuard<'a, F> {
    pub fn new(scheduler: &'a FrameScheduler<F>) -> Self {
        Self { scheduler }
    }
}

impl<F> Drop for CompletionGuard<'_, F> {
    fn drop(&mut self) {
        self.scheduler.on_processing_complete();
    }
}

/// Run the consumer loop on its own named thread until the scheduler closes.
///
/// A panicking handler is logged and the loop continues with the next frame.
pub fn spawn_consumer<F, H>(
    scheduler: Arc<FrameScheduler<F>>,
    name: &str,
    mut handler: H,
) -> Result<JoinHandle<()>>
where
    F: Send + 'static,
    H: FnMut(F) + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while let Some(frame) = scheduler.next_frame() {
                let _done = CompletionGuard::new(&scheduler);
                if panic::catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                    warn!("frame handler panicked; continuing with next frame");
                }
            }
            debug!("frame consumer exiting");
        })
        .with_context(|| format!("failed to spawn consumer thread {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn refuses_while_busy_and_accepts_after_completion() {
        let scheduler = FrameScheduler::new();
        assert!(scheduler.offer(1).is_accepted());
        assert!(matches!(scheduler.offer(2), Admission::Busy(2)));

        assert_eq!(scheduler.try_next_frame(), Some(1));
        // Still busy while the consumer works on frame 1.
        assert!(matches!(scheduler.offer(3), Admission::Busy(3)));
        assert_eq!(scheduler.try_next_frame(), None);

        scheduler.on_processing_complete();
        assert!(scheduler.offer(4).is_accepted());
        assert_eq!(scheduler.try_next_frame(), Some(4));

        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                offered: 4,
                accepted: 2,
                dropped: 2
            }
        );
    }

    #[test]
    fn burst_while_busy_processes_exactly_one_frame() {
        let scheduler = Arc::new(FrameScheduler::new());
        let processed = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let log = Arc::clone(&processed);
        let consumer = spawn_consumer(Arc::clone(&scheduler), "test-consumer", move |frame: u32| {
            started_tx.send(frame).unwrap();
            gate_rx.recv().unwrap();
            log.lock().unwrap().push(frame);
        })
        .unwrap();

        assert!(scheduler.offer(0).is_accepted());
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        for frame in 1..=50 {
            assert!(matches!(scheduler.offer(frame), Admission::Busy(_)));
        }

        gate_tx.send(()).unwrap();
        wait_until(|| !scheduler.is_busy());
        assert_eq!(*processed.lock().unwrap(), vec![0]);

        assert!(scheduler.offer(51).is_accepted());
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 51);
        gate_tx.send(()).unwrap();
        wait_until(|| !scheduler.is_busy());

        scheduler.close();
        consumer.join().unwrap();
        assert_eq!(*processed.lock().unwrap(), vec![0, 51]);
        assert_eq!(scheduler.stats().dropped, 50);
    }

    #[test]
    fn never_more_than_one_frame_in_flight() {
        let scheduler = Arc::new(FrameScheduler::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let (cur, max, done) = (
            Arc::clone(&in_flight),
            Arc::clone(&max_in_flight),
            Arc::clone(&processed),
        );
        let consumer = spawn_consumer(Arc::clone(&scheduler), "test-consumer", move |_: u64| {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(200));
            cur.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    for i in 0..2_000u64 {
                        let _ = scheduler.offer(p * 10_000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        scheduler.close();
        consumer.join().unwrap();

        let stats = scheduler.stats();
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(stats.offered, 8_000);
        assert_eq!(stats.accepted + stats.dropped, stats.offered);
        assert!(processed.load(Ordering::SeqCst) as u64 <= stats.accepted);
        assert!(processed.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn close_wakes_consumer_and_refuses_new_frames() {
        let scheduler = Arc::new(FrameScheduler::<u8>::new());
        let consumer = spawn_consumer(Arc::clone(&scheduler), "test-consumer", |_| {}).unwrap();
        scheduler.close();
        consumer.join().unwrap();
        assert!(matches!(scheduler.offer(9), Admission::Closed(9)));
        assert!(scheduler.is_closed());
    }

    #[test]
    fn panicking_handler_still_frees_the_slot() {
        let scheduler = Arc::new(FrameScheduler::new());
        let consumer = spawn_consumer(Arc::clone(&scheduler), "test-consumer", |frame: u8| {
            if frame == 0 {
                panic!("boom");
            }
        })
        .unwrap();

        assert!(scheduler.offer(0).is_accepted());
        wait_until(|| !scheduler.is_busy());
        assert!(scheduler.offer(1).is_accepted());
        wait_until(|| !scheduler.is_busy());

        scheduler.close();
        consumer.join().unwrap();
    }
}
