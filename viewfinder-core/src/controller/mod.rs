//! controller — keeps the preview transform in step with buffer, view and
//! display rotation changes
//!
//! Every input arrives as a [`ViewfinderEvent`] through [`ViewfinderController::handle`].
//! Invalid parts of an event (zero sizes, unknown rotation) are replaced by
//! the last good value; a transform is published only when all three inputs
//! are defined and at least one of them actually changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nalgebra::Matrix3;
use tracing::{debug, info};

use crate::geometry::{Dimensions, Rotation, Transform};

pub type DisplayId = u32;

// ── Collaborators ────────────────────────────────────────────────────────────

/// Receives every published transform.
pub trait TransformSink: Send + Sync {
    fn on_transform(&self, transform: &Transform);
}

/// The surface the camera preview is rendered into.
pub trait PreviewSurface: Send + Sync {
    fn set_transform(&self, matrix: Matrix3<f32>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayChange {
    pub display_id: DisplayId,
    pub rotation: Option<Rotation>,
}

/// A live registration for display changes. Hand the id back to
/// [`DisplayEvents::unsubscribe`] to end it.
pub struct Subscription {
    id: u64,
    changes: Receiver<DisplayChange>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Changes delivered since the last call, without blocking.
    pub fn pending(&self) -> Vec<DisplayChange> {
        self.changes.try_iter().collect()
    }
}

/// Registration point for display rotation changes.
pub trait DisplayEvents: Send + Sync {
    fn subscribe(&self) -> Subscription;
    fn unsubscribe(&self, id: u64);
}

/// In-process broadcaster of display changes.
#[derive(Default)]
pub struct DisplayBus {
    subscribers: Mutex<HashMap<u64, Sender<DisplayChange>>>,
    next_id: AtomicU64,
}

impl DisplayBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Sender<DisplayChange>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `change` to every subscriber; returns how many received it.
    pub fn publish(&self, change: DisplayChange) -> usize {
        let mut subscribers = self.lock();
        // A dropped receiver is a subscriber that went away without saying so.
        subscribers.retain(|_, tx| tx.send(change).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

impl DisplayEvents for DisplayBus {
    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.lock().insert(id, tx);
        debug!(id, "display change subscription added");
        Subscription { id, changes: rx }
    }

    fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(id, "display change subscription removed");
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewfinderEvent {
    /// New frame geometry from the camera.
    BufferChanged {
        size: Dimensions,
        rotation: Option<Rotation>,
    },
    /// The view was laid out again; rotation of the view's own display
    /// arrives this way.
    ViewLayoutChanged {
        size: Dimensions,
        rotation: Option<Rotation>,
    },
    /// Rotation changed on some display.
    DisplayChanged {
        display_id: DisplayId,
        rotation: Option<Rotation>,
    },
    /// The view is gone.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerState {
    Uninitialized,
    Valid(Transform),
    Detached,
}

/// Last good value of each input.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Inputs {
    rotation: Option<Rotation>,
    buffer: Dimensions,
    view: Dimensions,
}

pub struct ViewfinderController {
    display_id: DisplayId,
    inputs: Inputs,
    state: ControllerState,
    preview: Option<Arc<dyn PreviewSurface>>,
    sinks: Vec<Arc<dyn TransformSink>>,
    display_events: Option<(Arc<dyn DisplayEvents>, Subscription)>,
}

impl ViewfinderController {
    /// A controller for a view shown on `display_id`.
    pub fn new(display_id: DisplayId) -> Self {
        Self {
            display_id,
            inputs: Inputs::default(),
            state: ControllerState::Uninitialized,
            preview: None,
            sinks: Vec::new(),
            display_events: None,
        }
    }

    pub fn with_preview(mut self, preview: Arc<dyn PreviewSurface>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn TransformSink>) {
        self.sinks.push(sink);
    }

    /// Start listening for rotation changes on other displays.
    pub fn watch_displays(&mut self, events: Arc<dyn DisplayEvents>) {
        if let Some((old, subscription)) = self.display_events.take() {
            old.unsubscribe(subscription.id());
        }
        let subscription = events.subscribe();
        self.display_events = Some((events, subscription));
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn transform(&self) -> Option<Transform> {
        match self.state {
            ControllerState::Valid(t) => Some(t),
            _ => None,
        }
    }

    /// Feed one event. Returns `true` when a new transform was published.
    pub fn handle(&mut self, event: ViewfinderEvent) -> bool {
        if self.state == ControllerState::Detached {
            debug!(?event, "controller detached; ignoring event");
            return false;
        }

        let candidate = match event {
            ViewfinderEvent::Detached => {
                self.detach();
                return false;
            }
            ViewfinderEvent::DisplayChanged { display_id, .. } if display_id == self.display_id => {
                // Our own display's rotation shows up as a layout change.
                return false;
            }
            ViewfinderEvent::DisplayChanged { rotation, .. } => Inputs {
                rotation,
                ..Inputs::default()
            },
            ViewfinderEvent::BufferChanged { size, rotation } => Inputs {
                rotation,
                buffer: size,
                ..Inputs::default()
            },
            ViewfinderEvent::ViewLayoutChanged { size, rotation } => Inputs {
                rotation,
                view: size,
                ..Inputs::default()
            },
        };

        self.inputs = Inputs {
            rotation: candidate.rotation.or(self.inputs.rotation),
            buffer: pick(candidate.buffer, self.inputs.buffer),
            view: pick(candidate.view, self.inputs.view),
        };
        self.recompute()
    }

    /// Apply display changes delivered since the last call.
    pub fn pump_display_events(&mut self) -> usize {
        let changes = match &self.display_events {
            Some((_, subscription)) => subscription.pending(),
            None => return 0,
        };
        changes
            .into_iter()
            .filter(|change| {
                self.handle(ViewfinderEvent::DisplayChanged {
                    display_id: change.display_id,
                    rotation: change.rotation,
                })
            })
            .count()
    }

    fn recompute(&mut self) -> bool {
        let Inputs {
            rotation,
            buffer,
            view,
        } = self.inputs;
        let Some(rotation) = rotation else {
            debug!("rotation not known yet; transform unchanged");
            return false;
        };

        if let ControllerState::Valid(current) = self.state {
            if current.rotation == rotation && current.buffer_size == buffer && current.view_size == view {
                return false;
            }
        }

        let Some(transform) = Transform::compute(buffer, view, rotation) else {
            debug!(%buffer, %view, "sizes not defined yet; transform unchanged");
            return false;
        };

        self.state = ControllerState::Valid(transform);
        debug!(
            %buffer,
            %view,
            %rotation,
            scaled = %transform.scaled_output_size,
            "publishing preview transform"
        );
        if let Some(preview) = &self.preview {
            preview.set_transform(transform.matrix());
        }
        for sink in &self.sinks {
            sink.on_transform(&transform);
        }
        true
    }

    fn detach(&mut self) {
        if let Some((events, subscription)) = self.display_events.take() {
            events.unsubscribe(subscription.id());
        }
        self.state = ControllerState::Detached;
        info!(display_id = self.display_id, "viewfinder controller detached");
    }
}

impl Drop for ViewfinderController {
    fn drop(&mut self) {
        if let Some((events, subscription)) = self.display_events.take() {
            events.unsubscribe(subscription.id());
        }
    }
}

fn pick(new: Dimensions, last_good: Dimensions) -> Dimensions {
    if new.is_defined() {
        new
    } else {
        last_good
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        transforms: Mutex<Vec<Transform>>,
        matrices: Mutex<Vec<Matrix3<f32>>>,
    }

    impl TransformSink for Recorder {
        fn on_transform(&self, transform: &Transform) {
            self.transforms.lock().unwrap().push(*transform);
        }
    }

    impl PreviewSurface for Recorder {
        fn set_transform(&self, matrix: Matrix3<f32>) {
            self.matrices.lock().unwrap().push(matrix);
        }
    }

    const MAIN: DisplayId = 0;
    const EXTERNAL: DisplayId = 1;

    fn controller() -> (ViewfinderController, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut controller = ViewfinderController::new(MAIN).with_preview(recorder.clone());
        controller.add_sink(recorder.clone());
        (controller, recorder)
    }

    fn buffer(w: u32, h: u32, rotation: Option<Rotation>) -> ViewfinderEvent {
        ViewfinderEvent::BufferChanged {
            size: Dimensions::new(w, h),
            rotation,
        }
    }

    fn layout(w: u32, h: u32) -> ViewfinderEvent {
        ViewfinderEvent::ViewLayoutChanged {
            size: Dimensions::new(w, h),
            rotation: None,
        }
    }

    #[test]
    fn publishes_once_all_inputs_are_defined() {
        let (mut c, rec) = controller();
        assert!(!c.handle(buffer(1920, 1080, Some(Rotation::Deg90))));
        assert_eq!(c.state(), ControllerState::Uninitialized);

        assert!(c.handle(layout(1080, 1920)));
        let t = c.transform().unwrap();
        assert_eq!(t.scaled_output_size, Dimensions::new(1080, 1920));
        assert_eq!((t.scale_x, t.scale_y), (1.0, 1.0));
        assert_eq!(rec.transforms.lock().unwrap().len(), 1);
        assert_eq!(rec.matrices.lock().unwrap().len(), 1);
    }

    #[test]
    fn identical_inputs_publish_nothing() {
        let (mut c, rec) = controller();
        c.handle(buffer(640, 480, Some(Rotation::Deg0)));
        assert!(c.handle(layout(320, 320)));
        assert!(!c.handle(layout(320, 320)));
        assert!(!c.handle(buffer(640, 480, Some(Rotation::Deg0))));
        assert_eq!(rec.transforms.lock().unwrap().len(), 1);
    }

    #[test]
    fn invalid_parts_keep_last_good_values() {
        let (mut c, rec) = controller();
        c.handle(buffer(640, 480, Some(Rotation::Deg0)));
        c.handle(layout(320, 320));
        let before = c.transform();

        // Zero view and unknown rotation change nothing.
        assert!(!c.handle(layout(0, 320)));
        assert!(!c.handle(buffer(0, 0, None)));
        assert_eq!(c.transform(), before);

        // Unknown rotation with a real size change keeps the old rotation.
        assert!(c.handle(buffer(1280, 720, None)));
        let t = c.transform().unwrap();
        assert_eq!(t.rotation, Rotation::Deg0);
        assert_eq!(t.buffer_size, Dimensions::new(1280, 720));
        assert_eq!(rec.transforms.lock().unwrap().len(), 2);
    }

    #[test]
    fn own_display_changes_are_ignored() {
        let (mut c, _) = controller();
        c.handle(buffer(640, 480, Some(Rotation::Deg0)));
        c.handle(layout(320, 320));

        assert!(!c.handle(ViewfinderEvent::DisplayChanged {
            display_id: MAIN,
            rotation: Some(Rotation::Deg90),
        }));
        assert!(c.handle(ViewfinderEvent::DisplayChanged {
            display_id: EXTERNAL,
            rotation: Some(Rotation::Deg90),
        }));
        assert_eq!(c.transform().unwrap().rotation, Rotation::Deg90);
    }

    #[test]
    fn display_bus_delivers_changes_and_detach_unsubscribes() {
        let bus = Arc::new(DisplayBus::new());
        let (mut c, rec) = controller();
        c.watch_displays(bus.clone());
        assert_eq!(bus.subscriber_count(), 1);

        c.handle(buffer(640, 480, Some(Rotation::Deg0)));
        c.handle(layout(480, 640));
        bus.publish(DisplayChange {
            display_id: EXTERNAL,
            rotation: Some(Rotation::Deg270),
        });
        assert_eq!(c.pump_display_events(), 1);
        assert_eq!(c.transform().unwrap().rotation, Rotation::Deg270);

        c.handle(ViewfinderEvent::Detached);
        assert_eq!(c.state(), ControllerState::Detached);
        assert_eq!(bus.subscriber_count(), 0);

        let published = rec.transforms.lock().unwrap().len();
        assert!(!c.handle(layout(100, 100)));
        assert_eq!(rec.transforms.lock().unwrap().len(), published);
    }

    #[test]
    fn dropping_controller_unsubscribes() {
        let bus = Arc::new(DisplayBus::new());
        {
            let mut c = ViewfinderController::new(MAIN);
            c.watch_displays(bus.clone());
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.publish(DisplayChange {
                display_id: EXTERNAL,
                rotation: None
            }),
            0
        );
    }
}
