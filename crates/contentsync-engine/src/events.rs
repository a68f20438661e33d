//! Sync events and listener fan-out.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use compact_str::CompactString;
use parking_lot::{ReentrantMutex, RwLock};
use strum::Display;

use crate::state::SyncStatus;

/// Coarse grouping of events, used by listeners to filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EventKind {
    Started,
    Plan,
    Progress,
    Completed,
    Apply,
    Unpack,
}

/// Everything an observer can learn about a sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An attempt began. `full_sync` is true when the content root was empty.
    SyncStarted { full_sync: bool },
    /// Planning finished.
    PlanReady {
        additions: usize,
        modifications: usize,
        removals: usize,
        symlinks: usize,
        downloads: usize,
        bytes: u64,
    },
    /// The remote directory layout differs from the local one.
    StructureChanged,
    /// Download progress. Both counters only ever grow within an attempt.
    SyncProgress {
        completed: usize,
        total: usize,
        bytes_transferred: u64,
        bytes_total: u64,
        current: Option<CompactString>,
    },
    SyncCompleted { status: SyncStatus },
    ApplyStarted { total: usize },
    ApplyProgress { completed: usize, total: usize },
    ApplyCompleted { succeeded: usize, failed: usize },
    UnpackDetected { archive: PathBuf },
    UnpackTotal { entries: usize },
    UnpackProgress { done: usize, total: usize },
    UnpackCompleted { success: bool },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SyncStarted { .. } => EventKind::Started,
            Self::PlanReady { .. } | Self::StructureChanged => EventKind::Plan,
            Self::SyncProgress { .. } => EventKind::Progress,
            Self::SyncCompleted { .. } => EventKind::Completed,
            Self::ApplyStarted { .. } | Self::ApplyProgress { .. } | Self::ApplyCompleted { .. } => {
                EventKind::Apply
            }
            Self::UnpackDetected { .. }
            | Self::UnpackTotal { .. }
            | Self::UnpackProgress { .. }
            | Self::UnpackCompleted { .. } => EventKind::Unpack,
        }
    }
}

/// Receives sync events.
///
/// Callbacks run on whichever task emitted the event and must not block.
/// Events are delivered one at a time, never concurrently.
pub trait SyncListener: Send + Sync {
    fn on_event(&self, event: &SyncEvent);

    /// Skip events of kinds the listener does not care about.
    fn interested_in(&self, _kind: EventKind) -> bool {
        true
    }
}

impl<F> SyncListener for F
where
    F: Fn(&SyncEvent) + Send + Sync,
{
    fn on_event(&self, event: &SyncEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered, serialized delivery to registered listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn SyncListener>)>>,
    delivery: ReentrantMutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn SyncListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every interested listener.
    ///
    /// A listener may register or unregister from inside its callback; the
    /// change takes effect from the next event.
    pub fn emit(&self, event: SyncEvent) {
        let _delivery = self.delivery.lock();
        let kind = event.kind();
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if listener.interested_in(kind) {
                listener.on_event(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SyncEvent>>,
    }

    impl SyncListener for Recorder {
        fn on_event(&self, event: &SyncEvent) {
            self.seen.lock().push(event.clone());
        }

        fn interested_in(&self, kind: EventKind) -> bool {
            kind == EventKind::Completed
        }
    }

    #[test]
    fn test_filtering_and_unregister() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let id = bus.register(recorder.clone());

        bus.emit(SyncEvent::SyncStarted { full_sync: true });
        bus.emit(SyncEvent::SyncCompleted {
            status: SyncStatus::Ok,
        });
        assert_eq!(recorder.seen.lock().len(), 1);

        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        bus.emit(SyncEvent::SyncCompleted {
            status: SyncStatus::Failed,
        });
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn test_closure_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        bus.register(Arc::new(move |_: &SyncEvent| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        bus.emit(SyncEvent::StructureChanged);
        bus.emit(SyncEvent::UnpackTotal { entries: 3 });
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unregister_from_callback() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let (bus_ref, slot_ref, hits_ref) = (Arc::clone(&bus), Arc::clone(&slot), Arc::clone(&hits));
        let id = bus.register(Arc::new(move |_: &SyncEvent| {
            hits_ref.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = *slot_ref.lock() {
                bus_ref.unregister(id);
            }
        }));
        *slot.lock() = Some(id);

        bus.emit(SyncEvent::StructureChanged);
        bus.emit(SyncEvent::StructureChanged);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(
            SyncEvent::ApplyProgress {
                completed: 1,
                total: 2
            }
            .kind(),
            EventKind::Apply
        );
        assert_eq!(SyncEvent::StructureChanged.kind(), EventKind::Plan);
    }
}
