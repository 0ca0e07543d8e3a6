//! Facade events and the per-instance subscription table
//!
//! Each call instance owns its own table keyed by event kind; subscribing
//! returns a disposer handle. There is no process-wide listener state.

use meshcall_core::{CoWatchState, Participant};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Events emitted by a [`crate::GroupCall`]
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The roster changed; carries the full sorted roster
    ParticipantsChanged(Vec<Participant>),
    /// The shared co-watch state was replaced
    CoWatchChanged(CoWatchState),
    /// A participant started or stopped screensharing
    ScreenshareChanged { user_id: String, active: bool },
    /// A non-fatal failure was swallowed; the session continues
    Error { message: String },
    /// The session was torn down; no further events follow
    Disposed,
}

impl CallEvent {
    /// The kind used for subscription dispatch
    pub fn kind(&self) -> CallEventKind {
        match self {
            CallEvent::ParticipantsChanged(_) => CallEventKind::ParticipantsChanged,
            CallEvent::CoWatchChanged(_) => CallEventKind::CoWatchChanged,
            CallEvent::ScreenshareChanged { .. } => CallEventKind::ScreenshareChanged,
            CallEvent::Error { .. } => CallEventKind::Error,
            CallEvent::Disposed => CallEventKind::Disposed,
        }
    }
}

/// Subscription keys for [`CallEvent`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    ParticipantsChanged,
    CoWatchChanged,
    ScreenshareChanged,
    Error,
    Disposed,
}

impl CallEventKind {
    /// Event name as exposed to consumers
    pub fn name(&self) -> &'static str {
        match self {
            CallEventKind::ParticipantsChanged => "participants-changed",
            CallEventKind::CoWatchChanged => "co-watch-changed",
            CallEventKind::ScreenshareChanged => "screenshare-changed",
            CallEventKind::Error => "error",
            CallEventKind::Disposed => "disposed",
        }
    }
}

type Handler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

struct BusInner {
    handlers: Mutex<HashMap<CallEventKind, HashMap<u64, Handler>>>,
    next_id: AtomicU64,
}

/// Per-instance event dispatch table
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for one event kind; returns its disposer
    pub fn subscribe<F>(&self, kind: CallEventKind, handler: F) -> Subscription
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .insert(id, Arc::new(handler));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver an event to every handler registered for its kind.
    ///
    /// Handlers run synchronously on the emitting task; the table lock is
    /// released before any handler is invoked so handlers may subscribe or
    /// dispose.
    pub fn emit(&self, event: CallEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let table = self.inner.handlers.lock();
            table
                .get(&kind)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        trace!("emitting {} to {} handler(s)", kind.name(), handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of live handlers for a kind
    pub fn handler_count(&self, kind: CallEventKind) -> usize {
        self.inner
            .handlers
            .lock()
            .get(&kind)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Disposer handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle without calling [`Subscription::dispose`] leaves the
/// subscription active for the lifetime of the call instance.
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: CallEventKind,
    id: u64,
}

impl Subscription {
    /// Remove the handler from the table
    pub fn dispose(self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Some(map) = inner.handlers.lock().get_mut(&self.kind) {
                map.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_only_matching_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let _sub = bus.subscribe(CallEventKind::Disposed, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(CallEvent::ParticipantsChanged(Vec::new()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(CallEvent::Disposed);
        bus.emit(CallEvent::Disposed);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispose_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let sub = bus.subscribe(CallEventKind::Error, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(CallEvent::Error {
            message: "one".into(),
        });
        sub.dispose();
        bus.emit(CallEvent::Error {
            message: "two".into(),
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(CallEventKind::Error), 0);
    }

    #[test]
    fn dropping_the_handle_keeps_the_subscription() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe(CallEventKind::Disposed, |_| {});
        }
        assert_eq!(bus.handler_count(CallEventKind::Disposed), 1);
    }
}
