//! Synchronous event bus.
//!
//! Listeners registered with `on` and attached sinks run inline on the task
//! that performed the transition, after the durable write succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::{EventKind, QueueEvent};
use crate::ports::EventSink;

pub type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn emit(&self, event: &QueueEvent) {
        // Snapshot under the lock so a listener may register further listeners.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().clone();

        for listener in listeners {
            listener(event);
        }
        for sink in sinks {
            sink.emit(event);
        }
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &QueueEvent) {
        EventBus::emit(self, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobRecord, RecordId};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    fn event(kind: EventKind) -> QueueEvent {
        let job = JobRecord::new(
            RecordId::from_ulid(Ulid::new()),
            "email",
            "e1",
            serde_json::Value::Null,
            Utc::now(),
        );
        QueueEvent::new(kind, job, Utc::now())
    }

    struct CountingSink(AtomicUsize);

    impl EventSink for CountingSink {
        fn emit(&self, _event: &QueueEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listeners_only_see_their_kind() {
        let bus = EventBus::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        bus.on(EventKind::JobFinished, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&event(EventKind::JobFinished));
        bus.emit(&event(EventKind::JobFailed));

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sinks_see_every_event() {
        let bus = EventBus::new();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        bus.add_sink(sink.clone());

        bus.emit(&event(EventKind::JobEnqueued));
        bus.emit(&event(EventKind::JobRetried));

        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }
}
