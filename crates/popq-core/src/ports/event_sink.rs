//! EventSink port
//!
//! Fan-out to email, chat or webhooks lives outside the engine. The engine
//! hands every lifecycle event to each attached sink synchronously; a sink
//! that needs I/O should enqueue the event and return.

use crate::domain::QueueEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &QueueEvent);
}
