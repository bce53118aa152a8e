//! Ports
//!
//! Each trait is the engine's view of an external collaborator. The engine
//! only ever holds `Arc<dyn Port>`; concrete backends are picked once at
//! construction time (see `app::builder`).
//!
//! - the durable store is the source of truth
//! - the dispatch index only holds what is currently eligible for pickup
//! - the lock serializes dequeue batches per job name across processes

pub mod clock;
pub mod durable_store;
pub mod dispatch_index;
pub mod event_sink;
pub mod id_generator;
pub mod lock;
pub mod schema;
pub mod worker_registry;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::dispatch_index::{DispatchEntry, DispatchIndex, IndexedJob};
pub use self::durable_store::{DurableStore, JobFilter, SortOrder, validate_collection_name};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock::{DistributedLock, Lease, LockPolicy};
pub use self::schema::{PayloadSchema, RequiredFields};
pub use self::worker_registry::WorkerRegistry;
