//! Impls - concrete port implementations.
//!
//! The in-memory implementations are always available and back the tests and
//! the demo CLI. Production backends sit behind cargo features:
//! - `redis-backend`: dispatch index, lock and worker registry on Redis
//! - `postgres-backend`: durable store on Postgres

pub mod memory_index;
pub mod memory_lock;
pub mod memory_store;
pub mod memory_workers;

#[cfg(feature = "postgres-backend")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use self::memory_index::InMemoryDispatchIndex;
pub use self::memory_lock::InMemoryLock;
pub use self::memory_store::InMemoryStore;
pub use self::memory_workers::InMemoryWorkerRegistry;
