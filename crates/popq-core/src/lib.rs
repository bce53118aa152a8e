//! popq-core
//!
//! A persistent, priority- and delay-aware job queue.
//!
//! Every job lives twice: a durable record (the source of truth for its
//! lifecycle) and an entry in an ordered dispatch index scored by
//! `now + delay - priority`. Workers pop due entries under a per-name lock,
//! run the handler and record `finish` or `fail`; failures retry with backoff
//! until the retry budget is spent, then land in a dead-letter collection.
//!
//! # Modules
//! - **domain**: job records, lifecycle state, events, ids
//! - **ports**: store, index, lock, worker registry, clock and id traits
//! - **impls**: in-memory ports, plus Redis and Postgres behind features
//! - **queue**: the `JobQueue` engine
//! - **typed**: serde-typed tasks and handlers
//! - **app**: builder, execution loop, heartbeat
//! - **config** / **telemetry**: layered configuration and tracing setup

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod telemetry;
pub mod typed;

pub use app::{BuildError, ExecutionLoop, QueueBuilder, WorkerHeartbeat};
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use queue::{EnqueueOptions, JobQueue, RunnerOptions};
