// src/lib.rs
//! relq: a Redis-backed reliable queue engine
//!
//! Many service instances share one set of named FIFO queues. Each queue is
//! delivered by exactly one instance at a time, elected through an expiring
//! lease, and items are only removed once the processor acknowledges them.

pub mod api;
pub mod backoff;
pub mod backpressure;
pub mod config;
pub mod connection;
pub mod context;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod lease;
pub mod locks;
pub mod lua;
pub mod memory;
pub mod queue;
pub mod stats;
pub mod store;

pub use api::{Operation, OperationKind, Reply, Request, Status};
pub use backoff::{RetryPolicy, RetrySchedule};
pub use config::{QueueConfiguration, ReconnectSettings, RelqConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use context::{Delivery, FnProcessor, Processor};
pub use delivery::{DeliveryState, Outcome};
pub use engine::{Engine, EngineBuilder, EngineStats};
pub use error::{RelqError, Result};
pub use locks::LockRegistry;
pub use memory::MemoryStore;
pub use queue::RedisStore;
pub use stats::QueueStatistics;
pub use store::{LockInfo, MarkOutcome, QueueStore};

// Re-export commonly used types
pub use async_trait::async_trait;
