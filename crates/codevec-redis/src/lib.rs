//! Codevec Redis Broker Layer
//!
//! Pub/sub broadcast channels and the durable task queue, backed by Redis,
//! with in-memory equivalents for tests and local runs.

pub mod broker;
pub mod client;
pub mod memory;
pub mod queue;

pub use broker::{Broker, RedisBroker, Subscription};
pub use client::{RedisError, RedisPool, RedisResult};
pub use memory::{MemoryBroker, MemoryTaskQueue};
pub use queue::{
    Delivery, NackOutcome, QueuedTask, RedisTaskQueue, TaskQueue, DEFAULT_MAX_RETRIES,
    LOST_CONSUMER_REASON,
};
