//! Queue transport layer.
//!
//! - `transport`: the `QueueTransport` trait and `Delivery` handle
//! - `redis`: Redis list-based broker transport
//! - `memory`: in-process transport for single-host runs and tests
//! - `consumer`: the single-in-flight consume loop
//! - `idle`: idle-timeout supervision of a consume loop

pub mod consumer;
pub mod idle;
pub mod memory;
pub mod redis;
pub mod transport;

pub use consumer::{
    ConsumeReport, ConsumeStats, Consumer, HandlerError, MessageHandler, DEFAULT_RECEIVE_WAIT,
};
pub use idle::{ActivityClock, IdleSupervisor, ShutdownReason, DEFAULT_POLL_INTERVAL};
pub use memory::MemoryQueue;
pub use redis::{broker_url, RedisQueue, DEFAULT_REDIS_PORT};
pub use transport::{Delivery, DeliveryTag, QueueError, QueueStats, QueueTransport};
