//! # Connections Module
//!
//! Broker transports implementing `core::transport::Transport`.
//!
//! - **`memory_broker`**: an in-process topic broker with failure injection.
//! - **`pubsub_redis`**: Redis pub/sub, the broker of the default deployment.

/// In-process broker and its client transport.
pub mod memory_broker;

/// Redis pub/sub transport.
pub mod pubsub_redis;

pub use memory_broker::{MemoryBroker, MemoryTransport};
pub use pubsub_redis::RedisTransport;
