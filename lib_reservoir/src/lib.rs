//! # lib_reservoir
//!
//! Building blocks for the reservoir ReStream pipeline: flat-file records are
//! republished on one pub/sub channel per reservoir, and the same channels are
//! consumed to keep a running daily average per reservoir.
//!
//! Modules are gated by folder, mirroring the crate features:
//!
//! - **`configs`**: broker endpoint, credentials and reconnection policy.
//! - **`core`**: topic router, wire codec, aggregator, publisher, session manager.
//! - **`connections`**: broker transports (in-process broker, Redis pub/sub).
//! - **`ingestors`**: record sources that feed the publisher.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;

// --- Public API Re-exports ---
#[cfg(feature = "configs")]
pub use crate::configs::{BrokerConfig, Credentials, ProtocolVersion, ReconnectPolicy};
#[cfg(feature = "core")]
pub use crate::core::{
    Aggregator, DailySummary, Publisher, PubSubError, Record, RunningSummary, SessionEvent,
    SessionManager, SessionState, TopicRouter, WireCodec,
};
