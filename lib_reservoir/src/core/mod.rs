//! # Core Engine Module
//!
//! The stateful heart of the ReStream pipeline.
//!
//! ## Core Components:
//!
//! - **`topic_router`**: the static source ↔ channel bijection.
//! - **`message`**: `Record` and the JSON wire codec.
//! - **`publisher`**: paced, order-preserving, fail-fast publishing per source.
//! - **`session`**: broker connection lifecycle and inbound dispatch.
//! - **`aggregator`**: append-only buckets per `(date, source)` with on-demand means.
//! - **`transport`**: the trait every broker client implements.
//! - **`error`**: the shared error taxonomy.

/// Running per-date, per-source statistics.
pub mod aggregator;
/// Error taxonomy shared by every core component.
pub mod error;
/// Records and their wire form.
pub mod message;
/// Paced publishing of record sequences.
pub mod publisher;
/// Broker session lifecycle and inbound dispatch.
pub mod session;
/// Source ↔ channel mapping.
pub mod topic_router;
/// The broker client abstraction.
pub mod transport;

// --- Public API Re-exports ---
pub use aggregator::{Aggregator, DailySummary, RunningSummary};
pub use error::PubSubError;
pub use message::{CodecError, Record, WireCodec};
pub use publisher::{PublishReport, Publisher};
pub use session::{SessionEvent, SessionManager, SessionState};
pub use topic_router::TopicRouter;
pub use transport::{Inbound, ReasonCode, Transport, TransportError, TransportEvent};
