//! # Configuration Modules
//!
//! Library-side settings. The server binary owns argument and file parsing;
//! it hands the library these plain structs.

/// Broker endpoint, credentials, protocol and reconnection policy.
pub mod broker;

pub use broker::{BrokerConfig, Credentials, ProtocolVersion, ReconnectPolicy};
