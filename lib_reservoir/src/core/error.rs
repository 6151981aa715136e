//! # Pub/Sub Error Taxonomy
//!
//! One enum for every failure the core reports. How each is handled is
//! decided by where it surfaces:
//!
//! - `ConfigurationError`: unregistered source or channel, bad router setup. Fatal at startup.
//! - `ConnectionError`: handshake failure. The caller chooses whether to retry.
//! - `ConnectionLost`: mid-session drop. Reported as an event, never a crash.
//! - `DecodeError`: one malformed inbound message. Contained in the session manager.
//! - `PublishError`: the transport rejected a send. Halts that source's sequence only.

use thiserror::Error;

use crate::core::transport::ReasonCode;

/// Errors raised by the router, publisher and session manager.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PubSubError {
    /// A source or channel is not registered, or the router setup is invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The broker refused or never completed the handshake.
    #[error("Connection failed with code {}: {reason}", .code.as_u8())]
    ConnectionError {
        /// Broker-provided (or locally assigned) reason code.
        code: ReasonCode,
        /// Human-readable detail.
        reason: String,
    },

    /// An established connection dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An inbound payload could not be turned into a record.
    #[error("Decode error on channel '{channel}': {reason}")]
    DecodeError {
        /// Channel the payload arrived on.
        channel: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The transport rejected an outbound message.
    #[error("Publish error on channel '{channel}' after {sent} message(s): {reason}")]
    PublishError {
        /// Channel the publisher was sending on.
        channel: String,
        /// Records successfully handed to the transport before the failure.
        sent: usize,
        /// Transport-level detail.
        reason: String,
    },
}

impl PubSubError {
    /// Shorthand for `ConfigurationError`.
    pub fn configuration(msg: impl Into<String>) -> Self {
        PubSubError::ConfigurationError(msg.into())
    }
}
