//! # Transport Seam
//!
//! The core never talks to a broker directly. It drives a `Transport`:
//! connect, subscribe, publish, disconnect. Inbound traffic comes back on the
//! channel returned by `connect`, which the session manager drains on its own
//! task.

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

/// Connect-acknowledgement reason codes.
///
/// Codes 0-5 follow the classic broker CONNACK table; the rest are assigned
/// locally for failures that never reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    /// The handshake did not finish within the connect timeout.
    Timeout,
    /// An operation needed a live connection and there was none.
    NotConnected,
    /// Anything the broker reported that fits no other code.
    Unspecified,
}

impl ReasonCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ReasonCode::Accepted => 0,
            ReasonCode::UnacceptableProtocolVersion => 1,
            ReasonCode::IdentifierRejected => 2,
            ReasonCode::ServerUnavailable => 3,
            ReasonCode::BadCredentials => 4,
            ReasonCode::NotAuthorized => 5,
            ReasonCode::Timeout => 128,
            ReasonCode::NotConnected => 129,
            ReasonCode::Unspecified => 255,
        }
    }

    /// Human-readable description of the code.
    pub fn describe(&self) -> &'static str {
        match self {
            ReasonCode::Accepted => "Connection Accepted.",
            ReasonCode::UnacceptableProtocolVersion => {
                "Connection Refused: unacceptable protocol version."
            }
            ReasonCode::IdentifierRejected => "Connection Refused: identifier rejected.",
            ReasonCode::ServerUnavailable => "Connection Refused: broker unavailable.",
            ReasonCode::BadCredentials => "Connection Refused: bad user name or password.",
            ReasonCode::NotAuthorized => "Connection Refused: not authorised.",
            ReasonCode::Timeout => "Connection Refused: handshake timed out.",
            ReasonCode::NotConnected => "Not connected.",
            ReasonCode::Unspecified => "Connection Refused: unknown reason.",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Failure reported by a transport operation.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message} ({code})")]
pub struct TransportError {
    pub code: ReasonCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new(ReasonCode::NotConnected, "transport is not connected")
    }
}

/// What a connected transport delivers to the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message arrived on a subscribed channel.
    Message { channel: String, payload: Vec<u8> },
    /// The connection dropped. Nothing follows on this receiver.
    Closed { reason: String },
}

/// Inbound half handed out by `Transport::connect`.
pub type Inbound = mpsc::UnboundedReceiver<TransportEvent>;

/// # Transport
///
/// A broker client. One instance serves both the publisher and the session
/// manager; the session manager owns its connection lifecycle.
pub trait Transport: Send + Sync + 'static {
    /// Performs the handshake. On success, returns the receiver that will carry
    /// every inbound event for this connection.
    fn connect(&self) -> impl Future<Output = Result<Inbound, TransportError>> + Send;

    /// Subscribes to `channels` on the current connection.
    fn subscribe(
        &self,
        channels: &[String],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Hands one payload to the broker for `channel`.
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drops the connection. Must be safe to call when already disconnected.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}
