//! # Redis Pub/Sub Transport
//!
//! Talks to a Redis-compatible broker. Two connections are opened per session:
//! a dedicated pub/sub connection for the subscriber side and a
//! `ConnectionManager` for `PUBLISH`. Messages received on the pub/sub
//! connection are forwarded, in order, to the session manager's inbound
//! channel by a small forwarding task.

use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::configs::BrokerConfig;
use crate::core::transport::{
    Inbound, ReasonCode, Transport, TransportError, TransportEvent,
};

/// # Redis Transport
pub struct RedisTransport {
    client: Client,
    endpoint: String,
    /// Pub/sub connection between handshake and subscribe.
    pending: Mutex<Option<PubSub>>,
    publisher: Mutex<Option<ConnectionManager>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RedisTransport {
    /// Prepares a client for `config`. No network I/O happens until `connect`.
    pub fn new(config: &BrokerConfig) -> Result<Self, TransportError> {
        let url = config.url().map_err(|e| {
            TransportError::new(ReasonCode::Unspecified, format!("invalid broker address: {}", e))
        })?;
        let client = Client::open(url.as_str()).map_err(classify)?;

        Ok(Self {
            client,
            endpoint: config.endpoint(),
            pending: Mutex::new(None),
            publisher: Mutex::new(None),
            events: Mutex::new(None),
            forwarder: Mutex::new(None),
        })
    }
}

impl Transport for RedisTransport {
    async fn connect(&self) -> Result<Inbound, TransportError> {
        // Leftovers from a dropped session.
        self.disconnect().await;

        log::info!("Connecting to Redis broker at {}", self.endpoint);
        let pubsub = self.client.get_async_pubsub().await.map_err(classify)?;
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(classify)?;

        let (sender, inbound) = mpsc::unbounded_channel();
        *self.pending.lock().await = Some(pubsub);
        *self.publisher.lock().await = Some(manager);
        *self.events.lock().await = Some(sender);
        Ok(inbound)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let mut pubsub = self.pending.lock().await.take().ok_or_else(|| {
            TransportError::new(
                ReasonCode::NotConnected,
                "no fresh pub/sub connection; reconnect before subscribing again",
            )
        })?;

        for channel in channels {
            pubsub.subscribe(channel.as_str()).await.map_err(classify)?;
        }

        let sender = self
            .events
            .lock()
            .await
            .clone()
            .ok_or_else(TransportError::not_connected)?;
        let endpoint = self.endpoint.clone();

        let forwarder = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let event = TransportEvent::Message {
                    channel: msg.get_channel_name().to_string(),
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if sender.send(event).is_err() {
                    // Session side is gone.
                    return;
                }
            }
            let _ = sender.send(TransportEvent::Closed {
                reason: format!("pub/sub stream from {} ended", endpoint),
            });
        });

        if let Some(stale) = self.forwarder.lock().await.replace(forwarder) {
            stale.abort();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut manager = self
            .publisher
            .lock()
            .await
            .clone()
            .ok_or_else(TransportError::not_connected)?;

        let receivers: i64 = manager.publish(channel, payload).await.map_err(classify)?;
        log::trace!("PUBLISH {} reached {} subscriber(s)", channel, receivers);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.forwarder.lock().await.take() {
            task.abort();
        }
        self.pending.lock().await.take();
        self.publisher.lock().await.take();
        self.events.lock().await.take();
    }
}

/// Maps a Redis error onto the connect-acknowledgement reason codes.
fn classify(e: RedisError) -> TransportError {
    let code = match e.code() {
        Some("WRONGPASS") | Some("NOAUTH") => ReasonCode::BadCredentials,
        Some("NOPERM") => ReasonCode::NotAuthorized,
        Some("NOPROTO") => ReasonCode::UnacceptableProtocolVersion,
        _ if e.is_timeout() => ReasonCode::Timeout,
        _ if e.is_connection_refusal() || e.is_io_error() || e.is_connection_dropped() => {
            ReasonCode::ServerUnavailable
        }
        _ => ReasonCode::Unspecified,
    };
    TransportError::new(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{Credentials, ProtocolVersion};

    #[test]
    fn client_builds_without_network() {
        let config = BrokerConfig {
            host: "localhost".to_string(),
            port: 6379,
            protocol: ProtocolVersion::Resp2,
            credentials: Some(Credentials {
                username: None,
                password: "secret".to_string(),
            }),
            ..Default::default()
        };
        let transport = RedisTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint, "localhost:6379");
    }

    #[tokio::test]
    async fn publish_before_connect_is_not_connected() {
        let transport = RedisTransport::new(&BrokerConfig::default()).unwrap();
        let err = transport.publish("SHASTA/WML", b"{}".to_vec()).await.unwrap_err();
        assert_eq!(err.code, ReasonCode::NotConnected);
    }
}
