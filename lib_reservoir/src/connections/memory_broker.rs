//! # In-Process Broker
//!
//! A topic broker living in the current process. Every `MemoryTransport`
//! created from the same `MemoryBroker` can publish to and subscribe on the
//! same channels. Delivery order per channel is the publish order.
//!
//! Besides backing `--broker memory` runs, the broker lets callers inject
//! failures: refused handshakes, rejected publishes, raw payloads and dropped
//! connections.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::core::transport::{
    Inbound, ReasonCode, Transport, TransportError, TransportEvent,
};

struct ClientEntry {
    sender: mpsc::UnboundedSender<TransportEvent>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<usize, ClientEntry>,
    refusal: Option<ReasonCode>,
    publish_failure: Option<String>,
}

impl BrokerState {
    fn deliver(&mut self, channel: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            if client.channels.contains(channel) {
                let event = TransportEvent::Message {
                    channel: channel.to_string(),
                    payload: payload.to_vec(),
                };
                if client.sender.send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// # Memory Broker
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_id: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A new client of this broker. Clients start disconnected.
    pub fn client(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(self),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Refuse every handshake with `code` until called again with `None`.
    pub fn refuse_connections(&self, code: Option<ReasonCode>) {
        self.lock().refusal = code;
    }

    /// Reject every publish with `reason` until called again with `None`.
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.lock().publish_failure = reason.map(str::to_string);
    }

    /// Delivers a raw payload to every subscriber of `channel`, bypassing any
    /// client. Returns how many subscribers received it.
    pub fn inject(&self, channel: &str, payload: &[u8]) -> usize {
        self.lock().deliver(channel, payload)
    }

    /// Drops every connection; each client sees `Closed { reason }`.
    pub fn drop_connections(&self, reason: &str) {
        let clients: Vec<ClientEntry> = self.lock().clients.drain().map(|(_, c)| c).collect();
        log::debug!("Dropping {} in-process connection(s): {}", clients.len(), reason);
        for client in clients {
            let _ = client.sender.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.lock().clients.len()
    }

    /// Every channel with at least one subscriber, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.lock();
        let channels: BTreeSet<&String> = state
            .clients
            .values()
            .flat_map(|c| c.channels.iter())
            .collect();
        channels.into_iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One client connection to a `MemoryBroker`.
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    id: usize,
}

impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Inbound, TransportError> {
        let mut state = self.broker.lock();
        if let Some(code) = state.refusal {
            return Err(TransportError::new(code, code.describe()));
        }

        let (sender, inbound) = mpsc::unbounded_channel();
        state.clients.insert(
            self.id,
            ClientEntry {
                sender,
                channels: HashSet::new(),
            },
        );
        Ok(inbound)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let client = state
            .clients
            .get_mut(&self.id)
            .ok_or_else(TransportError::not_connected)?;
        client.channels.extend(channels.iter().cloned());
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if !state.clients.contains_key(&self.id) {
            return Err(TransportError::not_connected());
        }
        if let Some(reason) = &state.publish_failure {
            return Err(TransportError::new(ReasonCode::ServerUnavailable, reason.clone()));
        }
        state.deliver(channel, &payload);
        Ok(())
    }

    async fn disconnect(&self) {
        self.broker.lock().clients.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order_to_subscribers() {
        let broker = MemoryBroker::new();
        let subscriber = broker.client();
        let publisher = broker.client();

        let mut inbound = subscriber.connect().await.unwrap();
        subscriber.subscribe(&["SHASTA/WML".to_string()]).await.unwrap();
        publisher.connect().await.unwrap();

        for i in 0..3u8 {
            publisher.publish("SHASTA/WML", vec![i]).await.unwrap();
        }
        publisher.publish("SONOMA/WML", vec![9]).await.unwrap();

        for i in 0..3u8 {
            assert_eq!(
                inbound.recv().await,
                Some(TransportEvent::Message {
                    channel: "SHASTA/WML".to_string(),
                    payload: vec![i]
                })
            );
        }
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn refusal_carries_reason_code() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(Some(ReasonCode::NotAuthorized));
        let err = broker.client().connect().await.unwrap_err();
        assert_eq!(err.code, ReasonCode::NotAuthorized);
        assert_eq!(broker.connected_clients(), 0);
    }

    #[tokio::test]
    async fn publishing_requires_a_connection() {
        let broker = MemoryBroker::new();
        let err = broker.client().publish("SHASTA/WML", vec![]).await.unwrap_err();
        assert_eq!(err.code, ReasonCode::NotConnected);
    }

    #[tokio::test]
    async fn dropped_connections_see_closed() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        let mut inbound = client.connect().await.unwrap();

        broker.drop_connections("maintenance");
        assert_eq!(
            inbound.recv().await,
            Some(TransportEvent::Closed {
                reason: "maintenance".to_string()
            })
        );
        assert_eq!(inbound.recv().await, None);
        assert_eq!(broker.connected_clients(), 0);
    }
}
