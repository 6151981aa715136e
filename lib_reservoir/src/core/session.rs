//! # Session Manager
//!
//! Owns the broker connection for the subscriber side and feeds the aggregator.
//!
//! ## Lifecycle
//!
//! `Disconnected → Connecting → Connected → Disconnected`
//!
//! - `connect()` runs the handshake under the connect timeout. On success the
//!   session is `Connected` and immediately subscribes to every channel the
//!   router knows (subscribe-on-connect-ack). On failure it falls back to
//!   `Disconnected` and returns `ConnectionError` with the broker reason code.
//! - Inbound events are drained by a dedicated network task, so message
//!   handling runs concurrently with the publisher and with summary queries.
//! - A dropped connection is reported as `ConnectionLost`. Whether the session
//!   then reconnects by itself is decided by the `ReconnectPolicy`.
//! - `disconnect()` is idempotent.
//!
//! ## Failure Isolation
//!
//! `on_message` handles exactly one payload. A payload that does not decode,
//! or that arrives on an unknown channel, is logged, broadcast as an event and
//! dropped; the next message is processed as usual and the aggregator never
//! sees partial data.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::configs::ReconnectPolicy;
use crate::core::aggregator::{Aggregator, RunningSummary};
use crate::core::error::PubSubError;
use crate::core::message::WireCodec;
use crate::core::topic_router::TopicRouter;
use crate::core::transport::{Inbound, ReasonCode, Transport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a session reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake accepted.
    Connected,
    /// Subscriptions placed after the connect acknowledgement.
    Subscribed { channels: Vec<String> },
    /// A connect or reconnect attempt failed (`ConnectionError`).
    ConnectFailed(PubSubError),
    /// One inbound message was dropped (`DecodeError` or `ConfigurationError`).
    MessageRejected(PubSubError),
    /// An established connection dropped (`ConnectionLost`).
    ConnectionLost(PubSubError),
    /// An automatic reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic reconnection stopped after this many failed attempts.
    ReconnectAbandoned { attempts: u32 },
    /// The session was closed by its owner.
    Disconnected,
}

/// # Session Manager
///
/// Always used behind an `Arc`: the network task keeps its own reference.
pub struct SessionManager<T: Transport> {
    transport: Arc<T>,
    router: Arc<TopicRouter>,
    aggregator: Arc<Aggregator>,
    codec: WireCodec,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    network: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(
        transport: Arc<T>,
        router: Arc<TopicRouter>,
        aggregator: Arc<Aggregator>,
        codec: WireCodec,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            router,
            aggregator,
            codec,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::Manual,
            state: Mutex::new(SessionState::Disconnected),
            events,
            network: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Receiver for session events. Only events sent after this call are seen.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Connects, subscribes to every routed channel and starts the network task.
    ///
    /// A no-op when already connected.
    ///
    /// # Errors
    /// `ConnectionError` when the handshake is refused, times out or the
    /// subscriptions cannot be placed. The session is `Disconnected` afterwards
    /// and holds no subscriptions.
    pub async fn connect(self: &Arc<Self>) -> Result<(), PubSubError> {
        if self.state() == SessionState::Connected {
            log::debug!("connect() called while already connected");
            return Ok(());
        }

        match self.establish().await {
            Ok(inbound) => {
                self.spawn_network_loop(inbound);
                Ok(())
            }
            Err(e) => {
                log::error!("{}", e);
                self.emit(SessionEvent::ConnectFailed(e.clone()));
                Err(e)
            }
        }
    }

    /// Closes the session and releases the transport.
    ///
    /// Stops the network task, including any reconnect loop in progress.
    /// Calling it on a session that is already disconnected does nothing.
    pub async fn disconnect(&self) {
        let previous = self.swap_state(SessionState::Disconnected);
        let task = self.lock_network().take();
        if let Some(task) = &task {
            task.abort();
        }

        if previous == SessionState::Disconnected && task.is_none() {
            log::debug!("disconnect() called while already disconnected");
            return;
        }

        self.transport.disconnect().await;
        log::info!("Disconnected from broker.");
        self.emit(SessionEvent::Disconnected);
    }

    /// Handles one inbound payload: decode, resolve the source, aggregate.
    ///
    /// Returns the refreshed summary for the message's `(date, source)`.
    ///
    /// # Errors
    /// `DecodeError` for a malformed payload, `ConfigurationError` for an
    /// unknown channel. Either way the message is dropped, reported, and the
    /// session carries on.
    pub fn on_message(&self, channel: &str, raw: &[u8]) -> Result<RunningSummary, PubSubError> {
        let record = match self.codec.decode(raw) {
            Ok(record) => record,
            Err(e) => {
                return Err(self.reject(PubSubError::DecodeError {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                }))
            }
        };

        let source = match self.router.source_for(channel) {
            Ok(source) => source,
            Err(e) => return Err(self.reject(e)),
        };

        Ok(self.aggregator.record(source, &record.date, record.value))
    }

    /// Handshake plus subscribe-on-connect. Does not start the network task.
    async fn establish(&self) -> Result<Inbound, PubSubError> {
        if !self.transition(SessionState::Disconnected, SessionState::Connecting) {
            return Err(PubSubError::ConnectionError {
                code: ReasonCode::Unspecified,
                reason: "another connect attempt is in progress".to_string(),
            });
        }

        let handshake = tokio::time::timeout(self.connect_timeout, self.transport.connect());
        let inbound = match handshake.await {
            Ok(Ok(inbound)) => inbound,
            Ok(Err(e)) => {
                self.set_state(SessionState::Disconnected);
                return Err(PubSubError::ConnectionError {
                    code: e.code,
                    reason: e.message,
                });
            }
            Err(_) => {
                self.set_state(SessionState::Disconnected);
                self.transport.disconnect().await;
                return Err(PubSubError::ConnectionError {
                    code: ReasonCode::Timeout,
                    reason: format!("no acknowledgement within {:?}", self.connect_timeout),
                });
            }
        };

        if !self.transition(SessionState::Connecting, SessionState::Connected) {
            // disconnect() won the race while the handshake was in flight.
            self.transport.disconnect().await;
            return Err(PubSubError::ConnectionError {
                code: ReasonCode::Unspecified,
                reason: "session was closed while connecting".to_string(),
            });
        }

        log::info!("Connected successfully.");
        self.emit(SessionEvent::Connected);
        self.on_connect_ack().await?;
        Ok(inbound)
    }

    /// Subscribes to every channel in the router.
    async fn on_connect_ack(&self) -> Result<(), PubSubError> {
        let channels = self.router.channels();

        if let Err(e) = self.transport.subscribe(&channels).await {
            self.transport.disconnect().await;
            self.set_state(SessionState::Disconnected);
            return Err(PubSubError::ConnectionError {
                code: e.code,
                reason: format!("subscribe failed: {}", e.message),
            });
        }

        log::info!("Subscribed to {}", channels.join(", "));
        self.emit(SessionEvent::Subscribed { channels });
        Ok(())
    }

    fn spawn_network_loop(self: &Arc<Self>, inbound: Inbound) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.network_loop(inbound).await });
        if let Some(stale) = self.lock_network().replace(handle) {
            stale.abort();
        }
    }

    async fn network_loop(self: Arc<Self>, mut inbound: Inbound) {
        loop {
            let reason = self.pump(&mut inbound).await;

            if !self.transition(SessionState::Connected, SessionState::Disconnected) {
                // Closed on purpose by disconnect().
                return;
            }

            let lost = PubSubError::ConnectionLost(reason);
            log::warn!("{}", lost);
            self.emit(SessionEvent::ConnectionLost(lost));

            match self.reconnect_with_backoff().await {
                Some(next) => inbound = next,
                None => return,
            }
        }
    }

    /// Dispatches inbound events until the connection ends; returns why it ended.
    async fn pump(&self, inbound: &mut Inbound) -> String {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message { channel, payload } => {
                    // Rejections are already logged and broadcast.
                    let _ = self.on_message(&channel, &payload);
                }
                TransportEvent::Closed { reason } => return reason,
            }
        }
        "transport closed its event channel".to_string()
    }

    async fn reconnect_with_backoff(&self) -> Option<Inbound> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let Some(delay) = self.reconnect.delay_for(attempt) else {
                // Manual loss is already reported as ConnectionLost.
                if matches!(self.reconnect, ReconnectPolicy::Auto { .. }) {
                    log::error!("Giving up on reconnecting after {} attempt(s).", attempt - 1);
                    self.emit(SessionEvent::ReconnectAbandoned { attempts: attempt - 1 });
                }
                return None;
            };

            log::info!("Reconnect attempt {} in {:?}", attempt, delay);
            self.emit(SessionEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            match self.establish().await {
                Ok(inbound) => return Some(inbound),
                Err(e) => {
                    log::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.emit(SessionEvent::ConnectFailed(e));
                }
            }
        }
    }

    fn reject(&self, error: PubSubError) -> PubSubError {
        log::warn!("Dropping inbound message: {}", error);
        self.emit(SessionEvent::MessageRejected(error.clone()));
        error
    }

    fn emit(&self, event: SessionEvent) {
        // Observers are optional; everything sent here is also logged.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_network(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.lock_state() = next;
    }

    fn swap_state(&self, next: SessionState) -> SessionState {
        std::mem::replace(&mut *self.lock_state(), next)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.lock_state();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}
