use std::sync::Arc;
use std::time::Duration;

use lib_reservoir::connections::{MemoryBroker, MemoryTransport};
use lib_reservoir::core::transport::{Inbound, ReasonCode, Transport, TransportError};
use lib_reservoir::core::{
    Aggregator, DailySummary, PubSubError, Publisher, Record, SessionEvent, SessionManager,
    SessionState, TopicRouter, WireCodec,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const SOURCES: [&str; 3] = ["shasta", "oroville", "sonoma"];

fn router() -> Arc<TopicRouter> {
    Arc::new(TopicRouter::from_sources(SOURCES, "WML").expect("valid router"))
}

fn session_on(transport: MemoryTransport) -> Arc<SessionManager<MemoryTransport>> {
    Arc::new(SessionManager::new(
        Arc::new(transport),
        router(),
        Arc::new(Aggregator::new()),
        WireCodec::default(),
    ))
}

async fn connected_publisher(broker: &Arc<MemoryBroker>) -> Publisher<MemoryTransport> {
    let transport = broker.client();
    let _inbound = transport.connect().await.expect("publisher connects");
    Publisher::new(Arc::new(transport), router(), WireCodec::default()).with_pacing(Duration::ZERO)
}

async fn wait_updates(
    updates: &mut broadcast::Receiver<Arc<DailySummary>>,
    n: usize,
) -> Vec<Arc<DailySummary>> {
    let mut seen = Vec::with_capacity(n);
    while seen.len() < n {
        let update = timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("update within 5s")
            .expect("update channel open");
        seen.push(update);
    }
    seen
}

#[tokio::test]
async fn test_records_arrive_in_publish_order() {
    let broker = MemoryBroker::new();
    let session = session_on(broker.client());
    let mut updates = session.aggregator().subscribe_updates();
    session.connect().await.expect("connects");

    let publisher = connected_publisher(&broker).await;
    let records: Vec<Record> = (1..=5).map(|i| Record::new("2023-01-01", i as f64)).collect();
    assert_eq!(publisher.publish("shasta", &records).await, Ok(5));

    wait_updates(&mut updates, 5).await;
    assert_eq!(
        session.aggregator().bucket("2023-01-01", "shasta"),
        Some(vec![1.0, 2.0, 3.0, 4.0, 5.0])
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_running_mean_and_absent_sources() {
    let broker = MemoryBroker::new();
    let session = session_on(broker.client());
    let mut updates = session.aggregator().subscribe_updates();
    session.connect().await.expect("connects");

    let publisher = connected_publisher(&broker).await;
    let records = [Record::new("2023-01-01", 10.0), Record::new("2023-01-01", 20.0)];
    publisher.publish("shasta", &records).await.expect("published");

    let seen = wait_updates(&mut updates, 2).await;
    let latest = &seen[1];
    assert_eq!(latest.date, "2023-01-01");
    assert_eq!(latest.sources["shasta"].count, 2);
    assert_eq!(latest.sources["shasta"].mean, 15.0);

    let summary = session.aggregator().summary_for("2023-01-01");
    assert_eq!(summary.len(), 1);
    assert!(!summary.contains_key("oroville"));
    assert!(!summary.contains_key("sonoma"));
    assert!(session.aggregator().summary_for("2023-01-02").is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn test_malformed_message_is_dropped_and_session_continues() {
    let broker = MemoryBroker::new();
    let session = session_on(broker.client());
    let mut events = session.subscribe_events();
    let mut updates = session.aggregator().subscribe_updates();
    session.connect().await.expect("connects");

    assert_eq!(broker.inject("OROVILLE/WML", b"not json"), 1);
    assert_eq!(broker.inject("OROVILLE/WML", br#"{"Date":"2023-01-01"}"#), 1);
    assert_eq!(
        broker.inject("OROVILLE/WML", br#"{"Date":"2023-01-01","TAF":3.5,"Note":"x"}"#),
        1
    );

    wait_updates(&mut updates, 1).await;
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(
        session.aggregator().bucket("2023-01-01", "oroville"),
        Some(vec![3.5])
    );

    let mut rejected = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::MessageRejected(e) = event {
            rejected.push(e);
        }
    }
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(|e| matches!(
        e,
        PubSubError::DecodeError { channel, .. } if channel == "OROVILLE/WML"
    )));

    session.disconnect().await;
}

#[tokio::test]
async fn test_unknown_channel_is_a_configuration_error() {
    let broker = MemoryBroker::new();
    let session = session_on(broker.client());

    let err = session
        .on_message("FOLSOM/WML", br#"{"Date":"2023-01-01","TAF":1}"#)
        .unwrap_err();
    assert!(matches!(err, PubSubError::ConfigurationError(_)));
    assert!(session.aggregator().dates().is_empty());
}

#[tokio::test]
async fn test_concurrent_channels_aggregate_independently() {
    let broker = MemoryBroker::new();
    let session = session_on(broker.client());
    let mut updates = session.aggregator().subscribe_updates();
    session.connect().await.expect("connects");

    let shasta = connected_publisher(&broker).await;
    let oroville = connected_publisher(&broker).await;
    let sonoma = connected_publisher(&broker).await;

    let batch = |v: f64| vec![Record::new("2023-01-01", v), Record::new("2023-01-01", v * 3.0)];
    let (a, b, c) = (batch(1.0), batch(2.0), batch(4.0));
    let (ra, rb, rc) = tokio::join!(
        shasta.publish("shasta", &a),
        oroville.publish("oroville", &b),
        sonoma.publish("sonoma", &c),
    );
    assert_eq!((ra, rb, rc), (Ok(2), Ok(2), Ok(2)));

    wait_updates(&mut updates, 6).await;
    let summary = session.aggregator().summary_for("2023-01-01");
    assert_eq!(summary.len(), 3);
    assert_eq!(summary["shasta"].mean, 2.0);
    assert_eq!(summary["oroville"].mean, 4.0);
    assert_eq!(summary["sonoma"].mean, 8.0);
    assert!(summary.values().all(|s| s.count == 2));

    session.disconnect().await;
}

#[tokio::test]
async fn test_refused_connect_leaves_no_subscriptions() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(Some(ReasonCode::BadCredentials));
    let session = session_on(broker.client());
    let mut events = session.subscribe_events();

    let err = session.connect().await.unwrap_err();
    assert_eq!(
        err,
        PubSubError::ConnectionError {
            code: ReasonCode::BadCredentials,
            reason: ReasonCode::BadCredentials.describe().to_string(),
        }
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(broker.subscriptions().is_empty());
    assert_eq!(events.try_recv(), Ok(SessionEvent::ConnectFailed(err)));

    // The broker comes back; the same session can connect.
    broker.refuse_connections(None);
    session.connect().await.expect("connects on retry");
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(
        broker.subscriptions(),
        vec!["OROVILLE/WML", "SHASTA/WML", "SONOMA/WML"]
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_connect_and_disconnect_are_idempotent() {
    let broker = MemoryBroker::new();
    let session = session_on(broker.client());
    let mut events = session.subscribe_events();

    // Nothing to close yet.
    session.disconnect().await;
    assert!(events.try_recv().is_err());

    session.connect().await.expect("connects");
    session.connect().await.expect("second connect is a no-op");
    assert_eq!(broker.connected_clients(), 1);

    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(broker.connected_clients(), 0);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            SessionEvent::Connected,
            SessionEvent::Subscribed {
                channels: vec![
                    "SHASTA/WML".to_string(),
                    "OROVILLE/WML".to_string(),
                    "SONOMA/WML".to_string(),
                ]
            },
            SessionEvent::Disconnected,
        ]
    );
}

/// A broker that never answers the handshake.
struct SilentTransport;

impl Transport for SilentTransport {
    async fn connect(&self) -> Result<Inbound, TransportError> {
        std::future::pending().await
    }

    async fn subscribe(&self, _channels: &[String]) -> Result<(), TransportError> {
        Err(TransportError::not_connected())
    }

    async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::not_connected())
    }

    async fn disconnect(&self) {}
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_reports_timeout_code() {
    let session = Arc::new(
        SessionManager::new(
            Arc::new(SilentTransport),
            router(),
            Arc::new(Aggregator::new()),
            WireCodec::default(),
        )
        .with_connect_timeout(Duration::from_secs(5)),
    );

    let started = tokio::time::Instant::now();
    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        PubSubError::ConnectionError { code: ReasonCode::Timeout, .. }
    ));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(session.state(), SessionState::Disconnected);
}
