use std::sync::Arc;
use std::time::Duration;

use lib_reservoir::configs::ReconnectPolicy;
use lib_reservoir::connections::{MemoryBroker, MemoryTransport};
use lib_reservoir::core::transport::ReasonCode;
use lib_reservoir::core::{
    Aggregator, PubSubError, SessionEvent, SessionManager, SessionState, TopicRouter, WireCodec,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn session_with(
    broker: &Arc<MemoryBroker>,
    policy: ReconnectPolicy,
) -> Arc<SessionManager<MemoryTransport>> {
    let router = TopicRouter::from_sources(["shasta", "sonoma"], "WML").expect("valid router");
    Arc::new(
        SessionManager::new(
            Arc::new(broker.client()),
            Arc::new(router),
            Arc::new(Aggregator::new()),
            WireCodec::default(),
        )
        .with_reconnect_policy(policy),
    )
}

fn auto(base_ms: u64, max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy::Auto {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(base_ms * 4),
        max_attempts,
    }
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within 5s")
        .expect("event channel open")
}

async fn wait_for_state(session: &SessionManager<MemoryTransport>, wanted: SessionState) {
    timeout(Duration::from_secs(5), async {
        while session.state() != wanted {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state reached within 5s");
}

#[tokio::test]
async fn test_manual_policy_reports_loss_and_stays_down() {
    let broker = MemoryBroker::new();
    let session = session_with(&broker, ReconnectPolicy::Manual);
    session.connect().await.expect("connects");
    let mut events = session.subscribe_events();

    broker.drop_connections("maintenance");

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::ConnectionLost(PubSubError::ConnectionLost("maintenance".to_string()))
    );
    assert_eq!(session.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(broker.connected_clients(), 0);

    // The owner decides to come back.
    session.connect().await.expect("reconnects on request");
    assert_eq!(session.state(), SessionState::Connected);
    session.disconnect().await;
}

#[tokio::test]
async fn test_auto_policy_resubscribes_and_resumes() {
    let broker = MemoryBroker::new();
    let session = session_with(&broker, auto(10, None));
    let mut updates = session.aggregator().subscribe_updates();
    session.connect().await.expect("connects");
    let mut events = session.subscribe_events();

    broker.inject("SHASTA/WML", br#"{"Date":"2023-01-01","TAF":10}"#);
    timeout(Duration::from_secs(5), updates.recv()).await.expect("first update").expect("open");

    broker.drop_connections("broker restarted");

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionLost(PubSubError::ConnectionLost(_))
    ));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(10)
        }
    );
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Subscribed { channels } if channels.len() == 2
    ));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(broker.subscriptions(), vec!["SHASTA/WML", "SONOMA/WML"]);

    broker.inject("SHASTA/WML", br#"{"Date":"2023-01-01","TAF":20}"#);
    let summary = timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("second update")
        .expect("open");
    assert_eq!(summary.sources["shasta"].count, 2);
    assert_eq!(summary.sources["shasta"].mean, 15.0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_auto_policy_gives_up_after_max_attempts() {
    let broker = MemoryBroker::new();
    let session = session_with(&broker, auto(5, Some(2)));
    session.connect().await.expect("connects");
    let mut events = session.subscribe_events();

    broker.refuse_connections(Some(ReasonCode::ServerUnavailable));
    broker.drop_connections("gone");

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        let done = matches!(event, SessionEvent::ReconnectAbandoned { .. });
        seen.push(event);
        if done {
            break;
        }
    }

    let refused = PubSubError::ConnectionError {
        code: ReasonCode::ServerUnavailable,
        reason: ReasonCode::ServerUnavailable.describe().to_string(),
    };
    assert_eq!(
        seen,
        vec![
            SessionEvent::ConnectionLost(PubSubError::ConnectionLost("gone".to_string())),
            SessionEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(5)
            },
            SessionEvent::ConnectFailed(refused.clone()),
            SessionEvent::Reconnecting {
                attempt: 2,
                delay: Duration::from_millis(10)
            },
            SessionEvent::ConnectFailed(refused),
            SessionEvent::ReconnectAbandoned { attempts: 2 },
        ]
    );
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    let broker = MemoryBroker::new();
    let session = session_with(&broker, auto(60_000, None));
    session.connect().await.expect("connects");
    let mut events = session.subscribe_events();

    broker.drop_connections("flap");
    assert!(matches!(next_event(&mut events).await, SessionEvent::ConnectionLost(_)));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Reconnecting { attempt: 1, .. }
    ));

    session.disconnect().await;
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    wait_for_state(&session, SessionState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.connected_clients(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_auto_policy_without_attempts_reports_abandonment() {
    let broker = MemoryBroker::new();
    let session = session_with(&broker, auto(5, Some(0)));
    session.connect().await.expect("connects");
    let mut events = session.subscribe_events();

    broker.drop_connections("gone");

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::ConnectionLost(PubSubError::ConnectionLost("gone".to_string()))
    );
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::ReconnectAbandoned { attempts: 0 }
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(broker.connected_clients(), 0);
}
