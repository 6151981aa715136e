use tokio::sync::broadcast::{self, error::RecvError};

use lib_reservoir::configs::ReconnectPolicy;
use lib_reservoir::core::SessionEvent;

/// What the server does with one session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Shutdown,
}

/// A lost connection ends the run unless the session reconnects by itself.
pub fn judge(event: &SessionEvent, policy: &ReconnectPolicy) -> Verdict {
    match event {
        SessionEvent::ConnectionLost(_) if *policy == ReconnectPolicy::Manual => Verdict::Shutdown,
        SessionEvent::ReconnectAbandoned { .. } => Verdict::Shutdown,
        _ => Verdict::Continue,
    }
}

/// Watches session events and asks the server to stop when the broker is gone
/// for good.
pub async fn run(
    mut events: broadcast::Receiver<SessionEvent>,
    policy: ReconnectPolicy,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    match &event {
                        SessionEvent::Connected => log::info!("Session connected."),
                        SessionEvent::Subscribed { channels } => {
                            log::info!("Subscribed to {}", channels.join(", "))
                        }
                        SessionEvent::MessageRejected(e) => log::debug!("Rejected: {}", e),
                        SessionEvent::Reconnecting { attempt, delay } => {
                            log::info!("Reconnect attempt {} in {:?}", attempt, delay)
                        }
                        other => log::debug!("Session event: {:?}", other),
                    }
                    if judge(&event, &policy) == Verdict::Shutdown {
                        log::error!("Broker connection is gone ({:?}), shutting down.", event);
                        let _ = shutdown_tx.send(());
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Supervisor missed {} session event(s).", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_reservoir::core::PubSubError;
    use std::time::Duration;

    fn lost() -> SessionEvent {
        SessionEvent::ConnectionLost(PubSubError::ConnectionLost("reset".into()))
    }

    #[test]
    fn manual_policy_stops_on_lost_connection() {
        assert_eq!(judge(&lost(), &ReconnectPolicy::Manual), Verdict::Shutdown);
    }

    #[test]
    fn auto_policy_waits_for_abandonment() {
        let auto = ReconnectPolicy::Auto {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_attempts: Some(3),
        };
        assert_eq!(judge(&lost(), &auto), Verdict::Continue);
        assert_eq!(
            judge(&SessionEvent::ReconnectAbandoned { attempts: 3 }, &auto),
            Verdict::Shutdown
        );
        assert_eq!(judge(&SessionEvent::Connected, &auto), Verdict::Continue);
    }

    #[tokio::test]
    async fn requests_shutdown_after_manual_loss() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(events_rx, ReconnectPolicy::Manual, shutdown_tx));

        events_tx.send(SessionEvent::Connected).unwrap();
        events_tx.send(lost()).unwrap();

        shutdown_rx.recv().await.unwrap();
        handle.await.unwrap();
    }
}
