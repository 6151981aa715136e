//! # Paced Publisher
//!
//! Drains a record sequence for one source onto that source's channel, in input
//! order, sleeping a fixed pacing delay between sends so a shared broker and its
//! slow subscribers are not flooded. The sleep suspends only the publisher's own
//! task; inbound handling and aggregation keep running.
//!
//! There is no retry: the first transport failure ends the run for that source
//! and is returned as `PublishError`, carrying how many records went out first.

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::PubSubError;
use crate::core::message::{Record, WireCodec};
use crate::core::topic_router::TopicRouter;
use crate::core::transport::Transport;

/// Pacing used when none is configured.
pub const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// Outcome of one source within `publish_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub source: String,
    pub result: Result<usize, PubSubError>,
}

/// # Publisher
pub struct Publisher<T: Transport> {
    transport: Arc<T>,
    router: Arc<TopicRouter>,
    codec: WireCodec,
    pacing: Duration,
}

impl<T: Transport> Publisher<T> {
    pub fn new(transport: Arc<T>, router: Arc<TopicRouter>, codec: WireCodec) -> Self {
        Self {
            transport,
            router,
            codec,
            pacing: DEFAULT_PACING,
        }
    }

    /// Sets the delay between two consecutive sends. Zero disables pacing.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    /// Publishes `records` on the channel of `source`, in order.
    ///
    /// Returns the number of records sent.
    ///
    /// # Errors
    /// - `ConfigurationError` if `source` is not registered; nothing is sent.
    /// - `PublishError` on the first record the codec or transport rejects; the
    ///   rest of the sequence is not sent.
    pub async fn publish(&self, source: &str, records: &[Record]) -> Result<usize, PubSubError> {
        let channel = self.router.channel_for(source)?.to_string();
        log::info!(
            "Publishing {} record(s) for {} on {}",
            records.len(),
            source,
            channel
        );

        for (sent, record) in records.iter().enumerate() {
            if sent > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            let payload = self.codec.encode(record).map_err(|e| PubSubError::PublishError {
                channel: channel.clone(),
                sent,
                reason: e.to_string(),
            })?;

            if let Err(e) = self.transport.publish(&channel, payload).await {
                log::error!(
                    "Publish to {} failed after {} message(s): {}. Halting {}.",
                    channel,
                    sent,
                    e,
                    source
                );
                return Err(PubSubError::PublishError {
                    channel,
                    sent,
                    reason: e.to_string(),
                });
            }
            log::debug!("Published {} {} -> {}", record.date, record.value, channel);
        }

        Ok(records.len())
    }

    /// Publishes several sources one after another. A failure for one source
    /// is reported in its entry and does not stop the following sources.
    pub async fn publish_all(&self, batches: &[(String, Vec<Record>)]) -> Vec<PublishReport> {
        let mut reports = Vec::with_capacity(batches.len());
        for (source, records) in batches {
            let result = self.publish(source, records).await;
            if let Err(e) = &result {
                log::warn!("Publishing for {} did not complete: {}", source, e);
            }
            reports.push(PublishReport {
                source: source.clone(),
                result,
            });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{Inbound, ReasonCode, TransportError};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records every publish; fails once `fail_after` sends have gone through.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        fail_after: Option<usize>,
    }

    impl Transport for RecordingTransport {
        async fn connect(&self) -> Result<Inbound, TransportError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn subscribe(&self, _channels: &[String]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err(TransportError::new(ReasonCode::ServerUnavailable, "broker went away"));
            }
            sent.push((channel.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    fn router() -> Arc<TopicRouter> {
        Arc::new(TopicRouter::from_sources(["shasta", "sonoma"], "WML").unwrap())
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::new(format!("2023-01-{:02}", i + 1), i as f64)).collect()
    }

    #[tokio::test]
    async fn sends_in_input_order_on_resolved_channel() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(transport.clone(), router(), WireCodec::default())
            .with_pacing(Duration::ZERO);

        assert_eq!(publisher.publish("shasta", &records(3)).await, Ok(3));

        let codec = WireCodec::default();
        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().all(|(c, _)| c == "SHASTA/WML"));
        let values: Vec<f64> = sent.iter().map(|(_, p)| codec.decode(p).unwrap().value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn empty_sequence_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(transport.clone(), router(), WireCodec::default());
        assert_eq!(publisher.publish("shasta", &[]).await, Ok(0));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregistered_source_fails_before_sending() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(transport.clone(), router(), WireCodec::default());
        let result = publisher.publish("folsom", &records(2)).await;
        assert!(matches!(result, Err(PubSubError::ConfigurationError(_))));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_halts_the_source() {
        let transport = Arc::new(RecordingTransport {
            fail_after: Some(2),
            ..Default::default()
        });
        let publisher = Publisher::new(transport.clone(), router(), WireCodec::default())
            .with_pacing(Duration::ZERO);

        let result = publisher.publish("shasta", &records(5)).await;
        match result {
            Err(PubSubError::PublishError { channel, sent, .. }) => {
                assert_eq!(channel, "SHASTA/WML");
                assert_eq!(sent, 2);
            }
            other => panic!("expected PublishError, got {:?}", other),
        }
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_stop_the_next() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(transport.clone(), router(), WireCodec::default())
            .with_pacing(Duration::ZERO);

        let batches = vec![
            ("folsom".to_string(), records(2)),
            ("sonoma".to_string(), records(1)),
        ];
        let reports = publisher.publish_all(&batches).await;

        assert!(reports[0].result.is_err());
        assert_eq!(reports[1].result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_applies_between_sends_only() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = Publisher::new(transport, router(), WireCodec::default())
            .with_pacing(Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        publisher.publish("shasta", &records(3)).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }
}
