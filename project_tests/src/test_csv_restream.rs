use std::fs;
use std::sync::Arc;
use std::time::Duration;

use lib_reservoir::connections::MemoryBroker;
use lib_reservoir::core::{
    Aggregator, PubSubError, Publisher, Record, SessionManager, TopicRouter, WireCodec,
};
use lib_reservoir::ingestors::csv_records::{resolve_path, CsvRecordSource, DEFAULT_FILE_PATTERN};
use tempfile::tempdir;
use tokio::time::timeout;

#[tokio::test]
async fn test_csv_files_are_restreamed_and_averaged() {
    let dir = tempdir().expect("Failed to create temporary directory");
    fs::write(
        dir.path().join("Shasta_WML(Sample).csv"),
        concat!(
            "Date,Reservoir,TAF\n",
            "2023-01-01,Shasta,4000\n",
            "2023-01-01,Shasta,4100\n",
            "2023-01-02,Shasta,\"4,200\"\n",
        ),
    )
    .expect("write shasta");
    fs::write(
        dir.path().join("Sonoma_WML(Sample).csv"),
        "Date,TAF\n2023-01-01,200\nbad-row-without-value\n2023-01-02,210\n",
    )
    .expect("write sonoma");
    // No file for oroville.

    let sources = ["shasta", "oroville", "sonoma"];
    let router = Arc::new(TopicRouter::from_sources(sources, "WML").expect("valid router"));
    let codec = WireCodec::default();
    let broker = MemoryBroker::new();

    // One transport shared by the publisher and the session, as the server runs it.
    let transport = Arc::new(broker.client());
    let session = Arc::new(SessionManager::new(
        transport.clone(),
        router.clone(),
        Arc::new(Aggregator::new()),
        codec.clone(),
    ));
    let mut updates = session.aggregator().subscribe_updates();
    session.connect().await.expect("connects");

    let reader = CsvRecordSource::default();
    let mut batches: Vec<(String, Vec<Record>)> = Vec::new();
    for source in sources {
        let path = resolve_path(dir.path(), DEFAULT_FILE_PATTERN, source);
        if let Ok(loaded) = reader.load(&path) {
            batches.push((source.to_string(), loaded.records));
        }
    }
    assert_eq!(batches.len(), 2);

    let publisher = Publisher::new(transport, router, codec).with_pacing(Duration::ZERO);
    let reports = publisher.publish_all(&batches).await;
    let sent: Vec<_> = reports.iter().map(|r| (r.source.as_str(), r.result.clone())).collect();
    assert_eq!(sent, vec![("shasta", Ok(3)), ("sonoma", Ok(2))]);

    for _ in 0..5 {
        timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("update within 5s")
            .expect("update channel open");
    }

    let snapshot = session.aggregator().snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].date, "2023-01-01");
    assert_eq!(snapshot[0].sources["shasta"].mean, 4050.0);
    assert_eq!(snapshot[0].sources["sonoma"].count, 1);
    assert_eq!(snapshot[1].date, "2023-01-02");
    assert_eq!(snapshot[1].sources["shasta"].mean, 4200.0);
    assert!(snapshot.iter().all(|d| !d.sources.contains_key("oroville")));

    let exported = serde_json::to_value(&snapshot).expect("serializable");
    assert_eq!(exported[1]["sources"]["sonoma"]["mean"], 210.0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_publish_failure_halts_only_that_source() {
    let broker = MemoryBroker::new();
    let router =
        Arc::new(TopicRouter::from_sources(["shasta", "sonoma"], "WML").expect("valid router"));
    let transport = Arc::new(broker.client());
    let session = Arc::new(SessionManager::new(
        transport.clone(),
        router.clone(),
        Arc::new(Aggregator::new()),
        WireCodec::default(),
    ));
    session.connect().await.expect("connects");

    let publisher =
        Publisher::new(transport, router, WireCodec::default()).with_pacing(Duration::ZERO);
    let records = vec![Record::new("2023-01-01", 1.0), Record::new("2023-01-01", 2.0)];

    let batches = vec![
        ("folsom".to_string(), records.clone()),
        ("sonoma".to_string(), records.clone()),
    ];
    let reports = publisher.publish_all(&batches).await;
    assert!(matches!(
        reports[0].result,
        Err(PubSubError::ConfigurationError(_))
    ));
    assert_eq!(reports[1].result, Ok(2));

    broker.fail_publishes(Some("queue full"));
    let err = publisher.publish("shasta", &records).await.unwrap_err();
    assert!(matches!(
        err,
        PubSubError::PublishError { ref channel, sent: 0, .. } if channel == "SHASTA/WML"
    ));

    session.disconnect().await;
}
