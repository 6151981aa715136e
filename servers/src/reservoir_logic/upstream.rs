use std::path::Path;

use lib_reservoir::core::{PublishReport, Publisher, Record, Transport};
use lib_reservoir::ingestors::csv_records::{resolve_path, CsvRecordSource};

use super::config::Settings;

/// Loads every configured source's file. A source whose file cannot be read
/// is logged and left out; the others still load.
pub fn load_sources(settings: &Settings) -> Vec<(String, Vec<Record>)> {
    let reader = CsvRecordSource::new(&settings.date_column, &settings.value_column);
    settings
        .sources
        .iter()
        .filter_map(|source| {
            let path = resolve_path(&settings.data_dir, &settings.file_pattern, source);
            load_one(&reader, source, &path).map(|records| (source.clone(), records))
        })
        .collect()
}

fn load_one(reader: &CsvRecordSource, source: &str, path: &Path) -> Option<Vec<Record>> {
    match reader.load(path) {
        Ok(loaded) => Some(loaded.records),
        Err(e) => {
            log::error!("Skipping source {}: {}", source, e);
            None
        }
    }
}

/// Publishes the loaded sources one after another and logs the outcome.
pub async fn run<T: Transport>(
    publisher: Publisher<T>,
    batches: Vec<(String, Vec<Record>)>,
) -> Vec<PublishReport> {
    log::info!(
        "Publishing {} source(s), {:?} between records",
        batches.len(),
        publisher.pacing()
    );
    let reports = publisher.publish_all(&batches).await;

    for report in &reports {
        match &report.result {
            Ok(sent) => log::info!("Published {} record(s) for {}", sent, report.source),
            Err(e) => log::error!("Publishing for {} failed: {}", report.source, e),
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservoir_logic::config::Config;
    use crate::reservoir_logic::state::AppState;
    use lib_reservoir::connections::MemoryBroker;
    use lib_reservoir::core::{SessionManager, TopicRouter, WireCodec};
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn missing_files_do_not_stop_other_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("Shasta_WML(Sample).csv"),
            "Date,TAF\n2023-01-01,10\n2023-01-02,12\n",
        )
        .unwrap();

        let settings = Config {
            data_dir: Some(dir.path().to_path_buf()),
            sources: Some(vec!["shasta".into(), "oroville".into()]),
            ..Default::default()
        }
        .into_settings()
        .unwrap();

        let loaded = load_sources(&settings);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "shasta");
        assert_eq!(loaded[0].1.len(), 2);
    }

    #[tokio::test]
    async fn spawned_run_publishes_through_the_shared_transport() {
        let router = TopicRouter::from_sources(["shasta", "sonoma"], "WML").unwrap();
        let state = AppState::new(router, WireCodec::default());
        let broker = MemoryBroker::new();
        let transport = Arc::new(broker.client());

        let session = Arc::new(SessionManager::new(
            transport.clone(),
            state.router.clone(),
            state.aggregator.clone(),
            state.codec.clone(),
        ));
        let mut updates = state.aggregator.subscribe_updates();
        session.connect().await.unwrap();

        let publisher = Publisher::new(transport, state.router.clone(), state.codec.clone())
            .with_pacing(Duration::ZERO);
        let batches = vec![
            (
                "shasta".to_string(),
                vec![Record::new("2023-01-01", 10.0), Record::new("2023-01-01", 20.0)],
            ),
            ("folsom".to_string(), vec![Record::new("2023-01-01", 1.0)]),
        ];

        // Same wiring as the server: publishing runs on its own task.
        let reports = tokio::spawn(run(publisher, batches)).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].result, Ok(2));
        assert!(reports[1].result.is_err());

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .unwrap()
                .unwrap();
        }
        let summary = state.aggregator.summary_for("2023-01-01");
        assert_eq!(summary["shasta"].count, 2);
        assert_eq!(summary["shasta"].mean, 15.0);

        session.disconnect().await;
    }
}
