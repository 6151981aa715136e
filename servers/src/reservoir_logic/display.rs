use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use lib_reservoir::core::DailySummary;

/// Renders one summary as the lines shown to the operator.
pub fn render(summary: &DailySummary, value_field: &str) -> Vec<String> {
    summary
        .sources
        .iter()
        .map(|(source, stats)| {
            format!(
                "Date: {}, Reservoir: {}, Average {}: {:.2} ({} readings)",
                summary.date, source, value_field, stats.mean, stats.count
            )
        })
        .collect()
}

/// Prints the date's running averages after every accepted message.
pub async fn run(
    mut updates: broadcast::Receiver<Arc<DailySummary>>,
    value_field: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(summary) => {
                    for line in render(&summary, &value_field) {
                        log::info!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Display fell behind, skipped {} update(s).", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    log::debug!("Display task stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_reservoir::core::Aggregator;

    #[test]
    fn renders_one_line_per_source() {
        let aggregator = Aggregator::new();
        aggregator.record("sonoma", "2023-01-01", 10.0);
        aggregator.record("shasta", "2023-01-01", 10.0);
        aggregator.record("shasta", "2023-01-01", 20.0);

        let snapshot = aggregator.snapshot();
        let lines = render(&snapshot[0], "TAF");
        assert_eq!(
            lines,
            vec![
                "Date: 2023-01-01, Reservoir: shasta, Average TAF: 15.00 (2 readings)",
                "Date: 2023-01-01, Reservoir: sonoma, Average TAF: 10.00 (1 readings)",
            ]
        );
    }
}
