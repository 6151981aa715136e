//! # Running Daily Aggregator
//!
//! Keeps every value received for a `(date, source)` pair in an append-only
//! bucket and derives `count` and `mean` from the bucket whenever asked. The
//! whole map sits behind one mutex, so:
//!
//! 1.  Appends are atomic with respect to each other. Concurrent `record` calls
//!     for the same key from independent channels never lose or duplicate a value.
//! 2.  `summary_for` reads under the same lock, so it sees a state either fully
//!     before or fully after any given append.
//! 3.  The mean is recomputed from the bucket on every read; nothing cached can
//!     drift from the bucket's contents.
//!
//! Every successful `record` also broadcasts the refreshed `DailySummary` for
//! its date. That broadcast is a notification for display and export sinks;
//! having no subscribers is normal and never affects the stored state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the summary update channel. Slow sinks see `Lagged` and skip ahead.
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Count and arithmetic mean of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunningSummary {
    pub count: usize,
    pub mean: f64,
}

impl RunningSummary {
    /// `None` for an empty bucket: there is no mean of zero values.
    fn from_bucket(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            count: values.len(),
            mean: sum / values.len() as f64,
        })
    }
}

/// Summaries of every source that reported on one date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub sources: BTreeMap<String, RunningSummary>,
}

/// date -> source -> bucket
type Buckets = HashMap<String, BTreeMap<String, Vec<f64>>>;

/// # Aggregator
///
/// Owned by the running session and shared through an `Arc`.
pub struct Aggregator {
    buckets: Mutex<Buckets>,
    updates: broadcast::Sender<Arc<DailySummary>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            buckets: Mutex::new(HashMap::new()),
            updates,
        }
    }

    /// Appends `value` to the bucket of `(date, source)`, creating it on first use,
    /// and returns the refreshed summary for that key.
    pub fn record(&self, source: &str, date: &str, value: f64) -> RunningSummary {
        let (summary, daily) = {
            let mut buckets = self.lock();
            let by_source = buckets.entry(date.to_string()).or_default();
            let bucket = by_source.entry(source.to_string()).or_default();
            bucket.push(value);

            let daily = summarize(date, by_source);
            // The bucket was just appended to, so it is always summarized.
            let summary = daily
                .sources
                .get(source)
                .copied()
                .unwrap_or(RunningSummary {
                    count: 1,
                    mean: value,
                });
            (summary, daily)
        };

        log::trace!(
            "Recorded {} for {} on {} (count {}, mean {})",
            value,
            source,
            date,
            summary.count,
            summary.mean
        );

        // No receivers is fine: the sink is optional.
        let _ = self.updates.send(Arc::new(daily));
        summary
    }

    /// Count and mean of every source with at least one value on `date`.
    pub fn summary_for(&self, date: &str) -> BTreeMap<String, RunningSummary> {
        let buckets = self.lock();
        buckets
            .get(date)
            .map(|by_source| summarize(date, by_source).sources)
            .unwrap_or_default()
    }

    /// Copy of the raw bucket for `(date, source)`, in arrival order.
    pub fn bucket(&self, date: &str, source: &str) -> Option<Vec<f64>> {
        let buckets = self.lock();
        buckets.get(date).and_then(|s| s.get(source)).cloned()
    }

    /// Every date with data, ascending.
    pub fn dates(&self) -> Vec<String> {
        let buckets = self.lock();
        let mut dates: Vec<String> = buckets.keys().cloned().collect();
        dates.sort();
        dates
    }

    /// All daily summaries, dates ascending, taken under a single lock.
    pub fn snapshot(&self) -> Vec<DailySummary> {
        let buckets = self.lock();
        let mut days: Vec<DailySummary> = buckets
            .iter()
            .map(|(date, by_source)| summarize(date, by_source))
            .collect();
        days.sort_by(|a, b| a.date.cmp(&b.date));
        days
    }

    /// Receiver for the summary broadcast emitted after every `record`.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Arc<DailySummary>> {
        self.updates.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        // A panic while holding the lock cannot leave a half-written Vec push
        // behind, so the data is still usable.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn summarize(date: &str, by_source: &BTreeMap<String, Vec<f64>>) -> DailySummary {
    let sources = by_source
        .iter()
        .filter_map(|(source, values)| {
            RunningSummary::from_bucket(values).map(|s| (source.clone(), s))
        })
        .collect();
    DailySummary {
        date: date.to_string(),
        sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn mean_tracks_every_append() {
        let agg = Aggregator::new();
        assert_eq!(agg.record("shasta", "2023-01-01", 10.0).mean, 10.0);
        let summary = agg.record("shasta", "2023-01-01", 20.0);
        assert_eq!(summary.count, 2);
        assert!(approx(summary.mean, 15.0));

        let day = agg.summary_for("2023-01-01");
        assert_eq!(day["shasta"], RunningSummary { count: 2, mean: 15.0 });
    }

    #[test]
    fn sources_without_values_are_absent() {
        let agg = Aggregator::new();
        agg.record("shasta", "2023-01-01", 1.0);
        agg.record("oroville", "2023-01-02", 2.0);

        let day = agg.summary_for("2023-01-01");
        assert_eq!(day.len(), 1);
        assert!(!day.contains_key("oroville"));
        assert!(agg.summary_for("1999-12-31").is_empty());
    }

    #[test]
    fn buckets_keep_arrival_order() {
        let agg = Aggregator::new();
        for v in [3.0, 1.0, 2.0] {
            agg.record("sonoma", "2023-02-01", v);
        }
        assert_eq!(agg.bucket("2023-02-01", "sonoma"), Some(vec![3.0, 1.0, 2.0]));
    }

    #[test]
    fn snapshot_orders_dates() {
        let agg = Aggregator::new();
        agg.record("shasta", "2023-01-03", 1.0);
        agg.record("shasta", "2023-01-01", 1.0);
        agg.record("sonoma", "2023-01-02", 1.0);

        let dates: Vec<String> = agg.snapshot().into_iter().map(|d| d.date).collect();
        assert_eq!(dates, vec!["2023-01-01", "2023-01-02", "2023-01-03"]);
        assert_eq!(agg.dates(), dates);
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let agg = Arc::new(Aggregator::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    agg.record("shasta", "2023-01-01", i as f64);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut bucket = agg.bucket("2023-01-01", "shasta").unwrap();
        bucket.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(bucket, (0..16).map(|i| i as f64).collect::<Vec<_>>());
        assert!(approx(agg.summary_for("2023-01-01")["shasta"].mean, 7.5));
    }

    #[tokio::test]
    async fn updates_are_broadcast_per_record() {
        let agg = Aggregator::new();
        let mut rx = agg.subscribe_updates();

        agg.record("shasta", "2023-01-01", 10.0);
        agg.record("oroville", "2023-01-01", 30.0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sources.len(), 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.date, "2023-01-01");
        assert_eq!(second.sources["oroville"].mean, 30.0);
        assert_eq!(second.sources["shasta"].count, 1);
    }
}
