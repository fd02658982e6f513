use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use hdrhistogram::Histogram;
use tokio::time::Instant;

use crate::metric::{Event, MetricKind};

/// The `Aggregate` trait defines how raw event values are folded into a compact,
/// mergeable representation that keeps enough information for later analysis.
///
/// **Important:** aggregates do **not** produce final statistics for display. Those
/// belong to the [`crate::report`] stage, which reads a [`MetricSnapshot`] and derives
/// rates, averages and percentiles from it. Aggregates store counts, sums and
/// histograms so the report can compute accurate summaries without raw samples.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: the [`Aggregator`] merges
///   its shards in arbitrary order when it takes a snapshot.
/// - `consume` sits on the hot path of every session and should not allocate.
pub trait Aggregate: Send + Sync + Clone {
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Incorporate a single value into the aggregate.
    fn consume(&mut self, value: f64);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: &Self);
}

/// Running total of a counter metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterAggregate {
    pub total: u64,
}

impl Aggregate for CounterAggregate {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        // counters never go backwards
        if value.is_finite() && value > 0.0 {
            self.total = self.total.saturating_add(value.round() as u64);
        }
    }

    fn merge(&mut self, other: &Self) {
        self.total = self.total.saturating_add(other.total);
    }
}

/// Significant figures kept by trend histograms (0.1% relative error).
const SIGFIG: u8 = 3;
/// Trend values are stored in thousandths so sub-millisecond samples keep precision.
const SCALE: f64 = 1_000.0;

/// Streaming summary of a trend metric.
///
/// Exact count, sum and extremes are kept next to an auto-resizing HDR histogram
/// that answers quantile queries within [`SIGFIG`] significant figures.
#[derive(Debug, Clone)]
pub struct TrendAggregate {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Aggregate for TrendAggregate {
    fn new() -> Self {
        Self {
            histogram: Histogram::new(SIGFIG).expect("3 significant figures is a valid precision"),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn consume(&mut self, value: f64) {
        // a histogram cannot hold negative or non-finite samples
        if !value.is_finite() || value < 0.0 {
            tracing::trace!("Dropping unrepresentable trend sample {value}");
            return;
        }
        self.histogram.saturating_record((value * SCALE).round() as u64);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Failed to merge trend histograms: {e}");
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

impl TrendAggregate {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Value at percentile `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(q) as f64 / SCALE;
        // histogram buckets round up; never report outside the observed range
        Some(raw.clamp(self.min, self.max))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }
}

/// One named metric series.
#[derive(Debug, Clone)]
pub enum Series {
    Counter(CounterAggregate),
    Trend(TrendAggregate),
}

impl Series {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterAggregate::new()),
            MetricKind::Trend => Self::Trend(TrendAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    fn consume(&mut self, value: f64) {
        match self {
            Self::Counter(c) => c.consume(value),
            Self::Trend(t) => t.consume(value),
        }
    }

    fn merge(&mut self, other: &Self) {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => a.merge(b),
            (Self::Trend(a), Self::Trend(b)) => a.merge(b),
            // mismatched kinds are filtered out by the snapshot before merging
            _ => {}
        }
    }
}

type Shard = HashMap<Cow<'static, str>, Series>;

/// Concurrent-safe accumulator for every metric of a run.
///
/// Writes are spread round-robin over independent shards, each behind its own
/// mutex, so thousands of sessions recording at once only contend on a fraction of
/// the structure. [`Aggregator::snapshot`] locks every shard before reading any of
/// them: a snapshot never observes a half-applied event.
pub struct Aggregator {
    shards: Box<[Mutex<Shard>]>,
    next: AtomicUsize,
    started: Instant,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Four shards per CPU.
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get() * 4)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::new()))
            .collect();
        Self {
            shards,
            next: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Fold one event into its series.
    ///
    /// An event whose kind disagrees with an existing series of the same name is
    /// dropped, here when both land in one shard, otherwise by [`Aggregator::snapshot`].
    pub fn record(&self, event: Event) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let mut shard = lock(&self.shards[idx]);
        let series = shard
            .entry(event.name.clone())
            .or_insert_with(|| Series::new(event.kind));
        if series.kind() != event.kind {
            tracing::warn!(
                "Metric {} recorded as {:?} but registered as {:?}; dropping",
                event.name,
                event.kind,
                series.kind()
            );
            return;
        }
        series.consume(event.value);
    }

    /// Time since the aggregator was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Consistent point-in-time view of every series.
    pub fn snapshot(&self) -> MetricSnapshot {
        let guards: Vec<MutexGuard<'_, Shard>> = self.shards.iter().map(lock).collect();
        let elapsed = self.started.elapsed();

        let mut metrics: BTreeMap<String, Series> = BTreeMap::new();
        for shard in &guards {
            for (name, series) in shard.iter() {
                match metrics.get_mut(name.as_ref()) {
                    // shards register kinds independently; the first shard wins
                    Some(merged) if merged.kind() != series.kind() => {
                        tracing::warn!(
                            "Metric {name} recorded as {:?} but registered as {:?}; dropping",
                            series.kind(),
                            merged.kind()
                        );
                    }
                    Some(merged) => merged.merge(series),
                    None => {
                        metrics.insert(name.to_string(), series.clone());
                    }
                }
            }
        }
        drop(guards);

        MetricSnapshot { elapsed, metrics }
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    // a panicking writer leaves the shard consistent: every update is a single fold
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Immutable view of all metrics at one instant.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    elapsed: Duration,
    metrics: BTreeMap<String, Series>,
}

impl MetricSnapshot {
    /// Run time covered by this snapshot.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn get(&self, name: &str) -> Option<&Series> {
        self.metrics.get(name)
    }

    /// Counter total; a counter that was never incremented reads as zero.
    pub fn counter(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(Series::Counter(c)) => c.total,
            _ => 0,
        }
    }

    pub fn trend(&self, name: &str) -> Option<&TrendAggregate> {
        match self.metrics.get(name) {
            Some(Series::Trend(t)) => Some(t),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Series)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metric::names;

    mod counter {
        use super::*;

        #[test]
        fn accumulates_by_addition() {
            let agg = Aggregator::with_shards(4);
            for _ in 0..10 {
                agg.record(Event::counter(names::CHAT_MSGS_SENT, 3));
            }
            assert_eq!(agg.snapshot().counter(names::CHAT_MSGS_SENT), 30);
        }

        #[test]
        fn never_decreases() {
            let mut c = CounterAggregate::new();
            c.consume(5.0);
            c.consume(-3.0);
            c.consume(f64::NAN);
            assert_eq!(c.total, 5);
        }

        #[test]
        fn missing_counter_reads_zero() {
            let agg = Aggregator::with_shards(1);
            assert_eq!(agg.snapshot().counter(names::WS_ERRORS), 0);
        }
    }

    mod trend {
        use super::*;

        #[test]
        fn summary_statistics() {
            let mut t = TrendAggregate::new();
            for v in 1..=100 {
                t.consume(v as f64);
            }
            assert_eq!(t.count(), 100);
            assert_eq!(t.min(), Some(1.0));
            assert_eq!(t.max(), Some(100.0));
            assert_eq!(t.avg(), Some(50.5));
            let p95 = t.percentile(95.0).unwrap();
            assert!((94.0..=96.0).contains(&p95), "p95 was {p95}");
            let med = t.median().unwrap();
            assert!((49.0..=51.0).contains(&med), "median was {med}");
        }

        #[test]
        fn empty_trend_has_no_statistics() {
            let t = TrendAggregate::new();
            assert!(t.is_empty());
            assert_eq!(t.avg(), None);
            assert_eq!(t.percentile(95.0), None);
        }

        #[test]
        fn drops_negative_samples() {
            let mut t = TrendAggregate::new();
            t.consume(-1.0);
            t.consume(f64::INFINITY);
            assert!(t.is_empty());
        }

        #[test]
        fn merge_is_order_independent() {
            let mut a = TrendAggregate::new();
            let mut b = TrendAggregate::new();
            (1..=50).for_each(|v| a.consume(v as f64));
            (51..=100).for_each(|v| b.consume(v as f64));

            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);

            assert_eq!(ab.count(), ba.count());
            assert_eq!(ab.min(), ba.min());
            assert_eq!(ab.max(), ba.max());
            assert_eq!(ab.percentile(99.0), ba.percentile(99.0));
        }
    }

    #[test]
    fn kind_mismatch_is_dropped() {
        let agg = Aggregator::with_shards(1);
        agg.record(Event::counter("x", 1));
        agg.record(Event::trend("x", 10.0));
        let snap = agg.snapshot();
        assert_eq!(snap.counter("x"), 1);
        assert!(snap.trend("x").is_none());
    }

    #[test]
    fn kind_mismatch_across_shards_keeps_the_first_kind() {
        let agg = Aggregator::with_shards(2);
        // round robin: the counter lands in shard 0, the trend in shard 1
        agg.record(Event::counter("x", 5));
        agg.record(Event::trend("x", 10.0));
        agg.record(Event::counter("x", 2));
        let snap = agg.snapshot();
        assert_eq!(snap.get("x").map(Series::kind), Some(MetricKind::Counter));
        assert_eq!(snap.counter("x"), 7);
        assert!(snap.trend("x").is_none());
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn snapshot_is_immutable_after_later_writes() {
        let agg = Aggregator::with_shards(2);
        agg.record(Event::counter(names::WS_CONNECTS, 1));
        let snap = agg.snapshot();
        agg.record(Event::counter(names::WS_CONNECTS, 1));
        assert_eq!(snap.counter(names::WS_CONNECTS), 1);
        assert_eq!(agg.snapshot().counter(names::WS_CONNECTS), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let agg = Arc::new(Aggregator::with_shards(8));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let agg = agg.clone();
                tokio::spawn(async move {
                    for i in 0..1_000 {
                        agg.record(Event::counter(names::CHAT_MSGS_RECEIVED, 1));
                        agg.record(Event::trend(names::MSG_DELIVERY_LATENCY, i as f64));
                    }
                })
            })
            .collect();
        for h in futures::future::join_all(handles).await {
            h.unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.counter(names::CHAT_MSGS_RECEIVED), 64_000);
        assert_eq!(
            snap.trend(names::MSG_DELIVERY_LATENCY).unwrap().count(),
            64_000
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_taken_under_load_are_consistent() {
        // successive snapshots of a monotonic counter never go backwards
        let agg = Arc::new(Aggregator::with_shards(8));
        let writer = {
            let agg = agg.clone();
            tokio::spawn(async move {
                for _ in 0..20_000 {
                    agg.record(Event::counter(names::WS_CONNECTS, 1));
                }
            })
        };
        let mut last = 0;
        for _ in 0..200 {
            let now = agg.snapshot().counter(names::WS_CONNECTS);
            assert!(now >= last);
            last = now;
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(agg.snapshot().counter(names::WS_CONNECTS), 20_000);
    }
}
