use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Tag set attached to a metric. Sorted so that identity is order-independent.
pub type Tags = BTreeMap<String, String>;

/// Metric identity: a dot-delimited hierarchical name plus a tag mapping.
/// Two ids with the same name and tags refer to the same metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricId {
    name: String,
    tags: Tags,
}

impl MetricId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }
}

/// Counter whose value is expected to only increase (or reset to 0 when the
/// underlying kernel counter restarts). Rate derivation happens downstream.
#[derive(Debug, Default)]
pub struct MonotonicCounter {
    value: AtomicI64,
    seen: AtomicBool,
}

impl MonotonicCounter {
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        self.seen.store(true, Ordering::Release);
    }

    /// Last value, or None if never set this process lifetime.
    pub fn value(&self) -> Option<i64> {
        self.seen
            .load(Ordering::Acquire)
            .then(|| self.value.load(Ordering::Relaxed))
    }
}

/// Instantaneous value, overwritten each poll. NaN bits mark "never set".
#[derive(Debug)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Default for Gauge {
    fn default() -> Self {
        Self {
            bits: AtomicU64::new(f64::NAN.to_bits()),
        }
    }
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.load(Ordering::Relaxed));
        (!value.is_nan()).then_some(value)
    }
}

/// Gauge that keeps the maximum observed value since the last snapshot.
#[derive(Debug)]
pub struct MaxGauge {
    bits: AtomicU64,
}

impl Default for MaxGauge {
    fn default() -> Self {
        Self {
            bits: AtomicU64::new(f64::NAN.to_bits()),
        }
    }
}

impl MaxGauge {
    pub fn set(&self, value: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                if current.is_nan() || value > current {
                    Some(value.to_bits())
                } else {
                    None
                }
            });
    }

    pub fn value(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.load(Ordering::Relaxed));
        (!value.is_nan()).then_some(value)
    }

    pub fn reset(&self) {
        self.bits.store(f64::NAN.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SummaryState {
    count: u64,
    total: f64,
    max: f64,
}

/// Aggregates a distribution of observed values over a snapshot interval.
#[derive(Debug, Default)]
pub struct DistributionSummary {
    state: Mutex<SummaryState>,
}

impl DistributionSummary {
    pub fn record(&self, amount: f64) {
        let mut state = self.state.lock().expect("summary mutex poisoned");
        state.count += 1;
        state.total += amount;
        if amount > state.max {
            state.max = amount;
        }
    }

    pub fn count(&self) -> u64 {
        self.state.lock().expect("summary mutex poisoned").count
    }

    pub fn total(&self) -> f64 {
        self.state.lock().expect("summary mutex poisoned").total
    }

    pub fn max(&self) -> f64 {
        self.state.lock().expect("summary mutex poisoned").max
    }

    fn drain(&self) -> SummaryState {
        let mut state = self.state.lock().expect("summary mutex poisoned");
        std::mem::take(&mut *state)
    }
}

/// Typed factory for metric handles. Repeated calls with the same id must
/// return the same handle, so collectors can look handles up once and reuse
/// them every poll.
pub trait Registry: Send + Sync {
    fn monotonic_counter(&self, id: MetricId) -> Arc<MonotonicCounter>;
    fn gauge(&self, id: MetricId) -> Arc<Gauge>;
    fn max_gauge(&self, id: MetricId) -> Arc<MaxGauge>;
    fn distribution_summary(&self, id: MetricId) -> Arc<DistributionSummary>;
}

/// One published measurement in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    #[serde(flatten)]
    pub id: MetricId,
    pub kind: &'static str,
    pub value: f64,
}

/// In-process registry backend. Serves as the agent's metric store and as the
/// test double behind the `Registry` trait.
#[derive(Default)]
pub struct LocalRegistry {
    counters: Mutex<HashMap<MetricId, Arc<MonotonicCounter>>>,
    gauges: Mutex<HashMap<MetricId, Arc<Gauge>>>,
    max_gauges: Mutex<HashMap<MetricId, Arc<MaxGauge>>>,
    summaries: Mutex<HashMap<MetricId, Arc<DistributionSummary>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect everything published so far. Max gauges and distribution
    /// summaries reset, so a snapshot acts as their flush boundary.
    pub fn snapshot(&self) -> Vec<Measurement> {
        let mut out = Vec::new();

        for (id, counter) in self.counters.lock().expect("registry mutex poisoned").iter() {
            if let Some(value) = counter.value() {
                out.push(Measurement {
                    id: id.clone(),
                    kind: "counter",
                    value: value as f64,
                });
            }
        }
        for (id, gauge) in self.gauges.lock().expect("registry mutex poisoned").iter() {
            if let Some(value) = gauge.value() {
                out.push(Measurement {
                    id: id.clone(),
                    kind: "gauge",
                    value,
                });
            }
        }
        for (id, gauge) in self
            .max_gauges
            .lock()
            .expect("registry mutex poisoned")
            .iter()
        {
            if let Some(value) = gauge.value() {
                out.push(Measurement {
                    id: id.clone(),
                    kind: "max-gauge",
                    value,
                });
                gauge.reset();
            }
        }
        for (id, summary) in self
            .summaries
            .lock()
            .expect("registry mutex poisoned")
            .iter()
        {
            let state = summary.drain();
            if state.count > 0 {
                for (statistic, value) in [
                    ("count", state.count as f64),
                    ("totalAmount", state.total),
                    ("max", state.max),
                ] {
                    out.push(Measurement {
                        id: id.clone().tag("statistic", statistic),
                        kind: "distribution-summary",
                        value,
                    });
                }
            }
        }

        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

fn lookup<T: Default>(map: &Mutex<HashMap<MetricId, Arc<T>>>, id: MetricId) -> Arc<T> {
    map.lock()
        .expect("registry mutex poisoned")
        .entry(id)
        .or_default()
        .clone()
}

impl Registry for LocalRegistry {
    fn monotonic_counter(&self, id: MetricId) -> Arc<MonotonicCounter> {
        lookup(&self.counters, id)
    }

    fn gauge(&self, id: MetricId) -> Arc<Gauge> {
        lookup(&self.gauges, id)
    }

    fn max_gauge(&self, id: MetricId) -> Arc<MaxGauge> {
        lookup(&self.max_gauges, id)
    }

    fn distribution_summary(&self, id: MetricId) -> Arc<DistributionSummary> {
        lookup(&self.summaries, id)
    }
}
