use super::{Collector, ProcFs};
use crate::errors::CollectorError;
use crate::registry::{DistributionSummary, Gauge, MaxGauge, MetricId, Registry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const STAT_FIELDS: usize = 10;

/// Raw CPU tick counts from one `cpu` line of the stat file.
///
/// Kernels without steal/guest accounting report only 7 fields; anything
/// from 7 to 10 parses. Fewer than 7 yields an invalid sample (NaN total)
/// that never contributes to a rate.
#[derive(Debug, Clone, Copy)]
pub struct StatSample {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
    total: f64,
}

/// Percent of total ticks spent in each bucket between two samples of the
/// same source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateResult {
    pub user: f64,
    pub system: f64,
    pub stolen: f64,
    pub nice: f64,
    pub wait: f64,
    pub interrupt: f64,
}

impl RateResult {
    /// Overall utilization: the sum of all six buckets.
    pub fn total(&self) -> f64 {
        self.user + self.system + self.stolen + self.nice + self.wait + self.interrupt
    }
}

impl StatSample {
    /// Parse the numeric fields following the `cpuN` label.
    pub fn parse(fields: &str) -> Self {
        let mut values = [0u64; STAT_FIELDS];
        let mut assigned = 0;
        for token in fields.split_whitespace().take(STAT_FIELDS) {
            match token.parse::<u64>() {
                Ok(v) => {
                    values[assigned] = v;
                    assigned += 1;
                }
                Err(_) => break,
            }
        }
        if assigned < 7 {
            debug!(line = fields, assigned, "short cpu stat line");
            return Self::invalid();
        }

        let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] = values;
        let mut total = (user + nice + system + idle + iowait + irq + softirq) as f64;
        let steal = if assigned > 7 {
            total += (steal + guest + guest_nice) as f64;
            steal
        } else {
            0
        };
        Self {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
            total,
        }
    }

    fn invalid() -> Self {
        Self {
            user: 0,
            nice: 0,
            system: 0,
            idle: 0,
            iowait: 0,
            irq: 0,
            softirq: 0,
            steal: 0,
            total: f64::NAN,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.total.is_nan()
    }

    /// Rates between this sample and an earlier one of the same source.
    /// If the total did not advance, every percentage is 0. Field deltas
    /// saturate at 0 so a counter reset cannot produce a negative rate.
    pub fn rates(&self, prev: &StatSample) -> RateResult {
        let delta_total = self.total - prev.total;
        if !(delta_total > 0.0) {
            return RateResult::default();
        }
        let pct = |delta: u64| 100.0 * delta as f64 / delta_total;
        RateResult {
            user: pct(self.user.saturating_sub(prev.user)),
            system: pct(self.system.saturating_sub(prev.system)),
            stolen: pct(self.steal.saturating_sub(prev.steal)),
            nice: pct(self.nice.saturating_sub(prev.nice)),
            wait: pct(self.iowait.saturating_sub(prev.iowait)),
            interrupt: pct((self.irq + self.softirq).saturating_sub(prev.irq + prev.softirq)),
        }
    }
}

struct UtilizationGauges {
    user: Arc<Gauge>,
    system: Arc<Gauge>,
    stolen: Arc<Gauge>,
    nice: Arc<Gauge>,
    wait: Arc<Gauge>,
    interrupt: Arc<Gauge>,
}

impl UtilizationGauges {
    fn new(registry: &dyn Registry, name: &str) -> Self {
        let gauge = |id: &str| registry.gauge(MetricId::new(name).tag("id", id));
        Self {
            user: gauge("user"),
            system: gauge("system"),
            stolen: gauge("stolen"),
            nice: gauge("nice"),
            wait: gauge("wait"),
            interrupt: gauge("interrupt"),
        }
    }

    fn update(&self, rates: &RateResult) {
        self.user.set(rates.user);
        self.system.set(rates.system);
        self.stolen.set(rates.stolen);
        self.nice.set(rates.nice);
        self.wait.set(rates.wait);
        self.interrupt.set(rates.interrupt);
    }
}

struct PeakGauges {
    user: Arc<MaxGauge>,
    system: Arc<MaxGauge>,
    stolen: Arc<MaxGauge>,
    nice: Arc<MaxGauge>,
    wait: Arc<MaxGauge>,
    interrupt: Arc<MaxGauge>,
}

impl PeakGauges {
    fn new(registry: &dyn Registry, name: &str) -> Self {
        let gauge = |id: &str| registry.max_gauge(MetricId::new(name).tag("id", id));
        Self {
            user: gauge("user"),
            system: gauge("system"),
            stolen: gauge("stolen"),
            nice: gauge("nice"),
            wait: gauge("wait"),
            interrupt: gauge("interrupt"),
        }
    }

    fn update(&self, rates: &RateResult) {
        self.user.set(rates.user);
        self.system.set(rates.system);
        self.stolen.set(rates.stolen);
        self.nice.set(rates.nice);
        self.wait.set(rates.wait);
        self.interrupt.set(rates.interrupt);
    }
}

/// Aggregate and per-core CPU utilization from the stat file.
///
/// The aggregate line feeds six `sys.cpu.utilization` gauges; each core's
/// overall utilization feeds the `sys.cpu.coreUtilization` distribution
/// summary, capturing the shape of core-level load imbalance without six
/// metrics per core.
pub struct CpuCollector {
    proc: ProcFs,
    utilization: UtilizationGauges,
    num_processors: Arc<Gauge>,
    core_utilization: Arc<DistributionSummary>,
    prev: Option<StatSample>,
    prev_per_core: HashMap<u32, StatSample>,
}

impl CpuCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            utilization: UtilizationGauges::new(registry.as_ref(), "sys.cpu.utilization"),
            num_processors: registry.gauge(MetricId::new("sys.cpu.numProcessors")),
            core_utilization: registry
                .distribution_summary(MetricId::new("sys.cpu.coreUtilization")),
            prev: None,
            prev_per_core: HashMap::new(),
        }
    }
}

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("stat").await? else {
            return Ok(());
        };
        let mut lines = content.lines();
        let Some(first) = lines.next() else {
            return Ok(());
        };
        let Some(fields) = first.strip_prefix("cpu ") else {
            return Ok(());
        };

        let current = StatSample::parse(fields);
        if current.is_valid() {
            if let Some(prev) = self.prev.filter(StatSample::is_valid) {
                self.utilization.update(&current.rates(&prev));
            }
        }
        self.prev = Some(current);

        let mut cores = 0u32;
        for line in lines {
            if !line.starts_with("cpu") {
                break;
            }
            cores += 1;
            let Some((label, fields)) = line.split_once(' ') else {
                continue;
            };
            let Ok(core) = label[3..].parse::<u32>() else {
                continue;
            };
            let sample = StatSample::parse(fields);
            if sample.is_valid() {
                // a hot-plugged core has no previous sample and emits no
                // rate until its second observation
                if let Some(prev) = self.prev_per_core.get(&core).filter(|p| p.is_valid()) {
                    self.core_utilization.record(sample.rates(prev).total());
                }
            }
            self.prev_per_core.insert(core, sample);
        }
        self.num_processors.set(f64::from(cores));
        Ok(())
    }
}

/// Peak CPU utilization, fed from the same formula as [`CpuCollector`] but
/// with its own previous sample. The max-reducing aggregation is entirely
/// registry-side; this collector sets the max gauges every poll.
pub struct PeakCpuCollector {
    proc: ProcFs,
    peak: PeakGauges,
    prev: Option<StatSample>,
}

impl PeakCpuCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            peak: PeakGauges::new(registry.as_ref(), "sys.cpu.peakUtilization"),
            prev: None,
        }
    }
}

#[async_trait]
impl Collector for PeakCpuCollector {
    fn name(&self) -> &'static str {
        "cpu-peak"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("stat").await? else {
            return Ok(());
        };
        let Some(fields) = content.lines().next().and_then(|l| l.strip_prefix("cpu ")) else {
            return Ok(());
        };

        let current = StatSample::parse(fields);
        if current.is_valid() {
            if let Some(prev) = self.prev.filter(StatSample::is_valid) {
                self.peak.update(&current.rates(&prev));
            }
        }
        self.prev = Some(current);
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Unit tests — validate on hardcoded information
// ─────────────────────────────────────────────
