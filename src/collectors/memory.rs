use super::{Collector, ProcFs};
use crate::errors::CollectorError;
use crate::registry::{Gauge, MetricId, Registry};
use async_trait::async_trait;
use std::sync::Arc;

/// Memory gauges from the meminfo file.
///
/// Values in the source are kilobytes; every gauge is published in bytes.
/// `mem.totalFree` sums the MemFree and SwapFree kilobyte values first and
/// converts once at the end, so it lands in the same unit as the others.
pub struct MemoryCollector {
    proc: ProcFs,
    total_real: Arc<Gauge>,
    free_real: Arc<Gauge>,
    avail_real: Arc<Gauge>,
    avail_swap: Arc<Gauge>,
    total_swap: Arc<Gauge>,
    buffers: Arc<Gauge>,
    cached: Arc<Gauge>,
    shared: Arc<Gauge>,
    total_free: Arc<Gauge>,
}

impl MemoryCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        let gauge = |name: &str| registry.gauge(MetricId::new(name));
        Self {
            proc,
            total_real: gauge("mem.totalReal"),
            free_real: gauge("mem.freeReal"),
            avail_real: gauge("mem.availReal"),
            avail_swap: gauge("mem.availSwap"),
            total_swap: gauge("mem.totalSwap"),
            buffers: gauge("mem.buffer"),
            cached: gauge("mem.cached"),
            shared: gauge("mem.shared"),
            total_free: gauge("mem.totalFree"),
        }
    }
}

fn to_bytes(kb: u64) -> f64 {
    (kb * 1024) as f64
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("meminfo").await? else {
            return Ok(());
        };

        let mut total_free_kb: u64 = 0;
        for line in content.lines() {
            let Some((label, rest)) = line.split_once(':') else {
                continue;
            };
            let Some(kb) = rest
                .split_whitespace()
                .next()
                .and_then(|t| t.parse::<u64>().ok())
            else {
                continue;
            };
            match label {
                "MemTotal" => self.total_real.set(to_bytes(kb)),
                "MemFree" => {
                    self.free_real.set(to_bytes(kb));
                    total_free_kb += kb;
                }
                "MemAvailable" => self.avail_real.set(to_bytes(kb)),
                "SwapFree" => {
                    self.avail_swap.set(to_bytes(kb));
                    total_free_kb += kb;
                }
                "SwapTotal" => self.total_swap.set(to_bytes(kb)),
                "Buffers" => self.buffers.set(to_bytes(kb)),
                "Cached" => self.cached.set(to_bytes(kb)),
                "Shmem" => self.shared.set(to_bytes(kb)),
                _ => {}
            }
        }
        self.total_free.set(to_bytes(total_free_kb));
        Ok(())
    }
}
