use super::{Collector, ProcFs};
use crate::errors::CollectorError;
use crate::registry::{Gauge, MetricId, MonotonicCounter, Registry};
use async_trait::async_trait;
use nix::unistd::{sysconf, SysconfVar};
use std::sync::Arc;

const SIDE_FIELDS: usize = 8;

/// One side (receive or transmit) of an interface record: up to eight
/// numeric fields scanned in order, stopping at the first non-numeric token
/// without consuming it.
struct SideScan {
    values: [i64; SIDE_FIELDS],
    assigned: usize,
}

fn scan_side(tokens: &[&str]) -> SideScan {
    let mut scan = SideScan {
        values: [0; SIDE_FIELDS],
        assigned: 0,
    };
    for token in tokens.iter().take(SIDE_FIELDS) {
        let Ok(parsed) = token.parse::<i64>() else {
            break;
        };
        scan.values[scan.assigned] = parsed;
        scan.assigned += 1;
    }
    scan
}

/// Per-interface counters from the net/dev file.
///
/// The two header lines are discarded; each remaining line carries the
/// interface name (trailing colon stripped for the tag) followed by eight
/// receive fields and eight transmit fields. Each side is published
/// independently, so a line with valid RX but truncated TX still reports RX.
pub struct NetDevCollector {
    proc: ProcFs,
    registry: Arc<dyn Registry>,
}

impl NetDevCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self { proc, registry }
    }

    fn counter(&self, name: &str, iface: &str, direction: Option<&str>) -> Arc<MonotonicCounter> {
        let mut id = MetricId::new(name).tag("iface", iface);
        if let Some(direction) = direction {
            id = id.tag("id", direction);
        }
        self.registry.monotonic_counter(id)
    }

    fn handle_line(&self, line: &str) {
        let mut tokens = line.split_whitespace();
        let Some(label) = tokens.next() else {
            return;
        };
        let iface = label.trim_end_matches(':');
        let fields: Vec<&str> = tokens.collect();

        let rx = scan_side(&fields);
        if rx.assigned > 0 {
            let [bytes, packets, errs, dropped, fifo, frame, _compressed, _multicast] = rx.values;
            self.counter("net.iface.bytes", iface, Some("in")).set(bytes);
            self.counter("net.iface.packets", iface, Some("in")).set(packets);
            self.counter("net.iface.errors", iface, Some("in"))
                .set(errs + fifo + frame);
            self.counter("net.iface.droppedPackets", iface, Some("in"))
                .set(dropped);
        }

        let tx = scan_side(&fields[rx.assigned..]);
        if tx.assigned > 0 {
            let [bytes, packets, errs, dropped, fifo, colls, _carrier, _compressed] = tx.values;
            self.counter("net.iface.bytes", iface, Some("out")).set(bytes);
            self.counter("net.iface.packets", iface, Some("out")).set(packets);
            self.counter("net.iface.errors", iface, Some("out"))
                .set(errs + fifo);
            self.counter("net.iface.droppedPackets", iface, Some("out"))
                .set(dropped);
            self.counter("net.iface.collisions", iface, None).set(colls);
        }
    }
}

#[async_trait]
impl Collector for NetDevCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("net/dev").await? else {
            return Ok(());
        };
        for line in content.lines().skip(2) {
            self.handle_line(line);
        }
        Ok(())
    }
}

/// ARP cache size: the count of data lines that start with a digit,
/// i.e. entries with an IPv4-looking address.
pub struct ArpCacheCollector {
    proc: ProcFs,
    cache_size: Arc<Gauge>,
}

impl ArpCacheCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            cache_size: registry.gauge(MetricId::new("net.arpCacheSize")),
        }
    }
}

#[async_trait]
impl Collector for ArpCacheCollector {
    fn name(&self) -> &'static str {
        "arp"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("net/arp").await? else {
            return Ok(());
        };
        let entries = content
            .lines()
            .skip(1)
            .filter(|line| line.as_bytes().first().is_some_and(u8::is_ascii_digit))
            .count();
        self.cache_size.set(entries as f64);
        Ok(())
    }
}

/// Kernel TCP buffer memory from the sockstat file: the page count after the
/// `mem` token on the `TCP:` line, converted to bytes with the system page
/// size.
pub struct SockstatCollector {
    proc: ProcFs,
    tcp_memory: Arc<Gauge>,
    page_size: i64,
}

impl SockstatCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            tcp_memory: registry.gauge(MetricId::new("net.tcp.memory")),
            page_size: page_size(),
        }
    }
}

fn page_size() -> i64 {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(i64::from)
        .unwrap_or(4096)
}

#[async_trait]
impl Collector for SockstatCollector {
    fn name(&self) -> &'static str {
        "sockstat"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("net/sockstat").await? else {
            return Ok(());
        };
        for line in content.lines() {
            if !line.starts_with("TCP:") {
                continue;
            }
            let mut tokens = line.split_whitespace();
            while let Some(token) = tokens.next() {
                if token == "mem" {
                    if let Some(pages) = tokens.next().and_then(|t| t.parse::<i64>().ok()) {
                        self.tcp_memory.set((pages * self.page_size) as f64);
                    }
                    break;
                }
            }
            break;
        }
        Ok(())
    }
}
