use super::{Collector, ProcFs};
use crate::errors::CollectorError;
use crate::registry::{Gauge, MetricId, Registry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const CONN_STATES: usize = 12;

// slot 0 is reserved; kernel state codes are 1..=11
const STATE_NAMES: [&str; CONN_STATES] = [
    "",
    "established",
    "synSent",
    "synRecv",
    "finWait1",
    "finWait2",
    "timeWait",
    "close",
    "closeWait",
    "lastAck",
    "listen",
    "closing",
];

/// Tally connection states from one socket table. The first line is a
/// header; each record's 4th field is the state code in hexadecimal.
/// Short or malformed lines are skipped, out-of-range codes are dropped
/// with a log line.
pub(crate) fn sum_tcp_states(content: &str) -> [u64; CONN_STATES] {
    let mut census = [0u64; CONN_STATES];
    for line in content.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let Some(state_field) = fields.nth(3) else {
            continue;
        };
        let Ok(state) = usize::from_str_radix(state_field, 16) else {
            continue;
        };
        if state < CONN_STATES {
            census[state] += 1;
        } else {
            info!(state, line, "ignoring connection state");
        }
    }
    census
}

struct StateGauges {
    gauges: Vec<Arc<Gauge>>,
}

impl StateGauges {
    fn new(registry: &dyn Registry, proto: &str) -> Self {
        let gauges = (1..CONN_STATES)
            .map(|state| {
                registry.gauge(
                    MetricId::new("net.tcp.connectionStates")
                        .tag("id", STATE_NAMES[state])
                        .tag("proto", proto),
                )
            })
            .collect();
        Self { gauges }
    }

    fn publish(&self, census: &[u64; CONN_STATES]) {
        for (slot, gauge) in self.gauges.iter().enumerate() {
            gauge.set(census[slot + 1] as f64);
        }
    }
}

/// Census of TCP connection states, run independently for the IPv4 and IPv6
/// socket tables and published with a `proto` tag.
pub struct TcpStateCollector {
    proc: ProcFs,
    v4: StateGauges,
    v6: StateGauges,
}

impl TcpStateCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            v4: StateGauges::new(registry.as_ref(), "v4"),
            v6: StateGauges::new(registry.as_ref(), "v6"),
        }
    }
}

#[async_trait]
impl Collector for TcpStateCollector {
    fn name(&self) -> &'static str {
        "tcp-states"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(content) = self.proc.read("net/tcp").await? {
            self.v4.publish(&sum_tcp_states(&content));
        }
        if let Some(content) = self.proc.read("net/tcp6").await? {
            self.v6.publish(&sum_tcp_states(&content));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;

    const SAMPLE_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 ffff8880 100 0 0 10 0
   1: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000   108        0 23456 1 ffff8881 100 0 0 10 0
   2: AC100A02:0016 AC100A01:D2E4 01 00000000:00000000 02:000A7214 00000000     0        0 34567 4 ffff8882 20 4 31 10 -1
   3: AC100A02:B9F0 36EF2412:01BB 06 00000000:00000000 03:00000C12 00000000     0        0 0 3 ffff8883";

    #[test]
    fn test_census_counts_states() {
        let census = sum_tcp_states(SAMPLE_TCP);
        assert_eq!(census[0x0A], 2); // listen
        assert_eq!(census[0x01], 1); // established
        assert_eq!(census[0x06], 1); // timeWait
        assert_eq!(census[0x02], 0);
    }

    #[test]
    fn test_census_skips_short_and_bad_lines() {
        let content = "\
header
   0: tooshort
   1: 00000000:0016 00000000:0000 ZZ junk
   2: 00000000:0016 00000000:0000 0B extra fields here";
        let census = sum_tcp_states(content);
        assert_eq!(census.iter().sum::<u64>(), 1);
        assert_eq!(census[0x0B], 1); // closing
    }

    #[test]
    fn test_census_drops_out_of_range_state() {
        let content = "\
header
   0: 00000000:0016 00000000:0000 1F rest";
        let census = sum_tcp_states(content);
        assert_eq!(census.iter().sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn test_collector_publishes_both_protocols() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("net")).await.unwrap();
        tokio::fs::write(dir.path().join("net/tcp"), SAMPLE_TCP)
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("net/tcp6"),
            "\
header
   0: 00000000000000000000000000000000:0016 00000000000000000000000000000000:0000 0A more",
        )
        .await
        .unwrap();

        let registry = Arc::new(LocalRegistry::new());
        let mut collector = TcpStateCollector::new(ProcFs::new(dir.path()), registry.clone());
        collector.collect().await.unwrap();

        let gauge = |id: &str, proto: &str| {
            registry
                .gauge(
                    MetricId::new("net.tcp.connectionStates")
                        .tag("id", id)
                        .tag("proto", proto),
                )
                .value()
        };
        assert_eq!(gauge("listen", "v4"), Some(2.0));
        assert_eq!(gauge("established", "v4"), Some(1.0));
        assert_eq!(gauge("synSent", "v4"), Some(0.0));
        assert_eq!(gauge("listen", "v6"), Some(1.0));
        assert_eq!(gauge("established", "v6"), Some(0.0));
    }
}
