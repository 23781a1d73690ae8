use super::{parse_kv_bag, set_if_present, Collector, ProcFs};
use crate::errors::CollectorError;
use crate::registry::{Gauge, MetricId, MonotonicCounter, Registry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

// Historical field counts of the snmp file rows. The layout is positional,
// so the scan caps at the expected count; only the two trailing Tcp fields
// are optional.
const IP_FIELDS: usize = 19;
const TCP_FIELDS: usize = 14;
const UDP_FIELDS: usize = 4;

/// Parse the numeric row following a protocol prefix, e.g.
/// `Tcp: 1 200 120000 -1 ...`. Stops at the first non-numeric token.
fn scan_row(line: &str, expected: usize) -> Vec<i64> {
    line.split_whitespace()
        .skip(1)
        .map_while(|token| token.parse::<i64>().ok())
        .take(expected)
        .collect()
}

struct IpCounters {
    in_datagrams: Arc<MonotonicCounter>,
    in_discards: Arc<MonotonicCounter>,
    out_datagrams: Arc<MonotonicCounter>,
    out_discards: Arc<MonotonicCounter>,
    reasm_reqds: Arc<MonotonicCounter>,
}

impl IpCounters {
    fn new(registry: &dyn Registry, proto: &str) -> Self {
        let counter = |name: &str, direction: Option<&str>| {
            let mut id = MetricId::new(name).tag("proto", proto);
            if let Some(direction) = direction {
                id = id.tag("id", direction);
            }
            registry.monotonic_counter(id)
        };
        Self {
            in_datagrams: counter("net.ip.datagrams", Some("in")),
            in_discards: counter("net.ip.discards", Some("in")),
            out_datagrams: counter("net.ip.datagrams", Some("out")),
            out_discards: counter("net.ip.discards", Some("out")),
            reasm_reqds: counter("net.ip.reasmReqds", None),
        }
    }
}

struct TcpCounters {
    in_segs: Arc<MonotonicCounter>,
    out_segs: Arc<MonotonicCounter>,
    retrans_segs: Arc<MonotonicCounter>,
    in_errs: Arc<MonotonicCounter>,
    out_rsts: Arc<MonotonicCounter>,
    attempt_fails: Arc<MonotonicCounter>,
    estab_resets: Arc<MonotonicCounter>,
    active_opens: Arc<MonotonicCounter>,
    passive_opens: Arc<MonotonicCounter>,
    curr_estab: Arc<Gauge>,
}

impl TcpCounters {
    fn new(registry: &dyn Registry) -> Self {
        let error = |id: &str| {
            registry.monotonic_counter(MetricId::new("net.tcp.errors").tag("id", id))
        };
        Self {
            in_segs: registry.monotonic_counter(MetricId::new("net.tcp.segments").tag("id", "in")),
            out_segs: registry
                .monotonic_counter(MetricId::new("net.tcp.segments").tag("id", "out")),
            retrans_segs: error("retransSegs"),
            in_errs: error("inErrs"),
            out_rsts: error("outRsts"),
            attempt_fails: error("attemptFails"),
            estab_resets: error("estabResets"),
            active_opens: registry
                .monotonic_counter(MetricId::new("net.tcp.opens").tag("id", "active")),
            passive_opens: registry
                .monotonic_counter(MetricId::new("net.tcp.opens").tag("id", "passive")),
            curr_estab: registry.gauge(MetricId::new("net.tcp.currEstab")),
        }
    }
}

struct UdpCounters {
    in_datagrams: Arc<MonotonicCounter>,
    out_datagrams: Arc<MonotonicCounter>,
    in_errors: Arc<MonotonicCounter>,
}

impl UdpCounters {
    fn new(registry: &dyn Registry, proto: &str) -> Self {
        let counter = |name: &str, id: &str| {
            registry.monotonic_counter(MetricId::new(name).tag("id", id).tag("proto", proto))
        };
        Self {
            in_datagrams: counter("net.udp.datagrams", "in"),
            out_datagrams: counter("net.udp.datagrams", "out"),
            in_errors: counter("net.udp.errors", "inErrors"),
        }
    }
}

/// ECN packet classification counters for one protocol family.
pub(crate) struct EcnCounters {
    capable: Arc<MonotonicCounter>,
    not_capable: Arc<MonotonicCounter>,
    congested: Arc<MonotonicCounter>,
}

impl EcnCounters {
    pub(crate) fn new(registry: &dyn Registry, proto: &str) -> Self {
        Self {
            capable: registry.monotonic_counter(
                MetricId::new("net.ip.ectPackets")
                    .tag("id", "capable")
                    .tag("proto", proto),
            ),
            not_capable: registry.monotonic_counter(
                MetricId::new("net.ip.ectPackets")
                    .tag("id", "notCapable")
                    .tag("proto", proto),
            ),
            congested: registry
                .monotonic_counter(MetricId::new("net.ip.congestedPackets").tag("proto", proto)),
        }
    }
}

/// SNMP counters for IPv4 (positional rows in net/snmp) and IPv6
/// (symbolic key lookups in the net/snmp6 bag).
pub struct SnmpCollector {
    proc: ProcFs,
    ip_v4: IpCounters,
    tcp: TcpCounters,
    udp_v4: UdpCounters,
    ip_v6: IpCounters,
    udp_v6: UdpCounters,
    ecn_v6: EcnCounters,
}

impl SnmpCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        let registry = registry.as_ref();
        Self {
            proc,
            ip_v4: IpCounters::new(registry, "v4"),
            tcp: TcpCounters::new(registry),
            udp_v4: UdpCounters::new(registry, "v4"),
            ip_v6: IpCounters::new(registry, "v6"),
            udp_v6: UdpCounters::new(registry, "v6"),
            ecn_v6: EcnCounters::new(registry, "v6"),
        }
    }

    fn parse_ip_row(&self, line: &str) {
        let values = scan_row(line, IP_FIELDS);
        if values.len() < 14 {
            debug!(line, "short Ip row in net/snmp");
            return;
        }
        self.ip_v4.in_datagrams.set(values[2]);
        self.ip_v4.in_discards.set(values[7]);
        self.ip_v4.out_datagrams.set(values[9]);
        self.ip_v4.out_discards.set(values[10]);
        self.ip_v4.reasm_reqds.set(values[13]);
    }

    fn parse_tcp_row(&self, line: &str) {
        let values = scan_row(line, TCP_FIELDS);
        if values.len() < 12 {
            debug!(line, "short Tcp row in net/snmp");
            return;
        }
        self.tcp.active_opens.set(values[4]);
        self.tcp.passive_opens.set(values[5]);
        self.tcp.attempt_fails.set(values[6]);
        self.tcp.estab_resets.set(values[7]);
        self.tcp.curr_estab.set(values[8] as f64);
        self.tcp.in_segs.set(values[9]);
        self.tcp.out_segs.set(values[10]);
        self.tcp.retrans_segs.set(values[11]);
        // the last two columns arrived in later kernels; publish only what
        // the scan reached
        if values.len() > 12 {
            self.tcp.in_errs.set(values[12]);
        }
        if values.len() > 13 {
            self.tcp.out_rsts.set(values[13]);
        }
    }

    fn parse_udp_row(&self, line: &str) {
        let values = scan_row(line, UDP_FIELDS);
        if values.len() < UDP_FIELDS {
            debug!(line, "short Udp row in net/snmp");
            return;
        }
        self.udp_v4.in_datagrams.set(values[0]);
        self.udp_v4.in_errors.set(values[2]);
        self.udp_v4.out_datagrams.set(values[3]);
    }

    fn publish_ip_v6(&self, bag: &HashMap<String, i64>) {
        set_if_present(bag, "Ip6InReceives", &self.ip_v6.in_datagrams);
        set_if_present(bag, "Ip6InDiscards", &self.ip_v6.in_discards);
        set_if_present(bag, "Ip6OutRequests", &self.ip_v6.out_datagrams);
        set_if_present(bag, "Ip6OutDiscards", &self.ip_v6.out_discards);
        set_if_present(bag, "Ip6ReasmReqds", &self.ip_v6.reasm_reqds);

        // both ECT codepoints count as "capable"
        let capable =
            bag.get("Ip6InECT0Pkts").copied().unwrap_or(0) + bag.get("Ip6InECT1Pkts").copied().unwrap_or(0);
        self.ecn_v6.capable.set(capable);
        set_if_present(bag, "Ip6InNoECTPkts", &self.ecn_v6.not_capable);
        set_if_present(bag, "Ip6InCEPkts", &self.ecn_v6.congested);
    }

    fn publish_udp_v6(&self, bag: &HashMap<String, i64>) {
        set_if_present(bag, "Udp6InDatagrams", &self.udp_v6.in_datagrams);
        set_if_present(bag, "Udp6InErrors", &self.udp_v6.in_errors);
        set_if_present(bag, "Udp6OutDatagrams", &self.udp_v6.out_datagrams);
    }
}

#[async_trait]
impl Collector for SnmpCollector {
    fn name(&self) -> &'static str {
        "snmp"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(content) = self.proc.read("net/snmp").await? {
            // each recognized header line is followed by its value row
            let mut lines = content.lines();
            while let Some(line) = lines.next() {
                if line.starts_with("Ip:") {
                    if let Some(row) = lines.next() {
                        self.parse_ip_row(row);
                    }
                } else if line.starts_with("Tcp:") {
                    if let Some(row) = lines.next() {
                        self.parse_tcp_row(row);
                    }
                } else if line.starts_with("Udp:") {
                    if let Some(row) = lines.next() {
                        self.parse_udp_row(row);
                    }
                }
            }
        }

        if let Some(content) = self.proc.read("net/snmp6").await? {
            let bag = parse_kv_bag(&content);
            self.publish_ip_v6(&bag);
            self.publish_udp_v6(&bag);
        }
        Ok(())
    }
}

/// Extended-netstat congestion counters for IPv4, from the IpExt
/// header/value line pair.
///
/// All three counters are withheld when no ECT or non-ECT packets were seen
/// at all, so a cycle with no data does not publish misleading zeros; when
/// there is data, congested is sent explicitly even at 0 to distinguish
/// known no-congestion from no data.
pub struct NetstatCollector {
    proc: ProcFs,
    ecn_v4: EcnCounters,
}

impl NetstatCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            ecn_v4: EcnCounters::new(registry.as_ref(), "v4"),
        }
    }
}

#[async_trait]
impl Collector for NetstatCollector {
    fn name(&self) -> &'static str {
        "netstat"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("net/netstat").await? else {
            return Ok(());
        };

        let (mut ect, mut no_ect, mut congested) = (0i64, 0i64, 0i64);
        let mut lines = content.lines();
        while let Some(line) = lines.next() {
            if !line.starts_with("IpExt:") {
                continue;
            }
            let Some(value_line) = lines.next() else {
                debug!("IpExt header without a value row in net/netstat");
                break;
            };
            let headers = line.split_whitespace().skip(1);
            let values = value_line.split_whitespace().skip(1);
            for (header, value) in headers.zip(values) {
                let Ok(value) = value.parse::<i64>() else {
                    continue;
                };
                match header {
                    "InNoECTPkts" => no_ect = value,
                    "InECT0Pkts" | "InECT1Pkts" => ect += value,
                    "InCEPkts" => congested = value,
                    _ => {}
                }
            }
            break;
        }

        if ect > 0 || no_ect > 0 {
            self.ecn_v4.congested.set(congested);
            self.ecn_v4.capable.set(ect);
            self.ecn_v4.not_capable.set(no_ect);
        }
        Ok(())
    }
}
