use super::{all_digits, parse_kv_bag, set_if_present, Collector, ProcFs};
use crate::errors::CollectorError;
use crate::registry::{Gauge, MetricId, MonotonicCounter, Registry};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Load averages over 1/5/15 minutes, straight into three gauges.
pub struct LoadAvgCollector {
    proc: ProcFs,
    load_1: Arc<Gauge>,
    load_5: Arc<Gauge>,
    load_15: Arc<Gauge>,
}

impl LoadAvgCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            load_1: registry.gauge(MetricId::new("sys.load.1")),
            load_5: registry.gauge(MetricId::new("sys.load.5")),
            load_15: registry.gauge(MetricId::new("sys.load.15")),
        }
    }

    /// Parse the three leading floating values of the loadavg line.
    fn parse_loadavg(content: &str) -> Result<(f64, f64, f64), CollectorError> {
        let parts: Vec<&str> = content.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(CollectorError::ParseError {
                path: "loadavg".into(),
                field: "loadavg".into(),
                raw: content.to_string(),
            });
        }

        let parse = |idx: usize, field: &str| -> Result<f64, CollectorError> {
            parts[idx]
                .parse::<f64>()
                .map_err(|_| CollectorError::ParseError {
                    path: "loadavg".into(),
                    field: field.into(),
                    raw: parts[idx].to_string(),
                })
        };

        Ok((parse(0, "1m")?, parse(1, "5m")?, parse(2, "15m")?))
    }
}

#[async_trait]
impl Collector for LoadAvgCollector {
    fn name(&self) -> &'static str {
        "loadavg"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("loadavg").await? else {
            return Ok(());
        };
        let (load_1, load_5, load_15) = Self::parse_loadavg(&content)?;
        self.load_1.set(load_1);
        self.load_5.set(load_5);
        self.load_15.set(load_15);
        Ok(())
    }
}

/// Process scheduling counters from the stat file, paging/swap counters
/// from the vmstat bag, and file-handle usage from sys/fs/file-nr.
pub struct VmStatCollector {
    proc: ProcFs,
    processes: Arc<MonotonicCounter>,
    procs_running: Arc<Gauge>,
    procs_blocked: Arc<Gauge>,
    page_in: Arc<MonotonicCounter>,
    page_out: Arc<MonotonicCounter>,
    swap_in: Arc<MonotonicCounter>,
    swap_out: Arc<MonotonicCounter>,
    fh_allocated: Arc<Gauge>,
    fh_max: Arc<Gauge>,
}

impl VmStatCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            processes: registry.monotonic_counter(MetricId::new("vmstat.procs.count")),
            procs_running: registry.gauge(MetricId::new("vmstat.procs").tag("id", "running")),
            procs_blocked: registry.gauge(MetricId::new("vmstat.procs").tag("id", "blocked")),
            page_in: registry.monotonic_counter(MetricId::new("vmstat.paging").tag("id", "in")),
            page_out: registry.monotonic_counter(MetricId::new("vmstat.paging").tag("id", "out")),
            swap_in: registry.monotonic_counter(MetricId::new("vmstat.swapping").tag("id", "in")),
            swap_out: registry.monotonic_counter(MetricId::new("vmstat.swapping").tag("id", "out")),
            fh_allocated: registry.gauge(MetricId::new("vmstat.fh.allocated")),
            fh_max: registry.gauge(MetricId::new("vmstat.fh.max")),
        }
    }
}

fn first_number(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl Collector for VmStatCollector {
    fn name(&self) -> &'static str {
        "vmstat"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(content) = self.proc.read("stat").await? {
            for line in content.lines() {
                if let Some(rest) = line.strip_prefix("processes") {
                    if let Some(n) = first_number(rest) {
                        self.processes.set(n as i64);
                    }
                } else if let Some(rest) = line.strip_prefix("procs_running") {
                    if let Some(n) = first_number(rest) {
                        self.procs_running.set(n as f64);
                    }
                } else if let Some(rest) = line.strip_prefix("procs_blocked") {
                    if let Some(n) = first_number(rest) {
                        self.procs_blocked.set(n as f64);
                    }
                }
            }
        }

        if let Some(content) = self.proc.read("vmstat").await? {
            let bag = parse_kv_bag(&content);
            set_if_present(&bag, "pgpgin", &self.page_in);
            set_if_present(&bag, "pgpgout", &self.page_out);
            set_if_present(&bag, "pswpin", &self.swap_in);
            set_if_present(&bag, "pswpout", &self.swap_out);
        }

        if let Some(content) = self.proc.read("sys/fs/file-nr").await? {
            let fields: Vec<u64> = content
                .split_whitespace()
                .map_while(|t| t.parse().ok())
                .collect();
            // allocated / used / max; only allocated and max are published
            if fields.len() == 3 {
                self.fh_allocated.set(fields[0] as f64);
                self.fh_max.set(fields[2] as f64);
            }
        }
        Ok(())
    }
}

/// System uptime in seconds. The fraction of a second is irrelevant at the
/// magnitudes this gauge reaches.
pub struct UptimeCollector {
    proc: ProcFs,
    uptime: Arc<Gauge>,
}

impl UptimeCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            uptime: registry.gauge(MetricId::new("sys.uptime")),
        }
    }
}

#[async_trait]
impl Collector for UptimeCollector {
    fn name(&self) -> &'static str {
        "uptime"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Some(content) = self.proc.read("uptime").await? else {
            return Ok(());
        };
        if let Some(seconds) = content
            .split_whitespace()
            .next()
            .and_then(|t| t.parse::<f64>().ok())
        {
            self.uptime.set(seconds);
        }
        Ok(())
    }
}

/// Count of live processes and their threads: all-digit entries of the root
/// directory are PIDs, and each PID's `task` subdirectory holds one entry
/// per thread.
pub struct ProcessCollector {
    proc: ProcFs,
    current_pids: Arc<Gauge>,
    current_threads: Arc<Gauge>,
}

impl ProcessCollector {
    pub fn new(proc: ProcFs, registry: Arc<dyn Registry>) -> Self {
        Self {
            proc,
            current_pids: registry.gauge(MetricId::new("sys.currentProcesses")),
            current_threads: registry.gauge(MetricId::new("sys.currentThreads")),
        }
    }
}

async fn count_tasks(dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        // a process that exited mid-scan counts zero threads
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_str().is_some_and(all_digits) {
            count += 1;
        }
    }
    count
}

#[async_trait]
impl Collector for ProcessCollector {
    fn name(&self) -> &'static str {
        "processes"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let Ok(mut entries) = tokio::fs::read_dir(self.proc.root()).await else {
            return Ok(());
        };
        let (mut pids, mut threads) = (0u64, 0u64);
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_str().is_some_and(all_digits) {
                pids += 1;
                threads += count_tasks(&entry.path().join("task")).await;
            }
        }
        self.current_pids.set(pids as f64);
        self.current_threads.set(threads as f64);
        Ok(())
    }
}

/// Extract the namespace PID from a scheduler-stat header line like
/// `systemd (1, #threads: 1)`: the integer right after the first `(`.
pub(crate) fn pid_from_sched_line(line: &str) -> Option<i64> {
    let (_, rest) = line.split_once('(')?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Whether the agent appears to run inside a PID namespace: the process with
/// namespace PID 1 reports a different global PID in its sched file. This is
/// a heuristic, not a guarantee.
pub async fn is_container(proc: &ProcFs) -> bool {
    match proc.read("1/sched").await {
        Ok(Some(content)) => content
            .lines()
            .next()
            .is_some_and(|line| pid_from_sched_line(line) != Some(1)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;

    #[test]
    fn test_parse_loadavg() {
        let content = "0.50 0.75 1.00 2/1234 5678";
        let (l1, l5, l15) = LoadAvgCollector::parse_loadavg(content).unwrap();
        assert!((l1 - 0.50).abs() < f64::EPSILON);
        assert!((l5 - 0.75).abs() < f64::EPSILON);
        assert!((l15 - 1.00).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_loadavg_too_short() {
        assert!(LoadAvgCollector::parse_loadavg("0.50 0.75").is_err());
    }

    #[tokio::test]
    async fn test_vmstat_sources() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("stat"),
            "\
cpu  1 2 3 4 5 6 7 0 0 0
processes 270014
procs_running 2
procs_blocked 1",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("vmstat"),
            "\
pgpgin 5001
pgpgout 6002
pswpin 7
nr_free_pages 12345",
        )
        .await
        .unwrap();
        tokio::fs::create_dir_all(dir.path().join("sys/fs"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("sys/fs/file-nr"), "2944	0	1198792\n")
            .await
            .unwrap();

        let registry = Arc::new(LocalRegistry::new());
        let mut collector = VmStatCollector::new(ProcFs::new(dir.path()), registry.clone());
        collector.collect().await.unwrap();

        assert_eq!(
            registry
                .monotonic_counter(MetricId::new("vmstat.procs.count"))
                .value(),
            Some(270014)
        );
        assert_eq!(
            registry
                .gauge(MetricId::new("vmstat.procs").tag("id", "running"))
                .value(),
            Some(2.0)
        );
        assert_eq!(
            registry
                .monotonic_counter(MetricId::new("vmstat.paging").tag("id", "in"))
                .value(),
            Some(5001)
        );
        // pswpout absent from the bag: stays unset
        assert_eq!(
            registry
                .monotonic_counter(MetricId::new("vmstat.swapping").tag("id", "out"))
                .value(),
            None
        );
        assert_eq!(
            registry.gauge(MetricId::new("vmstat.fh.allocated")).value(),
            Some(2944.0)
        );
        assert_eq!(
            registry.gauge(MetricId::new("vmstat.fh.max")).value(),
            Some(1198792.0)
        );
    }

    #[tokio::test]
    async fn test_uptime_first_value() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("uptime"), "123456.78 654321.00\n")
            .await
            .unwrap();
        let registry = Arc::new(LocalRegistry::new());
        let mut collector = UptimeCollector::new(ProcFs::new(dir.path()), registry.clone());
        collector.collect().await.unwrap();
        assert_eq!(
            registry.gauge(MetricId::new("sys.uptime")).value(),
            Some(123456.78)
        );
    }

    #[tokio::test]
    async fn test_process_census() {
        let dir = tempfile::tempdir().unwrap();
        for (pid, tasks) in [("1", 2), ("42", 3)] {
            let task_dir = dir.path().join(pid).join("task");
            tokio::fs::create_dir_all(&task_dir).await.unwrap();
            for task in 0..tasks {
                tokio::fs::create_dir(task_dir.join(format!("{}", 100 + task)))
                    .await
                    .unwrap();
            }
        }
        // non-PID entries are ignored
        tokio::fs::create_dir(dir.path().join("self")).await.unwrap();

        let registry = Arc::new(LocalRegistry::new());
        let mut collector = ProcessCollector::new(ProcFs::new(dir.path()), registry.clone());
        collector.collect().await.unwrap();

        assert_eq!(
            registry
                .gauge(MetricId::new("sys.currentProcesses"))
                .value(),
            Some(2.0)
        );
        assert_eq!(
            registry.gauge(MetricId::new("sys.currentThreads")).value(),
            Some(5.0)
        );
    }

    #[test]
    fn test_pid_from_sched_line() {
        assert_eq!(pid_from_sched_line("systemd (1, #threads: 1)"), Some(1));
        assert_eq!(pid_from_sched_line("bash (4522, #threads: 1)"), Some(4522));
        assert_eq!(pid_from_sched_line("no parens here"), None);
    }

    #[tokio::test]
    async fn test_container_detection() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("1")).await.unwrap();
        tokio::fs::write(
            dir.path().join("1/sched"),
            "bash (4522, #threads: 1)\nse.exec_start : 0\n",
        )
        .await
        .unwrap();
        let proc = ProcFs::new(dir.path());
        assert!(is_container(&proc).await);

        tokio::fs::write(
            dir.path().join("1/sched"),
            "systemd (1, #threads: 1)\nse.exec_start : 0\n",
        )
        .await
        .unwrap();
        assert!(!is_container(&proc).await);
    }

    #[tokio::test]
    async fn test_container_detection_defaults_to_false_without_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_container(&ProcFs::new(dir.path())).await);
    }
}
