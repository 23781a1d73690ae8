use clap::Parser;
use host_metrics_agent::collectors::cpu::{CpuCollector, PeakCpuCollector};
use host_metrics_agent::collectors::memory::MemoryCollector;
use host_metrics_agent::collectors::network::{
    ArpCacheCollector, NetDevCollector, SockstatCollector,
};
use host_metrics_agent::collectors::snmp::{NetstatCollector, SnmpCollector};
use host_metrics_agent::collectors::system::{
    is_container, LoadAvgCollector, ProcessCollector, UptimeCollector, VmStatCollector,
};
use host_metrics_agent::collectors::tcp::TcpStateCollector;
use host_metrics_agent::collectors::{Collector, ProcFs};
use host_metrics_agent::config::Config;
use host_metrics_agent::http::HttpClient;
use host_metrics_agent::registry::{LocalRegistry, Measurement, Registry};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Report<'a> {
    agent_id: &'a str,
    metrics: &'a [Measurement],
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(config.json_logs);

    let agent_id = config.resolved_agent_id();
    let proc = ProcFs::new(&config.proc_path);
    let local_registry = Arc::new(LocalRegistry::new());
    let registry: Arc<dyn Registry> = local_registry.clone();

    if is_container(&proc).await {
        info!("pid namespace detected; metrics reflect the container's view of the host");
    }

    let mut collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(CpuCollector::new(proc.clone(), registry.clone())),
        Box::new(PeakCpuCollector::new(proc.clone(), registry.clone())),
        Box::new(NetDevCollector::new(proc.clone(), registry.clone())),
        Box::new(SnmpCollector::new(proc.clone(), registry.clone())),
        Box::new(NetstatCollector::new(proc.clone(), registry.clone())),
        Box::new(TcpStateCollector::new(proc.clone(), registry.clone())),
        Box::new(ArpCacheCollector::new(proc.clone(), registry.clone())),
        Box::new(SockstatCollector::new(proc.clone(), registry.clone())),
        Box::new(MemoryCollector::new(proc.clone(), registry.clone())),
        Box::new(LoadAvgCollector::new(proc.clone(), registry.clone())),
        Box::new(VmStatCollector::new(proc.clone(), registry.clone())),
        Box::new(UptimeCollector::new(proc.clone(), registry.clone())),
        Box::new(ProcessCollector::new(proc.clone(), registry.clone())),
    ];

    let client = match &config.publish_url {
        Some(_) => Some(HttpClient::new(config.http_config(), registry.clone())?),
        None => None,
    };

    info!(
        agent_id = %agent_id,
        interval_ms = config.collect_interval_ms,
        proc_path = %config.proc_path,
        "starting collection loop"
    );

    let mut ticker = tokio::time::interval(config.collect_interval());
    loop {
        ticker.tick().await;

        for collector in &mut collectors {
            if let Err(err) = collector.collect().await {
                warn!(collector = collector.name(), error = %err, "collection failed");
            }
        }

        let metrics = local_registry.snapshot();
        debug!(measurements = metrics.len(), "collection cycle complete");

        if let (Some(client), Some(url)) = (&client, &config.publish_url) {
            let report = Report {
                agent_id: &agent_id,
                metrics: &metrics,
            };
            match serde_json::to_vec(&report) {
                Ok(payload) => {
                    let response = client
                        .perform(
                            "POST",
                            url,
                            &[("Content-Type", "application/json")],
                            Some(&payload),
                        )
                        .await;
                    if !response.is_success() {
                        warn!(status = response.status, url = %url, "snapshot delivery failed");
                    }
                }
                Err(err) => error!(error = %err, "failed to encode snapshot"),
            }
        }
    }
}
