use crate::http::HttpClientConfig;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "host_metrics_agent", version, about)]
pub struct Config {
    /// Unique identifier for this agent instance.
    /// if none provided, default to hostname.
    #[arg(long, env = "HOST_AGENT_ID")]
    pub agent_id: Option<String>,

    /// Root of the kernel pseudo-filesystem. Redirect it for tests or
    /// when running inside a container with the host's /proc bind-mounted.
    #[arg(long, env = "HOST_AGENT_PROC_PATH", default_value = "/proc")]
    pub proc_path: String,

    /// Metric collection interval in milliseconds.
    #[arg(long, env = "HOST_AGENT_COLLECT_INTERVAL_MS", default_value_t = 5000)]
    pub collect_interval_ms: u64,

    /// Endpoint that receives the JSON metric snapshot each cycle.
    /// Delivery is disabled when unset.
    #[arg(long, env = "HOST_AGENT_PUBLISH_URL")]
    pub publish_url: Option<String>,

    /// HTTP connect timeout in milliseconds.
    #[arg(long, env = "HOST_AGENT_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// HTTP read timeout in milliseconds.
    #[arg(long, env = "HOST_AGENT_READ_TIMEOUT_MS", default_value_t = 5000)]
    pub read_timeout_ms: u64,

    /// Enable JSON structured logging.
    #[arg(long, env = "HOST_AGENT_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

impl Config {
    /// get agent ID, upon failure fallback to hostname.
    pub fn resolved_agent_id(&self) -> String {
        self.agent_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown-agent".to_string())
        })
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}
