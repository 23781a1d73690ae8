use crate::registry::{MetricId, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("host-metrics-agent/", env!("CARGO_PKG_VERSION"));
const MAX_ATTEMPTS: u32 = 3;

/// Timeout classes for one delivery call. The total deadline for a single
/// attempt is connect + read; retries restart the attempt timer, so a call
/// can block for up to roughly the deadline per attempt.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl HttpClientConfig {
    pub fn total_deadline(&self) -> Duration {
        self.connect_timeout + self.read_timeout
    }
}

/// Outcome of one logical HTTP operation. `status` is -1 when no HTTP
/// response was ever obtained; delivery failures are values, not errors.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: i32,
    pub body: String,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }

    fn no_response() -> Self {
        Self {
            status: -1,
            body: String::new(),
            headers: HashMap::new(),
        }
    }
}

/// Classification of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ConnectionError,
    Timeout,
    Unknown,
}

impl ErrorClass {
    fn as_str(self) -> &'static str {
        match self {
            ErrorClass::ConnectionError => "connection_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Unknown => "unknown",
        }
    }
}

fn classify(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_connect() {
        ErrorClass::ConnectionError
    } else {
        ErrorClass::Unknown
    }
}

/// What one attempt produced, for the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Status(i32),
    Transport(ErrorClass),
}

fn is_retryable_status(status: i32) -> bool {
    status == 429 || status / 100 == 5
}

/// The retry policy as a pure function of the attempt outcome, the attempt
/// index, and elapsed time since the first attempt. Transport failures are
/// retried only while the total deadline has not passed; retryable statuses
/// are bound by the attempt cap alone.
pub(crate) fn should_retry(
    outcome: AttemptOutcome,
    attempt: u32,
    elapsed: Duration,
    deadline: Duration,
) -> bool {
    if attempt + 1 >= MAX_ATTEMPTS {
        return false;
    }
    match outcome {
        AttemptOutcome::Status(status) => is_retryable_status(status),
        AttemptOutcome::Transport(_) => elapsed < deadline,
    }
}

/// Fixed backoff before the retry that follows `attempt`: 200ms, then 400ms.
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(200u64 << attempt)
}

enum AttemptResult {
    Response(HttpResponse),
    Failure(ErrorClass),
}

/// HTTP delivery client with bounded retries.
///
/// Each `perform` call is independent; the reqwest client and its connection
/// pool are built once per `HttpClient` and shared by concurrent calls.
pub struct HttpClient {
    client: reqwest::Client,
    config: HttpClientConfig,
    registry: Arc<dyn Registry>,
}

impl HttpClient {
    pub fn new(
        config: HttpClientConfig,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            config,
            registry,
        })
    }

    pub async fn get(&self, url: &str) -> HttpResponse {
        self.perform("GET", url, &[], None).await
    }

    /// Issue one logical HTTP operation. Transport failures and 429/5xx
    /// statuses are retried up to two times; the result is always a
    /// response value, with status -1 reserved for "no HTTP response was
    /// ever obtained".
    pub async fn perform(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        payload: Option<&[u8]>,
    ) -> HttpResponse {
        let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
            warn!(method, url, "invalid http method");
            return HttpResponse::no_response();
        };

        let deadline = self.config.total_deadline();
        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let attempt_start = Instant::now();
            let result = self.execute_once(method.clone(), url, headers, payload).await;
            let attempt_elapsed = attempt_start.elapsed();

            match result {
                AttemptResult::Response(response) => {
                    let retry = should_retry(
                        AttemptOutcome::Status(response.status),
                        attempt,
                        start.elapsed(),
                        deadline,
                    );
                    let result_tag = if response.is_success() {
                        "success"
                    } else {
                        "http_error"
                    };
                    self.record_attempt(&method, url, attempt, !retry, attempt_elapsed, result_tag);
                    if retry {
                        info!(url, status = response.status, attempt, "retryable http status");
                        tokio::time::sleep(backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return response;
                }
                AttemptResult::Failure(class) => {
                    warn!(url, error = class.as_str(), attempt, "http attempt failed");
                    let retry = should_retry(
                        AttemptOutcome::Transport(class),
                        attempt,
                        start.elapsed(),
                        deadline,
                    );
                    self.record_attempt(
                        &method,
                        url,
                        attempt,
                        !retry,
                        attempt_elapsed,
                        class.as_str(),
                    );
                    if retry {
                        attempt += 1;
                        continue;
                    }
                    return HttpResponse::no_response();
                }
            }
        }
    }

    async fn execute_once(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &[(&str, &str)],
        payload: Option<&[u8]>,
    ) -> AttemptResult {
        let mut request = self
            .client
            .request(method, url)
            .timeout(self.config.total_deadline());
        for (key, value) in headers {
            request = request.header(*key, *value);
        }
        if let Some(payload) = payload {
            request = request.body(payload.to_vec());
        }

        match request.send().await {
            Ok(response) => {
                let status = i32::from(response.status().as_u16());
                let headers = flatten_headers(response.headers());
                match response.text().await {
                    Ok(body) => AttemptResult::Response(HttpResponse {
                        status,
                        body,
                        headers,
                    }),
                    Err(err) => AttemptResult::Failure(classify(&err)),
                }
            }
            Err(err) => AttemptResult::Failure(classify(&err)),
        }
    }

    /// One record per attempt, whether retried or terminal.
    fn record_attempt(
        &self,
        method: &reqwest::Method,
        url: &str,
        attempt: u32,
        terminal: bool,
        elapsed: Duration,
        result: &str,
    ) {
        let summary = self.registry.distribution_summary(
            MetricId::new("http.client.attempts")
                .tag("method", method.as_str())
                .tag("result", result)
                .tag("final", if terminal { "true" } else { "false" }),
        );
        summary.record(elapsed.as_secs_f64() * 1000.0);
        debug!(
            method = %method,
            url,
            attempt,
            terminal,
            result,
            elapsed_ms = elapsed.as_millis() as u64,
            "http attempt"
        );
    }
}

/// Collapse a header map into owned strings; repeated headers join with a
/// comma, so nothing is lost to key collisions.
fn flatten_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_retry_policy_http_branch_ignores_deadline() {
        let over_deadline = Duration::from_secs(60);
        assert!(should_retry(
            AttemptOutcome::Status(503),
            0,
            over_deadline,
            Duration::from_secs(1)
        ));
        assert!(!should_retry(
            AttemptOutcome::Status(200),
            0,
            Duration::ZERO,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_retry_policy_transport_branch_checks_deadline() {
        let deadline = Duration::from_secs(1);
        assert!(should_retry(
            AttemptOutcome::Transport(ErrorClass::ConnectionError),
            0,
            Duration::from_millis(100),
            deadline
        ));
        assert!(!should_retry(
            AttemptOutcome::Transport(ErrorClass::Timeout),
            0,
            Duration::from_secs(2),
            deadline
        ));
    }

    #[test]
    fn test_retry_policy_attempt_cap() {
        let deadline = Duration::from_secs(10);
        assert!(should_retry(AttemptOutcome::Status(503), 1, Duration::ZERO, deadline));
        assert!(!should_retry(AttemptOutcome::Status(503), 2, Duration::ZERO, deadline));
        assert!(!should_retry(
            AttemptOutcome::Transport(ErrorClass::ConnectionError),
            2,
            Duration::ZERO,
            deadline
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(0), Duration::from_millis(200));
        assert_eq!(backoff(1), Duration::from_millis(400));
    }

    fn test_config() -> HttpClientConfig {
        HttpClientConfig {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(1500),
        }
    }

    /// Serve a canned response for every connection; responses carry
    /// `connection: close` so each attempt shows up as a new connection.
    async fn spawn_server(response: &'static str) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (url, hits)
    }

    #[tokio::test]
    async fn test_success_response_carries_body_and_headers() {
        let (url, hits) = spawn_server(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 2\r\nconnection: close\r\n\r\nOK",
        )
        .await;
        let registry = Arc::new(LocalRegistry::new());
        let client = HttpClient::new(test_config(), registry).unwrap();

        let response = client.get(&url).await;
        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(response.body, "OK");
        assert_eq!(response.headers.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_503_returns_final_response_after_three_attempts() {
        let (url, hits) = spawn_server(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let registry = Arc::new(LocalRegistry::new());
        let client = HttpClient::new(test_config(), registry).unwrap();

        let response = client.get(&url).await;
        // the final 503 is returned as-is, not a synthetic -1
        assert_eq!(response.status, 503);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_attempts_and_returns_synthetic() {
        // bind then drop to find a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let registry = Arc::new(LocalRegistry::new());
        let client = HttpClient::new(test_config(), registry.clone()).unwrap();
        let response = client.get(&url).await;
        assert_eq!(response.status, -1);
        assert!(!response.is_success());

        // one attempt record per attempt: two retried, one terminal
        let attempt_count = |terminal: &str| {
            registry
                .distribution_summary(
                    MetricId::new("http.client.attempts")
                        .tag("method", "GET")
                        .tag("result", "connection_error")
                        .tag("final", terminal),
                )
                .count()
        };
        assert_eq!(attempt_count("false") + attempt_count("true"), 3);
        assert_eq!(attempt_count("true"), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_server_times_out_with_synthetic_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                // accept and read, never answer
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        let config = HttpClientConfig {
            connect_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_millis(200),
        };
        let registry = Arc::new(LocalRegistry::new());
        let client = HttpClient::new(config, registry).unwrap();

        let started = Instant::now();
        let response = client.get(&url).await;
        assert_eq!(response.status, -1);
        // at most 3 attempts of ~300ms each plus slack
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
