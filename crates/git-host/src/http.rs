//! HTTP kernel shared by every forge adapter and by host detection.
//!
//! Centralizes authentication, the stable user agent, CA-bundle handling,
//! and the retry policy. The retry loop is written out explicitly so that
//! both decision kinds, transport retries and secondary-rate-limit waits,
//! stay readable and composable with a caller-supplied handler.

use std::error::Error as _;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::{Certificate, Client, Method};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::GitHostError;

/// HTTP statuses retried at the kernel level.
pub const RETRYABLE_STATUS: [u16; 11] = [405, 408, 413, 429, 500, 502, 503, 504, 521, 522, 524];

const USER_AGENT: &str = concat!("gitu/", env!("CARGO_PKG_VERSION"));

/// A CA bundle read once from disk and attached by value to every request.
/// The path is retained so local clones can reuse it via `http.sslCAInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCert {
    pub path: PathBuf,
    pub pem: Vec<u8>,
}

impl CaCert {
    pub fn read(path: impl Into<PathBuf>) -> io::Result<CaCert> {
        let path = path.into();
        let pem = std::fs::read(&path)?;
        Ok(CaCert { path, pem })
    }
}

/// What a caller-supplied retry handler gets to look at.
pub struct RetryCheck<'a> {
    pub operation: &'a str,
    pub status: Option<u16>,
    pub body: Option<&'a str>,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Option<Duration>,
}

pub type RetryHandler = Arc<dyn Fn(&RetryCheck<'_>) -> Option<RetryDecision> + Send + Sync>;

/// Kernel retry configuration. The effective handler is the union of the
/// kernel's own rules and `handler`; the first decision with `retry: true`
/// wins.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub delay_jitter: Duration,
    /// Statuses whose semantics belong to the caller; the kernel never
    /// retries these even when they appear in [`RETRYABLE_STATUS`].
    pub pass_through_status: Vec<u16>,
    pub handler: Option<RetryHandler>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(5_000),
            delay_jitter: Duration::from_millis(5_000),
            pass_through_status: Vec::new(),
            handler: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with no retries at all, used by detection probes.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Policy for merge endpoints, where 405 carries forge-specific meaning
    /// (conflicts, blocked merges) and must surface to the orchestrator.
    pub fn merge() -> Self {
        Self {
            pass_through_status: vec![405, 409, 422],
            ..Self::default()
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter = self.delay_jitter.as_millis() as u64;
        let extra = if jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter)
        };
        self.base_delay + Duration::from_millis(extra)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("delay_jitter", &self.delay_jitter)
            .field("pass_through_status", &self.pass_through_status)
            .field("handler", &self.handler.as_ref().map(|_| "…"))
            .finish()
    }
}

/// How requests authenticate against the forge.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, token: String },
    Bearer { token: String },
    Anonymous,
}

/// Response snapshot with the body already drained, so retry decisions and
/// adapter mappers can both inspect it.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GitHostError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| GitHostError::Decode(format!("{e}: {}", self.text())))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Request body shapes the adapters need.
pub enum Payload<'a> {
    Empty,
    Json(&'a serde_json::Value),
    Form(&'a [(String, String)]),
}

/// HTTP client bound to one forge base URL.
#[derive(Debug, Clone)]
pub struct HostClient {
    client: Client,
    base_url: String,
    auth: Auth,
    policy: RetryPolicy,
}

impl HostClient {
    pub fn new(
        base_url: impl Into<String>,
        auth: Auth,
        ca_cert: Option<&CaCert>,
        policy: RetryPolicy,
    ) -> Result<HostClient, GitHostError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10));

        if let Some(ca) = ca_cert {
            let certificate = Certificate::from_pem(&ca.pem).map_err(|e| {
                GitHostError::BadCredentials(format!(
                    "unusable CA bundle {}: {e}",
                    ca.path.display()
                ))
            })?;
            // The supplied bundle replaces the system roots entirely.
            builder = builder
                .add_root_certificate(certificate)
                .tls_built_in_root_certs(false);
        }

        Ok(HostClient {
            client: builder
                .build()
                .map_err(|e| GitHostError::Transport(format!("failed to build http client: {e}")))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> HostClient {
        self.policy = policy;
        self
    }

    /// Issue a request under the client's own retry policy.
    pub async fn execute(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        payload: Payload<'_>,
        headers: &[(&str, &str)],
    ) -> Result<ApiResponse, GitHostError> {
        self.execute_with_policy(operation, &self.policy, method, path, payload, headers)
            .await
    }

    /// Issue a request under an explicit retry policy.
    pub async fn execute_with_policy(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        method: Method,
        path: &str,
        payload: Payload<'_>,
        headers: &[(&str, &str)],
    ) -> Result<ApiResponse, GitHostError> {
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        };

        let mut remaining = policy.max_attempts;
        loop {
            let request = self.build_request(&method, &url, &payload, headers);

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    if is_transient(&error) && remaining > 0 {
                        remaining -= 1;
                        let delay = policy.next_delay();
                        debug!(
                            operation,
                            remaining, "transport failure, retrying in {delay:?}: {error}"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let rendered = error.to_string();
                    if remaining > 0 {
                        if let Some(delay) =
                            caller_retry(policy, operation, None, None, Some(&rendered))
                        {
                            remaining -= 1;
                            debug!(operation, remaining, "handler retry in {delay:?}: {rendered}");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    return Err(GitHostError::Transport(rendered));
                }
            };

            let status = response.status().as_u16();
            let response_headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| GitHostError::Transport(format!("while reading body: {e}")))?
                .to_vec();
            let api = ApiResponse {
                status,
                headers: response_headers,
                body,
            };

            if api.ok() {
                return Ok(api);
            }

            let body_text = api.text();

            // Secondary rate limits get their own wait: Retry-After when the
            // forge names one, a randomized half-minute otherwise.
            if api.status == 403 && is_secondary_rate_limit(&body_text) && remaining > 0 {
                remaining -= 1;
                let delay = api.retry_after().unwrap_or_else(rate_limit_delay);
                debug!(operation, remaining, "secondary rate limit, waiting {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }

            if RETRYABLE_STATUS.contains(&api.status)
                && !policy.pass_through_status.contains(&api.status)
                && remaining > 0
            {
                remaining -= 1;
                let delay = api.retry_after().unwrap_or_else(|| policy.next_delay());
                debug!(
                    operation,
                    remaining,
                    status = api.status,
                    "retryable status, retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if remaining > 0 {
                if let Some(delay) =
                    caller_retry(policy, operation, Some(api.status), Some(&body_text), None)
                {
                    remaining -= 1;
                    debug!(
                        operation,
                        remaining,
                        status = api.status,
                        "handler retry in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            // Non-2xx without a retry decision: the adapter's mapper decides
            // what it means.
            return Ok(api);
        }
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        payload: &Payload<'_>,
        headers: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method.clone(), url);

        request = match &self.auth {
            Auth::Basic { username, token } => request.basic_auth(username, Some(token)),
            Auth::Bearer { token } => request.bearer_auth(token),
            Auth::Anonymous => request,
        };

        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("accept")) {
            request = request.header("Accept", "application/json");
        }
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        match payload {
            Payload::Empty => request,
            Payload::Json(value) => request.json(value),
            Payload::Form(fields) => request.form(fields),
        }
    }
}

fn caller_retry(
    policy: &RetryPolicy,
    operation: &str,
    status: Option<u16>,
    body: Option<&str>,
    error: Option<&str>,
) -> Option<Duration> {
    let handler = policy.handler.as_ref()?;
    let decision = handler(&RetryCheck {
        operation,
        status,
        body,
        error,
    })?;
    if decision.retry {
        Some(decision.delay.unwrap_or_else(|| policy.next_delay()))
    } else {
        None
    }
}

fn is_secondary_rate_limit(body: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)secondary rate limit").unwrap())
        .is_match(body)
}

fn rate_limit_delay() -> Duration {
    Duration::from_secs(30 + rand::rng().random_range(0..20))
}

/// Connection-level failures worth retrying: timeouts, refused or reset
/// connections, broken pipes, unreachable networks, flaky DNS.
fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_error.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::AddrInUse
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
            ) {
                return true;
            }
        }
        if cause.to_string().contains("dns error") {
            return true;
        }
        source = cause.source();
    }
    false
}
