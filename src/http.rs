//! The HTTP transport realization: a `reqwest`-backed [`Connection`],
//! request bodies, outcome classification, and [`HttpFuseClient`] — the
//! concrete client that wires [`crate::fuse::FuseClient`]'s breaker
//! machinery to an actual wire protocol, the way `FuseHttpClient` wired
//! the abstract `FuseClient` to curl in the original source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tokio::time::Instant;
use uuid::Uuid;

use crate::connection::Connection;
use crate::connection_pool::{ConnectionFactory, ConnectionPool};
use crate::error::FuseError;
use crate::fuse::{FuseClient, FuseGate, RecoveryProbe};

fn trace_id_header() -> HeaderName {
    HeaderName::from_static("x-trace-id")
}

fn alb_trace_id_header() -> HeaderName {
    HeaderName::from_static("x-amzn-trace-id")
}

/// One of the four request methods the original transport supports (no
/// PATCH — it never appeared in `HTTP_REQUEST_METHOD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One field of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct FormPart {
    pub key: String,
    pub bytes: Vec<u8>,
    pub name: String,
}

/// A request body. A closed, two-variant tagged enum rather than a trait
/// object — the set of body kinds `do_request` needs to dispatch over is
/// fixed (§6, §9's "polymorphic bodies" design note).
#[derive(Debug, Clone)]
pub enum Body {
    Json(Vec<u8>),
    Multipart(Vec<FormPart>),
}

impl Body {
    /// Build the outgoing request: inject the body-dependent
    /// `Content-Type`, marshal the body, and apply the already-prepared
    /// headers (trace ids) plus the effective timeout.
    pub fn prepare(
        &self,
        client: &reqwest::Client,
        url: &str,
        method: HttpMethod,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let mut builder = client
            .request(method.into(), url)
            .timeout(timeout)
            .headers(headers.clone());

        match self {
            Body::Json(data) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                if !data.is_empty() {
                    builder = builder.body(data.clone());
                }
            }
            Body::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    form = form.part(
                        part.key.clone(),
                        reqwest::multipart::Part::bytes(part.bytes.clone())
                            .file_name(part.name.clone()),
                    );
                }
                // reqwest's `.multipart()` sets its own boundary'd
                // Content-Type; an explicit one here would just be
                // overwritten.
                builder = builder.multipart(form);
            }
        }

        builder
    }
}

/// The five-way-ish outcome classification `do_request`'s attempt loop
/// switches on (§6's `SendRequest` table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Timeout,
    NetworkError,
    ClientError,
    ServerError,
    Retry302,
    Unknown,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Outcome::ClientError)
    }
}

fn classify_status(status: reqwest::StatusCode) -> Outcome {
    let code = status.as_u16();
    if code == 302 {
        Outcome::Retry302
    } else if code >= 500 {
        Outcome::ServerError
    } else if code >= 400 {
        Outcome::ClientError
    } else {
        Outcome::Success
    }
}

fn classify_error(err: &reqwest::Error) -> Outcome {
    if err.is_timeout() {
        Outcome::Timeout
    } else if err.is_connect() {
        Outcome::NetworkError
    } else {
        Outcome::Unknown
    }
}

/// The fuse-accounting predicate (§4.3): count the attempt unless it was a
/// clean success/client-error finish, or unless its latency alone blew the
/// budget even though the outcome looked fine.
fn should_count_outcome(outcome: Outcome, max_latency: Duration, latency_timeout: Duration) -> bool {
    !(outcome.is_success() || outcome.is_client_error()) || max_latency > latency_timeout
}

/// A `reqwest`-backed [`Connection`]. `reqwest::Client` already pools its
/// own keep-alive sockets under the hood; `connect`/`disconnect` are
/// no-ops here, matching the hooks' role as lifecycle markers rather than
/// literal socket operations once the transport owns its own pooling.
pub struct HttpConnection {
    client: reqwest::Client,
}

impl HttpConnection {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn connect(&mut self) -> bool {
        true
    }

    async fn disconnect(&mut self) -> bool {
        true
    }
}

/// Produces [`HttpConnection`]s sharing one underlying `reqwest::Client`
/// (and therefore one connection pool at the transport layer, beneath
/// this crate's own destination-scoped pool).
pub struct HttpConnectionFactory {
    client: reqwest::Client,
}

impl HttpConnectionFactory {
    pub fn new() -> Result<Self, FuseError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FuseError::ConnectionCreation(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConnectionFactory<HttpConnection> for HttpConnectionFactory {
    async fn create(&self, _destination: &str) -> Result<HttpConnection, FuseError> {
        let mut conn = HttpConnection {
            client: self.client.clone(),
        };
        conn.connect().await;
        Ok(conn)
    }
}

/// Configuration knobs for a [`HttpFuseClient`] (§6). Loading this from a
/// file is the caller's concern; this crate only provides the shape
/// (ambient stack: optionally `serde::Deserialize`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct FuseConfig {
    /// Seconds. `0` disables the fuse; values above 600 are capped.
    pub slide_window: u64,
    pub threshold: u64,
    pub recovery_interval_secs: u64,
    pub recovery_threshold: u64,
    pub inplace_retry_times: u64,
    pub timeout_secs: u64,
    pub coefficient: u64,
    pub latency_timeout_ms: u64,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            slide_window: 0,
            threshold: 0,
            recovery_interval_secs: 1,
            recovery_threshold: 1,
            inplace_retry_times: 0,
            timeout_secs: 0,
            coefficient: 1,
            latency_timeout_ms: u64::MAX,
        }
    }
}

/// The concrete client: `FuseClient<HttpConnection>`'s breaker machinery
/// wired to a real `do_request`, the same division of labor as
/// `FuseClient`/`FuseHttpClient` in the original source expressed as
/// composition instead of inheritance. Cheap to clone — cloning duplicates
/// the inner `Arc<FuseClient<_>>` handle and the probe path, not the pool
/// or its connections.
#[derive(Clone)]
pub struct HttpFuseClient {
    fuse: Arc<FuseClient<HttpConnection>>,
    probe_path: String,
}

impl HttpFuseClient {
    pub fn new(
        destination: impl Into<String>,
        pool: Arc<ConnectionPool<HttpConnection>>,
        probe_path: impl Into<String>,
    ) -> Self {
        Self {
            fuse: FuseClient::new(destination, pool),
            probe_path: probe_path.into(),
        }
    }

    pub fn fuse(&self) -> &Arc<FuseClient<HttpConnection>> {
        &self.fuse
    }

    pub fn apply_config(&self, config: &FuseConfig) {
        self.fuse.set_fuse(
            config.slide_window,
            config.threshold,
            Duration::from_secs(config.recovery_interval_secs),
            config.recovery_threshold,
        );
        self.fuse.set_inplace_retry_times(config.inplace_retry_times);
        self.fuse.set_timeout(Duration::from_secs(config.timeout_secs));
        self.fuse.set_coefficient(config.coefficient);
        self.fuse
            .set_latency_timeout(Duration::from_millis(config.latency_timeout_ms));
    }

    /// `do_request(path, method, headers, body, &mut response) ->
    /// http_status_code_or_-1` (§4.3), as the public entry point.
    pub async fn do_request(
        &self,
        path: &str,
        method: HttpMethod,
        headers: &mut HeaderMap,
        body: &Body,
        response: &mut Vec<u8>,
    ) -> i64 {
        self.request(path, method, headers, body, response, false).await
    }

    /// The recovery worker's bypass entry point: same algorithm, but
    /// `is_probe = true` skips the open-circuit rejection and the fuse
    /// accounting (§4.3, §9's `is_probe` design note).
    pub async fn probe_request(
        &self,
        path: &str,
        method: HttpMethod,
        headers: &mut HeaderMap,
        body: &Body,
        response: &mut Vec<u8>,
    ) -> i64 {
        self.request(path, method, headers, body, response, true).await
    }

    async fn request(
        &self,
        path: &str,
        method: HttpMethod,
        headers: &mut HeaderMap,
        body: &Body,
        response: &mut Vec<u8>,
        is_probe: bool,
    ) -> i64 {
        let trace_id = match headers.get(trace_id_header()) {
            Some(v) => v.to_str().unwrap_or_default().to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                headers.insert(
                    trace_id_header(),
                    HeaderValue::from_str(&id).expect("uuid is valid header value"),
                );
                id
            }
        };
        headers.insert(
            alb_trace_id_header(),
            HeaderValue::from_str(&format!("Root={trace_id}")).expect("trace id is ascii"),
        );

        if self.fuse.precheck(is_probe) == FuseGate::Rejected {
            tracing::debug!(trace_id, "in fuse mode, rejecting request");
            response.clear();
            return -1;
        }

        let conn = match self.fuse.pool().acquire(self.fuse.destination(), 0).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(trace_id, error = %e, "no connection available");
                response.clear();
                return -1;
            }
        };

        let retry_times = self.fuse.retry_times(is_probe);
        let mut code: i64 = -1;
        let mut outcome = Outcome::Unknown;
        let mut max_latency = Duration::ZERO;

        for _ in 0..=retry_times {
            response.clear();

            let url = format!("http://{}{}", self.fuse.destination(), path);
            let effective_timeout = self.fuse.effective_timeout();
            let builder = body.prepare(conn.get().client(), &url, method, effective_timeout, headers);

            let start = Instant::now();
            let result = builder.send().await;
            let (this_outcome, this_code, this_body) = match result {
                Ok(resp) => {
                    let status = resp.status();
                    let bytes = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    (classify_status(status), status.as_u16() as i64, bytes)
                }
                Err(e) => {
                    let o = classify_error(&e);
                    (o, 0, Vec::new())
                }
            };
            let latency = start.elapsed();
            max_latency = max_latency.max(latency);

            outcome = this_outcome;
            code = this_code;
            *response = this_body;

            tracing::debug!(
                trace_id, url = %url, code, latency_ms = latency.as_millis() as u64,
                outcome = ?outcome, "request attempt",
            );

            if outcome.is_success() || outcome.is_client_error() {
                break;
            }
        }

        if self.fuse.pool().release(conn).await.is_err() {
            tracing::warn!(trace_id, "failed to release connection");
            return code;
        }

        let should_count = should_count_outcome(outcome, max_latency, self.fuse.latency_timeout());
        self.fuse
            .record_outcome(is_probe, should_count, Arc::new(self.clone()))
            .await;

        code
    }
}

#[async_trait]
impl RecoveryProbe for HttpFuseClient {
    async fn test(&self) -> bool {
        let mut headers = HeaderMap::new();
        let mut response = Vec::new();
        let code = self
            .probe_request(
                &self.probe_path,
                HttpMethod::Get,
                &mut headers,
                &Body::Json(Vec::new()),
                &mut response,
            )
            .await;
        (200..300).contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_boundaries() {
        assert_eq!(classify_status(reqwest::StatusCode::OK), Outcome::Success);
        assert_eq!(
            classify_status(reqwest::StatusCode::FOUND),
            Outcome::Retry302
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_REQUEST),
            Outcome::ClientError
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            Outcome::ServerError
        );
    }

    #[test]
    fn test_latency_trip_scenario_3() {
        // spec.md §8 boundary scenario 3: a technically successful response
        // still counts against the fuse if it ran over latency_timeout.
        assert!(should_count_outcome(
            Outcome::Success,
            Duration::from_millis(500),
            Duration::from_millis(200),
        ));
        assert!(!should_count_outcome(
            Outcome::Success,
            Duration::from_millis(100),
            Duration::from_millis(200),
        ));
        assert!(should_count_outcome(
            Outcome::ServerError,
            Duration::from_millis(10),
            Duration::from_millis(200),
        ));
        assert!(!should_count_outcome(
            Outcome::ClientError,
            Duration::from_secs(5),
            Duration::from_millis(200),
        ));
    }

    #[test]
    fn test_outcome_success_and_client_error_never_count() {
        assert!(Outcome::Success.is_success());
        assert!(!Outcome::Success.is_client_error());
        assert!(Outcome::ClientError.is_client_error());
        assert!(!Outcome::ClientError.is_success());
        assert!(!Outcome::ServerError.is_success());
        assert!(!Outcome::ServerError.is_client_error());
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let client = reqwest::Client::new();
        let mut headers = HeaderMap::new();
        headers.insert(trace_id_header(), HeaderValue::from_static("abc"));
        let body = Body::Json(br#"{"a":1}"#.to_vec());
        let builder = body.prepare(
            &client,
            "http://example.com/path",
            HttpMethod::Post,
            Duration::from_secs(5),
            &headers,
        );
        let request = builder.build().unwrap();
        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(request.headers().get(trace_id_header()).unwrap(), "abc");
    }

    #[test]
    fn test_http_method_maps_to_reqwest_method() {
        assert_eq!(reqwest::Method::from(HttpMethod::Get), reqwest::Method::GET);
        assert_eq!(
            reqwest::Method::from(HttpMethod::Delete),
            reqwest::Method::DELETE
        );
    }

    #[tokio::test]
    async fn test_do_request_without_factory_installed_rejects() {
        struct NoFactory;
        #[async_trait]
        impl ConnectionFactory<HttpConnection> for NoFactory {
            async fn create(&self, destination: &str) -> Result<HttpConnection, FuseError> {
                Err(FuseError::ConnectionCreation(destination.to_string()))
            }
        }

        let pool = Arc::new(ConnectionPool::new(
            Arc::new(NoFactory),
            crate::connection_pool::PoolConfig::default(),
        ));
        let client = HttpFuseClient::new("127.0.0.1:1", pool, "/health");

        let mut headers = HeaderMap::new();
        let mut response = Vec::new();
        let code = client
            .do_request(
                "/path",
                HttpMethod::Get,
                &mut headers,
                &Body::Json(Vec::new()),
                &mut response,
            )
            .await;
        assert_eq!(code, -1);
        assert!(response.is_empty());
    }
}
