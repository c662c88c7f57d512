//! Backend transport — sends one request to a function's backend.
//!
//! Synchronous calls stream the caller's body straight through and are
//! sent exactly once. Dispatched async calls carry a buffered body, so
//! they can be replayed: those are retried on connect errors and on
//! transient upstream statuses with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{debug, warn};

use napgrid_state::CustomRequest;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid backend request: {0}")]
    InvalidRequest(String),

    #[error("cannot connect to backend: {0}")]
    Connect(String),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Upstream(String),
}

pub enum BackendBody {
    /// Caller's body, forwarded as it arrives. Not replayable.
    Streaming(Body),
    /// Fully captured body; `None` sends no body at all.
    Buffered(Option<Bytes>),
}

pub struct BackendRequest {
    pub function: String,
    /// Path below the function root, empty or starting with `/`.
    pub path: String,
    /// Raw query string including the leading `?`, or empty.
    pub query: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: BackendBody,
}

impl BackendRequest {
    /// Rebuild a dispatchable request from a queued payload.
    ///
    /// Headers whose name or value is not valid HTTP are dropped.
    pub fn from_custom(request: &CustomRequest) -> Result<Self, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("method {}: {e}", request.method)))?;

        let mut headers = HeaderMap::new();
        for header in &request.headers {
            let Ok(name) = HeaderName::from_bytes(header.key.as_bytes()) else {
                debug!(header = %header.key, "dropping invalid header name");
                continue;
            };
            for value in &header.values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }

        Ok(Self {
            function: request.function_name.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            method,
            headers,
            body: BackendBody::Buffered(request.body.clone().map(Bytes::from)),
        })
    }
}

#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn send(&self, request: BackendRequest) -> Result<Response<Body>, TransportError>;
}

/// Headers that describe one connection and must not be forwarded.
///
/// `host` is included so the backend sees its own authority.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 500 | 502 | 503 | 504)
}

// ── HTTP transport ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// hyper-based transport resolving functions through a URL template.
///
/// The template may contain `{function_name}` and `{namespace}`, e.g.
/// `http://{function_name}.{namespace}:8080`.
pub struct HttpTransport {
    client: Client<HttpConnector, Body>,
    base_url: String,
    namespace: String,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            base_url: base_url.into(),
            namespace: namespace.into(),
            request_timeout,
            retry,
        }
    }

    pub fn backend_uri(&self, function: &str, path: &str, query: &str) -> Result<Uri, TransportError> {
        let base = self
            .base_url
            .replace("{function_name}", function)
            .replace("{namespace}", &self.namespace);
        let path = if path.is_empty() { "/" } else { path };
        let uri = format!("{}{}{}", base.trim_end_matches('/'), path, query);
        uri.parse::<Uri>()
            .map_err(|e| TransportError::InvalidRequest(format!("{uri}: {e}")))
    }

    async fn send_once(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Body,
    ) -> Result<Response<Body>, TransportError> {
        let mut request = Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        match tokio::time::timeout(self.request_timeout, self.client.request(request)).await {
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
            Ok(Err(e)) if e.is_connect() => Err(TransportError::Connect(e.to_string())),
            Ok(Err(e)) => Err(TransportError::Upstream(e.to_string())),
            Ok(Ok(response)) => Ok(response.map(Body::new)),
        }
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn send(&self, request: BackendRequest) -> Result<Response<Body>, TransportError> {
        let uri = self.backend_uri(&request.function, &request.path, &request.query)?;
        let headers = forwardable_headers(&request.headers);
        debug!(function = %request.function, method = %request.method, %uri, "forwarding to backend");

        let bytes = match request.body {
            BackendBody::Streaming(body) => {
                return self.send_once(request.method, uri, headers, body).await;
            }
            BackendBody::Buffered(bytes) => bytes,
        };

        let mut attempt = 0;
        loop {
            let body = bytes.clone().map(Body::from).unwrap_or_else(Body::empty);
            let result = self
                .send_once(request.method.clone(), uri.clone(), headers.clone(), body)
                .await;

            let retry = match &result {
                Ok(response) => is_retryable_status(response.status()),
                Err(TransportError::Connect(_)) => true,
                Err(_) => false,
            };
            if !retry || attempt >= self.retry.attempts {
                return result;
            }

            let delay = self.retry.delay(attempt);
            match &result {
                Ok(response) => warn!(
                    function = %request.function,
                    status = response.status().as_u16(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient backend status, retrying"
                ),
                Err(e) => warn!(
                    function = %request.function,
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "backend unreachable, retrying"
                ),
            }
            drop(result);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use napgrid_state::CustomHeader;

    fn transport() -> HttpTransport {
        HttpTransport::new(
            "http://{function_name}.{namespace}:8080/",
            "faas",
            Duration::from_secs(1),
            RetryPolicy::none(),
        )
    }

    #[test]
    fn uri_substitutes_template() {
        let uri = transport().backend_uri("fib", "/compute", "?n=3").unwrap();
        assert_eq!(uri.to_string(), "http://fib.faas:8080/compute?n=3");
    }

    #[test]
    fn uri_empty_sub_path_targets_root() {
        let uri = transport().backend_uri("fib", "", "").unwrap();
        assert_eq!(uri.to_string(), "http://fib.faas:8080/");
    }

    #[test]
    fn uri_rejects_garbage() {
        assert!(matches!(
            transport().backend_uri("bad name", "/", ""),
            Err(TransportError::InvalidRequest(_))
        ));
    }

    #[test]
    fn hop_by_hop_headers() {
        for name in ["Connection", "keep-alive", "Transfer-Encoding", "Upgrade", "Host", "TE"] {
            assert!(is_hop_by_hop(name), "{name}");
        }
        for name in ["content-type", "authorization", "x-request-id"] {
            assert!(!is_hop_by_hop(name), "{name}");
        }
    }

    #[test]
    fn forwardable_keeps_multi_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        headers.insert("connection", HeaderValue::from_static("close"));

        let out = forwardable_headers(&headers);
        assert_eq!(out.get_all("x-tag").iter().count(), 2);
        assert!(out.get("connection").is_none());
    }

    #[test]
    fn retry_delay_doubles() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(8));
    }

    #[test]
    fn retryable_statuses() {
        for code in [408, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200, 400, 404, 501] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn from_custom_rebuilds_request() {
        let custom = CustomRequest {
            headers: vec![
                CustomHeader {
                    key: "x-tag".to_string(),
                    values: vec!["a".to_string(), "b".to_string()],
                },
                CustomHeader {
                    key: "bad header".to_string(),
                    values: vec!["x".to_string()],
                },
            ],
            body: Some(b"payload".to_vec()),
            function_name: "fib".to_string(),
            path: "/run".to_string(),
            method: "POST".to_string(),
            query: "?n=1".to_string(),
        };

        let request = BackendRequest::from_custom(&custom).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers.get_all("x-tag").iter().count(), 2);
        assert_eq!(request.headers.len(), 2);
        match request.body {
            BackendBody::Buffered(Some(bytes)) => assert_eq!(&bytes[..], b"payload"),
            _ => panic!("expected buffered body"),
        }
    }

    #[test]
    fn from_custom_rejects_bad_method() {
        let custom = CustomRequest {
            headers: vec![],
            body: None,
            function_name: "fib".to_string(),
            path: String::new(),
            method: "BAD METHOD".to_string(),
            query: String::new(),
        };
        assert!(BackendRequest::from_custom(&custom).is_err());
    }

    #[tokio::test]
    async fn unreachable_backend_is_connect_error() {
        let transport = HttpTransport::new(
            "http://127.0.0.1:1",
            "faas",
            Duration::from_secs(2),
            RetryPolicy::none(),
        );
        let request = BackendRequest {
            function: "fib".to_string(),
            path: "/".to_string(),
            query: String::new(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: BackendBody::Buffered(None),
        };
        assert!(matches!(
            transport.send(request).await,
            Err(TransportError::Connect(_))
        ));
    }
}
