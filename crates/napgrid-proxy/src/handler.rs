//! Function proxy — the request-side half of the control plane.
//!
//! Runs as axum middleware in front of the rest of the router. Function
//! paths are answered here; everything else goes to the next handler
//! untouched.
//!
//! Caller cancellation needs no bookkeeping: when the client goes away
//! hyper drops the handler future, which drops the cold-start sleep or
//! the in-progress backend call with it.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::TRANSFER_ENCODING;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use napgrid_core::NapConfig;
use napgrid_state::{ActivityTracker, CustomHeader, CustomRequest, FunctionQueue, TopologyCache};

use crate::route::{FunctionRoute, InvocationMode, classify};
use crate::transport::{BackendBody, BackendRequest, BackendTransport, TransportError};

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub cold_start_timeout: Duration,
    pub cold_start_poll_interval: Duration,
    pub activity_touch_interval: Duration,
    pub max_async_body_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from(&NapConfig::default())
    }
}

impl From<&NapConfig> for ProxySettings {
    fn from(config: &NapConfig) -> Self {
        Self {
            cold_start_timeout: config.proxy.cold_start_timeout,
            cold_start_poll_interval: config.proxy.cold_start_poll_interval,
            activity_touch_interval: config.proxy.activity_touch_interval,
            max_async_body_bytes: config.proxy.max_async_body_bytes,
        }
    }
}

#[derive(Clone)]
pub struct FunctionProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    topology: TopologyCache,
    activity: ActivityTracker,
    queue: Arc<dyn FunctionQueue>,
    transport: Arc<dyn BackendTransport>,
    settings: ProxySettings,
}

impl FunctionProxy {
    pub fn new(
        topology: TopologyCache,
        activity: ActivityTracker,
        queue: Arc<dyn FunctionQueue>,
        transport: Arc<dyn BackendTransport>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                topology,
                activity,
                queue,
                transport,
                settings,
            }),
        }
    }

    /// Answer a classified function request.
    pub async fn handle(&self, route: FunctionRoute, request: Request) -> Response {
        debug!(
            method = %request.method(),
            function = %route.name,
            mode = ?route.mode,
            sub_path = %route.sub_path,
            "function request"
        );
        match route.mode {
            InvocationMode::Wake => self.wake(&route.name),
            InvocationMode::Async => self.enqueue(route, request).await,
            InvocationMode::Sync => self.forward(route, request).await,
            InvocationMode::NotAFunction => StatusCode::NOT_FOUND.into_response(),
        }
    }

    // ── Wake ───────────────────────────────────────────────────────

    fn wake(&self, function: &str) -> Response {
        if !self.inner.topology.contains(function) {
            return StatusCode::NOT_FOUND.into_response();
        }
        self.inner.activity.touch(function);
        StatusCode::NO_CONTENT.into_response()
    }

    // ── Async ──────────────────────────────────────────────────────

    async fn enqueue(&self, route: FunctionRoute, request: Request) -> Response {
        if !self.inner.topology.contains(&route.name) {
            return StatusCode::NOT_FOUND.into_response();
        }

        let custom = match self.capture(route, request).await {
            Ok(custom) => custom,
            Err(status) => return status.into_response(),
        };
        let function = custom.function_name.clone();

        let payload = match custom.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(function = %function, error = %e, "failed to serialize async request");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        if let Err(e) = self.inner.queue.enqueue(&function, &payload).await {
            error!(function = %function, error = %e, "failed to enqueue async request");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        debug!(function = %function, bytes = payload.len(), "async request queued");
        StatusCode::ACCEPTED.into_response()
    }

    async fn capture(&self, route: FunctionRoute, request: Request) -> Result<CustomRequest, StatusCode> {
        let (parts, body) = request.into_parts();
        let method = parts.method.to_string();

        let body = if CustomRequest::method_carries_body(&method) {
            let limited = Limited::new(body, self.inner.settings.max_async_body_bytes);
            match limited.collect().await {
                Ok(collected) => Some(collected.to_bytes().to_vec()),
                Err(e) if e.is::<LengthLimitError>() => {
                    warn!(function = %route.name, "async request body too large");
                    return Err(StatusCode::PAYLOAD_TOO_LARGE);
                }
                Err(e) => {
                    warn!(function = %route.name, error = %e, "failed to read async request body");
                    return Err(StatusCode::BAD_REQUEST);
                }
            }
        } else {
            None
        };

        Ok(CustomRequest {
            headers: capture_headers(&parts.headers),
            body,
            function_name: route.name,
            path: route.sub_path,
            method,
            query: parts
                .uri
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default(),
        })
    }

    // ── Sync ───────────────────────────────────────────────────────

    async fn forward(&self, route: FunctionRoute, request: Request) -> Response {
        let function = route.name;
        if !self.inner.topology.contains(&function) {
            return StatusCode::NOT_FOUND.into_response();
        }
        self.inner.activity.touch(&function);
        self.wait_for_ready(&function).await;

        let (parts, body) = request.into_parts();
        let backend_request = BackendRequest {
            function: function.clone(),
            path: route.sub_path,
            query: parts
                .uri
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default(),
            method: parts.method,
            headers: parts.headers,
            body: BackendBody::Streaming(body),
        };

        let touch_every = self.inner.settings.activity_touch_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + touch_every, touch_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let send = self.inner.transport.send(backend_request);
        tokio::pin!(send);
        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                _ = ticker.tick() => {
                    self.inner.activity.touch(&function);
                }
            }
        };
        self.inner.activity.touch(&function);

        match result {
            Ok(response) => mirror_response(response),
            Err(TransportError::Timeout(after)) => {
                warn!(function = %function, timeout = ?after, "backend timed out");
                StatusCode::GATEWAY_TIMEOUT.into_response()
            }
            Err(e) => {
                warn!(function = %function, error = %e, "backend call failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    /// Poll until the function has a ready pod or the budget runs out.
    ///
    /// Activity is re-touched while waiting so the autoscaler does not
    /// scale the function back down under a waiting caller. Returns
    /// whether a ready pod was seen; on timeout the caller forwards anyway.
    async fn wait_for_ready(&self, function: &str) -> bool {
        let settings = &self.inner.settings;
        let started = Instant::now();
        let mut last_touch = started;
        let mut waited = false;

        while !self.inner.topology.has_ready_pod(function) {
            waited = true;
            if started.elapsed() >= settings.cold_start_timeout {
                warn!(
                    function = %function,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "no ready pod before cold-start timeout, forwarding anyway"
                );
                return false;
            }
            tokio::time::sleep(settings.cold_start_poll_interval).await;
            if last_touch.elapsed() >= settings.activity_touch_interval {
                self.inner.activity.touch(function);
                last_touch = Instant::now();
            }
        }

        if waited {
            debug!(
                function = %function,
                waited_ms = started.elapsed().as_millis() as u64,
                "function ready"
            );
        }
        true
    }
}

/// Group header values by name, in first-seen order.
///
/// Values that are not valid UTF-8 cannot be stored exactly and are
/// dropped; a name left with no values is dropped with them.
fn capture_headers(headers: &HeaderMap) -> Vec<CustomHeader> {
    headers
        .keys()
        .filter_map(|name| {
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| match std::str::from_utf8(v.as_bytes()) {
                    Ok(value) => Some(value.to_string()),
                    Err(_) => {
                        debug!(header = %name, "dropping non-UTF-8 header value");
                        None
                    }
                })
                .collect();
            (!values.is_empty()).then(|| CustomHeader {
                key: name.as_str().to_string(),
                values,
            })
        })
        .collect()
}

/// Copy status and headers from the backend; the outer server recomputes
/// the transfer encoding.
fn mirror_response(response: Response<Body>) -> Response {
    let (parts, body) = response.into_parts();
    let mut mirrored = Response::new(body);
    *mirrored.status_mut() = parts.status;
    for (name, value) in &parts.headers {
        if name != TRANSFER_ENCODING {
            mirrored.headers_mut().append(name.clone(), value.clone());
        }
    }
    mirrored
}

/// axum middleware entry point; see [`crate::router::build_router`].
pub async fn proxy_middleware(
    State(proxy): State<FunctionProxy>,
    request: Request,
    next: Next,
) -> Response {
    let route = classify(request.uri().path());
    if !route.is_function() {
        return next.run(request).await;
    }
    proxy.handle(route, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn headers_grouped_by_name() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let captured = capture_headers(&headers);
        assert_eq!(captured.len(), 2);
        let tag = captured.iter().find(|h| h.key == "x-tag").unwrap();
        assert_eq!(tag.values, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn non_utf8_header_values_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_bytes(b"caf\xe9").unwrap());
        headers.append("x-tag", HeaderValue::from_static("ok"));
        headers.insert("x-raw", HeaderValue::from_bytes(b"\xff\xfe").unwrap());
        headers.insert("x-name", HeaderValue::from_bytes("café".as_bytes()).unwrap());

        let captured = capture_headers(&headers);
        let tag = captured.iter().find(|h| h.key == "x-tag").unwrap();
        assert_eq!(tag.values, vec!["ok".to_string()]);
        assert!(captured.iter().all(|h| h.key != "x-raw"));
        let name = captured.iter().find(|h| h.key == "x-name").unwrap();
        assert_eq!(name.values, vec!["café".to_string()]);
    }

    #[test]
    fn mirror_drops_transfer_encoding() {
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header("transfer-encoding", "chunked")
            .header("content-type", "application/json")
            .header("x-backend", "1")
            .body(Body::empty())
            .unwrap();

        let mirrored = mirror_response(response);
        assert_eq!(mirrored.status(), StatusCode::CREATED);
        assert!(mirrored.headers().get("transfer-encoding").is_none());
        assert_eq!(mirrored.headers()["content-type"], "application/json");
        assert_eq!(mirrored.headers()["x-backend"], "1");
    }

    #[test]
    fn settings_from_config() {
        let mut config = NapConfig::default();
        config.proxy.cold_start_timeout = Duration::from_secs(3);
        let settings = ProxySettings::from(&config);
        assert_eq!(settings.cold_start_timeout, Duration::from_secs(3));
        assert_eq!(settings.max_async_body_bytes, 32 * 1024 * 1024);
    }
}
