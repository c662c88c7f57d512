//! Async dispatcher — drains function queues into their backends.
//!
//! One loop serves every function. Each tick it reaps finished forwards,
//! then admits at most one queued item per function whose in-flight count
//! is under `number_parallel_request`. Forwards run as spawned tasks; the
//! loop never waits on a backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use http_body_util::BodyExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use napgrid_proxy::{BackendRequest, BackendTransport, TransportError};
use napgrid_state::{ActivityTracker, CustomRequest, DeploymentInfo, FunctionQueue, TopologyCache};

type ForwardOutcome = Result<StatusCode, TransportError>;

/// One forward that has been started and not yet reaped.
struct InFlight {
    handle: JoinHandle<ForwardOutcome>,
    request: CustomRequest,
    started: Instant,
}

/// Counters for one tick, mostly for tests and debug logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub reaped: usize,
    pub admitted: usize,
    /// Functions with queued work but no ready pod.
    pub woken: usize,
}

pub struct AsyncDispatcher {
    topology: TopologyCache,
    activity: ActivityTracker,
    queue: Arc<dyn FunctionQueue>,
    transport: Arc<dyn BackendTransport>,
    in_flight: HashMap<String, Vec<InFlight>>,
}

impl AsyncDispatcher {
    pub fn new(
        topology: TopologyCache,
        activity: ActivityTracker,
        queue: Arc<dyn FunctionQueue>,
        transport: Arc<dyn BackendTransport>,
    ) -> Self {
        Self {
            topology,
            activity,
            queue,
            transport,
            in_flight: HashMap::new(),
        }
    }

    pub fn in_flight_count(&self, function: &str) -> usize {
        self.in_flight.get(function).map_or(0, Vec::len)
    }

    pub async fn tick(&mut self) -> TickStats {
        let mut stats = TickStats {
            reaped: self.reap().await,
            ..TickStats::default()
        };

        let snapshot = self.topology.snapshot();
        for function in &snapshot.functions {
            if self.in_flight_count(&function.name) >= function.number_parallel_request as usize {
                continue;
            }
            if !function.has_ready_pod() {
                if self.wake_if_queued(function).await {
                    stats.woken += 1;
                }
                continue;
            }
            if self.admit_one(function).await {
                stats.admitted += 1;
            }
        }
        stats
    }

    /// Remove finished forwards, log them, and count them as activity.
    ///
    /// Failed deliveries still touch activity so the function is not
    /// scaled down while work for it is being attempted.
    async fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for (function, entries) in self.in_flight.iter_mut() {
            let (finished, running): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|e| e.handle.is_finished());
            *entries = running;

            for entry in finished {
                reaped += 1;
                let elapsed_ms = entry.started.elapsed().as_millis() as u64;
                match entry.handle.await {
                    Ok(Ok(status)) => debug!(
                        function = %function,
                        method = %entry.request.method,
                        path = %entry.request.path,
                        status = status.as_u16(),
                        elapsed_ms,
                        "async request delivered"
                    ),
                    Ok(Err(e)) => warn!(
                        function = %function,
                        method = %entry.request.method,
                        path = %entry.request.path,
                        error = %e,
                        elapsed_ms,
                        "async request delivery failed"
                    ),
                    Err(e) => error!(
                        function = %function,
                        error = %e,
                        "async forward task aborted"
                    ),
                }
                self.activity.touch(function);
            }
        }
        self.in_flight.retain(|_, entries| !entries.is_empty());
        reaped
    }

    /// A cold function with queued work gets its activity touched so the
    /// autoscaler brings it up; the items stay queued until a pod is ready.
    async fn wake_if_queued(&self, function: &DeploymentInfo) -> bool {
        match self.queue.count(&function.name).await {
            Ok(0) => false,
            Ok(pending) => {
                self.activity.touch(&function.name);
                debug!(function = %function.name, pending, "queued work waiting for a ready pod");
                true
            }
            Err(e) => {
                warn!(function = %function.name, error = %e, "failed to count queue");
                false
            }
        }
    }

    async fn admit_one(&mut self, function: &DeploymentInfo) -> bool {
        let payloads = match self.queue.dequeue_up_to(&function.name, 1).await {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(function = %function.name, error = %e, "failed to dequeue");
                return false;
            }
        };
        let Some(payload) = payloads.into_iter().next() else {
            return false;
        };

        let request = match CustomRequest::from_json(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(function = %function.name, error = %e, "dropping malformed queued request");
                return false;
            }
        };
        self.activity.touch(&function.name);

        let backend_request = match BackendRequest::from_custom(&request) {
            Ok(backend_request) => backend_request,
            Err(e) => {
                warn!(function = %function.name, error = %e, "dropping undeliverable queued request");
                return false;
            }
        };

        let transport = self.transport.clone();
        let handle = tokio::spawn(async move {
            let response = transport.send(backend_request).await?;
            let status = response.status();
            // Drain so the connection can be reused.
            response
                .into_body()
                .collect()
                .await
                .map_err(|e| TransportError::Upstream(e.to_string()))?;
            Ok::<_, TransportError>(status)
        });

        self.in_flight
            .entry(function.name.clone())
            .or_default()
            .push(InFlight {
                handle,
                request,
                started: Instant::now(),
            });
        true
    }

    pub async fn run(&mut self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = tick.as_millis() as u64, "async dispatcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    let stats = self.tick().await;
                    if stats.admitted > 0 || stats.reaped > 0 {
                        debug!(admitted = stats.admitted, reaped = stats.reaped, "dispatch tick");
                    }
                }
                _ = shutdown.changed() => {
                    let pending: usize = self.in_flight.values().map(Vec::len).sum();
                    info!(in_flight = pending, "async dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use http::Response;
    use napgrid_state::{PodStatus, StateStore, TopologySnapshot};

    fn function(name: &str, limit: u32, ready: bool) -> DeploymentInfo {
        DeploymentInfo {
            name: name.to_string(),
            namespace: "faas".to_string(),
            replicas: Some(if ready { 1 } else { 0 }),
            replicas_min: 0,
            replicas_at_start: 1,
            number_parallel_request: limit,
            timeout_seconds_before_scale_to_min: 300,
            start_with_any_function: false,
            pods: vec![PodStatus {
                name: format!("{name}-0"),
                ready,
            }],
        }
    }

    fn queued(function: &str, body: &[u8]) -> String {
        CustomRequest {
            headers: vec![],
            body: Some(body.to_vec()),
            function_name: function.to_string(),
            path: "/run".to_string(),
            method: "POST".to_string(),
            query: String::new(),
        }
        .to_json()
        .unwrap()
    }

    /// Holds each call for `delay` and records peak concurrency.
    struct SlowTransport {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        bodies: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl SlowTransport {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                bodies: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl BackendTransport for SlowTransport {
        async fn send(&self, request: BackendRequest) -> Result<Response<Body>, TransportError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let napgrid_proxy::BackendBody::Buffered(Some(bytes)) = request.body {
                self.bodies.lock().unwrap().push(bytes.to_vec());
            }
            if self.fail {
                return Err(TransportError::Connect("refused".to_string()));
            }
            Ok(Response::new(Body::from("done")))
        }
    }

    fn dispatcher(
        functions: Vec<DeploymentInfo>,
        store: &StateStore,
        transport: Arc<SlowTransport>,
    ) -> (AsyncDispatcher, ActivityTracker) {
        let activity = ActivityTracker::new();
        let dispatcher = AsyncDispatcher::new(
            TopologyCache::with_snapshot(TopologySnapshot::new(functions)),
            activity.clone(),
            Arc::new(store.clone()),
            transport,
        );
        (dispatcher, activity)
    }

    #[tokio::test]
    async fn never_exceeds_parallel_limit() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..10u8 {
            store.enqueue("fib", &queued("fib", &[i])).await.unwrap();
        }
        let transport = Arc::new(SlowTransport::new(Duration::from_millis(30)));
        let (mut dispatcher, _) = dispatcher(vec![function("fib", 2, true)], &store, transport.clone());

        for _ in 0..200 {
            dispatcher.tick().await;
            assert!(dispatcher.in_flight_count("fib") <= 2);
            if store.count("fib").await.unwrap() == 0 && dispatcher.in_flight_count("fib") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(store.count("fib").await.unwrap(), 0);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(transport.bodies.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn admits_one_per_function_per_tick() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..3u8 {
            store.enqueue("a", &queued("a", &[i])).await.unwrap();
            store.enqueue("b", &queued("b", &[i])).await.unwrap();
        }
        let transport = Arc::new(SlowTransport::new(Duration::from_millis(200)));
        let (mut dispatcher, _) = dispatcher(
            vec![function("a", 10, true), function("b", 10, true)],
            &store,
            transport,
        );

        let stats = dispatcher.tick().await;
        assert_eq!(stats.admitted, 2);
        assert_eq!(dispatcher.in_flight_count("a"), 1);
        assert_eq!(dispatcher.in_flight_count("b"), 1);
        assert_eq!(store.count("a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delivers_body_byte_exact() {
        let store = StateStore::open_in_memory().unwrap();
        let body: Vec<u8> = (0..=255).collect();
        store.enqueue("fib", &queued("fib", &body)).await.unwrap();
        let transport = Arc::new(SlowTransport::new(Duration::ZERO));
        let (mut dispatcher, _) = dispatcher(vec![function("fib", 1, true)], &store, transport.clone());

        dispatcher.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = dispatcher.tick().await;

        assert_eq!(stats.reaped, 1);
        assert_eq!(transport.bodies.lock().unwrap()[0], body);
    }

    #[tokio::test]
    async fn failed_delivery_still_touches_activity() {
        let store = StateStore::open_in_memory().unwrap();
        store.enqueue("fib", &queued("fib", b"x")).await.unwrap();
        let transport = Arc::new(SlowTransport::failing());
        let (mut dispatcher, activity) = dispatcher(vec![function("fib", 1, true)], &store, transport);

        dispatcher.tick().await;
        let admitted_at = activity.last_call("fib").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = dispatcher.tick().await;

        assert_eq!(stats.reaped, 1);
        assert_eq!(dispatcher.in_flight_count("fib"), 0);
        assert!(activity.last_call("fib").unwrap() >= admitted_at);
        // Not re-enqueued.
        assert_eq!(store.count("fib").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cold_function_keeps_work_queued_and_wakes() {
        let store = StateStore::open_in_memory().unwrap();
        store.enqueue("fib", &queued("fib", b"x")).await.unwrap();
        let transport = Arc::new(SlowTransport::new(Duration::ZERO));
        let (mut dispatcher, activity) = dispatcher(vec![function("fib", 1, false)], &store, transport);

        let stats = dispatcher.tick().await;
        assert_eq!(stats.woken, 1);
        assert_eq!(stats.admitted, 0);
        assert_eq!(store.count("fib").await.unwrap(), 1);
        assert!(activity.last_call("fib").is_some());
    }

    #[tokio::test]
    async fn empty_cold_function_is_not_woken() {
        let store = StateStore::open_in_memory().unwrap();
        let transport = Arc::new(SlowTransport::new(Duration::ZERO));
        let (mut dispatcher, activity) = dispatcher(vec![function("fib", 1, false)], &store, transport);

        assert_eq!(dispatcher.tick().await, TickStats::default());
        assert!(activity.last_call("fib").is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let store = StateStore::open_in_memory().unwrap();
        store.enqueue("fib", "{not json").await.unwrap();
        store.enqueue("fib", &queued("fib", b"ok")).await.unwrap();
        let transport = Arc::new(SlowTransport::new(Duration::ZERO));
        let (mut dispatcher, _) = dispatcher(vec![function("fib", 1, true)], &store, transport);

        assert_eq!(dispatcher.tick().await.admitted, 0);
        assert_eq!(dispatcher.tick().await.admitted, 1);
        assert_eq!(store.count("fib").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_limit_pauses_dispatch() {
        let store = StateStore::open_in_memory().unwrap();
        store.enqueue("fib", &queued("fib", b"x")).await.unwrap();
        let transport = Arc::new(SlowTransport::new(Duration::ZERO));
        let (mut dispatcher, _) = dispatcher(vec![function("fib", 0, true)], &store, transport);

        assert_eq!(dispatcher.tick().await.admitted, 0);
        assert_eq!(store.count("fib").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let transport = Arc::new(SlowTransport::new(Duration::ZERO));
        let (mut dispatcher, _) = dispatcher(vec![], &store, transport);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { dispatcher.run(Duration::from_millis(5), rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
