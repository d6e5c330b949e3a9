use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::Stream;
use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::condition::{Condition, Operator};
use crate::config::{BackendConfig, RouteConfig};
use crate::error::{GatewayError, Result};
use crate::metrics::{Alert, AlertState, MetricsRepository, RequestMetrics};

pub mod backend;
pub mod strategy;
pub mod switchover;

pub use backend::{Backend, BackendSummary};
pub use strategy::Strategy;
pub use switchover::{Switchover, SwitchoverStatus, SwitchoverSummary};

const SERVER_NAME: &str = concat!("veer/", env!("CARGO_PKG_VERSION"));

/// Headers consumed by the proxy hop; never forwarded in either direction.
fn hop_headers() -> [HeaderName; 8] {
    [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
}

/// Condition auto-inserted for every health-checked backend so transport
/// outages raise alerts without operator configuration.
fn transport_outage_condition() -> Condition {
    Condition::new("6xxRate", Operator::Gt, 0.0, Duration::from_secs(2))
}

struct RouteInner {
    name: String,
    prefix: String,
    methods: Vec<String>,
    host: Option<String>,
    rewrite: Option<String>,
    cookie_ttl: Duration,
    timeout: Duration,
    health_check: bool,
    health_check_interval: Duration,
    monitoring_interval: Duration,
    strategy: RwLock<Strategy>,
    backends: RwLock<std::collections::HashMap<Uuid, Arc<Backend>>>,
    distribution: RwLock<Vec<Arc<Backend>>>,
    rr_cursor: AtomicUsize,
    switchover: Mutex<Option<Arc<Switchover>>>,
    repo: MetricsRepository,
    metrics_tx: mpsc::Sender<RequestMetrics>,
    client: reqwest::Client,
    stop_health: watch::Sender<bool>,
}

/// A named request-matching unit owning a set of weighted backends.
///
/// Cheap to clone; background loops hold their own handle. The backend map
/// and the derived distribution vector sit behind read-write locks: writers
/// are the backend lifecycle operations and `update_weights`, readers are
/// selection and listing.
#[derive(Clone)]
pub struct Route {
    inner: Arc<RouteInner>,
}

/// Non-owning handle held by a switchover so the route can drop first.
#[derive(Clone, Debug)]
pub(crate) struct WeakRoute(Weak<RouteInner>);

impl WeakRoute {
    pub(crate) fn upgrade(&self) -> Option<Route> {
        self.0.upgrade().map(|inner| Route { inner })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteSummary {
    pub name: String,
    pub prefix: String,
    pub methods: Vec<String>,
    pub strategy: Strategy,
    pub health_check: bool,
    pub backends: Vec<BackendSummary>,
    pub switchover: Option<SwitchoverSummary>,
}

impl Route {
    pub fn new(cfg: &RouteConfig, repo: MetricsRepository) -> Result<Self> {
        if !cfg.prefix.starts_with('/') {
            return Err(GatewayError::ConfigInvalid(format!(
                "route prefix {:?} must start with '/'",
                cfg.prefix
            )));
        }
        let mut prefix = cfg.prefix.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        if cfg.methods.is_empty() {
            return Err(GatewayError::ConfigInvalid(format!(
                "route {:?} must allow at least one method",
                cfg.name
            )));
        }

        let client = reqwest::Client::builder()
            .pool_idle_timeout(cfg.idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| GatewayError::Internal(format!("upstream client: {err}")))?;

        let (stop_health, _) = watch::channel(false);
        let metrics_tx = repo.sender();
        Ok(Self {
            inner: Arc::new(RouteInner {
                name: cfg.name.clone(),
                prefix,
                methods: cfg.methods.iter().map(|m| m.to_uppercase()).collect(),
                host: cfg.host.clone(),
                rewrite: cfg.rewrite.clone(),
                cookie_ttl: cfg.cookie_ttl,
                timeout: cfg.timeout,
                health_check: cfg.health_check,
                health_check_interval: cfg.health_check_interval,
                monitoring_interval: cfg.monitoring_interval,
                strategy: RwLock::new(cfg.strategy),
                backends: RwLock::new(std::collections::HashMap::new()),
                distribution: RwLock::new(Vec::new()),
                rr_cursor: AtomicUsize::new(0),
                switchover: Mutex::new(None),
                repo,
                metrics_tx,
                client,
                stop_health,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn methods(&self) -> &[String] {
        &self.inner.methods
    }

    pub fn metrics_repo(&self) -> &MetricsRepository {
        &self.inner.repo
    }

    pub(crate) fn downgrade(&self) -> WeakRoute {
        WeakRoute(Arc::downgrade(&self.inner))
    }

    /// Spawn the route's background work; call once after construction.
    pub fn start(&self) {
        if self.inner.health_check {
            tokio::spawn(self.clone().run_health_checks());
        }
    }

    pub async fn strategy(&self) -> Strategy {
        *self.inner.strategy.read().await
    }

    pub async fn set_strategy(&self, strategy: Strategy) {
        *self.inner.strategy.write().await = strategy;
    }

    pub async fn summary(&self) -> RouteSummary {
        let mut backends: Vec<BackendSummary> = {
            let map = self.inner.backends.read().await;
            map.values().map(|b| b.summary()).collect()
        };
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        let strategy = *self.inner.strategy.read().await;
        let switchover = self
            .inner
            .switchover
            .lock()
            .await
            .as_ref()
            .map(|s| s.summary());
        RouteSummary {
            name: self.inner.name.clone(),
            prefix: self.inner.prefix.clone(),
            methods: self.inner.methods.clone(),
            strategy,
            health_check: self.inner.health_check,
            backends,
            switchover,
        }
    }

    /// Does the request's Host header pass this route's optional filter?
    pub fn matches_host(&self, headers: &HeaderMap) -> bool {
        match &self.inner.host {
            None => true,
            Some(host) => headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(|value| value == host)
                .unwrap_or(false),
        }
    }

    /// Add a versioned upstream to this route.
    ///
    /// The backend starts inactive when health checking is enabled and flips
    /// active on its first successful check; otherwise it joins the
    /// distribution immediately.
    pub async fn add_backend(&self, cfg: BackendConfig) -> Result<Uuid> {
        let mut backends = self.inner.backends.write().await;
        if backends.values().any(|b| b.name == cfg.name) {
            return Err(GatewayError::Conflict(format!(
                "backend {:?} already exists on route {:?}",
                cfg.name, self.inner.name
            )));
        }

        let mut thresholds = cfg.thresholds.clone();
        if self.inner.health_check {
            thresholds.push(transport_outage_condition());
        }
        let backend = Arc::new(Backend::new(
            &cfg.name,
            cfg.addr,
            cfg.scrape_url,
            cfg.healthcheck_url,
            cfg.scrape_metrics.clone(),
            thresholds.clone(),
            cfg.weight,
            !self.inner.health_check,
        )?);

        let alert_rx = self
            .inner
            .repo
            .register_backend(
                &self.inner.name,
                backend.id,
                backend.scrape_url.clone(),
                cfg.scrape_metrics,
                thresholds,
            )
            .await?;

        {
            let repo = self.inner.repo.clone();
            let backend_id = backend.id;
            let interval = self.inner.monitoring_interval;
            tokio::spawn(async move {
                if let Err(err) = repo.monitor(backend_id, interval, interval).await {
                    warn!(backend = %backend_id, error = %err, "monitor loop ended with error");
                }
            });
        }
        let drain = tokio::spawn(drain_alerts(self.clone(), backend.clone(), alert_rx));
        *backend
            .alert_drain
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(drain);

        backends.insert(backend.id, backend.clone());
        drop(backends);

        info!(route = %self.inner.name, backend = %backend.name, id = %backend.id, "added backend");
        if self.inner.health_check {
            if backend.healthcheck_url.is_some() {
                tokio::spawn(validate_status(self.clone(), backend.clone()));
            }
        } else {
            self.update_weights().await;
        }
        Ok(backend.id)
    }

    /// Remove a backend, refusing while a running switchover references it.
    pub async fn remove_backend(&self, backend_id: Uuid) -> Result<()> {
        {
            let switchover = self.inner.switchover.lock().await;
            if let Some(sw) = switchover.as_ref() {
                if sw.status() == SwitchoverStatus::Running
                    && (sw.from.id == backend_id || sw.to.id == backend_id)
                {
                    return Err(GatewayError::Conflict(format!(
                        "backend {backend_id} is part of running switchover {}",
                        sw.id
                    )));
                }
            }
        }

        self.inner.repo.remove_backend(backend_id).await?;
        let removed = self.inner.backends.write().await.remove(&backend_id);
        match removed {
            Some(backend) => {
                backend.stop_alert_drain();
                self.update_weights().await;
                warn!(route = %self.inner.name, backend = %backend.name, "removed backend");
                Ok(())
            }
            None => Err(GatewayError::NotFound(format!("backend {backend_id}"))),
        }
    }

    pub async fn update_backend_weight(&self, backend_id: Uuid, weight: u8) -> Result<()> {
        if weight > 100 {
            return Err(GatewayError::ConfigInvalid(format!(
                "weight {weight} exceeds 100"
            )));
        }
        let backend = self
            .inner
            .backends
            .read()
            .await
            .get(&backend_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("backend {backend_id}")))?;
        backend.set_weight(weight);
        self.update_weights().await;
        Ok(())
    }

    pub async fn backend_ids(&self) -> Vec<Uuid> {
        self.inner.backends.read().await.keys().copied().collect()
    }

    pub async fn backend_by_name(&self, name: &str) -> Option<Arc<Backend>> {
        self.inner
            .backends
            .read()
            .await
            .values()
            .find(|b| b.name == name)
            .cloned()
    }

    /// Recompute the weighted distribution vector.
    ///
    /// Active backends appear `weight / gcd(weights)` times; with no active
    /// backend (or only zero weights) the vector is empty and selection
    /// fails.
    pub async fn update_weights(&self) {
        let active: Vec<Arc<Backend>> = {
            let backends = self.inner.backends.read().await;
            backends
                .values()
                .filter(|b| b.is_active())
                .cloned()
                .collect()
        };
        let weights: Vec<u8> = active.iter().map(|b| b.weight()).collect();
        let divisor = gcd_all(&weights);

        let mut distribution = Vec::new();
        if divisor > 0 {
            for backend in &active {
                for _ in 0..(backend.weight() / divisor) {
                    distribution.push(backend.clone());
                }
            }
        }
        debug!(route = %self.inner.name, slots = distribution.len(), "recomputed distribution");
        *self.inner.distribution.write().await = distribution;
    }

    pub async fn distribution_names(&self) -> Vec<String> {
        self.inner
            .distribution
            .read()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    /// Pick a backend for a request according to the current strategy.
    ///
    /// Returns the backend and, for the canary strategies, the `Set-Cookie`
    /// value to attach to the response.
    pub async fn select_backend(
        &self,
        headers: &HeaderMap,
    ) -> Result<(Arc<Backend>, Option<String>)> {
        let current = *self.inner.strategy.read().await;
        match current {
            Strategy::Random => Ok((self.draw_random().await?, None)),
            Strategy::RoundRobin => Ok((self.draw_round_robin().await?, None)),
            Strategy::Sticky => {
                let cookie = strategy::cookie_name(&self.inner.name);
                if let Some(id) = strategy::cookie_value(headers, &cookie) {
                    let pinned = self.inner.backends.read().await.get(&id).cloned();
                    if let Some(backend) = pinned.filter(|b| b.is_active()) {
                        return Ok((backend, None));
                    }
                }
                let backend = self.draw_random().await?;
                let set_cookie =
                    strategy::sticky_cookie(&cookie, backend.id, self.inner.cookie_ttl);
                Ok((backend, Some(set_cookie)))
            }
            Strategy::Slippery => {
                let cookie = strategy::cookie_name(&self.inner.name);
                let backend = self.draw_random().await?;
                let set_cookie =
                    strategy::sticky_cookie(&cookie, backend.id, self.inner.cookie_ttl);
                Ok((backend, Some(set_cookie)))
            }
        }
    }

    async fn draw_random(&self) -> Result<Arc<Backend>> {
        let distribution = self.inner.distribution.read().await;
        if distribution.is_empty() {
            return Err(GatewayError::Upstream("no backend is active".into()));
        }
        let index = rand::thread_rng().gen_range(0..distribution.len());
        Ok(distribution[index].clone())
    }

    async fn draw_round_robin(&self) -> Result<Arc<Backend>> {
        let distribution = self.inner.distribution.read().await;
        if distribution.is_empty() {
            return Err(GatewayError::Upstream("no backend is active".into()));
        }
        let index = self.inner.rr_cursor.fetch_add(1, Ordering::Relaxed) % distribution.len();
        Ok(distribution[index].clone())
    }

    /// Proxy one client request, converting gateway errors into the proper
    /// client responses.
    pub async fn handle(&self, req: Request, peer: Option<SocketAddr>) -> Response {
        match self.proxy(req, peer).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }

    async fn proxy(&self, req: Request, peer: Option<SocketAddr>) -> Result<Response> {
        let (backend, set_cookie) = self.select_backend(req.headers()).await?;
        let (parts, body) = req.into_parts();

        let mut url = backend.addr.clone();
        let path = parts.uri.path();
        let rewritten = match &self.inner.rewrite {
            Some(rewrite) if path.starts_with(self.inner.prefix.as_str()) => {
                path.replacen(self.inner.prefix.as_str(), rewrite, 1)
            }
            _ => path.to_string(),
        };
        url.set_path(&rewritten);
        url.set_query(parts.uri.query());

        let mut headers = parts.headers.clone();
        strip_hop_headers(&mut headers);
        headers.remove(header::HOST);
        append_forwarded_for(&mut headers, peer);
        let downstream_addr = peer.map(|p| p.to_string()).unwrap_or_default();

        let method = parts.method.clone();
        let started = Instant::now();
        let outcome = self
            .inner
            .client
            .request(method.clone(), url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .timeout(self.inner.timeout)
            .send()
            .await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        let upstream = match outcome {
            Ok(upstream) => upstream,
            Err(err) => {
                self.emit_measurement(&backend, 600, &method, 0, elapsed_us, &downstream_addr)
                    .await;
                return Err(if err.is_timeout() {
                    GatewayError::Timeout(self.inner.timeout)
                } else {
                    GatewayError::Upstream(err.to_string())
                });
            }
        };

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_headers(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);
        response_headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
        if let Some(cookie) = set_cookie {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response_headers.append(header::SET_COOKIE, value);
            }
        }

        let measurement = RequestMetrics {
            route: self.inner.name.clone(),
            backend_id: backend.id,
            response_status: status.as_u16(),
            request_method: method.to_string(),
            content_length: 0,
            upstream_response_time_us: elapsed_us,
            downstream_addr,
        };
        let metered = MeteredBody::new(
            upstream.bytes_stream(),
            measurement,
            self.inner.metrics_tx.clone(),
        );

        let mut builder = Response::builder().status(status);
        if let Some(slot) = builder.headers_mut() {
            *slot = response_headers;
        }
        builder
            .body(Body::from_stream(metered))
            .map_err(|err| GatewayError::Internal(format!("assembling response: {err}")))
    }

    async fn emit_measurement(
        &self,
        backend: &Backend,
        status: u16,
        method: &Method,
        content_length: u64,
        elapsed_us: u64,
        downstream_addr: &str,
    ) {
        let measurement = RequestMetrics {
            route: self.inner.name.clone(),
            backend_id: backend.id,
            response_status: status,
            request_method: method.to_string(),
            content_length,
            upstream_response_time_us: elapsed_us,
            downstream_addr: downstream_addr.to_string(),
        };
        if self.inner.metrics_tx.send(measurement).await.is_err() {
            debug!(route = %self.inner.name, "metrics channel closed; measurement dropped");
        }
    }

    async fn run_health_checks(self) {
        let mut stop = self.inner.stop_health.subscribe();
        let mut ticker = time::interval(self.inner.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            route = %self.inner.name,
            interval = ?self.inner.health_check_interval,
            "health check loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {
                    warn!(route = %self.inner.name, "health check loop stopped");
                    return;
                }
            }

            let backends: Vec<Arc<Backend>> = {
                let backends = self.inner.backends.read().await;
                backends.values().cloned().collect()
            };
            for backend in backends {
                if backend.healthcheck_url.is_some() {
                    tokio::spawn(check_backend(self.clone(), backend));
                }
            }
        }
    }

    /// Begin shifting traffic from one backend to another.
    ///
    /// `force` replaces the strategy with `sticky` and seeds the weights
    /// `(100 - weight_change, weight_change)`; otherwise the route must
    /// already run a canary strategy.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_switchover(
        &self,
        id: u64,
        from: Option<&str>,
        to: &str,
        conditions: Vec<Condition>,
        timeout: Duration,
        allowed_failures: u32,
        weight_change: u8,
        force: bool,
        rollback: bool,
    ) -> Result<Arc<Switchover>> {
        let mut slot = self.inner.switchover.lock().await;
        if let Some(existing) = slot.as_ref() {
            if matches!(
                existing.status(),
                SwitchoverStatus::Registered | SwitchoverStatus::Running
            ) {
                return Err(GatewayError::Conflict(
                    "only one switchover can be active per route".into(),
                ));
            }
        }

        let (from_backend, to_backend) = {
            let backends = self.inner.backends.read().await;
            let to_backend = backends
                .values()
                .find(|b| b.name == to)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("backend {to:?}")))?;
            let from_backend = match from {
                Some(name) => backends
                    .values()
                    .find(|b| b.name == name)
                    .cloned()
                    .ok_or_else(|| GatewayError::NotFound(format!("backend {name:?}")))?,
                None => backends
                    .values()
                    .find(|b| b.name != to && b.weight() == 100)
                    .cloned()
                    .ok_or_else(|| {
                        GatewayError::ConfigInvalid(
                            "no source backend given and none carries the full weight".into(),
                        )
                    })?,
            };
            (from_backend, to_backend)
        };

        if weight_change == 0 || weight_change > 100 {
            return Err(GatewayError::ConfigInvalid(format!(
                "weight change {weight_change} must be within [1, 100]"
            )));
        }

        if force {
            self.set_strategy(Strategy::Sticky).await;
            from_backend.set_weight(100 - weight_change);
            to_backend.set_weight(weight_change);
            self.update_weights().await;
        } else if !self.strategy().await.is_canary() {
            return Err(GatewayError::ConfigInvalid(
                "switchover requires the sticky or slippery strategy".into(),
            ));
        }

        let switchover = Switchover::new(
            id,
            from_backend,
            to_backend,
            self,
            conditions,
            timeout,
            allowed_failures,
            weight_change,
            rollback,
        )?;
        *slot = Some(switchover.clone());
        tokio::spawn(switchover.clone().run());
        Ok(switchover)
    }

    /// Stop and discard the route's switchover, leaving weights as they are.
    pub async fn remove_switchover(&self) -> Option<SwitchoverSummary> {
        let mut slot = self.inner.switchover.lock().await;
        slot.take().map(|switchover| {
            switchover.stop();
            switchover.summary()
        })
    }

    pub async fn current_switchover(&self) -> Option<Arc<Switchover>> {
        self.inner.switchover.lock().await.clone()
    }

    /// Tear the route down: health loop, switchover, then every backend.
    pub async fn stop_all(&self) {
        self.inner.stop_health.send_replace(true);
        self.remove_switchover().await;
        let ids = self.backend_ids().await;
        for id in ids {
            if let Err(err) = self.remove_backend(id).await {
                warn!(route = %self.inner.name, error = %err, "failed to remove backend during teardown");
            }
        }
    }
}

async fn drain_alerts(route: Route, backend: Arc<Backend>, mut alerts: mpsc::Receiver<Alert>) {
    while let Some(alert) = alerts.recv().await {
        info!(
            route = %route.inner.name,
            backend = %backend.name,
            metric = %alert.metric,
            state = ?alert.state,
            value = alert.value,
            "backend alert"
        );
        if alert.metric == "6xxRate" {
            match alert.state {
                AlertState::Alarming if backend.is_active() => {
                    backend.set_active(false);
                    route.update_weights().await;
                }
                AlertState::Resolved if !backend.is_active() => {
                    backend.set_active(true);
                    route.update_weights().await;
                }
                _ => {}
            }
        }
    }
}

/// One health probe against a backend.
///
/// A failed check deactivates the backend and records a synthetic 600
/// measurement; a successful one reactivates it and records the real status.
async fn check_backend(route: Route, backend: Arc<Backend>) {
    let Some(url) = backend.healthcheck_url.clone() else {
        return;
    };

    let started = Instant::now();
    let (status, content_length) = match route
        .inner
        .client
        .get(url)
        .timeout(route.inner.timeout)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => (
            response.status().as_u16(),
            response.content_length().unwrap_or(0),
        ),
        Ok(response) => {
            debug!(backend = %backend.name, status = %response.status(), "healthcheck returned non-2xx");
            (600, 0)
        }
        Err(err) => {
            debug!(backend = %backend.name, error = %err, "healthcheck transport failure");
            (600, 0)
        }
    };
    let elapsed_us = started.elapsed().as_micros() as u64;

    route
        .emit_measurement(&backend, status, &Method::GET, content_length, elapsed_us, "")
        .await;

    let healthy = status != 600;
    if healthy && !backend.is_active() {
        backend.set_active(true);
        route.update_weights().await;
        info!(route = %route.inner.name, backend = %backend.name, "backend became healthy");
    } else if !healthy && backend.is_active() {
        backend.set_active(false);
        route.update_weights().await;
        warn!(route = %route.inner.name, backend = %backend.name, "backend became unhealthy");
    }
}

/// First probe of a freshly added backend.
///
/// When the upstream is still starting, no monitoring window exists yet, so
/// a `Pending` transport alert is synthesized for the recovery to resolve.
async fn validate_status(route: Route, backend: Arc<Backend>) {
    check_backend(route.clone(), backend.clone()).await;
    if !backend.is_active() {
        if let Err(err) = route
            .inner
            .repo
            .register_alert(backend.id, AlertState::Pending, "6xxRate", 0.0, 1.0)
            .await
        {
            debug!(backend = %backend.name, error = %err, "could not synthesize pending alert");
        }
    }
}

fn gcd(a: u8, b: u8) -> u8 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn gcd_all(weights: &[u8]) -> u8 {
    weights.iter().fold(0, |acc, w| gcd(*w, acc))
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in &hop_headers() {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<SocketAddr>) {
    let Some(peer) = peer else {
        return;
    };
    let ip = peer.ip().to_string();
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Map a proxy-path failure onto the client-facing response.
fn error_response(err: &GatewayError) -> Response {
    let status = match err {
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Upstream(_) | GatewayError::BadResponse(_) => StatusCode::BAD_GATEWAY,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body relay that counts the bytes actually written and emits
/// exactly one measurement when the stream completes, errors, or is dropped
/// by a disconnecting client.
struct MeteredBody {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    measurement: Option<RequestMetrics>,
    written: u64,
    tx: mpsc::Sender<RequestMetrics>,
}

impl MeteredBody {
    fn new(
        stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        measurement: RequestMetrics,
        tx: mpsc::Sender<RequestMetrics>,
    ) -> Self {
        Self {
            inner: Box::pin(stream),
            measurement: Some(measurement),
            written: 0,
            tx,
        }
    }

    fn emit(&mut self) {
        let Some(mut measurement) = self.measurement.take() else {
            return;
        };
        measurement.content_length = self.written;
        match self.tx.try_send(measurement) {
            Ok(()) => {}
            Err(TrySendError::Full(measurement)) => {
                // The body task cannot wait here; hand the send to a task so
                // the measurement is delivered rather than dropped.
                let tx = self.tx.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = tx.send(measurement).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl Stream for MeteredBody {
    type Item = std::result::Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.written += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.emit();
                Poll::Ready(Some(Err(Box::new(err) as BoxError)))
            }
            Poll::Ready(None) => {
                this.emit();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_reduces_weight_lists() {
        assert_eq!(gcd_all(&[80, 20]), 20);
        assert_eq!(gcd_all(&[50, 50]), 50);
        assert_eq!(gcd_all(&[30, 45, 75]), 15);
        assert_eq!(gcd_all(&[0, 0]), 0, "all-zero weights have no divisor");
        assert_eq!(gcd_all(&[]), 0);
        assert_eq!(gcd_all(&[7]), 7);
    }

    #[test]
    fn forwarded_for_appends_client_ip() {
        let peer: SocketAddr = "10.1.2.3:55000".parse().expect("addr");
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, Some(peer));
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3");

        append_forwarded_for(&mut headers, Some(peer));
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3, 10.1.2.3");

        let mut untouched = HeaderMap::new();
        append_forwarded_for(&mut untouched, None);
        assert!(untouched.get("x-forwarded-for").is_none());
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_headers(&mut headers);
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::ACCEPT).is_some());
    }
}
