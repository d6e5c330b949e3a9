use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{GatewayError, Result};
use crate::store::{Metric, MetricSample, MetricStore};

pub mod prom;
pub mod scrape;

use prom::PromAdapter;

/// Capacity of the request-measurement channel. Raise it in configuration if
/// the listen loop cannot keep up with request volume.
pub const METRICS_CHANNEL_CAPACITY: usize = 100;
/// Capacity of the scrape-result channel.
pub const SCRAPE_CHANNEL_CAPACITY: usize = 50;
/// Window over which monitor loops derive rates.
pub const MONITORING_GRANULARITY: Duration = Duration::from_secs(10);
/// Capacity of each backend's alert channel.
const ALERT_CHANNEL_CAPACITY: usize = 16;

/// Metric names every backend offers without scrape configuration.
pub const DEFAULT_METRICS: &[&str] = &[
    "ContentLength",
    "ResponseTime",
    "2xxRate",
    "3xxRate",
    "4xxRate",
    "5xxRate",
    "6xxRate",
];

/// One measurement emitted by the proxy path or the health-check loop.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub route: String,
    pub backend_id: Uuid,
    pub response_status: u16,
    pub request_method: String,
    pub content_length: u64,
    pub upstream_response_time_us: u64,
    pub downstream_addr: String,
}

/// The extracted values of one scrape pass over a backend.
#[derive(Debug, Clone)]
pub struct ScrapeSample {
    pub backend_id: Uuid,
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertState {
    Pending,
    Alarming,
    Resolved,
}

/// A threshold violation tracked through `Pending -> Alarming -> Resolved`.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub state: AlertState,
    pub backend_id: Uuid,
    pub metric: String,
    pub threshold: f64,
    pub value: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub send_time: Option<DateTime<Utc>>,
}

struct MonitoredBackend {
    id: Uuid,
    route: String,
    scrape_url: Option<Url>,
    scrape_metrics: Vec<String>,
    thresholds: Vec<Condition>,
    alert_tx: mpsc::Sender<Alert>,
    stop: watch::Sender<bool>,
    active_alerts: Mutex<HashMap<String, Alert>>,
    scrape_buffer: Mutex<Option<HashMap<String, f64>>>,
    scrape_errors: AtomicU32,
}

struct RepoInner {
    store: MetricStore,
    prom: PromAdapter,
    scrape_interval: Duration,
    client: reqwest::Client,
    backends: RwLock<HashMap<Uuid, Arc<MonitoredBackend>>>,
    metrics_tx: mpsc::Sender<RequestMetrics>,
    metrics_rx: StdMutex<Option<mpsc::Receiver<RequestMetrics>>>,
    scrape_tx: mpsc::Sender<ScrapeSample>,
    scrape_rx: StdMutex<Option<mpsc::Receiver<ScrapeSample>>>,
    shutdown: watch::Sender<bool>,
}

/// Fan-in point for request measurements and scrape results.
///
/// Owns the metric store, the Prometheus adapter, the two inbound channels,
/// the scrape dispatcher and one monitor loop per registered backend. The
/// `listen` loop is the store's only writer.
#[derive(Clone)]
pub struct MetricsRepository {
    inner: Arc<RepoInner>,
}

impl MetricsRepository {
    pub fn new(store: MetricStore, scrape_interval: Duration) -> anyhow::Result<Self> {
        Self::with_capacity(
            store,
            scrape_interval,
            METRICS_CHANNEL_CAPACITY,
            SCRAPE_CHANNEL_CAPACITY,
        )
    }

    pub fn with_capacity(
        store: MetricStore,
        scrape_interval: Duration,
        metrics_capacity: usize,
        scrape_capacity: usize,
    ) -> anyhow::Result<Self> {
        let (metrics_tx, metrics_rx) = mpsc::channel(metrics_capacity.max(1));
        let (scrape_tx, scrape_rx) = mpsc::channel(scrape_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        info!("created metrics repository");
        Ok(Self {
            inner: Arc::new(RepoInner {
                store,
                prom: PromAdapter::new()?,
                scrape_interval,
                client,
                backends: RwLock::new(HashMap::new()),
                metrics_tx,
                metrics_rx: StdMutex::new(Some(metrics_rx)),
                scrape_tx,
                scrape_rx: StdMutex::new(Some(scrape_rx)),
                shutdown,
            }),
        })
    }

    /// Handle for emitting measurements into the repository.
    pub fn sender(&self) -> mpsc::Sender<RequestMetrics> {
        self.inner.metrics_tx.clone()
    }

    pub fn prom(&self) -> &PromAdapter {
        &self.inner.prom
    }

    pub fn store(&self) -> &MetricStore {
        &self.inner.store
    }

    /// Register a backend for storage, scraping and monitoring.
    ///
    /// Returns the receive end of the backend's alert channel; the caller
    /// must drain it.
    pub async fn register_backend(
        &self,
        route: &str,
        backend_id: Uuid,
        scrape_url: Option<Url>,
        scrape_metrics: Vec<String>,
        thresholds: Vec<Condition>,
    ) -> Result<mpsc::Receiver<Alert>> {
        let mut backends = self.inner.backends.write().await;
        if backends.contains_key(&backend_id) {
            return Err(GatewayError::Conflict(format!(
                "backend {backend_id} is already registered"
            )));
        }

        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        backends.insert(
            backend_id,
            Arc::new(MonitoredBackend {
                id: backend_id,
                route: route.to_string(),
                scrape_url,
                scrape_metrics,
                thresholds,
                alert_tx,
                stop,
                active_alerts: Mutex::new(HashMap::new()),
                scrape_buffer: Mutex::new(None),
                scrape_errors: AtomicU32::new(0),
            }),
        );
        debug!(route, backend = %backend_id, "registered backend for monitoring");
        Ok(alert_rx)
    }

    /// Cancel a backend's monitor loop and forget its registration.
    ///
    /// Removing an unknown backend reports an error and changes nothing.
    pub async fn remove_backend(&self, backend_id: Uuid) -> Result<()> {
        let mut backends = self.inner.backends.write().await;
        let Some(backend) = backends.get(&backend_id) else {
            return Err(GatewayError::NotFound(format!("backend {backend_id}")));
        };
        // cancel the monitor loop before the delete
        backend.stop.send_replace(true);
        backends.remove(&backend_id);
        drop(backends);
        self.inner.store.remove_backend(backend_id).await;
        warn!(backend = %backend_id, "removed monitored backend");
        Ok(())
    }

    /// Inject an alert directly onto a backend's channel.
    ///
    /// Used by the route health check to synthesize a `Pending` before the
    /// first monitoring window exists.
    pub async fn register_alert(
        &self,
        backend_id: Uuid,
        state: AlertState,
        metric: &str,
        threshold: f64,
        value: f64,
    ) -> Result<()> {
        let backend = self
            .backend(backend_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("backend {backend_id}")))?;

        let alert = Alert {
            state,
            backend_id,
            metric: metric.to_string(),
            threshold,
            value,
            start_time: Utc::now(),
            end_time: None,
            send_time: None,
        };
        backend
            .active_alerts
            .lock()
            .await
            .insert(metric.to_string(), alert.clone());
        let _ = backend.alert_tx.send(alert).await;
        Ok(())
    }

    /// Run the monitor loop of one backend until it is cancelled.
    ///
    /// Every `timeout`, reads the rates of the trailing monitoring window
    /// and walks each threshold condition through the alert lifecycle. The
    /// caller runs this on a dedicated task.
    pub async fn monitor(
        &self,
        backend_id: Uuid,
        timeout: Duration,
        default_active_for: Duration,
    ) -> Result<()> {
        let backend = self
            .backend(backend_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("backend {backend_id}")))?;

        debug!(backend = %backend_id, "starting monitor loop");
        let mut stop = backend.stop.subscribe();
        let mut ticker = time::interval(timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!(backend = %backend_id, "monitor loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            let window = chrono_duration(MONITORING_GRANULARITY);
            let rates = match self
                .read_rates_of_backend(backend_id, now - window, now)
                .await
            {
                Ok(rates) => rates,
                Err(err) => {
                    trace!(backend = %backend_id, error = %err, "no rates for monitoring window");
                    continue;
                }
            };

            let mut alerts = backend.active_alerts.lock().await;
            for condition in &backend.thresholds {
                let is_true = condition.is_true(&rates);
                let value = rates.get(&condition.metric).copied().unwrap_or_default();
                let active_for = if condition.active_for.is_zero() {
                    default_active_for
                } else {
                    condition.active_for
                };
                let active_for = chrono_duration(active_for);

                match alerts.get_mut(&condition.metric) {
                    Some(alert) if is_true => {
                        alert.value = value;
                        alert.end_time = None;
                        if alert.send_time.is_none() && now >= alert.start_time + active_for {
                            alert.state = AlertState::Alarming;
                            alert.send_time = Some(now);
                            let outbound = alert.clone();
                            debug!(backend = %backend_id, metric = %outbound.metric, "alert promoted to alarming");
                            let _ = backend.alert_tx.send(outbound).await;
                        }
                    }
                    Some(alert) => {
                        if alert.end_time.is_none() {
                            alert.end_time = Some(now);
                        }
                        if alert
                            .end_time
                            .map(|end| now >= end + active_for)
                            .unwrap_or(false)
                        {
                            alert.state = AlertState::Resolved;
                            alert.value = value;
                            let outbound = alert.clone();
                            debug!(backend = %backend_id, metric = %outbound.metric, "alert resolved");
                            let _ = backend.alert_tx.send(outbound).await;
                            alerts.remove(&condition.metric);
                        }
                    }
                    None if is_true => {
                        let alert = Alert {
                            state: AlertState::Pending,
                            backend_id,
                            metric: condition.metric.clone(),
                            threshold: condition.threshold,
                            value,
                            start_time: now,
                            end_time: None,
                            send_time: None,
                        };
                        alerts.insert(condition.metric.clone(), alert.clone());
                        debug!(backend = %backend_id, metric = %alert.metric, "new pending alert");
                        let _ = backend.alert_tx.send(alert).await;
                    }
                    None => {}
                }
            }
        }
    }

    /// Consume both inbound channels until shutdown.
    ///
    /// Exactly one instance runs per process. Each request measurement is
    /// forwarded to the Prometheus adapter and written to the store together
    /// with the backend's last-seen scrape values; each scrape sample
    /// replaces that buffer.
    pub async fn listen(&self) {
        let metrics_rx = self
            .inner
            .metrics_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let scrape_rx = self
            .inner
            .scrape_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (Some(mut metrics_rx), Some(mut scrape_rx)) = (metrics_rx, scrape_rx) else {
            warn!("listen called twice; ignoring");
            return;
        };

        tokio::spawn(scrape_loop(self.inner.clone()));

        let mut shutdown = self.inner.shutdown.subscribe();
        info!("metrics repository listening");
        loop {
            tokio::select! {
                Some(measurement) = metrics_rx.recv() => self.ingest(measurement).await,
                Some(sample) = scrape_rx.recv() => self.buffer_scrape(sample).await,
                _ = shutdown.changed() => {
                    info!("metrics repository listen loop stopped");
                    return;
                }
            }
        }
    }

    /// Stop the listen loop, the scrape dispatcher, all monitor loops and
    /// finally the store.
    pub async fn stop(&self) {
        debug!("shutting down metrics repository");
        self.inner.shutdown.send_replace(true);
        let backends = self.inner.backends.read().await;
        for backend in backends.values() {
            backend.stop.send_replace(true);
        }
        self.inner.store.stop();
    }

    /// Flatten the window aggregate of a backend into `metric -> value`.
    ///
    /// Status-class counters become `2xxRate..6xxRate` with floating-point
    /// division by `max(total_responses, 1)`.
    pub async fn read_rates_of_backend(
        &self,
        backend_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let metric = self.inner.store.read_backend(backend_id, start, end).await?;
        Ok(flatten_rates(&metric))
    }

    /// Bucketed backend aggregates for the admin API.
    pub async fn read_backend_windows(
        &self,
        backend_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Duration,
    ) -> Result<Vec<MetricSample>> {
        if self.backend(backend_id).await.is_none() {
            return Err(GatewayError::NotFound(format!("backend {backend_id}")));
        }
        let buckets = bucket_bounds(start, end, granularity)?;
        let mut samples = Vec::with_capacity(buckets.len());
        for (from, to) in buckets {
            let metric = self.inner.store.read_backend(backend_id, from, to).await?;
            samples.push(MetricSample { ts: to, metric });
        }
        Ok(samples)
    }

    /// Bucketed route aggregates for the admin API.
    pub async fn read_route_windows(
        &self,
        route: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Duration,
    ) -> Result<Vec<MetricSample>> {
        let buckets = bucket_bounds(start, end, granularity)?;
        let mut samples = Vec::with_capacity(buckets.len());
        for (from, to) in buckets {
            let metric = self.inner.store.read_route(route, from, to).await;
            samples.push(MetricSample { ts: to, metric });
        }
        Ok(samples)
    }

    /// Snapshot of every backend's currently-active alerts.
    pub async fn active_alerts(&self) -> HashMap<Uuid, HashMap<String, Alert>> {
        let backends = self.inner.backends.read().await;
        let mut snapshot = HashMap::with_capacity(backends.len());
        for (id, backend) in backends.iter() {
            snapshot.insert(*id, backend.active_alerts.lock().await.clone());
        }
        snapshot
    }

    async fn backend(&self, backend_id: Uuid) -> Option<Arc<MonitoredBackend>> {
        self.inner.backends.read().await.get(&backend_id).cloned()
    }

    async fn ingest(&self, m: RequestMetrics) {
        trace!(route = %m.route, backend = %m.backend_id, status = m.response_status, "ingesting measurement");
        let response_time = m.upstream_response_time_us as f64 / 1_000_000.0;
        self.inner.prom.update(
            response_time,
            m.content_length as f64,
            m.response_status,
            &m.request_method,
            &m.route,
            m.backend_id,
        );

        let Some(backend) = self.backend(m.backend_id).await else {
            return;
        };
        let scrape = backend.scrape_buffer.lock().await.clone();
        self.inner
            .store
            .write(
                &m.route,
                m.backend_id,
                scrape,
                m.upstream_response_time_us,
                m.content_length,
                m.response_status,
            )
            .await;
    }

    async fn buffer_scrape(&self, sample: ScrapeSample) {
        if let Some(backend) = self.backend(sample.backend_id).await {
            backend.scrape_buffer.lock().await.replace(sample.metrics);
        }
    }
}

fn flatten_rates(metric: &Metric) -> HashMap<String, f64> {
    let total = metric.total_responses.max(1) as f64;
    let mut rates = HashMap::with_capacity(8 + metric.custom_metrics.len());
    rates.insert("2xxRate".into(), metric.response_status_2xx as f64 / total);
    rates.insert("3xxRate".into(), metric.response_status_3xx as f64 / total);
    rates.insert("4xxRate".into(), metric.response_status_4xx as f64 / total);
    rates.insert("5xxRate".into(), metric.response_status_5xx as f64 / total);
    rates.insert("6xxRate".into(), metric.response_status_6xx as f64 / total);
    rates.insert("ResponseTime".into(), metric.response_time);
    rates.insert("ContentLength".into(), metric.content_length);
    for (name, value) in &metric.custom_metrics {
        rates.insert(name.clone(), *value);
    }
    rates
}

fn bucket_bounds(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: Duration,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let granularity = if granularity.is_zero() {
        MONITORING_GRANULARITY
    } else {
        granularity
    };
    let window = (end - start)
        .to_std()
        .map_err(|_| GatewayError::ConfigInvalid("window end precedes start".into()))?;
    if window < granularity {
        return Err(GatewayError::ConfigInvalid(format!(
            "granularity {granularity:?} must not exceed the window {window:?}"
        )));
    }

    let step = chrono_duration(granularity);
    let steps = (window.as_nanos() / granularity.as_nanos()).max(1) as usize;
    let mut bounds = Vec::with_capacity(steps);
    let mut cursor = start;
    for _ in 0..steps {
        let next = cursor + step;
        bounds.push((cursor, next));
        cursor = next;
    }
    Ok(bounds)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(3600))
}

async fn scrape_loop(inner: Arc<RepoInner>) {
    let mut stop = inner.shutdown.subscribe();
    let mut ticker = time::interval(inner.scrape_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?inner.scrape_interval, "scrape dispatcher started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                debug!("scrape dispatcher stopped");
                return;
            }
        }

        let backends: Vec<Arc<MonitoredBackend>> =
            inner.backends.read().await.values().cloned().collect();
        for backend in backends {
            if backend.scrape_url.is_some() {
                tokio::spawn(scrape_backend(inner.clone(), backend));
            }
        }
    }
}

async fn scrape_backend(inner: Arc<RepoInner>, backend: Arc<MonitoredBackend>) {
    let Some(url) = backend.scrape_url.clone() else {
        return;
    };

    // Back off linearly with the consecutive error count.
    let errors = backend.scrape_errors.load(Ordering::Acquire);
    if errors > 0 {
        time::sleep(Duration::from_secs(u64::from(errors))).await;
    }

    trace!(backend = %backend.id, %url, "scraping backend");
    let response = match inner.client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(err) => {
            backend.scrape_errors.fetch_add(1, Ordering::AcqRel);
            debug!(backend = %backend.id, error = %err, "scrape transport failure");
            return;
        }
    };

    if !response.status().is_success() {
        backend.scrape_errors.fetch_add(1, Ordering::AcqRel);
        debug!(backend = %backend.id, status = %response.status(), "scrape returned non-2xx");
        return;
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            backend.scrape_errors.fetch_add(1, Ordering::AcqRel);
            debug!(backend = %backend.id, error = %err, "scrape body read failed");
            return;
        }
    };

    backend.scrape_errors.store(0, Ordering::Release);
    let metrics = scrape::extract(&body, &backend.scrape_metrics);
    let sample = ScrapeSample {
        backend_id: backend.id,
        metrics,
    };
    if inner.scrape_tx.send(sample).await.is_err() {
        debug!(backend = %backend.id, "scrape channel closed; dropping sample");
    }
}
