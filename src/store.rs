use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregate over the measurement points of one window.
///
/// The five status-class counters always sum to `total_responses`; any
/// status at or above 600, and any status below 200, is accounted to the
/// synthetic 6xx class ("no usable response"). `response_time` and
/// `content_length` are arithmetic means over the window, as are the values
/// in `custom_metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metric {
    pub total_responses: u64,
    pub response_status_2xx: u64,
    pub response_status_3xx: u64,
    pub response_status_4xx: u64,
    pub response_status_5xx: u64,
    pub response_status_6xx: u64,
    pub response_time: f64,
    pub content_length: f64,
    pub custom_metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub ts: DateTime<Utc>,
    pub metric: Metric,
}

#[derive(Debug, Clone)]
struct Point {
    ts: DateTime<Utc>,
    status: u16,
    response_time_us: u64,
    content_length: u64,
    custom: Option<HashMap<String, f64>>,
}

struct Series {
    route: String,
    points: Vec<Point>,
}

struct StoreInner {
    series: RwLock<HashMap<Uuid, Series>>,
    retention: Duration,
    stop: watch::Sender<bool>,
}

/// Time-bucketed store for per-request measurements, keyed by
/// `(route, backend)`.
///
/// The metrics repository is the sole writer; monitor loops, switchovers and
/// the admin API read windows. A background loop prunes points older than
/// the retention horizon until `stop` is called.
#[derive(Clone)]
pub struct MetricStore {
    inner: Arc<StoreInner>,
}

impl MetricStore {
    pub fn new(retention: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        let inner = Arc::new(StoreInner {
            series: RwLock::new(HashMap::new()),
            retention,
            stop,
        });
        tokio::spawn(prune_loop(inner.clone()));
        Self { inner }
    }

    /// Append one measurement point at the current time.
    pub async fn write(
        &self,
        route: &str,
        backend_id: Uuid,
        custom: Option<HashMap<String, f64>>,
        response_time_us: u64,
        content_length: u64,
        status: u16,
    ) {
        let point = Point {
            ts: Utc::now(),
            status,
            response_time_us,
            content_length,
            custom,
        };
        let mut series = self.inner.series.write().await;
        series
            .entry(backend_id)
            .or_insert_with(|| Series {
                route: route.to_string(),
                points: Vec::new(),
            })
            .points
            .push(point);
    }

    /// Aggregate all points of one backend in `[start, end)`.
    ///
    /// A window with no points (or an unknown backend) yields a zero
    /// aggregate; this read never fails.
    pub async fn read_backend(
        &self,
        backend_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Metric> {
        let series = self.inner.series.read().await;
        let points: Vec<&Point> = series
            .get(&backend_id)
            .map(|s| {
                s.points
                    .iter()
                    .filter(|p| p.ts >= start && p.ts < end)
                    .collect()
            })
            .unwrap_or_default();
        Ok(aggregate(&points))
    }

    /// Aggregate across every backend of a route in `[start, end)`.
    pub async fn read_route(
        &self,
        route: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Metric {
        let series = self.inner.series.read().await;
        let points: Vec<&Point> = series
            .values()
            .filter(|s| s.route == route)
            .flat_map(|s| s.points.iter().filter(|p| p.ts >= start && p.ts < end))
            .collect();
        aggregate(&points)
    }

    /// Snapshot the full store as `route -> backend -> samples`.
    pub async fn read_data(&self) -> HashMap<String, HashMap<Uuid, Vec<MetricSample>>> {
        let series = self.inner.series.read().await;
        let mut snapshot: HashMap<String, HashMap<Uuid, Vec<MetricSample>>> = HashMap::new();
        for (backend_id, s) in series.iter() {
            let samples = s
                .points
                .iter()
                .map(|p| MetricSample {
                    ts: p.ts,
                    metric: aggregate(&[p]),
                })
                .collect();
            snapshot
                .entry(s.route.clone())
                .or_default()
                .insert(*backend_id, samples);
        }
        snapshot
    }

    /// Drop every series owned by `backend_id`.
    pub async fn remove_backend(&self, backend_id: Uuid) {
        self.inner.series.write().await.remove(&backend_id);
    }

    /// Halt the background prune loop.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }
}

fn aggregate(points: &[&Point]) -> Metric {
    let mut metric = Metric::default();
    if points.is_empty() {
        return metric;
    }

    let mut response_time_us: u64 = 0;
    let mut content_length: u64 = 0;
    let mut custom_sums: HashMap<String, (f64, u64)> = HashMap::new();

    for point in points {
        metric.total_responses += 1;
        match point.status {
            200..=299 => metric.response_status_2xx += 1,
            300..=399 => metric.response_status_3xx += 1,
            400..=499 => metric.response_status_4xx += 1,
            500..=599 => metric.response_status_5xx += 1,
            _ => metric.response_status_6xx += 1,
        }
        response_time_us += point.response_time_us;
        content_length += point.content_length;
        if let Some(custom) = &point.custom {
            for (name, value) in custom {
                let entry = custom_sums.entry(name.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
    }

    let total = metric.total_responses as f64;
    metric.response_time = response_time_us as f64 / 1_000_000.0 / total;
    metric.content_length = content_length as f64 / total;
    metric.custom_metrics = custom_sums
        .into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect();
    metric
}

async fn prune_loop(inner: Arc<StoreInner>) {
    let mut stop = inner.stop.subscribe();
    let mut ticker = time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                debug!("metric store prune loop stopped");
                return;
            }
        }

        let horizon = Utc::now()
            - chrono::Duration::from_std(inner.retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let mut series = inner.series.write().await;
        for s in series.values_mut() {
            s.points.retain(|p| p.ts >= horizon);
        }
    }
}
