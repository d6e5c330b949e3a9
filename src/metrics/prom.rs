use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use uuid::Uuid;

// Smoothing factor of the rolling per-backend averages.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, Default)]
struct Rolling {
    response_time: f64,
    content_length: f64,
    primed: bool,
}

impl Rolling {
    fn feed(&mut self, response_time: f64, content_length: f64) {
        if self.primed {
            self.response_time += EWMA_ALPHA * (response_time - self.response_time);
            self.content_length += EWMA_ALPHA * (content_length - self.content_length);
        } else {
            self.response_time = response_time;
            self.content_length = content_length;
            self.primed = true;
        }
    }
}

/// Prometheus families exposed on the admin scrape endpoint.
///
/// Write-only from the core: the listen loop feeds it one update per
/// measurement, the admin HTTP layer encodes the registry.
pub struct PromAdapter {
    registry: Registry,
    total_requests: IntCounterVec,
    avg_response_time: GaugeVec,
    avg_content_length: GaugeVec,
    rolling: Mutex<HashMap<(String, Uuid), Rolling>>,
}

impl PromAdapter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("veer".into()), None)?;

        let total_requests = IntCounterVec::new(
            Opts::new("total_http_requests", "Total proxied HTTP requests"),
            &["route", "backend", "code", "method"],
        )?;
        registry.register(Box::new(total_requests.clone()))?;

        let avg_response_time = GaugeVec::new(
            Opts::new(
                "avg_response_time_seconds",
                "Smoothed upstream response time per backend",
            ),
            &["route", "backend"],
        )?;
        registry.register(Box::new(avg_response_time.clone()))?;

        let avg_content_length = GaugeVec::new(
            Opts::new(
                "avg_content_length_bytes",
                "Smoothed response content length per backend",
            ),
            &["route", "backend"],
        )?;
        registry.register(Box::new(avg_content_length.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            avg_response_time,
            avg_content_length,
            rolling: Mutex::new(HashMap::new()),
        })
    }

    /// Record one measurement: bump the request counter and refresh the
    /// smoothed gauges for the `(route, backend)` pair.
    pub fn update(
        &self,
        response_time: f64,
        content_length: f64,
        status: u16,
        method: &str,
        route: &str,
        backend_id: Uuid,
    ) {
        let backend = backend_id.to_string();
        let code = status.to_string();
        self.total_requests
            .with_label_values(&[route, backend.as_str(), code.as_str(), method])
            .inc();

        let (rt, cl) = {
            let mut rolling = self.rolling.lock().unwrap_or_else(|e| e.into_inner());
            let entry = rolling
                .entry((route.to_string(), backend_id))
                .or_default();
            entry.feed(response_time, content_length);
            (entry.response_time, entry.content_length)
        };

        self.avg_response_time
            .with_label_values(&[route, backend.as_str()])
            .set(rt);
        self.avg_content_length
            .with_label_values(&[route, backend.as_str()])
            .set(cl);
    }

    pub fn avg_response_time(&self, route: &str, backend_id: Uuid) -> f64 {
        let rolling = self.rolling.lock().unwrap_or_else(|e| e.into_inner());
        rolling
            .get(&(route.to_string(), backend_id))
            .map(|r| r.response_time)
            .unwrap_or_default()
    }

    pub fn avg_content_length(&self, route: &str, backend_id: Uuid) -> f64 {
        let rolling = self.rolling.lock().unwrap_or_else(|e| e.into_inner());
        rolling
            .get(&(route.to_string(), backend_id))
            .map(|r| r.content_length)
            .unwrap_or_default()
    }

    /// Encode the registry into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
