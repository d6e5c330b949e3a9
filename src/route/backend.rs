use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;

use serde::Serialize;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{GatewayError, Result};

/// A versioned upstream of a route.
///
/// Weight and active flag are atomics so the health-check loop and an active
/// switchover can flip them without taking the route's write lock; the
/// distribution vector derived from them is still recomputed under that
/// lock.
#[derive(Debug)]
pub struct Backend {
    pub id: Uuid,
    pub name: String,
    pub addr: Url,
    pub scrape_url: Option<Url>,
    pub healthcheck_url: Option<Url>,
    pub scrape_metrics: Vec<String>,
    pub thresholds: Vec<Condition>,
    weight: AtomicU8,
    active: AtomicBool,
    pub(crate) alert_drain: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub id: Uuid,
    pub name: String,
    pub addr: String,
    pub weight: u8,
    pub active: bool,
}

impl Backend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        addr: Url,
        scrape_url: Option<Url>,
        healthcheck_url: Option<Url>,
        scrape_metrics: Vec<String>,
        thresholds: Vec<Condition>,
        weight: u8,
        active: bool,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "backend name must not be empty".into(),
            ));
        }
        if weight > 100 {
            return Err(GatewayError::ConfigInvalid(format!(
                "backend weight {weight} exceeds 100"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            addr,
            scrape_url,
            healthcheck_url,
            scrape_metrics,
            thresholds,
            weight: AtomicU8::new(weight),
            active: AtomicBool::new(active),
            alert_drain: StdMutex::new(None),
        })
    }

    pub fn weight(&self) -> u8 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn set_weight(&self, weight: u8) {
        self.weight.store(weight.min(100), Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn summary(&self) -> BackendSummary {
        BackendSummary {
            id: self.id,
            name: self.name.clone(),
            addr: self.addr.to_string(),
            weight: self.weight(),
            active: self.is_active(),
        }
    }

    /// Abort the task draining this backend's alert channel, if any.
    pub(crate) fn stop_alert_drain(&self) {
        if let Some(handle) = self
            .alert_drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
