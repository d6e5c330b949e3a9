use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::condition::Condition;
use crate::config::{AppConfig, BackendConfig, RouteConfig};
use crate::error::{GatewayError, Result};
use crate::metrics::{Alert, MetricsRepository};
use crate::route::{Route, RouteSummary, SwitchoverSummary};
use crate::router::Dispatcher;
use crate::store::{MetricSample, MetricStore};

/// Parameters of a switchover start request.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchoverRequest {
    /// Source backend; defaults to the backend carrying the full weight.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "SwitchoverRequest::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// 0 disables the failure cap.
    #[serde(default)]
    pub allowed_failures: u32,
    #[serde(default = "SwitchoverRequest::default_weight_change")]
    pub weight_change: u8,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "SwitchoverRequest::default_rollback")]
    pub rollback: bool,
}

impl SwitchoverRequest {
    const fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_weight_change() -> u8 {
        10
    }

    const fn default_rollback() -> bool {
        true
    }
}

struct GatewayInner {
    config: Arc<AppConfig>,
    repo: MetricsRepository,
    routes: RwLock<HashMap<String, Route>>,
    dispatcher: RwLock<Dispatcher<Route>>,
    switchover_ids: AtomicU64,
}

/// Shared gateway handle passed to the admin HTTP layer and the proxy
/// listeners.
///
/// Owns the route table, the per-method dispatch tree, the metrics
/// repository and the process-wide switchover ID generator.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = MetricStore::new(config.gateway.retention);
        let repo = MetricsRepository::with_capacity(
            store,
            config.gateway.scrape_interval,
            config.gateway.metrics_channel_capacity,
            config.gateway.scrape_channel_capacity,
        )?;
        Ok(Self {
            inner: Arc::new(GatewayInner {
                config: Arc::new(config),
                repo,
                routes: RwLock::new(HashMap::new()),
                dispatcher: RwLock::new(Dispatcher::new()),
                switchover_ids: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn repo(&self) -> &MetricsRepository {
        &self.inner.repo
    }

    /// Spawn the repository listen loop and apply the configured routes.
    pub async fn start(&self) -> anyhow::Result<()> {
        let repo = self.inner.repo.clone();
        tokio::spawn(async move { repo.listen().await });

        let routes = self.inner.config.routes.clone();
        for route_cfg in routes {
            let name = route_cfg.name.clone();
            self.apply_route(route_cfg)
                .await
                .map_err(|err| anyhow::anyhow!("route {name:?}: {err}"))?;
        }
        Ok(())
    }

    /// Create a route with its backends and register its dispatch handlers.
    pub async fn apply_route(&self, cfg: RouteConfig) -> Result<RouteSummary> {
        {
            let routes = self.inner.routes.read().await;
            if routes.contains_key(&cfg.name) {
                return Err(GatewayError::Conflict(format!(
                    "route {:?} already exists",
                    cfg.name
                )));
            }
        }

        let route = Route::new(&cfg, self.inner.repo.clone())?;
        {
            let mut dispatcher = self.inner.dispatcher.write().await;
            let mut registered: Vec<String> = Vec::new();
            for method in route.methods() {
                match dispatcher.add_handler(method, route.prefix(), route.clone()) {
                    Ok(()) => registered.push(method.clone()),
                    Err(err) => {
                        for method in registered {
                            let _ = dispatcher.remove_handler(&method, route.prefix());
                        }
                        return Err(err);
                    }
                }
            }
        }

        route.start();
        for backend in cfg.backends {
            if let Err(err) = route.add_backend(backend).await {
                self.unregister_route(&route).await;
                route.stop_all().await;
                return Err(err);
            }
        }

        info!(route = %route.name(), prefix = %route.prefix(), "route applied");
        let summary = route.summary().await;
        self.inner
            .routes
            .write()
            .await
            .insert(route.name().to_string(), route);
        Ok(summary)
    }

    pub async fn remove_route(&self, name: &str) -> Result<()> {
        let route = self
            .inner
            .routes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound(format!("route {name:?}")))?;
        self.unregister_route(&route).await;
        route.stop_all().await;
        info!(route = %name, "route removed");
        Ok(())
    }

    async fn unregister_route(&self, route: &Route) {
        let mut dispatcher = self.inner.dispatcher.write().await;
        for method in route.methods() {
            let _ = dispatcher.remove_handler(method, route.prefix());
        }
    }

    pub async fn route(&self, name: &str) -> Result<Route> {
        self.inner
            .routes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("route {name:?}")))
    }

    pub async fn list_routes(&self) -> Vec<RouteSummary> {
        let routes: Vec<Route> = self.inner.routes.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(routes.len());
        for route in routes {
            summaries.push(route.summary().await);
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Dispatch a request to the owning route, honoring the host filter.
    pub async fn lookup(&self, method: &str, path: &str) -> Option<Route> {
        self.inner
            .dispatcher
            .read()
            .await
            .lookup(method, path)
            .cloned()
    }

    pub async fn add_backend(&self, route_name: &str, cfg: BackendConfig) -> Result<Uuid> {
        let route = self.route(route_name).await?;
        route.add_backend(cfg).await
    }

    pub async fn remove_backend(&self, route_name: &str, backend_id: Uuid) -> Result<()> {
        let route = self.route(route_name).await?;
        route.remove_backend(backend_id).await
    }

    pub async fn update_backend_weight(
        &self,
        route_name: &str,
        backend_id: Uuid,
        weight: u8,
    ) -> Result<()> {
        let route = self.route(route_name).await?;
        route.update_backend_weight(backend_id, weight).await
    }

    pub async fn start_switchover(
        &self,
        route_name: &str,
        request: SwitchoverRequest,
    ) -> Result<SwitchoverSummary> {
        let route = self.route(route_name).await?;
        let id = self.inner.switchover_ids.fetch_add(1, Ordering::AcqRel) + 1;
        let switchover = route
            .start_switchover(
                id,
                request.from.as_deref(),
                &request.to,
                request.conditions,
                request.timeout,
                request.allowed_failures,
                request.weight_change,
                request.force,
                request.rollback,
            )
            .await?;
        Ok(switchover.summary())
    }

    pub async fn stop_switchover(&self, route_name: &str) -> Result<SwitchoverSummary> {
        let route = self.route(route_name).await?;
        route
            .remove_switchover()
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("switchover on route {route_name:?}")))
    }

    pub async fn active_alerts(&self) -> HashMap<Uuid, HashMap<String, Alert>> {
        self.inner.repo.active_alerts().await
    }

    pub async fn read_backend_metrics(
        &self,
        backend_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Duration,
    ) -> Result<Vec<MetricSample>> {
        self.inner
            .repo
            .read_backend_windows(backend_id, start, end, granularity)
            .await
    }

    pub async fn read_route_metrics(
        &self,
        route_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Duration,
    ) -> Result<Vec<MetricSample>> {
        // resolve first so unknown routes surface as NotFound
        let route = self.route(route_name).await?;
        self.inner
            .repo
            .read_route_windows(route.name(), start, end, granularity)
            .await
    }

    /// Stop every route and then the repository.
    pub async fn shutdown(&self) {
        let routes: Vec<Route> = self.inner.routes.write().await.drain().map(|(_, r)| r).collect();
        for route in routes {
            self.unregister_route(&route).await;
            route.stop_all().await;
        }
        self.inner.repo.stop().await;
        info!("gateway shut down");
    }
}
