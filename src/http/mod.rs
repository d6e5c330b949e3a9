use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::app::{Gateway, SwitchoverRequest};
use crate::config::{BackendConfig, RouteConfig};
use crate::error::GatewayError;
use crate::metrics::{Alert, MONITORING_GRANULARITY};
use crate::route::{RouteSummary, SwitchoverSummary};
use crate::store::MetricSample;

/// Admin API: route and backend CRUD, switchover control, alert and metric
/// reads, plus health and Prometheus exposition.
pub fn create_router(gateway: Gateway) -> Router {
    let api = Router::new()
        .route("/routes", get(list_routes).post(create_route))
        .route("/routes/:name", get(get_route).delete(delete_route))
        .route("/routes/:name/backends", post(create_backend))
        .route("/routes/:name/backends/:id", delete(delete_backend))
        .route("/routes/:name/backends/:id/weight", put(update_weight))
        .route(
            "/routes/:name/switchover",
            post(start_switchover).delete(stop_switchover),
        )
        .route("/alerts", get(get_alerts))
        .route("/metrics/backends/:id", get(get_backend_metrics))
        .route("/metrics/routes/:name", get(get_route_metrics));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_prometheus))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream(_) | GatewayError::BadResponse(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

async fn get_healthz() -> StatusCode {
    StatusCode::OK
}

async fn get_prometheus(State(gateway): State<Gateway>) -> Response {
    match gateway.repo().prom().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn list_routes(State(gateway): State<Gateway>) -> Json<Vec<RouteSummary>> {
    Json(gateway.list_routes().await)
}

async fn create_route(
    State(gateway): State<Gateway>,
    Json(cfg): Json<RouteConfig>,
) -> Result<(StatusCode, Json<RouteSummary>), ApiError> {
    let summary = gateway.apply_route(cfg).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_route(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
) -> Result<Json<RouteSummary>, ApiError> {
    let route = gateway.route(&name).await?;
    Ok(Json(route.summary().await))
}

async fn delete_route(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    gateway.remove_route(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_backend(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
    Json(cfg): Json<BackendConfig>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id = gateway.add_backend(&name, cfg).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn delete_backend(
    State(gateway): State<Gateway>,
    Path((name, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    gateway.remove_backend(&name, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WeightUpdate {
    weight: u8,
}

async fn update_weight(
    State(gateway): State<Gateway>,
    Path((name, id)): Path<(String, Uuid)>,
    Json(update): Json<WeightUpdate>,
) -> Result<StatusCode, ApiError> {
    gateway
        .update_backend_weight(&name, id, update.weight)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_switchover(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
    Json(request): Json<SwitchoverRequest>,
) -> Result<(StatusCode, Json<SwitchoverSummary>), ApiError> {
    let summary = gateway.start_switchover(&name, request).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn stop_switchover(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
) -> Result<Json<SwitchoverSummary>, ApiError> {
    Ok(Json(gateway.stop_switchover(&name).await?))
}

async fn get_alerts(
    State(gateway): State<Gateway>,
) -> Json<HashMap<Uuid, HashMap<String, Alert>>> {
    Json(gateway.active_alerts().await)
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    #[serde(default, with = "humantime_serde")]
    granularity: Option<Duration>,
}

impl MetricsQuery {
    /// Resolve the window: defaults to the trailing monitoring granularity.
    fn window(&self) -> (DateTime<Utc>, DateTime<Utc>, Duration) {
        let end = self.end.unwrap_or_else(Utc::now);
        let granularity = self.granularity.unwrap_or(Duration::ZERO);
        let default_span = chrono::Duration::from_std(MONITORING_GRANULARITY)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let start = self.start.unwrap_or(end - default_span);
        (start, end, granularity)
    }
}

async fn get_backend_metrics(
    State(gateway): State<Gateway>,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    let (start, end, granularity) = query.window();
    Ok(Json(
        gateway
            .read_backend_metrics(id, start, end, granularity)
            .await?,
    ))
}

async fn get_route_metrics(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    let (start, end, granularity) = query.window();
    Ok(Json(
        gateway
            .read_route_metrics(&name, start, end, granularity)
            .await?,
    ))
}
