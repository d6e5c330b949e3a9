use std::collections::HashMap;
use std::time::Duration;

use axum::http::HeaderMap;
use veer::config::{BackendConfig, RouteConfig};
use veer::metrics::MetricsRepository;
use veer::route::{Route, Strategy};
use veer::store::MetricStore;

fn repo() -> MetricsRepository {
    let store = MetricStore::new(Duration::from_secs(60));
    MetricsRepository::new(store, Duration::from_secs(60)).expect("repository")
}

fn route_config(name: &str, strategy: Strategy) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        prefix: "/api/".to_string(),
        methods: vec!["GET".to_string()],
        host: None,
        rewrite: None,
        strategy,
        health_check: false,
        health_check_interval: Duration::from_millis(50),
        monitoring_interval: Duration::from_millis(50),
        scrape_interval: Duration::from_secs(5),
        timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
        cookie_ttl: Duration::from_secs(60),
        backends: Vec::new(),
    }
}

fn backend_config(name: &str, weight: u8) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        addr: "http://127.0.0.1:9".parse().expect("url"),
        scrape_url: None,
        healthcheck_url: None,
        scrape_metrics: Vec::new(),
        thresholds: Vec::new(),
        weight,
    }
}

#[tokio::test]
async fn distribution_vector_reduces_by_gcd() {
    let route = Route::new(&route_config("api", Strategy::Random), repo()).expect("route");
    route.add_backend(backend_config("a", 80)).await.expect("a");
    route.add_backend(backend_config("b", 20)).await.expect("b");

    let names = route.distribution_names().await;
    assert_eq!(names.len(), 5, "80/20 reduces to 4+1 slots: {names:?}");
    assert_eq!(names.iter().filter(|n| *n == "a").count(), 4);
    assert_eq!(names.iter().filter(|n| *n == "b").count(), 1);
}

#[tokio::test]
async fn selection_tracks_weights_statistically() {
    let route = Route::new(&route_config("api", Strategy::Random), repo()).expect("route");
    route.add_backend(backend_config("a", 80)).await.expect("a");
    route.add_backend(backend_config("b", 20)).await.expect("b");

    let headers = HeaderMap::new();
    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..10_000 {
        let (backend, _) = route.select_backend(&headers).await.expect("selection");
        *counts.entry(backend.name.clone()).or_default() += 1;
    }

    let a = f64::from(counts["a"]);
    let b = f64::from(counts["b"]);
    let ratio = a / b;
    assert!(
        (3.5..=4.5).contains(&ratio),
        "expected a/b near 4.0, got {ratio} ({counts:?})"
    );
}

#[tokio::test]
async fn inactive_backends_are_never_selected() {
    let route = Route::new(&route_config("api", Strategy::Random), repo()).expect("route");
    route.add_backend(backend_config("a", 80)).await.expect("a");
    route.add_backend(backend_config("b", 20)).await.expect("b");

    let b = route.backend_by_name("b").await.expect("backend b");
    b.set_active(false);
    route.update_weights().await;

    let headers = HeaderMap::new();
    for _ in 0..1_000 {
        let (backend, _) = route.select_backend(&headers).await.expect("selection");
        assert_eq!(backend.name, "a", "inactive backend must not be drawn");
    }

    let a = route.backend_by_name("a").await.expect("backend a");
    a.set_active(false);
    route.update_weights().await;
    assert!(route.distribution_names().await.is_empty());
    assert!(
        route.select_backend(&headers).await.is_err(),
        "selection with no active backend must fail"
    );
}

#[tokio::test]
async fn add_then_remove_restores_distribution() {
    let route = Route::new(&route_config("api", Strategy::Random), repo()).expect("route");
    route.add_backend(backend_config("a", 80)).await.expect("a");
    route.add_backend(backend_config("b", 20)).await.expect("b");

    let mut before = route.distribution_names().await;
    before.sort();

    let c = route.add_backend(backend_config("c", 50)).await.expect("c");
    assert_ne!(route.distribution_names().await.len(), before.len());

    route.remove_backend(c).await.expect("remove c");
    let mut after = route.distribution_names().await;
    after.sort();
    assert_eq!(before, after, "removal must restore the previous vector");
}

#[tokio::test]
async fn round_robin_cycles_the_vector() {
    let route = Route::new(&route_config("api", Strategy::RoundRobin), repo()).expect("route");
    route.add_backend(backend_config("a", 50)).await.expect("a");
    route.add_backend(backend_config("b", 50)).await.expect("b");

    let headers = HeaderMap::new();
    let mut seen = Vec::new();
    for _ in 0..4 {
        let (backend, _) = route.select_backend(&headers).await.expect("selection");
        seen.push(backend.name.clone());
    }
    assert_ne!(seen[0], seen[1], "equal weights alternate");
    assert_eq!(seen[0], seen[2]);
    assert_eq!(seen[1], seen[3]);
}

#[tokio::test]
async fn sticky_pins_by_cookie_while_backend_is_active() {
    let route = Route::new(&route_config("api", Strategy::Sticky), repo()).expect("route");
    route.add_backend(backend_config("a", 50)).await.expect("a");
    route.add_backend(backend_config("b", 50)).await.expect("b");

    let (first, cookie) = route.select_backend(&HeaderMap::new()).await.expect("draw");
    let cookie = cookie.expect("first draw sets the session cookie");
    assert!(cookie.starts_with("api_sticky="));

    let mut headers = HeaderMap::new();
    let pair = cookie.split(';').next().expect("cookie pair");
    headers.insert(axum::http::header::COOKIE, pair.parse().expect("header"));

    for _ in 0..50 {
        let (pinned, set_cookie) = route.select_backend(&headers).await.expect("pinned");
        assert_eq!(pinned.id, first.id, "cookie pins while backend is active");
        assert!(set_cookie.is_none(), "no re-draw, no new cookie");
    }

    first.set_active(false);
    route.update_weights().await;
    let (fallback, set_cookie) = route.select_backend(&headers).await.expect("re-draw");
    assert_ne!(fallback.id, first.id, "inactive pin forces a re-draw");
    assert!(set_cookie.is_some(), "re-draw overwrites the cookie");
}

#[tokio::test]
async fn slippery_redraws_every_request() {
    let route = Route::new(&route_config("api", Strategy::Slippery), repo()).expect("route");
    route.add_backend(backend_config("a", 50)).await.expect("a");
    route.add_backend(backend_config("b", 50)).await.expect("b");

    let (first, _) = route.select_backend(&HeaderMap::new()).await.expect("draw");
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::COOKIE,
        format!("api_sticky={}", first.id).parse().expect("header"),
    );

    let mut saw_other = false;
    for _ in 0..200 {
        let (backend, set_cookie) = route.select_backend(&headers).await.expect("draw");
        assert!(set_cookie.is_some(), "slippery always refreshes the cookie");
        if backend.id != first.id {
            saw_other = true;
            break;
        }
    }
    assert!(saw_other, "slippery must ignore the cookie for selection");
}

#[tokio::test]
async fn duplicate_backend_names_conflict() {
    let route = Route::new(&route_config("api", Strategy::Random), repo()).expect("route");
    route.add_backend(backend_config("a", 50)).await.expect("a");
    let err = route
        .add_backend(backend_config("a", 50))
        .await
        .expect_err("duplicate name");
    assert!(matches!(err, veer::GatewayError::Conflict(_)));
}
