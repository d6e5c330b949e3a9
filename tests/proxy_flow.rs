use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tower::ServiceExt;
use veer::app::Gateway;
use veer::config::{AppConfig, BackendConfig, RouteConfig};
use veer::proxy;
use veer::route::Strategy;

async fn spawn_upstream() -> (SocketAddr, JoinHandle<()>) {
    let app = Router::new()
        .route("/hello", get(|| async { "hello from upstream" }))
        .route(
            "/teapot",
            get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, handle)
}

fn route_config(name: &str, prefix: &str, addr: SocketAddr, strategy: Strategy) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        prefix: prefix.to_string(),
        methods: vec!["GET".to_string()],
        host: None,
        rewrite: Some("/".to_string()),
        strategy,
        health_check: false,
        health_check_interval: Duration::from_millis(50),
        monitoring_interval: Duration::from_millis(50),
        scrape_interval: Duration::from_secs(5),
        timeout: Duration::from_millis(500),
        idle_timeout: Duration::from_secs(5),
        cookie_ttl: Duration::from_secs(60),
        backends: vec![BackendConfig {
            name: "v1".to_string(),
            addr: format!("http://{addr}").parse().expect("url"),
            scrape_url: None,
            healthcheck_url: None,
            scrape_metrics: Vec::new(),
            thresholds: Vec::new(),
            weight: 100,
        }],
    }
}

async fn gateway() -> Gateway {
    let gateway = Gateway::new(AppConfig::default()).expect("gateway");
    gateway.start().await.expect("start");
    gateway
}

#[tokio::test]
async fn proxied_request_round_trips_and_records_a_measurement() {
    let (addr, upstream) = spawn_upstream().await;
    let gateway = gateway().await;
    gateway
        .apply_route(route_config("api", "/api/", addr, Strategy::Random))
        .await
        .expect("route");
    let app = proxy::proxy_router(gateway.clone());

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/hello")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let server = response
            .headers()
            .get(header::SERVER)
            .and_then(|v| v.to_str().ok())
            .expect("server header");
        assert!(server.starts_with("veer/"), "got {server:?}");

        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body");
        assert_eq!(&body[..], b"hello from upstream");
    }

    // one store point per request, all 2xx
    sleep(Duration::from_millis(200)).await;
    let route = gateway.route("api").await.expect("route");
    let backend = route.backend_by_name("v1").await.expect("backend");
    let now = Utc::now();
    let metric = gateway
        .repo()
        .store()
        .read_backend(backend.id, now - chrono::Duration::seconds(10), now)
        .await
        .expect("read");
    assert_eq!(metric.total_responses, 5);
    assert_eq!(metric.response_status_2xx, 5);
    assert!(
        metric.content_length > 0.0,
        "measurement carries the bytes actually written"
    );

    let rates = gateway
        .repo()
        .read_rates_of_backend(backend.id, now - chrono::Duration::seconds(10), now)
        .await
        .expect("rates");
    assert_eq!(rates["2xxRate"], 1.0);

    upstream.abort();
}

#[tokio::test]
async fn upstream_status_is_relayed_verbatim() {
    let (addr, upstream) = spawn_upstream().await;
    let gateway = gateway().await;
    gateway
        .apply_route(route_config("api", "/api/", addr, Strategy::Random))
        .await
        .expect("route");
    let app = proxy::proxy_router(gateway.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/teapot")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    upstream.abort();
}

#[tokio::test]
async fn unmatched_method_or_path_is_not_found() {
    let (addr, upstream) = spawn_upstream().await;
    let gateway = gateway().await;
    gateway
        .apply_route(route_config("api", "/api/", addr, Strategy::Random))
        .await
        .expect("route");
    let app = proxy::proxy_router(gateway.clone());

    let wrong_method = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/hello")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(wrong_method.status(), StatusCode::NOT_FOUND);

    let wrong_path = app
        .oneshot(
            Request::builder()
                .uri("/other/hello")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(wrong_path.status(), StatusCode::NOT_FOUND);
    upstream.abort();
}

#[tokio::test]
async fn dead_upstream_yields_502_and_a_600_measurement() {
    let gateway = gateway().await;
    // nothing listens on this port
    let addr: SocketAddr = "127.0.0.1:9".parse().expect("addr");
    gateway
        .apply_route(route_config("dead", "/dead/", addr, Strategy::Random))
        .await
        .expect("route");
    let app = proxy::proxy_router(gateway.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/dead/x")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    sleep(Duration::from_millis(200)).await;
    let route = gateway.route("dead").await.expect("route");
    let backend = route.backend_by_name("v1").await.expect("backend");
    let now = Utc::now();
    let rates = gateway
        .repo()
        .read_rates_of_backend(backend.id, now - chrono::Duration::seconds(10), now)
        .await
        .expect("rates");
    assert_eq!(rates["6xxRate"], 1.0, "connection failure lands in 6xx");
}

#[tokio::test]
async fn host_filter_gates_dispatch() {
    let (addr, upstream) = spawn_upstream().await;
    let gateway = gateway().await;
    let mut cfg = route_config("api", "/api/", addr, Strategy::Random);
    cfg.host = Some("api.example.com".to_string());
    gateway.apply_route(cfg).await.expect("route");
    let app = proxy::proxy_router(gateway.clone());

    let wrong_host = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/hello")
                .header(header::HOST, "other.example.com")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(wrong_host.status(), StatusCode::NOT_FOUND);

    let matching = app
        .oneshot(
            Request::builder()
                .uri("/api/hello")
                .header(header::HOST, "api.example.com")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(matching.status(), StatusCode::OK);
    upstream.abort();
}

#[tokio::test]
async fn sticky_strategy_sets_the_session_cookie() {
    let (addr, upstream) = spawn_upstream().await;
    let gateway = gateway().await;
    gateway
        .apply_route(route_config("api", "/api/", addr, Strategy::Sticky))
        .await
        .expect("route");
    let app = proxy::proxy_router(gateway.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/hello")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("session cookie");
    assert!(cookie.starts_with("api_sticky="), "got {cookie:?}");
    upstream.abort();
}

#[tokio::test]
async fn duplicate_route_prefix_conflicts() {
    let (addr, upstream) = spawn_upstream().await;
    let gateway = gateway().await;
    gateway
        .apply_route(route_config("api", "/api/", addr, Strategy::Random))
        .await
        .expect("first");
    let err = gateway
        .apply_route(route_config("api2", "/api/", addr, Strategy::Random))
        .await
        .expect_err("same method+prefix");
    assert!(matches!(err, veer::GatewayError::Conflict(_)));
    upstream.abort();
}
