use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;
use veer::condition::Condition;
use veer::metrics::MetricsRepository;
use veer::store::MetricStore;
use veer::GatewayError;

fn repo() -> MetricsRepository {
    let store = MetricStore::new(Duration::from_secs(300));
    MetricsRepository::new(store, Duration::from_secs(60)).expect("repository")
}

#[tokio::test]
async fn rates_divide_by_total_responses() {
    let repo = repo();
    let backend = Uuid::new_v4();

    // statuses 200, 201, 503 at t, t+1, t+2
    for status in [200, 201, 503] {
        repo.store()
            .write("api", backend, None, 5_000, 100, status)
            .await;
    }

    let now = Utc::now();
    let rates = repo
        .read_rates_of_backend(backend, now - chrono::Duration::seconds(10), now)
        .await
        .expect("rates");

    assert!(
        (rates["2xxRate"] - 2.0 / 3.0).abs() < 1e-9,
        "expected 0.667, got {}",
        rates["2xxRate"]
    );
    assert!((rates["5xxRate"] - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(rates["3xxRate"], 0.0);
    assert_eq!(rates["6xxRate"], 0.0);
}

#[tokio::test]
async fn empty_window_rates_are_all_zero() {
    let repo = repo();
    let now = Utc::now();
    let rates = repo
        .read_rates_of_backend(Uuid::new_v4(), now - chrono::Duration::seconds(10), now)
        .await
        .expect("rates never fail on an empty window");
    for key in ["2xxRate", "3xxRate", "4xxRate", "5xxRate", "6xxRate"] {
        assert_eq!(rates[key], 0.0, "{key} must be zero with no writes");
    }
    assert_eq!(rates["ResponseTime"], 0.0);
    assert_eq!(rates["ContentLength"], 0.0);
}

#[tokio::test]
async fn custom_scrape_values_flow_into_rates() {
    let repo = repo();
    let backend = Uuid::new_v4();
    let custom: std::collections::HashMap<String, f64> =
        [("queue_depth".to_string(), 7.0)].into();
    repo.store()
        .write("api", backend, Some(custom), 2_000_000, 512, 200)
        .await;

    let now = Utc::now();
    let rates = repo
        .read_rates_of_backend(backend, now - chrono::Duration::seconds(10), now)
        .await
        .expect("rates");
    assert_eq!(rates["queue_depth"], 7.0);
    assert!((rates["ResponseTime"] - 2.0).abs() < 1e-9, "seconds");
    assert_eq!(rates["ContentLength"], 512.0);
}

#[tokio::test]
async fn windowed_reads_validate_granularity() {
    let repo = repo();
    let backend = Uuid::new_v4();
    repo.register_backend("api", backend, None, Vec::new(), Vec::new())
        .await
        .expect("register");
    repo.store().write("api", backend, None, 1_000, 10, 200).await;

    let end = Utc::now();
    let start = end - chrono::Duration::seconds(30);

    // granularity wider than the window is rejected
    let err = repo
        .read_backend_windows(backend, start, end, Duration::from_secs(60))
        .await
        .expect_err("granularity must be <= window");
    assert!(matches!(err, GatewayError::ConfigInvalid(_)));

    let samples = repo
        .read_backend_windows(backend, start, end, Duration::from_secs(10))
        .await
        .expect("buckets");
    assert_eq!(samples.len(), 3, "30s window at 10s granularity");
    let total: u64 = samples.iter().map(|s| s.metric.total_responses).sum();
    assert_eq!(total, 1, "the single point lands in exactly one bucket");

    // unknown backend is a NotFound, not a panic
    let err = repo
        .read_backend_windows(Uuid::new_v4(), start, end, Duration::from_secs(10))
        .await
        .expect_err("unknown backend");
    assert!(matches!(err, GatewayError::NotFound(_)));
}

#[tokio::test]
async fn backend_registration_is_conflict_checked() {
    let repo = repo();
    let backend = Uuid::new_v4();
    repo.register_backend("api", backend, None, Vec::new(), Vec::new())
        .await
        .expect("first registration");
    let err = repo
        .register_backend("api", backend, None, Vec::new(), Vec::new())
        .await
        .expect_err("duplicate id");
    assert!(matches!(err, GatewayError::Conflict(_)));

    // removal is effective once and errors afterwards, with no side effects
    repo.remove_backend(backend).await.expect("remove");
    let err = repo.remove_backend(backend).await.expect_err("already gone");
    assert!(matches!(err, GatewayError::NotFound(_)));
}

#[tokio::test]
async fn conditions_with_thresholds_survive_registration() {
    let repo = repo();
    let backend = Uuid::new_v4();
    let condition = Condition::new(
        "5xxRate",
        veer::Operator::Gt,
        0.1,
        Duration::from_secs(30),
    );
    repo.register_backend("api", backend, None, Vec::new(), vec![condition])
        .await
        .expect("register");
    assert!(repo.active_alerts().await[&backend].is_empty());
}
