use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;
use veer::condition::{Condition, Operator};
use veer::metrics::{AlertState, MetricsRepository};
use veer::store::MetricStore;

const ACTIVE_FOR: Duration = Duration::from_millis(80);
const MONITOR_TICK: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(3);

fn repo() -> MetricsRepository {
    let store = MetricStore::new(Duration::from_secs(300));
    MetricsRepository::new(store, Duration::from_secs(60)).expect("repository")
}

#[tokio::test]
async fn alert_walks_pending_alarming_resolved() {
    let repo = repo();
    let backend = Uuid::new_v4();
    let condition = Condition::new("5xxRate", Operator::Gt, 0.5, ACTIVE_FOR);
    let mut alerts = repo
        .register_backend("api", backend, None, Vec::new(), vec![condition])
        .await
        .expect("register");

    // a window full of 5xx responses keeps the condition true
    for _ in 0..4 {
        repo.store().write("api", backend, None, 1_000, 10, 500).await;
    }

    {
        let repo = repo.clone();
        tokio::spawn(async move {
            let _ = repo.monitor(backend, MONITOR_TICK, ACTIVE_FOR).await;
        });
    }

    let pending = timeout(WAIT, alerts.recv())
        .await
        .expect("pending in time")
        .expect("alert");
    assert_eq!(pending.state, AlertState::Pending);
    assert_eq!(pending.metric, "5xxRate");
    assert!(pending.send_time.is_none());

    let alarming = timeout(WAIT, alerts.recv())
        .await
        .expect("alarming in time")
        .expect("alert");
    assert_eq!(alarming.state, AlertState::Alarming);
    assert!(
        alarming.send_time.is_some(),
        "promotion stamps the send time"
    );
    assert!(
        alarming.send_time.expect("send time") >= alarming.start_time + chrono::Duration::milliseconds(80),
        "promotion only after activeFor of continuous truth"
    );

    // dilute the window with 2xx responses until the rate drops below 0.5
    for _ in 0..60 {
        repo.store().write("api", backend, None, 1_000, 10, 200).await;
    }

    let resolved = timeout(WAIT, alerts.recv())
        .await
        .expect("resolved in time")
        .expect("alert");
    assert_eq!(resolved.state, AlertState::Resolved);

    let active = repo.active_alerts().await;
    assert!(
        active[&backend].is_empty(),
        "resolved alerts leave the active set: {active:?}"
    );

    repo.stop().await;
}

#[tokio::test]
async fn injected_alert_is_visible_and_delivered() {
    let repo = repo();
    let backend = Uuid::new_v4();
    let mut alerts = repo
        .register_backend("api", backend, None, Vec::new(), Vec::new())
        .await
        .expect("register");

    repo.register_alert(backend, AlertState::Pending, "6xxRate", 0.0, 1.0)
        .await
        .expect("inject");

    let delivered = timeout(WAIT, alerts.recv())
        .await
        .expect("delivery in time")
        .expect("alert");
    assert_eq!(delivered.state, AlertState::Pending);
    assert_eq!(delivered.metric, "6xxRate");

    let active = repo.active_alerts().await;
    assert!(active[&backend].contains_key("6xxRate"));
}

#[tokio::test]
async fn monitor_for_unknown_backend_errors() {
    let repo = repo();
    let err = repo
        .monitor(Uuid::new_v4(), MONITOR_TICK, ACTIVE_FOR)
        .await
        .expect_err("unknown backend");
    assert!(matches!(err, veer::GatewayError::NotFound(_)));
}

#[tokio::test]
async fn cancelled_monitor_sends_nothing_further() {
    let repo = repo();
    let backend = Uuid::new_v4();
    let condition = Condition::new("5xxRate", Operator::Gt, 0.5, ACTIVE_FOR);
    let mut alerts = repo
        .register_backend("api", backend, None, Vec::new(), vec![condition])
        .await
        .expect("register");

    for _ in 0..4 {
        repo.store().write("api", backend, None, 1_000, 10, 500).await;
    }
    let monitor = {
        let repo = repo.clone();
        tokio::spawn(async move { repo.monitor(backend, MONITOR_TICK, ACTIVE_FOR).await })
    };

    let pending = timeout(WAIT, alerts.recv())
        .await
        .expect("pending in time")
        .expect("alert");
    assert_eq!(pending.state, AlertState::Pending);

    // removal cancels the monitor loop before the delete
    repo.remove_backend(backend).await.expect("remove");
    let outcome = timeout(WAIT, monitor).await.expect("loop exits in time");
    assert!(outcome.expect("join").is_ok());
}
