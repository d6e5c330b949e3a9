// Compiled as a library so integration tests can drive the core directly.
pub mod app;
pub mod condition;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod proxy;
pub mod route;
pub mod router;
pub mod store;
pub mod tls;

// Re-export commonly used types for tests and embedders.
pub use app::{Gateway, SwitchoverRequest};
pub use condition::{Condition, Operator};
pub use error::GatewayError;
pub use metrics::{Alert, AlertState, MetricsRepository, RequestMetrics};
pub use route::{Backend, Route, Strategy, Switchover, SwitchoverStatus};
pub use router::Dispatcher;
pub use store::{Metric, MetricStore};
