use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::condition::Condition;
use crate::route::Strategy;

const DEFAULT_CONFIG_PATH: &str = "/config/veer.yaml";

/// Top-level configuration for the gateway process.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Listener and repository settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "GatewayConfig::default_proxy_bind")]
    pub proxy_bind: String,
    #[serde(default)]
    pub proxy_tls_bind: Option<String>,
    #[serde(default = "GatewayConfig::default_admin_bind")]
    pub admin_bind: String,
    #[serde(default)]
    pub admin_tls_bind: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Cadence of the scrape dispatcher.
    #[serde(
        default = "GatewayConfig::default_scrape_interval",
        with = "humantime_serde"
    )]
    pub scrape_interval: Duration,
    /// How long measurement points stay in the metric store.
    #[serde(default = "GatewayConfig::default_retention", with = "humantime_serde")]
    pub retention: Duration,
    /// Raise when request volume outruns the listen loop.
    #[serde(default = "GatewayConfig::default_metrics_channel_capacity")]
    pub metrics_channel_capacity: usize,
    #[serde(default = "GatewayConfig::default_scrape_channel_capacity")]
    pub scrape_channel_capacity: usize,
}

impl GatewayConfig {
    fn default_proxy_bind() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_admin_bind() -> String {
        "0.0.0.0:8081".to_string()
    }

    const fn default_scrape_interval() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_retention() -> Duration {
        Duration::from_secs(3600)
    }

    const fn default_metrics_channel_capacity() -> usize {
        crate::metrics::METRICS_CHANNEL_CAPACITY
    }

    const fn default_scrape_channel_capacity() -> usize {
        crate::metrics::SCRAPE_CHANNEL_CAPACITY
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_bind: Self::default_proxy_bind(),
            proxy_tls_bind: None,
            admin_bind: Self::default_admin_bind(),
            admin_tls_bind: None,
            tls: None,
            scrape_interval: Self::default_scrape_interval(),
            retention: Self::default_retention(),
            metrics_channel_capacity: Self::default_metrics_channel_capacity(),
            scrape_channel_capacity: Self::default_scrape_channel_capacity(),
        }
    }
}

/// Certificate material for the optional HTTPS listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// One named route and its backends.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub prefix: String,
    #[serde(default = "RouteConfig::default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default = "RouteConfig::default_strategy")]
    pub strategy: Strategy,
    #[serde(default = "RouteConfig::default_health_check")]
    pub health_check: bool,
    #[serde(
        default = "RouteConfig::default_health_check_interval",
        with = "humantime_serde"
    )]
    pub health_check_interval: Duration,
    #[serde(
        default = "RouteConfig::default_monitoring_interval",
        with = "humantime_serde"
    )]
    pub monitoring_interval: Duration,
    #[serde(
        default = "RouteConfig::default_scrape_interval",
        with = "humantime_serde"
    )]
    pub scrape_interval: Duration,
    #[serde(default = "RouteConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "RouteConfig::default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "RouteConfig::default_cookie_ttl", with = "humantime_serde")]
    pub cookie_ttl: Duration,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl RouteConfig {
    fn default_methods() -> Vec<String> {
        vec!["GET".to_string()]
    }

    const fn default_strategy() -> Strategy {
        Strategy::Random
    }

    const fn default_health_check() -> bool {
        true
    }

    const fn default_health_check_interval() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_monitoring_interval() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_scrape_interval() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_idle_timeout() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_cookie_ttl() -> Duration {
        Duration::from_secs(300)
    }
}

/// One versioned upstream of a route.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub addr: Url,
    #[serde(default)]
    pub scrape_url: Option<Url>,
    #[serde(default)]
    pub healthcheck_url: Option<Url>,
    #[serde(default)]
    pub scrape_metrics: Vec<String>,
    #[serde(default)]
    pub thresholds: Vec<Condition>,
    #[serde(default = "BackendConfig::default_weight")]
    pub weight: u8,
}

impl BackendConfig {
    const fn default_weight() -> u8 {
        100
    }
}

/// Load configuration from a YAML file, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("VEER_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(bind) = env::var("VEER_PROXY_BIND") {
        if !bind.is_empty() {
            config.gateway.proxy_bind = bind;
        }
    }
    if let Ok(bind) = env::var("VEER_ADMIN_BIND") {
        if !bind.is_empty() {
            config.gateway.admin_bind = bind;
        }
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    let mut names = std::collections::HashSet::new();
    for route in &config.routes {
        if route.name.is_empty() {
            bail!("route names must not be empty");
        }
        if !names.insert(route.name.as_str()) {
            bail!("route name {:?} is used more than once", route.name);
        }
        if !route.prefix.starts_with('/') {
            bail!(
                "route {:?}: prefix {:?} must start with '/'",
                route.name,
                route.prefix
            );
        }
        if route.methods.is_empty() {
            bail!("route {:?}: at least one method is required", route.name);
        }
        if route.health_check && route.health_check_interval.is_zero() {
            bail!(
                "route {:?}: health_check_interval must be positive when health checks are enabled",
                route.name
            );
        }
        for backend in &route.backends {
            if backend.weight > 100 {
                bail!(
                    "route {:?}: backend {:?} weight {} exceeds 100",
                    route.name,
                    backend.name,
                    backend.weight
                );
            }
        }
    }
    if (config.gateway.proxy_tls_bind.is_some() || config.gateway.admin_tls_bind.is_some())
        && config.gateway.tls.is_none()
    {
        bail!("TLS listeners are configured but gateway.tls cert/key paths are missing");
    }
    Ok(())
}
