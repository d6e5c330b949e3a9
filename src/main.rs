use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use veer::app::Gateway;
use veer::{config, http, proxy, tls};

#[derive(Debug, Parser)]
#[command(author, version, about = "veer — canary API gateway")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env VEER_CONFIG or built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let gateway = Gateway::new(config.clone())?;
    gateway.start().await?;

    let (shutdown_tx, _) = watch::channel(false);
    let admin_app = http::create_router(gateway.clone());
    let proxy_app = proxy::proxy_router(gateway.clone());
    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    let admin_listener = TcpListener::bind(&config.gateway.admin_bind)
        .await
        .context("failed to bind admin listener")?;
    info!("admin API listening on {}", config.gateway.admin_bind);
    servers.push(spawn_server(
        "admin",
        proxy::serve_http(admin_listener, admin_app.clone(), shutdown_tx.subscribe()),
    ));

    let proxy_listener = TcpListener::bind(&config.gateway.proxy_bind)
        .await
        .context("failed to bind proxy listener")?;
    info!("proxy listening on {}", config.gateway.proxy_bind);
    servers.push(spawn_server(
        "proxy",
        proxy::serve_http(proxy_listener, proxy_app.clone(), shutdown_tx.subscribe()),
    ));

    if let Some(tls_cfg) = &config.gateway.tls {
        let server_config = tls::load_server_config(&tls_cfg.cert_path, &tls_cfg.key_path)?;

        if let Some(bind) = &config.gateway.admin_tls_bind {
            let listener = TcpListener::bind(bind)
                .await
                .context("failed to bind admin TLS listener")?;
            info!("admin API (TLS) listening on {bind}");
            servers.push(spawn_server(
                "admin-tls",
                proxy::serve_https(
                    listener,
                    server_config.clone(),
                    admin_app.clone(),
                    shutdown_tx.subscribe(),
                ),
            ));
        }

        if let Some(bind) = &config.gateway.proxy_tls_bind {
            let listener = TcpListener::bind(bind)
                .await
                .context("failed to bind proxy TLS listener")?;
            info!("proxy (TLS) listening on {bind}");
            servers.push(spawn_server(
                "proxy-tls",
                proxy::serve_https(
                    listener,
                    server_config.clone(),
                    proxy_app.clone(),
                    shutdown_tx.subscribe(),
                ),
            ));
        }
    }

    shutdown_signal().await;
    shutdown_tx.send_replace(true);
    gateway.shutdown().await;
    for handle in servers {
        let _ = handle.await;
    }

    Ok(())
}

fn spawn_server(
    name: &'static str,
    server: impl Future<Output = anyhow::Result<()>> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(server = name, error = ?err, "server terminated with error");
        }
    })
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("veer=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = ?err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
