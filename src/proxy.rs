use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use futures_util::FutureExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::app::Gateway;

/// The client-facing application: every request falls through to the
/// dispatcher, which hands it to the owning route's proxy path.
pub fn proxy_router(gateway: Gateway) -> Router {
    Router::new()
        .fallback(proxy_entry)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn proxy_entry(State(gateway): State<Gateway>, req: Request) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let Some(route) = gateway.lookup(&method, &path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !route.matches_host(req.headers()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    // Top-level guard: a fault inside the handler must not take the
    // gateway down with it.
    match std::panic::AssertUnwindSafe(route.handle(req, peer))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(_) => {
            error!(route = %route.name(), "request handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal gateway error").into_response()
        }
    }
}

/// Serve an application over plain HTTP until shutdown is signalled.
pub async fn serve_http(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    Ok(())
}

/// Serve an application over TLS until shutdown is signalled.
///
/// Each accepted connection is handshaken and driven on its own task; a
/// failed handshake only affects that connection.
pub async fn serve_https(
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    info!("TLS listener ready");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => return Ok(()),
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };

            let service =
                TowerToHyperService::new(app.layer(Extension(ConnectInfo(peer))));
            let io = TokioIo::new(stream);
            if let Err(err) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                debug!(%peer, error = ?err, "TLS connection ended with error");
            }
        });
    }
}
