#![forbid(unsafe_code)]
//! The HTTP control surface (§6): templates/services CRUD, routing without
//! execution, tool execution, liveness, and an SSE log stream. Everything
//! here composes `gateway-core`/`gateway-store`/`gateway-scheduling`/
//! `gateway-auth`/`gateway-dispatch`/`gateway-bus` rather than reimplements
//! any of them.

mod auth;
mod error;
mod logs;
mod persistence;
mod routes;
mod state;

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

pub use logs::{LogBroadcaster, LogEntry};
pub use persistence::load_templates_dir;
pub use state::AppState;

/// Assembles the router with its middleware stack. Split from [`serve`] so
/// tests can exercise routes directly via `tower::ServiceExt::oneshot`.
pub fn app(state: AppState, request_timeout: Duration) -> Router {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new()),
        )
}

/// Binds `host:port` and serves `app` until a shutdown signal arrives, then
/// waits up to `grace` for in-flight requests to finish (§4.12). If
/// `grace` elapses first, `serve` returns anyway and leaves whatever is
/// still in flight to be cut off — the caller's post-`serve` cleanup
/// (disconnecting pooled adapters, stopping the Event Bus) runs either
/// way.
pub async fn serve(
    host: &str,
    port: u16,
    router: Router,
    grace: Duration,
) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, "gateway listening");

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel();
    let serve_fut = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(signalled_tx));

    tokio::select! {
        result = serve_fut => result,
        _ = bound_by_grace(signalled_rx, grace) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed with requests still in flight");
            Ok(())
        }
    }
}

/// Resolves `grace` after the shutdown signal fires, bounding how long the
/// in-flight-request drain above is allowed to run. Never resolves on the
/// happy path, where `serve_fut` itself finishes draining first.
async fn bound_by_grace(signalled: tokio::sync::oneshot::Receiver<()>, grace: Duration) {
    let _ = signalled.await;
    tokio::time::sleep(grace).await;
}

async fn shutdown_signal(signalled: tokio::sync::oneshot::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }

    tracing::info!("draining in-flight requests");
    let _ = signalled.send(());
}
