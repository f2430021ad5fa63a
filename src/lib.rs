pub mod crypto;
pub mod db;
pub mod error;
pub mod middleware;
pub mod oauth;
pub mod provision;
pub mod settings;
pub mod state;
pub mod stripe;
pub mod supabase;
pub mod sweeper;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::Request, middleware as axum_middleware, response::Response, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Span};

use state::AppState;
use sweeper::SweeperController;

/// Expired install states are swept on this cadence.
const STATE_GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub async fn run(settings: settings::Settings) -> Result<()> {
    let state = AppState::new(&settings).await?;

    // Background loops: the half-hourly token sweep and the install-state GC.
    let controller = Arc::new(SweeperController::new(
        state.db_pool.clone(),
        state.tokens.clone(),
    ));
    controller.start();
    spawn_state_gc(state.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(oauth::routes::routes())
        .merge(provision::routes::routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                // Request IDs first so the trace layer can see them.
                .layer(axum_middleware::from_fn(middleware::request_id_middleware))
                .layer(
                    TraceLayer::new_for_http()
                        .on_request(|request: &Request, _span: &Span| {
                            tracing::info!(
                                method = %request.method(),
                                path = %request.uri().path(),
                                "request started"
                            );
                        })
                        .on_response(
                            |response: &Response, latency: std::time::Duration, _span: &Span| {
                                let status = response.status();
                                let latency_ms = latency.as_millis();
                                let request_id = response
                                    .headers()
                                    .get("x-request-id")
                                    .and_then(|h| h.to_str().ok());
                                if status.is_server_error() {
                                    tracing::error!(
                                        status = %status,
                                        latency_ms = %latency_ms,
                                        request_id = ?request_id,
                                        "request failed"
                                    );
                                } else if status.is_client_error() {
                                    tracing::warn!(
                                        status = %status,
                                        latency_ms = %latency_ms,
                                        request_id = ?request_id,
                                        "request rejected"
                                    );
                                } else {
                                    tracing::info!(
                                        status = %status,
                                        latency_ms = %latency_ms,
                                        request_id = ?request_id,
                                        "request completed"
                                    );
                                }
                            },
                        ),
                ),
        );

    let addr = format!("{}:{}", settings.host, settings.port);
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shutdown complete");
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

fn spawn_state_gc(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATE_GC_INTERVAL);
        loop {
            ticker.tick().await;
            match db::oauth_states::purge_expired(&state.db_pool).await {
                Ok(purged) if purged > 0 => {
                    tracing::debug!(purged, "purged expired install states");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = ?e, "install-state purge failed"),
            }
        }
    });
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
