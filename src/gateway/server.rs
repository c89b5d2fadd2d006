use crate::gateway::api::{healthz, ingest, method_not_allowed, GatewayState};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ingest", post(ingest).fallback(method_not_allowed))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway on an already-bound listener until `shutdown` fires.
/// In-flight requests are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    info!(addr = %listener.local_addr()?, "Starting ingestion gateway");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Ingestion gateway stopped");
    Ok(())
}
