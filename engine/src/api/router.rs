use crate::api::auth::auth_middleware;
use crate::api::state::ApiState;
use crate::api::{control, dlq, health};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Router, middleware};
use errors::{ApiError, Error, Result};
use log::info;
use tokio::sync::broadcast;

/// Configures and returns the axum router for the control plane.
///
/// # Routes
/// - Public:
///   - `GET /metrics`: Prometheus metrics
///   - `GET /health`: pipeline health snapshot
/// - Protected (requires API key):
///   - `POST /reprocess`: plan or run a corpus reprocess
///   - `GET /reprocess/status`: corpus counters and last run
///   - `GET /status`: per-stage run records
///   - `GET /dlq`: inspect dead-lettered messages
///   - `POST /dlq/redrive`: re-enqueue a dead-lettered message
pub fn router(state: ApiState) -> Router {
    let protected_routes = Router::new()
        .route("/reprocess", post(control::reprocess))
        .route("/reprocess/status", get(control::reprocess_status))
        .route("/status", get(control::pipeline_status))
        .route("/dlq", get(dlq::get_dlq))
        .route("/dlq/redrive", post(dlq::redrive))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health::health_check));

    protected_routes.merge(public_routes).with_state(state)
}

/// Handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<ApiState>) -> String {
    if let Some(handle) = &state.prometheus_handle {
        handle.render()
    } else {
        "Prometheus metrics not available (recorder not initialized)".to_string()
    }
}

/// Bind and serve the control plane until the shutdown signal arrives.
pub async fn serve(
    state: ApiState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::from(ApiError::BindFailed(Box::new(e))))?;
    info!("control plane listening on port {port}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| Error::from(ApiError::ServerFailed(Box::new(e))))
}
