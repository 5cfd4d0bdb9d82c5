use crate::api::state::ApiState;
use crate::monitor::HealthSnapshot;
use axum::{Json, extract::State};

/// Handler for `GET /health`: the monitor's latest snapshot. Diagnostic
/// only; scaling decisions never read it.
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    let snapshot = state.snapshot.read().await.clone();
    Json(snapshot)
}
