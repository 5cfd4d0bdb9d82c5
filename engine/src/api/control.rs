use crate::api::state::ApiState;
use axum::{Json, extract::State};
use common::model::{ReprocessMode, Stage, StageRunRecord};
use log::error;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Deserialize)]
pub struct ReprocessRequest {
    #[serde(default)]
    pub dry_run: bool,
    pub max_items: Option<usize>,
}

/// Handler for `POST /reprocess`.
///
/// Faults are reported inside the envelope (`{status: "error", message}`)
/// rather than as bare HTTP errors, so operators always get structured JSON.
pub async fn reprocess(
    State(state): State<ApiState>,
    Json(request): Json<ReprocessRequest>,
) -> Json<Value> {
    if request.dry_run {
        match state.coordinator.plan(request.max_items).await {
            Ok(plan) => Json(json!({
                "status": "ok",
                "mode": ReprocessMode::DryRun,
                "collections_planned": plan.item_count,
                "estimated_cost": plan.estimated_cost,
                "estimated_time_seconds": plan.estimated_time_seconds,
            })),
            Err(e) => {
                error!("reprocess dry run failed: {e}");
                Json(json!({"status": "error", "message": e.to_string()}))
            }
        }
    } else {
        match state.coordinator.execute(request.max_items).await {
            Ok(outcome) => {
                let status = if outcome.failure.is_some() {
                    "partial"
                } else {
                    "ok"
                };
                Json(json!({
                    "status": status,
                    "mode": ReprocessMode::Execute,
                    "collections_planned": outcome.planned,
                    "collections_queued": outcome.queued,
                    "estimated_cost": outcome.estimated_cost,
                    "message": outcome.failure,
                }))
            }
            Err(e) => {
                error!("reprocess run failed: {e}");
                Json(json!({"status": "error", "message": e.to_string()}))
            }
        }
    }
}

/// Handler for `GET /reprocess/status`.
pub async fn reprocess_status(State(state): State<ApiState>) -> Json<Value> {
    let queue_depth = match state.broker.depth(Stage::first()).await {
        Ok(d) => d,
        Err(e) => {
            error!("reprocess status: depth failed: {e}");
            return Json(json!({"status": "error", "message": e.to_string()}));
        }
    };
    match state.coordinator.status().await {
        Ok(status) => Json(json!({
            "status": "ok",
            "queue_depth": queue_depth,
            "collected_items": status.total,
            "processed_items": status.completed,
            "pending_items": status.pending,
            "last_outcome": status.last_outcome,
        })),
        Err(e) => {
            error!("reprocess status failed: {e}");
            Json(json!({"status": "error", "message": e.to_string()}))
        }
    }
}

/// Handler for `GET /status`: the controller's per-stage run records.
pub async fn pipeline_status(State(state): State<ApiState>) -> Json<Vec<StageRunRecord>> {
    let records = state.records.read().await;
    let mut stages: Vec<StageRunRecord> = Stage::ALL
        .into_iter()
        .filter_map(|s| records.get(&s).cloned())
        .collect();
    if stages.is_empty() {
        stages = Stage::ALL.into_iter().map(StageRunRecord::new).collect();
    }
    Json(stages)
}
