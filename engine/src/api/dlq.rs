use crate::api::state::ApiState;
use axum::extract::{Query, State};
use axum::Json;
use common::model::Stage;
use log::error;
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;

#[derive(Deserialize)]
pub struct DlqParams {
    pub stage: Option<String>,
    /// Number of entries to retrieve (default: 10)
    pub count: Option<usize>,
}

/// Handler for `GET /dlq`: newest dead-lettered messages for a stage.
pub async fn get_dlq(State(state): State<ApiState>, Query(params): Query<DlqParams>) -> Json<Value> {
    let stage = match parse_stage(params.stage.as_deref()) {
        Ok(s) => s,
        Err(message) => return Json(json!({"status": "error", "message": message})),
    };
    let count = params.count.unwrap_or(10);

    match state.broker.dead_letters(stage, count).await {
        Ok(entries) => Json(json!({"status": "ok", "stage": stage, "entries": entries})),
        Err(e) => {
            error!("dlq read failed for {stage}: {e}");
            Json(json!({"status": "error", "message": e.to_string()}))
        }
    }
}

#[derive(Deserialize)]
pub struct RedriveRequest {
    pub stage: String,
    pub id: String,
}

/// Handler for `POST /dlq/redrive`: re-enqueue one dead-lettered message
/// with a fresh retry budget.
pub async fn redrive(
    State(state): State<ApiState>,
    Json(request): Json<RedriveRequest>,
) -> Json<Value> {
    let stage = match parse_stage(Some(&request.stage)) {
        Ok(s) => s,
        Err(message) => return Json(json!({"status": "error", "message": message})),
    };

    match state.broker.redrive(stage, &request.id).await {
        Ok(message_id) => Json(json!({"status": "ok", "stage": stage, "message_id": message_id})),
        Err(e) => {
            error!("redrive of {} from {stage} failed: {e}", request.id);
            Json(json!({"status": "error", "message": e.to_string()}))
        }
    }
}

fn parse_stage(raw: Option<&str>) -> Result<Stage, String> {
    let raw = raw.unwrap_or_else(|| Stage::first().as_str());
    Stage::from_str(raw).map_err(|_| format!("unknown stage: {raw}"))
}
