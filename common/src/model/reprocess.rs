use serde::{Deserialize, Serialize};

/// Whether an operator call estimates or enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessMode {
    DryRun,
    Execute,
}

/// A historical item eligible for reprocessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessItem {
    pub id: String,
    pub payload_ref: String,
}

/// Dry-run result: estimates only, nothing was enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessPlan {
    pub mode: ReprocessMode,
    pub item_count: usize,
    pub estimated_cost: f64,
    pub estimated_time_seconds: u64,
    pub items: Vec<ReprocessItem>,
}

/// Execute result. `queued` counts enqueues that succeeded before any
/// failure; already-enqueued messages are never rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessOutcome {
    pub planned: usize,
    pub queued: usize,
    pub estimated_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
