use crate::model::message::Stage;
use chrono::{DateTime, Utc};
use errors::{Result, ScaleError};
use serde::{Deserialize, Serialize};

/// Scaling policy for one stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleRule {
    /// Floor the stage settles to when its queue drains. May be 0.
    pub min_replicas: usize,
    pub max_replicas: usize,
    /// Backlog one replica is expected to absorb; the controller targets
    /// ceil(depth / queue_length_threshold) replicas.
    pub queue_length_threshold: u64,
    /// Minimum depth that wakes a stage from zero replicas.
    pub activation_threshold: u64,
    /// Minimum gap between a scale action and a later scale-down.
    pub cooldown_seconds: u64,
}

impl ScaleRule {
    pub fn validate(&self, stage: Stage) -> Result<()> {
        let invalid = |reason: &str| {
            Err(ScaleError::InvalidRule {
                stage: stage.to_string(),
                reason: reason.to_string(),
            }
            .into())
        };

        if self.min_replicas > self.max_replicas {
            return invalid("min_replicas must not exceed max_replicas");
        }
        if self.queue_length_threshold == 0 {
            return invalid("queue_length_threshold must be >= 1");
        }
        if self.activation_threshold == 0 {
            // activation_threshold = 0 would wake an empty stage forever
            return invalid("activation_threshold must be >= 1");
        }
        if self.activation_threshold > self.queue_length_threshold {
            return invalid("activation_threshold must not exceed queue_length_threshold");
        }
        Ok(())
    }
}

/// Outcome of one controller poll for one stage. Scale-up always wins over
/// scale-down when both would apply; activation ignores the cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Activate { to: usize },
    ScaleUp { to: usize },
    ScaleDown { to: usize },
}

impl ScaleDecision {
    /// Target replica count, when the decision changes it.
    pub fn target(&self) -> Option<usize> {
        match self {
            ScaleDecision::Hold => None,
            ScaleDecision::Activate { to }
            | ScaleDecision::ScaleUp { to }
            | ScaleDecision::ScaleDown { to } => Some(*to),
        }
    }
}

/// Controller-owned view of one stage. The controller is the only writer;
/// the monitor and the status endpoint read it.
///
/// `last_scale_action_at` moves only when the replica count actually changes
/// (it anchors the scale-down cooldown); `last_polled_at` moves every poll.
#[derive(Debug, Clone, Serialize)]
pub struct StageRunRecord {
    pub stage: Stage,
    pub replica_count: usize,
    pub observed_queue_depth: u64,
    pub last_scale_action_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl StageRunRecord {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            replica_count: 0,
            observed_queue_depth: 0,
            last_scale_action_at: None,
            last_polled_at: None,
        }
    }
}
