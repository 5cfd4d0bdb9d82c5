use chrono::{DateTime, Utc};
use errors::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of the pipeline. Each stage has its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Collect,
    Process,
    Markdown,
    Publish,
}

impl Stage {
    /// Pipeline order. Iteration over stages always uses this.
    pub const ALL: [Stage; 4] = [Stage::Collect, Stage::Process, Stage::Markdown, Stage::Publish];

    /// Entry point of the pipeline; reprocessing enqueues here.
    pub fn first() -> Stage {
        Stage::Collect
    }

    /// The stage a successful handler output flows into, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Collect => Some(Stage::Process),
            Stage::Process => Some(Stage::Markdown),
            Stage::Markdown => Some(Stage::Publish),
            Stage::Publish => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Process => "process",
            Stage::Markdown => "markdown",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collect" => Ok(Stage::Collect),
            "process" => Ok(Stage::Process),
            "markdown" => Ok(Stage::Markdown),
            "publish" => Ok(Stage::Publish),
            other => Err(Error::config_invalid(format!("unknown stage: {other}"))),
        }
    }
}

/// Wire message. Payload content stays external; the message only carries a
/// pointer to it. `dequeue_count` is owned by the broker and bumped on every
/// lease, never by anything downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMessage {
    pub stage: Stage,
    pub payload_ref: String,
    pub correlation_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub dequeue_count: u32,
}

impl StageMessage {
    pub fn new(
        stage: Stage,
        payload_ref: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            payload_ref: payload_ref.into(),
            correlation_id: correlation_id.into(),
            enqueued_at: Utc::now(),
            dequeue_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain_order() {
        assert_eq!(Stage::first(), Stage::Collect);
        assert_eq!(Stage::Collect.next(), Some(Stage::Process));
        assert_eq!(Stage::Process.next(), Some(Stage::Markdown));
        assert_eq!(Stage::Markdown.next(), Some(Stage::Publish));
        assert_eq!(Stage::Publish.next(), None);
    }

    #[test]
    fn test_stage_parse_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("render".parse::<Stage>().is_err());
    }

    #[test]
    fn test_wire_format() {
        let msg = StageMessage::new(Stage::Process, "blob/2024/item-17.json", "corr-17");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["stage"], "process");
        assert_eq!(json["payload_ref"], "blob/2024/item-17.json");
        assert_eq!(json["correlation_id"], "corr-17");
        assert_eq!(json["dequeue_count"], 0);
        // chrono's serde impl emits RFC 3339
        assert!(json["enqueued_at"].as_str().unwrap().contains('T'));

        let back: StageMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
