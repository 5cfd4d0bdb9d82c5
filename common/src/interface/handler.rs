use async_trait::async_trait;
use std::fmt;

/// How a stage handler classifies its failure. Handlers never touch the
/// broker; the worker loop translates these into ack / redeliver /
/// dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    /// Worth retrying: network timeout, upstream 5xx. The message is simply
    /// not acked, so the visibility timeout redelivers it, bounded by the
    /// stage's max_attempts.
    Transient { reason: String },
    /// Not worth retrying: malformed payload, unrecoverable business error.
    /// A permanent failure on the first delivery still gets one redelivery
    /// to tolerate misclassification, unless flagged non_retryable.
    Permanent { reason: String, non_retryable: bool },
}

impl StageFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        StageFailure::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        StageFailure::Permanent {
            reason: reason.into(),
            non_retryable: false,
        }
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        StageFailure::Permanent {
            reason: reason.into(),
            non_retryable: true,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            StageFailure::Transient { reason } | StageFailure::Permanent { reason, .. } => reason,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::Transient { reason } => write!(f, "transient: {reason}"),
            StageFailure::Permanent {
                reason,
                non_retryable,
            } => write!(f, "permanent (non_retryable={non_retryable}): {reason}"),
        }
    }
}

/// Successful handler outcome. `next_payload_ref` is what the worker enqueues
/// into the following stage's queue; `None` ends the chain for this item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub next_payload_ref: Option<String>,
}

impl Completion {
    /// Terminal completion, nothing flows downstream.
    pub fn done() -> Self {
        Self {
            next_payload_ref: None,
        }
    }

    /// Forward an artifact reference to the next stage.
    pub fn forward(next_payload_ref: impl Into<String>) -> Self {
        Self {
            next_payload_ref: Some(next_payload_ref.into()),
        }
    }
}

/// Stage-specific processing logic. Implementations must be idempotent with
/// respect to (correlation_id, payload_ref): at-least-once delivery means a
/// handler can see the same message twice.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(
        &self,
        payload_ref: &str,
        correlation_id: &str,
    ) -> Result<Completion, StageFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons() {
        let t = StageFailure::transient("upstream 503");
        assert_eq!(t.reason(), "upstream 503");

        let p = StageFailure::non_retryable("unsupported content type");
        assert!(matches!(
            p,
            StageFailure::Permanent {
                non_retryable: true,
                ..
            }
        ));
    }

    #[test]
    fn test_completion_forwarding() {
        assert_eq!(Completion::done().next_payload_ref, None);
        assert_eq!(
            Completion::forward("artifacts/item.md").next_payload_ref.as_deref(),
            Some("artifacts/item.md")
        );
    }
}
