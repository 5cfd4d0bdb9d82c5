pub mod memory;
pub mod redis;


pub use crate::memory::MemoryBroker;
pub use crate::redis::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{Stage, StageMessage};
use errors::Result;
use serde::Serialize;
use std::time::Duration;

pub type MessageId = String;

/// A leased message. The holder must `ack`, `release` or `dead_letter` it
/// through the broker; dropping a `Delivery` leaves the lease to expire.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub message: StageMessage,
}

/// Terminal quarantine record for a message that exhausted its retry budget
/// or failed permanently. Never auto-deleted; an operator redrive is the only
/// way back into the live queue.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub message: StageMessage,
    pub failure_reason: String,
    pub attempts: u32,
    pub moved_at: DateTime<Utc>,
}

/// Durable per-stage queue with visibility-timeout leasing.
///
/// Delivery is at-least-once: a lease that expires unacked is handed out
/// again with a bumped `dequeue_count`. Consumers must be idempotent with
/// respect to (correlation_id, payload_ref).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a message, visible to consumers immediately. The broker stamps
    /// `enqueued_at` and starts `dequeue_count` at zero.
    async fn enqueue(
        &self,
        stage: Stage,
        payload_ref: &str,
        correlation_id: &str,
    ) -> Result<MessageId>;

    /// Lease at most one message. The message stays invisible to other
    /// leasers until `visibility_timeout` elapses or it is acked. `None`
    /// means the queue is empty, which is a normal outcome, not an error.
    async fn lease(&self, stage: Stage, visibility_timeout: Duration) -> Result<Option<Delivery>>;

    /// Permanently remove an acked message. Returns `ErrorKind::MessageGone`
    /// when the lease already expired and the message moved on; callers treat
    /// that as duplicate suppression, not a failure.
    async fn ack(&self, stage: Stage, id: &str) -> Result<()>;

    /// Push the lease deadline out for a long-running handler.
    async fn extend_lease(&self, stage: Stage, id: &str, additional: Duration) -> Result<()>;

    /// Abandon a held lease so the message is redeliverable immediately
    /// instead of waiting out the visibility timeout. Used on shutdown.
    async fn release(&self, stage: Stage, id: &str) -> Result<()>;

    /// Approximate queue depth (ready + in-flight). Eventually consistent;
    /// used only for scaling decisions, never for correctness.
    async fn depth(&self, stage: Stage) -> Result<u64>;

    /// Move a held message to the stage's dead-letter store and consume the
    /// lease in one operation, so a crash cannot wedge a message between the
    /// move and the ack.
    async fn dead_letter(&self, stage: Stage, id: &str, reason: &str) -> Result<()>;

    /// Inspect the stage's dead-letter store, newest first.
    async fn dead_letters(&self, stage: Stage, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Operator re-enqueue of a dead-lettered message. Resets
    /// `dequeue_count` to zero and removes the dead-letter entry.
    async fn redrive(&self, stage: Stage, dead_letter_id: &str) -> Result<MessageId>;
}
