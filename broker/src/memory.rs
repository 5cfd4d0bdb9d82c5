use crate::{Broker, DeadLetterEntry, Delivery, MessageId};
use async_trait::async_trait;
use chrono::Utc;
use common::model::{Stage, StageMessage};
use errors::{Error, Result};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct InFlight {
    message: StageMessage,
    deadline: Instant,
}

#[derive(Default)]
struct StageState {
    ready: VecDeque<StageMessage>,
    in_flight: HashMap<MessageId, InFlight>,
    dead: Vec<DeadLetterEntry>,
}

impl StageState {
    /// Move every expired lease back to the front of the ready queue.
    /// Expiry is detected lazily at access time; there is no reaper task.
    /// The stale lease id is forgotten, so a late ack against it reports
    /// the message as gone.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                debug!("lease {id} expired, returning message to ready queue");
                self.ready.push_front(flight.message);
            }
        }
    }
}

/// In-process broker backend. The default for single-node deployments and
/// the backend every test runs against.
///
/// Each lease hands out a fresh lease id (receipt-handle style), so an ack
/// against an expired lease cannot collide with a newer lease of the same
/// message. Bookkeeping lives under one lock; no method awaits while
/// holding it.
#[derive(Default)]
pub struct MemoryBroker {
    stages: Mutex<HashMap<Stage, StageState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stage<T>(&self, stage: Stage, f: impl FnOnce(&mut StageState) -> T) -> T {
        let mut stages = self.stages.lock().expect("broker lock poisoned");
        f(stages.entry(stage).or_default())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        stage: Stage,
        payload_ref: &str,
        correlation_id: &str,
    ) -> Result<MessageId> {
        let id = Uuid::new_v4().to_string();
        let message = StageMessage::new(stage, payload_ref, correlation_id);
        self.with_stage(stage, |state| {
            state.ready.push_back(message);
        });
        Ok(id)
    }

    async fn lease(&self, stage: Stage, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let delivery = self.with_stage(stage, |state| {
            state.reclaim_expired(now);
            let mut message = state.ready.pop_front()?;
            message.dequeue_count += 1;
            let lease_id = Uuid::new_v4().to_string();
            state.in_flight.insert(
                lease_id.clone(),
                InFlight {
                    message: message.clone(),
                    deadline: now + visibility_timeout,
                },
            );
            Some(Delivery {
                id: lease_id,
                message,
            })
        });
        Ok(delivery)
    }

    async fn ack(&self, stage: Stage, id: &str) -> Result<()> {
        self.with_stage(stage, |state| {
            state.reclaim_expired(Instant::now());
            if state.in_flight.remove(id).is_some() {
                Ok(())
            } else {
                Err(Error::message_gone(id))
            }
        })
    }

    async fn extend_lease(&self, stage: Stage, id: &str, additional: Duration) -> Result<()> {
        let now = Instant::now();
        self.with_stage(stage, |state| {
            state.reclaim_expired(now);
            match state.in_flight.get_mut(id) {
                Some(flight) => {
                    flight.deadline = now + additional;
                    Ok(())
                }
                None => Err(Error::message_gone(id)),
            }
        })
    }

    async fn release(&self, stage: Stage, id: &str) -> Result<()> {
        self.with_stage(stage, |state| match state.in_flight.remove(id) {
            Some(flight) => {
                // Front of the queue so redelivery is prompt. The lease-time
                // dequeue_count bump stands.
                state.ready.push_front(flight.message);
                Ok(())
            }
            None => Err(Error::message_gone(id)),
        })
    }

    async fn depth(&self, stage: Stage) -> Result<u64> {
        Ok(self.with_stage(stage, |state| {
            (state.ready.len() + state.in_flight.len()) as u64
        }))
    }

    async fn dead_letter(&self, stage: Stage, id: &str, reason: &str) -> Result<()> {
        self.with_stage(stage, |state| match state.in_flight.remove(id) {
            Some(flight) => {
                let attempts = flight.message.dequeue_count;
                state.dead.push(DeadLetterEntry {
                    id: Uuid::new_v4().to_string(),
                    message: flight.message,
                    failure_reason: reason.to_string(),
                    attempts,
                    moved_at: Utc::now(),
                });
                Ok(())
            }
            None => Err(Error::message_gone(id)),
        })
    }

    async fn dead_letters(&self, stage: Stage, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.with_stage(stage, |state| {
            state.dead.iter().rev().take(limit).cloned().collect()
        }))
    }

    async fn redrive(&self, stage: Stage, dead_letter_id: &str) -> Result<MessageId> {
        self.with_stage(stage, |state| {
            let pos = state
                .dead
                .iter()
                .position(|entry| entry.id == dead_letter_id)
                .ok_or_else(|| Error::message_gone(dead_letter_id))?;
            let entry = state.dead.remove(pos);
            let id = Uuid::new_v4().to_string();
            let mut message = entry.message;
            message.dequeue_count = 0;
            message.enqueued_at = Utc::now();
            state.ready.push_back(message);
            Ok(id)
        })
    }
}
