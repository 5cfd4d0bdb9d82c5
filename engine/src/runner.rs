use crate::guard::RateGuard;
use broker::{Broker, Delivery};
use common::interface::{StageFailure, StageHandler};
use common::model::Stage;
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// How long a worker sleeps after an empty lease before polling again.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Pause after a broker error before retrying, so a down broker is not
/// hammered in a tight loop.
const BROKER_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// One replica of a stage's worker pool.
///
/// The loop owns every broker interaction; handlers only ever see
/// `(payload_ref, correlation_id)` and report transient or permanent
/// failure. Per message: lease, attempt-cap check, handler with lease
/// heartbeat, then ack / leave-for-redelivery / dead-letter.
pub struct StageWorker {
    stage: Stage,
    replica: usize,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn StageHandler>,
    guard: Option<Arc<RateGuard>>,
    max_attempts: u32,
    visibility_timeout: Duration,
    shutdown_grace: Duration,
    stop_rx: watch::Receiver<bool>,
}

impl StageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stage: Stage,
        replica: usize,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn StageHandler>,
        guard: Option<Arc<RateGuard>>,
        max_attempts: u32,
        visibility_timeout: Duration,
        shutdown_grace: Duration,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stage,
            replica,
            broker,
            handler,
            guard,
            max_attempts,
            visibility_timeout,
            shutdown_grace,
            stop_rx,
        }
    }

    pub async fn run(mut self) {
        info!("worker {}#{} started", self.stage, self.replica);
        gauge!("pipeline_stage_workers", "stage" => self.stage.as_str()).increment(1.0);

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            // A throttled call means the worker holds off before leasing
            // again; redelivery through the broker does the retrying.
            if let Some(delay) = self.guard.as_ref().and_then(|g| g.consume_backoff()) {
                if self.interruptible_sleep(delay).await {
                    break;
                }
                continue;
            }

            match self.broker.lease(self.stage, self.visibility_timeout).await {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    // Empty queue is the normal idle state, not an error.
                    if self.interruptible_sleep(IDLE_POLL).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("worker {}#{}: lease failed: {e}", self.stage, self.replica);
                    if self.interruptible_sleep(BROKER_ERROR_PAUSE).await {
                        break;
                    }
                }
            }
        }

        gauge!("pipeline_stage_workers", "stage" => self.stage.as_str()).decrement(1.0);
        info!("worker {}#{} stopped", self.stage, self.replica);
    }

    /// Sleep that wakes early on the stop signal. Returns true when the
    /// worker should exit.
    async fn interruptible_sleep(&self, duration: Duration) -> bool {
        let mut stop_rx = self.stop_rx.clone();
        let sender_gone = tokio::select! {
            _ = sleep(duration) => false,
            res = stop_rx.changed() => res.is_err(),
        };
        sender_gone || *self.stop_rx.borrow()
    }

    async fn process(&mut self, delivery: Delivery) {
        let stage = self.stage;
        let message = &delivery.message;
        counter!("pipeline_processed_total", "stage" => stage.as_str()).increment(1);

        // Attempt cap first: a message past its retry budget is quarantined
        // before the handler can burn another attempt on it.
        if message.dequeue_count > self.max_attempts {
            let reason = format!(
                "retry budget exhausted ({} deliveries, max {})",
                message.dequeue_count, self.max_attempts
            );
            warn!(
                "{}: dead-lettering {} after {} deliveries",
                stage, message.correlation_id, message.dequeue_count
            );
            self.quarantine(&delivery, &reason).await;
            return;
        }

        let outcome = self.run_handler(&delivery).await;
        let Some(outcome) = outcome else {
            // Lease lost or abandoned during processing; the broker
            // redelivers.
            return;
        };

        match outcome {
            Ok(completion) => {
                // Enqueue downstream before acking: a crash in between
                // yields a duplicate downstream message under at-least-once,
                // never a lost one.
                if let (Some(next), Some(next_ref)) =
                    (stage.next(), completion.next_payload_ref.as_deref())
                {
                    if let Err(e) = self
                        .broker
                        .enqueue(next, next_ref, &message.correlation_id)
                        .await
                    {
                        error!(
                            "{}: enqueue into {next} failed for {}: {e}",
                            stage, message.correlation_id
                        );
                        // Leave unacked so the whole step is redelivered.
                        return;
                    }
                }
                match self.broker.ack(stage, &delivery.id).await {
                    Ok(()) => {
                        counter!("pipeline_acked_total", "stage" => stage.as_str()).increment(1);
                    }
                    Err(e) if e.is_message_gone() => {
                        // Lease expired mid-flight and someone else owns the
                        // message now; our work stands, theirs is the
                        // duplicate the idempotent handlers absorb.
                        debug!("{}: ack after expiry for {}", stage, message.correlation_id);
                    }
                    Err(e) => error!("{}: ack failed for {}: {e}", stage, message.correlation_id),
                }
            }
            Err(StageFailure::Transient { reason }) => {
                debug!(
                    "{}: transient failure for {} (delivery {}): {reason}",
                    stage, message.correlation_id, message.dequeue_count
                );
                // No ack; the visibility timeout redelivers, bounded by the
                // attempt cap.
            }
            Err(StageFailure::Permanent {
                reason,
                non_retryable,
            }) => {
                if !non_retryable && message.dequeue_count <= 1 {
                    // One redelivery even for permanent failures, in case the
                    // handler misclassified a transient fault.
                    debug!(
                        "{}: permanent failure on first delivery of {}, allowing one retry: {reason}",
                        stage, message.correlation_id
                    );
                    return;
                }
                warn!(
                    "{}: dead-lettering {} ({reason})",
                    stage, message.correlation_id
                );
                self.quarantine(&delivery, &reason).await;
            }
        }
    }

    /// Drive the handler future while heartbeating the lease at half the
    /// visibility timeout, and honor shutdown with a grace period followed
    /// by an explicit lease release. Returns `None` when the message was
    /// handed back to the broker.
    async fn run_handler(
        &mut self,
        delivery: &Delivery,
    ) -> Option<Result<common::interface::Completion, StageFailure>> {
        enum Event {
            Finished(Result<common::interface::Completion, StageFailure>),
            Heartbeat,
            StopRequested(bool),
            GraceExpired,
        }

        let heartbeat = self.visibility_timeout / 2;
        let handler = self.handler.clone();
        let message = delivery.message.clone();
        let fut = async move {
            handler
                .handle(&message.payload_ref, &message.correlation_id)
                .await
        };
        tokio::pin!(fut);

        let mut stop_rx = self.stop_rx.clone();
        let mut stopping = *stop_rx.borrow();
        let grace = sleep(if stopping {
            self.shutdown_grace
        } else {
            // Effectively never, re-armed once stop is requested.
            Duration::from_secs(86_400)
        });
        tokio::pin!(grace);

        loop {
            let event = tokio::select! {
                outcome = &mut fut => Event::Finished(outcome),
                _ = sleep(heartbeat) => Event::Heartbeat,
                res = stop_rx.changed(), if !stopping => Event::StopRequested(res.is_err()),
                _ = &mut grace, if stopping => Event::GraceExpired,
            };

            match event {
                Event::Finished(outcome) => return Some(outcome),
                Event::Heartbeat => {
                    match self
                        .broker
                        .extend_lease(self.stage, &delivery.id, self.visibility_timeout)
                        .await
                    {
                        Ok(()) => debug!("{}: extended lease for {}", self.stage, delivery.id),
                        Err(e) if e.is_message_gone() => {
                            // Another consumer owns it now; abandon our run.
                            warn!(
                                "{}: lost lease for {} mid-processing",
                                self.stage, delivery.message.correlation_id
                            );
                            return None;
                        }
                        Err(e) => warn!("{}: extend_lease failed: {e}", self.stage),
                    }
                }
                Event::StopRequested(sender_gone) => {
                    if sender_gone || *self.stop_rx.borrow() {
                        stopping = true;
                        grace
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.shutdown_grace);
                        info!(
                            "{}#{}: shutdown requested, granting {:?} to finish in-flight work",
                            self.stage, self.replica, self.shutdown_grace
                        );
                    }
                }
                Event::GraceExpired => {
                    // Grace spent: hand the lease back explicitly so the
                    // message is redelivered promptly instead of waiting out
                    // the visibility timeout.
                    if let Err(e) = self.broker.release(self.stage, &delivery.id).await {
                        if !e.is_message_gone() {
                            warn!("{}: release on shutdown failed: {e}", self.stage);
                        }
                    }
                    counter!("pipeline_abandoned_total", "stage" => self.stage.as_str())
                        .increment(1);
                    return None;
                }
            }
        }
    }

    async fn quarantine(&self, delivery: &Delivery, reason: &str) {
        match self.broker.dead_letter(self.stage, &delivery.id, reason).await {
            Ok(()) => {
                counter!("pipeline_dead_lettered_total", "stage" => self.stage.as_str())
                    .increment(1);
            }
            Err(e) if e.is_message_gone() => {
                debug!("{}: dead-letter raced a lease expiry", self.stage);
            }
            Err(e) => error!("{}: dead-letter failed: {e}", self.stage),
        }
    }
}
