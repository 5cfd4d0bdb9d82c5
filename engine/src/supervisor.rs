use crate::guard::RateGuard;
use crate::runner::StageWorker;
use broker::Broker;
use common::interface::StageHandler;
use common::model::Stage;
use futures::future::join_all;
use log::{debug, info};
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Realizes the controller's replica targets for one stage: a replica is a
/// spawned worker task. Scale-up spawns, scale-down stops the newest workers
/// through their watch-channel stop flags (the worker's own grace and
/// lease-release semantics apply).
pub struct WorkerSupervisor {
    stage: Stage,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn StageHandler>,
    guard: Option<Arc<RateGuard>>,
    max_attempts: u32,
    visibility_timeout: Duration,
    shutdown_grace: Duration,
    workers: Mutex<Vec<WorkerHandle>>,
    spawned_total: Mutex<usize>,
}

impl WorkerSupervisor {
    pub fn new(
        stage: Stage,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn StageHandler>,
        guard: Option<Arc<RateGuard>>,
        max_attempts: u32,
        visibility_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            stage,
            broker,
            handler,
            guard,
            max_attempts,
            visibility_timeout,
            shutdown_grace,
            workers: Mutex::new(Vec::new()),
            spawned_total: Mutex::new(0),
        }
    }

    pub async fn replica_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Bring the pool to `target` replicas. Returns the resulting count.
    pub async fn scale_to(&self, target: usize) -> usize {
        let mut workers = self.workers.lock().await;

        while workers.len() < target {
            let replica = {
                let mut total = self.spawned_total.lock().await;
                *total += 1;
                *total
            };
            let (stop_tx, stop_rx) = watch::channel(false);
            let worker = StageWorker::new(
                self.stage,
                replica,
                self.broker.clone(),
                self.handler.clone(),
                self.guard.clone(),
                self.max_attempts,
                self.visibility_timeout,
                self.shutdown_grace,
                stop_rx,
            );
            let join = tokio::spawn(worker.run());
            workers.push(WorkerHandle { stop_tx, join });
            debug!("{}: spawned replica #{replica}", self.stage);
        }

        // Newest first, so long-lived replicas keep their warm state.
        while workers.len() > target {
            if let Some(handle) = workers.pop() {
                let _ = handle.stop_tx.send(true);
                // The worker drains its in-flight message (or releases the
                // lease) on its own; no need to block the control loop on it.
                drop(handle.join);
            }
        }

        gauge!("pipeline_stage_replicas", "stage" => self.stage.as_str())
            .set(workers.len() as f64);
        workers.len()
    }

    /// Stop every replica and wait for the pool to drain.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.iter() {
            let _ = handle.stop_tx.send(true);
        }
        let joins: Vec<JoinHandle<()>> = workers.drain(..).map(|h| h.join).collect();
        drop(workers);
        join_all(joins).await;
        gauge!("pipeline_stage_replicas", "stage" => self.stage.as_str()).set(0.0);
        info!("{}: worker pool drained", self.stage);
    }
}
