use crate::api::{self, ApiState};
use crate::controller::AutoscaleController;
use crate::guard::RateGuard;
use crate::handler::{HttpStageHandler, PassthroughHandler};
use crate::monitor::PipelineMonitor;
use crate::reprocess::{FilesystemItemSource, ReprocessCoordinator};
use crate::scheduler::CronScheduler;
use crate::supervisor::WorkerSupervisor;
use broker::{Broker, MemoryBroker, RedisBroker};
use common::interface::StageHandler;
use common::model::{Config, ScaleRule, Stage};
use errors::{Error, Result};
use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Wires the whole pipeline together from config: broker, per-stage worker
/// supervisors, autoscale controller, monitor, scheduler and control plane.
pub struct Engine {
    config: Config,
    broker: Arc<dyn Broker>,
    guard: Option<Arc<RateGuard>>,
    supervisors: HashMap<Stage, Arc<WorkerSupervisor>>,
    coordinator: Arc<ReprocessCoordinator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let broker: Arc<dyn Broker> = match config.broker.backend.as_str() {
            "memory" => Arc::new(MemoryBroker::new()),
            "redis" => {
                let redis = config.broker.redis.as_ref().ok_or_else(|| {
                    Error::config_invalid("broker.redis is required when backend = \"redis\"")
                })?;
                Arc::new(RedisBroker::connect(redis, &config.broker.namespace).await?)
            }
            other => {
                return Err(Error::config_invalid(format!(
                    "unknown broker backend: {other}"
                )));
            }
        };

        // One guard for every guarded stage: they share the same upstream
        // API quota.
        let any_guarded = Stage::ALL
            .into_iter()
            .any(|s| config.stages.get(s).guarded);
        let guard = any_guarded.then(|| Arc::new(RateGuard::new(&config.limiter)));

        let visibility_timeout = Duration::from_secs(config.broker.visibility_timeout_secs);
        let shutdown_grace = Duration::from_secs(config.controller.shutdown_grace_secs);

        let mut supervisors = HashMap::new();
        for stage in Stage::ALL {
            let stage_config = config.stages.get(stage);
            let handler: Arc<dyn StageHandler> = match &stage_config.endpoint {
                Some(endpoint) => {
                    let stage_guard = stage_config.guarded.then(|| guard.clone()).flatten();
                    Arc::new(HttpStageHandler::new(endpoint.clone(), stage_guard)?)
                }
                None => {
                    warn!("{stage}: no endpoint configured, payloads pass through unchanged");
                    Arc::new(PassthroughHandler)
                }
            };
            supervisors.insert(
                stage,
                Arc::new(WorkerSupervisor::new(
                    stage,
                    broker.clone(),
                    handler,
                    stage_config.guarded.then(|| guard.clone()).flatten(),
                    stage_config.max_attempts,
                    visibility_timeout,
                    shutdown_grace,
                )),
            );
        }

        let coordinator = Arc::new(ReprocessCoordinator::new(
            broker.clone(),
            Arc::new(FilesystemItemSource::new(&config.reprocess.content_dir)),
            config.reprocess.unit_cost,
            config.reprocess.unit_seconds,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            broker,
            guard,
            supervisors,
            coordinator,
            shutdown_tx,
        })
    }

    /// Run until Ctrl+C (or an explicit shutdown broadcast), then drain.
    pub async fn run(self) -> Result<()> {
        info!("engine \"{}\" starting", self.config.name);

        let prometheus_handle = PrometheusBuilder::new().install_recorder().ok();
        if prometheus_handle.is_none() {
            warn!("Prometheus recorder not installed, /metrics will be empty");
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Scheduler first: its cron expression also feeds the monitor's
        // execution-window awareness.
        let mut cron_schedule = None;
        if let Some(scheduler_config) = &self.config.scheduler {
            let scheduler = CronScheduler::new(&scheduler_config.cron, self.coordinator.clone())?;
            cron_schedule = Some(scheduler.schedule());
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(scheduler.run(shutdown)));
        }

        let rules: HashMap<Stage, ScaleRule> = Stage::ALL
            .into_iter()
            .map(|s| (s, self.config.stages.get(s).scale_rule()))
            .collect();

        let controller = AutoscaleController::new(
            self.broker.clone(),
            self.supervisors.clone(),
            rules,
            Duration::from_secs(self.config.controller.poll_interval_secs),
        );
        let records = controller.records();
        tasks.push(tokio::spawn(controller.run(self.shutdown_tx.subscribe())));

        let monitor = PipelineMonitor::new(
            self.config.monitor.clone().unwrap_or_default(),
            self.broker.clone(),
            records.clone(),
            self.guard.clone(),
            cron_schedule,
        );
        let snapshot = monitor.snapshot();
        tasks.push(tokio::spawn(monitor.run(self.shutdown_tx.subscribe())));

        if let Some(api_config) = &self.config.api {
            let state = ApiState::new(
                self.coordinator.clone(),
                self.broker.clone(),
                records,
                snapshot,
                prometheus_handle,
                api_config.api_key.clone(),
            );
            let port = api_config.port;
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = api::serve(state, port, shutdown).await {
                    error!("control plane exited: {e}");
                }
            }));
        }

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("received Ctrl+C, initiating shutdown");
                let _ = shutdown_tx.send(());
            }
        });

        // Block until shutdown is broadcast.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;

        info!("engine \"{}\" shutting down", self.config.name);
        for supervisor in self.supervisors.values() {
            supervisor.shutdown().await;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("engine \"{}\" stopped", self.config.name);
        Ok(())
    }

    /// Request shutdown from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
