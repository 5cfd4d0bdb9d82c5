use crate::supervisor::WorkerSupervisor;
use broker::Broker;
use chrono::{DateTime, Utc};
use common::model::{ScaleDecision, ScaleRule, Stage, StageRunRecord};
use log::{debug, error, info};
use metrics::gauge;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::sleep;

pub type StageRecords = Arc<RwLock<HashMap<Stage, StageRunRecord>>>;

/// Pure scaling decision for one stage at one poll.
///
/// Order encodes the tie-break: scale-up always wins over scale-down, and
/// activation from zero ignores the cooldown entirely so work starts fast.
/// Only scale-down is cooldown-gated; transient empty-queue blips within the
/// cooldown window hold instead of flapping.
pub fn decide(
    rule: &ScaleRule,
    depth: u64,
    replicas: usize,
    last_scale_action_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ScaleDecision {
    if depth >= rule.activation_threshold && replicas == 0 {
        return ScaleDecision::Activate { to: 1 };
    }

    // Scale-up only adjusts a stage that is already running; waking a
    // dormant stage is the activation branch's job, and it has a higher bar.
    let desired = (depth.div_ceil(rule.queue_length_threshold) as usize).min(rule.max_replicas);
    if replicas > 0 && desired > replicas {
        return ScaleDecision::ScaleUp { to: desired };
    }

    if depth == 0 && replicas > rule.min_replicas {
        let cooled = match last_scale_action_at {
            Some(at) => (now - at).num_seconds() >= rule.cooldown_seconds as i64,
            None => true,
        };
        if cooled {
            return ScaleDecision::ScaleDown {
                to: rule.min_replicas,
            };
        }
    }

    ScaleDecision::Hold
}

/// Demand-driven autoscaler: one poll loop for every stage, mapping queue
/// depth to a replica target and realizing it through the supervisors.
///
/// The controller is the only writer of the Stage Run Records; the monitor
/// and the status endpoint read them.
pub struct AutoscaleController {
    broker: Arc<dyn Broker>,
    supervisors: HashMap<Stage, Arc<WorkerSupervisor>>,
    rules: HashMap<Stage, ScaleRule>,
    records: StageRecords,
    poll_interval: Duration,
}

impl AutoscaleController {
    pub fn new(
        broker: Arc<dyn Broker>,
        supervisors: HashMap<Stage, Arc<WorkerSupervisor>>,
        rules: HashMap<Stage, ScaleRule>,
        poll_interval: Duration,
    ) -> Self {
        let records = Arc::new(RwLock::new(
            Stage::ALL
                .into_iter()
                .map(|s| (s, StageRunRecord::new(s)))
                .collect(),
        ));
        Self {
            broker,
            supervisors,
            rules,
            records,
            poll_interval,
        }
    }

    /// Shared read handle for the monitor and the status endpoint.
    pub fn records(&self) -> StageRecords {
        self.records.clone()
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "autoscale controller started, poll interval {:?}",
            self.poll_interval
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("autoscale controller received shutdown signal");
                    break;
                }
                _ = sleep(self.poll_interval) => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One control cycle over every stage. Records are updated on every
    /// poll; `last_scale_action_at` moves only when the replica count
    /// actually changes, anchoring the scale-down cooldown.
    pub async fn poll_once(&self) {
        for stage in Stage::ALL {
            let Some(supervisor) = self.supervisors.get(&stage) else {
                continue;
            };
            let rule = &self.rules[&stage];

            let depth = match self.broker.depth(stage).await {
                Ok(d) => d,
                Err(e) => {
                    error!("controller: depth({stage}) failed: {e}");
                    continue;
                }
            };
            let replicas = supervisor.replica_count().await;
            let now = Utc::now();
            let last_action = {
                let records = self.records.read().await;
                records.get(&stage).and_then(|r| r.last_scale_action_at)
            };

            let decision = decide(rule, depth, replicas, last_action, now);
            let realized = match decision.target() {
                Some(target) if target != replicas => {
                    info!(
                        "{stage}: depth {depth}, {replicas} -> {target} replicas ({decision:?})"
                    );
                    Some(supervisor.scale_to(target).await)
                }
                _ => {
                    debug!("{stage}: depth {depth}, holding at {replicas} replicas");
                    None
                }
            };

            gauge!("pipeline_queue_depth", "stage" => stage.as_str()).set(depth as f64);

            let mut records = self.records.write().await;
            let record = records
                .entry(stage)
                .or_insert_with(|| StageRunRecord::new(stage));
            record.observed_queue_depth = depth;
            record.last_polled_at = Some(now);
            match realized {
                Some(count) => {
                    record.replica_count = count;
                    record.last_scale_action_at = Some(now);
                }
                None => record.replica_count = replicas,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn rule() -> ScaleRule {
        ScaleRule {
            min_replicas: 0,
            max_replicas: 3,
            queue_length_threshold: 4,
            activation_threshold: 1,
            cooldown_seconds: 120,
        }
    }

    #[test]
    fn test_activation_ignores_cooldown() {
        let now = Utc::now();
        // A scale action just happened; activation must still fire.
        let decision = decide(&rule(), 5, 0, Some(now - ChronoDuration::seconds(1)), now);
        assert_eq!(decision, ScaleDecision::Activate { to: 1 });
    }

    #[test]
    fn test_scale_up_targets_depth_over_threshold() {
        let now = Utc::now();
        assert_eq!(
            decide(&rule(), 5, 1, None, now),
            ScaleDecision::ScaleUp { to: 2 }
        );
        // 13 items / threshold 4 = 4 replicas, capped at max 3.
        assert_eq!(
            decide(&rule(), 13, 2, None, now),
            ScaleDecision::ScaleUp { to: 3 }
        );
        // Already at max: hold.
        assert_eq!(decide(&rule(), 13, 3, None, now), ScaleDecision::Hold);
    }

    #[test]
    fn test_scale_down_waits_for_cooldown() {
        let now = Utc::now();
        let recent = Some(now - ChronoDuration::seconds(30));
        assert_eq!(decide(&rule(), 0, 2, recent, now), ScaleDecision::Hold);

        let stale = Some(now - ChronoDuration::seconds(130));
        assert_eq!(
            decide(&rule(), 0, 2, stale, now),
            ScaleDecision::ScaleDown { to: 0 }
        );
    }

    #[test]
    fn test_scale_down_respects_min_replicas() {
        let now = Utc::now();
        let mut r = rule();
        r.min_replicas = 1;
        assert_eq!(
            decide(&r, 0, 3, None, now),
            ScaleDecision::ScaleDown { to: 1 }
        );
        assert_eq!(decide(&r, 0, 1, None, now), ScaleDecision::Hold);
    }

    #[test]
    fn test_backlog_lifecycle_from_activation_to_drain() {
        // 5 items, activation 1, threshold 4, max 3:
        // poll 1 activates to 1, poll 2 scales to ceil(5/4)=2, and once the
        // queue drains past the cooldown it falls back to min.
        let now = Utc::now();
        let r = rule();

        assert_eq!(decide(&r, 5, 0, None, now), ScaleDecision::Activate { to: 1 });
        assert_eq!(
            decide(&r, 5, 1, Some(now), now),
            ScaleDecision::ScaleUp { to: 2 }
        );
        // Drained but inside cooldown: hold.
        assert_eq!(
            decide(&r, 0, 2, Some(now - ChronoDuration::seconds(10)), now),
            ScaleDecision::Hold
        );
        // Cooldown elapsed: back to min_replicas = 0.
        assert_eq!(
            decide(&r, 0, 2, Some(now - ChronoDuration::seconds(121)), now),
            ScaleDecision::ScaleDown { to: 0 }
        );
    }

    #[test]
    fn test_quiet_queue_below_activation_stays_at_zero() {
        let now = Utc::now();
        let mut r = rule();
        r.activation_threshold = 3;
        assert_eq!(decide(&r, 2, 0, None, now), ScaleDecision::Hold);
        assert_eq!(decide(&r, 3, 0, None, now), ScaleDecision::Activate { to: 1 });

        // A stage that is already running still tracks demand below the
        // activation bar.
        r.queue_length_threshold = 1;
        assert_eq!(decide(&r, 2, 1, None, now), ScaleDecision::ScaleUp { to: 2 });
    }
}
