use crate::controller::AutoscaleController;
use crate::handler::PassthroughHandler;
use crate::supervisor::WorkerSupervisor;
use async_trait::async_trait;
use broker::{Broker, MemoryBroker};
use common::interface::{Completion, StageFailure, StageHandler};
use common::model::{ScaleRule, Stage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Handler that never finishes within a test run, pinning leased messages
/// in flight so queue depth stays observable.
struct StalledHandler;

#[async_trait]
impl StageHandler for StalledHandler {
    async fn handle(&self, _: &str, _: &str) -> Result<Completion, StageFailure> {
        sleep(Duration::from_secs(600)).await;
        Ok(Completion::done())
    }
}

fn rule(cooldown_seconds: u64) -> ScaleRule {
    ScaleRule {
        min_replicas: 0,
        max_replicas: 3,
        queue_length_threshold: 4,
        activation_threshold: 1,
        cooldown_seconds,
    }
}

fn supervisor(
    stage: Stage,
    broker: Arc<MemoryBroker>,
    handler: Arc<dyn StageHandler>,
) -> Arc<WorkerSupervisor> {
    Arc::new(WorkerSupervisor::new(
        stage,
        broker,
        handler,
        None,
        3,
        Duration::from_secs(5),
        Duration::from_millis(200),
    ))
}

async fn wait_for_depth(broker: &MemoryBroker, stage: Stage, want: u64) {
    timeout(Duration::from_secs(10), async {
        loop {
            if broker.depth(stage).await.unwrap() == want {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{stage} depth never reached {want}"));
}

#[tokio::test]
async fn test_backlog_activates_then_scales_up() {
    let broker = Arc::new(MemoryBroker::new());
    for i in 0..5 {
        broker
            .enqueue(Stage::Collect, &format!("blob/{i}.json"), &format!("c{i}"))
            .await
            .unwrap();
    }

    let collect = supervisor(Stage::Collect, broker.clone(), Arc::new(StalledHandler));
    let controller = AutoscaleController::new(
        broker.clone(),
        HashMap::from([(Stage::Collect, collect.clone())]),
        HashMap::from([(Stage::Collect, rule(120))]),
        Duration::from_secs(5),
    );

    // First poll wakes the stage with a single replica regardless of depth.
    controller.poll_once().await;
    assert_eq!(collect.replica_count().await, 1);

    // Depth still counts in-flight work, so the next poll raises the target
    // to ceil(5 / 4) = 2.
    controller.poll_once().await;
    assert_eq!(collect.replica_count().await, 2);

    // Bounded by max_replicas even if polled again.
    controller.poll_once().await;
    assert_eq!(collect.replica_count().await, 2);

    collect.shutdown().await;
}

#[tokio::test]
async fn test_drained_stage_scales_back_to_floor() {
    let broker = Arc::new(MemoryBroker::new());
    broker
        .enqueue(Stage::Publish, "blob/a.json", "c1")
        .await
        .unwrap();
    broker
        .enqueue(Stage::Publish, "blob/b.json", "c2")
        .await
        .unwrap();

    // Publish is the terminal stage, so passthrough completions just ack.
    let publish = supervisor(Stage::Publish, broker.clone(), Arc::new(PassthroughHandler));
    let controller = AutoscaleController::new(
        broker.clone(),
        HashMap::from([(Stage::Publish, publish.clone())]),
        HashMap::from([(Stage::Publish, rule(0))]),
        Duration::from_secs(5),
    );

    controller.poll_once().await;
    assert_eq!(publish.replica_count().await, 1);

    wait_for_depth(&broker, Stage::Publish, 0).await;

    // Zero cooldown: the empty queue scales straight back to the floor.
    controller.poll_once().await;
    assert_eq!(publish.replica_count().await, 0);

    publish.shutdown().await;
}

#[tokio::test]
async fn test_cooldown_defers_scale_down_after_drain() {
    let broker = Arc::new(MemoryBroker::new());
    broker
        .enqueue(Stage::Publish, "blob/a.json", "c1")
        .await
        .unwrap();

    let publish = supervisor(Stage::Publish, broker.clone(), Arc::new(PassthroughHandler));
    let controller = AutoscaleController::new(
        broker.clone(),
        HashMap::from([(Stage::Publish, publish.clone())]),
        HashMap::from([(Stage::Publish, rule(3600))]),
        Duration::from_secs(5),
    );

    controller.poll_once().await;
    wait_for_depth(&broker, Stage::Publish, 0).await;

    // Activation was a scale action, and the hour-long cooldown has not
    // elapsed: the replica stays up.
    controller.poll_once().await;
    assert_eq!(publish.replica_count().await, 1);

    publish.shutdown().await;
}

/// Handler that rejects everything as non-retryable.
struct RejectingHandler;

#[async_trait]
impl StageHandler for RejectingHandler {
    async fn handle(&self, payload_ref: &str, _: &str) -> Result<Completion, StageFailure> {
        Err(StageFailure::non_retryable(format!(
            "unsupported payload: {payload_ref}"
        )))
    }
}

#[tokio::test]
async fn test_rejected_message_lands_in_dead_letter_queue() {
    let broker = Arc::new(MemoryBroker::new());
    broker
        .enqueue(Stage::Collect, "blob/bad.json", "c1")
        .await
        .unwrap();

    let collect = supervisor(Stage::Collect, broker.clone(), Arc::new(RejectingHandler));
    collect.scale_to(1).await;

    wait_for_depth(&broker, Stage::Collect, 0).await;
    collect.shutdown().await;

    // Quarantined, not silently dropped, and never back in the live queue.
    let dead = broker.dead_letters(Stage::Collect, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].failure_reason.contains("unsupported payload"));
    assert_eq!(broker.depth(Stage::Collect).await.unwrap(), 0);
}

#[tokio::test]
async fn test_item_flows_through_all_stages() {
    let broker = Arc::new(MemoryBroker::new());
    let mut supervisors = Vec::new();
    for stage in Stage::ALL {
        let s = supervisor(stage, broker.clone(), Arc::new(PassthroughHandler));
        s.scale_to(1).await;
        supervisors.push(s);
    }

    broker
        .enqueue(Stage::first(), "blob/item.json", "c1")
        .await
        .unwrap();

    // Passthrough handlers forward the payload reference stage to stage
    // until publish completes it.
    for stage in Stage::ALL {
        wait_for_depth(&broker, stage, 0).await;
    }

    for s in supervisors {
        s.shutdown().await;
    }
}
