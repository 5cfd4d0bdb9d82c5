use async_trait::async_trait;
use broker::Broker;
use common::interface::{ItemSource, SourceStats};
use common::model::{ReprocessItem, ReprocessMode, ReprocessOutcome, ReprocessPlan, Stage};
use errors::{Error, ReprocessError, Result};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Item source backed by a directory of stored collections: one `<id>.json`
/// per item, with a sibling `<id>.md` marking a completed render.
pub struct FilesystemItemSource {
    content_dir: PathBuf,
}

impl FilesystemItemSource {
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
        }
    }

    async fn list_json_stems(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(&self.content_dir)
            .await
            .map_err(|e| Error::from(ReprocessError::EnumerationFailed(Box::new(e))))?;

        let mut stems = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::from(ReprocessError::EnumerationFailed(Box::new(e))))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push((stem.to_owned(), path.clone()));
            }
        }
        // Stable order so repeated dry runs over the same corpus agree.
        stems.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(stems)
    }
}

#[async_trait]
impl ItemSource for FilesystemItemSource {
    async fn enumerate(&self, max_items: Option<usize>) -> Result<Vec<ReprocessItem>> {
        let stems = self.list_json_stems().await?;
        let mut items: Vec<ReprocessItem> = stems
            .into_iter()
            .map(|(id, path)| ReprocessItem {
                payload_ref: path.to_string_lossy().into_owned(),
                id,
            })
            .collect();
        if let Some(max) = max_items {
            items.truncate(max);
        }
        Ok(items)
    }

    async fn stats(&self) -> Result<SourceStats> {
        let stems = self.list_json_stems().await?;
        let mut completed = 0;
        for (stem, path) in &stems {
            let marker = path.with_file_name(format!("{stem}.md"));
            if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                completed += 1;
            }
        }
        Ok(SourceStats {
            total: stems.len(),
            completed,
        })
    }
}

/// Reprocess status surfaced over the API: corpus counters plus the most
/// recent execute outcome, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessStatus {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<ReprocessOutcome>,
}

/// Plans and runs full-corpus refreshes: every enumerated item is re-enqueued
/// at the head of the pipeline. Deliberately no deduplication against work
/// already in flight; the stages are idempotent per payload reference.
pub struct ReprocessCoordinator {
    broker: Arc<dyn Broker>,
    source: Arc<dyn ItemSource>,
    unit_cost: f64,
    unit_seconds: u64,
    last_outcome: Mutex<Option<ReprocessOutcome>>,
}

impl ReprocessCoordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        source: Arc<dyn ItemSource>,
        unit_cost: f64,
        unit_seconds: u64,
    ) -> Self {
        Self {
            broker,
            source,
            unit_cost,
            unit_seconds,
            last_outcome: Mutex::new(None),
        }
    }

    /// Estimate a run without touching the broker. Safe to call repeatedly.
    pub async fn plan(&self, max_items: Option<usize>) -> Result<ReprocessPlan> {
        let items = self.source.enumerate(max_items).await?;
        let item_count = items.len();
        Ok(ReprocessPlan {
            mode: ReprocessMode::DryRun,
            item_count,
            estimated_cost: self.unit_cost * item_count as f64,
            estimated_time_seconds: self.unit_seconds * item_count as u64,
            items,
        })
    }

    /// Enqueue one message per enumerated item into the first stage. On a
    /// mid-run enqueue failure the outcome reports exactly how many items
    /// made it; nothing already queued is rolled back.
    pub async fn execute(&self, max_items: Option<usize>) -> Result<ReprocessOutcome> {
        let items = self.source.enumerate(max_items).await?;
        let planned = items.len();
        info!("reprocess: enqueuing {planned} items into {}", Stage::first());

        let mut queued = 0usize;
        let mut failure = None;
        for item in &items {
            let correlation_id = Uuid::now_v7().to_string();
            match self
                .broker
                .enqueue(Stage::first(), &item.payload_ref, &correlation_id)
                .await
            {
                Ok(_) => queued += 1,
                Err(e) => {
                    warn!(
                        "reprocess: enqueue failed for {} after {queued}/{planned}: {e}",
                        item.id
                    );
                    failure = Some(
                        Error::from(ReprocessError::PartialEnqueue {
                            queued,
                            planned,
                            source: Box::new(e),
                        })
                        .to_string(),
                    );
                    break;
                }
            }
        }

        let outcome = ReprocessOutcome {
            planned,
            queued,
            estimated_cost: self.unit_cost * planned as f64,
            failure,
        };
        *self.last_outcome.lock().await = Some(outcome.clone());
        info!(
            "reprocess: queued {}/{} items",
            outcome.queued, outcome.planned
        );
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<ReprocessStatus> {
        let stats = self.source.stats().await?;
        let last_outcome = self.last_outcome.lock().await.clone();
        Ok(ReprocessStatus {
            total: stats.total,
            completed: stats.completed,
            pending: stats.total.saturating_sub(stats.completed),
            last_outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::MemoryBroker;
    use std::fs;
    use tempfile::TempDir;

    fn corpus(items: &[(&str, bool)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (id, completed) in items {
            fs::write(dir.path().join(format!("{id}.json")), "{}").unwrap();
            if *completed {
                fs::write(dir.path().join(format!("{id}.md")), "# done").unwrap();
            }
        }
        dir
    }

    #[tokio::test]
    async fn test_dry_run_is_repeatable_and_enqueues_nothing() {
        let dir = corpus(&[("a", true), ("b", false), ("c", false)]);
        let broker = Arc::new(MemoryBroker::new());
        let coordinator = ReprocessCoordinator::new(
            broker.clone(),
            Arc::new(FilesystemItemSource::new(dir.path())),
            0.02,
            90,
        );

        let first = coordinator.plan(None).await.unwrap();
        let second = coordinator.plan(None).await.unwrap();
        assert_eq!(first.item_count, 3);
        assert_eq!(first.items, second.items);
        assert_eq!(first.estimated_time_seconds, 270);
        assert!((first.estimated_cost - 0.06).abs() < 1e-9);
        assert_eq!(broker.depth(Stage::first()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enumeration_is_sorted_and_capped() {
        let dir = corpus(&[("m", false), ("a", false), ("z", false)]);
        let source = FilesystemItemSource::new(dir.path());
        let items = source.enumerate(Some(2)).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m"]);
    }

    #[tokio::test]
    async fn test_execute_enqueues_every_item() {
        let dir = corpus(&[("a", true), ("b", false)]);
        let broker = Arc::new(MemoryBroker::new());
        let coordinator = ReprocessCoordinator::new(
            broker.clone(),
            Arc::new(FilesystemItemSource::new(dir.path())),
            0.02,
            90,
        );

        let outcome = coordinator.execute(None).await.unwrap();
        assert_eq!(outcome.planned, 2);
        assert_eq!(outcome.queued, 2);
        assert!(outcome.failure.is_none());
        assert_eq!(broker.depth(Stage::first()).await.unwrap(), 2);

        let status = coordinator.status().await.unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.completed, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.last_outcome.unwrap().queued, 2);
    }

    /// Broker stub whose enqueue fails after a set number of successes.
    struct FlakyBroker {
        inner: MemoryBroker,
        allow: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn enqueue(
            &self,
            stage: Stage,
            payload_ref: &str,
            correlation_id: &str,
        ) -> Result<broker::MessageId> {
            use std::sync::atomic::Ordering;
            if self.allow.fetch_sub(1, Ordering::SeqCst) == 0 {
                return Err(Error::broker_connection());
            }
            self.inner.enqueue(stage, payload_ref, correlation_id).await
        }

        async fn lease(
            &self,
            stage: Stage,
            visibility_timeout: std::time::Duration,
        ) -> Result<Option<broker::Delivery>> {
            self.inner.lease(stage, visibility_timeout).await
        }

        async fn ack(&self, stage: Stage, id: &str) -> Result<()> {
            self.inner.ack(stage, id).await
        }

        async fn extend_lease(
            &self,
            stage: Stage,
            id: &str,
            additional: std::time::Duration,
        ) -> Result<()> {
            self.inner.extend_lease(stage, id, additional).await
        }

        async fn release(&self, stage: Stage, id: &str) -> Result<()> {
            self.inner.release(stage, id).await
        }

        async fn depth(&self, stage: Stage) -> Result<u64> {
            self.inner.depth(stage).await
        }

        async fn dead_letter(&self, stage: Stage, id: &str, reason: &str) -> Result<()> {
            self.inner.dead_letter(stage, id, reason).await
        }

        async fn dead_letters(
            &self,
            stage: Stage,
            limit: usize,
        ) -> Result<Vec<broker::DeadLetterEntry>> {
            self.inner.dead_letters(stage, limit).await
        }

        async fn redrive(&self, stage: Stage, dead_letter_id: &str) -> Result<broker::MessageId> {
            self.inner.redrive(stage, dead_letter_id).await
        }
    }

    #[tokio::test]
    async fn test_partial_failure_reports_exact_queued_count() {
        let dir = corpus(&[("a", false), ("b", false), ("c", false), ("d", false)]);
        let broker = Arc::new(FlakyBroker {
            inner: MemoryBroker::new(),
            allow: std::sync::atomic::AtomicUsize::new(2),
        });
        let coordinator = ReprocessCoordinator::new(
            broker.clone(),
            Arc::new(FilesystemItemSource::new(dir.path())),
            0.02,
            90,
        );

        let outcome = coordinator.execute(None).await.unwrap();
        assert_eq!(outcome.planned, 4);
        assert_eq!(outcome.queued, 2);
        assert!(outcome
            .failure
            .as_deref()
            .unwrap()
            .contains("enqueued 2 of 4 items"));
        // Successful enqueues stay queued.
        assert_eq!(broker.depth(Stage::first()).await.unwrap(), 2);
    }
}
