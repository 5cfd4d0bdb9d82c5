use crate::reprocess::ReprocessCoordinator;
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use errors::{Error, Result, SchedulerError};
use log::{debug, error, info};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep};

/// Triggers a full reprocess run on a cron schedule. A cron-initiated run is
/// exactly an operator-initiated one: both go through
/// `ReprocessCoordinator::execute`.
pub struct CronScheduler {
    schedule: Schedule,
    coordinator: Arc<ReprocessCoordinator>,
    last_fired: Option<DateTime<Utc>>,
}

impl CronScheduler {
    pub fn new(cron: &str, coordinator: Arc<ReprocessCoordinator>) -> Result<Self> {
        let schedule = Schedule::from_str(cron)
            .map_err(|e| Error::from(SchedulerError::InvalidSchedule(Box::new(e))))?;
        Ok(Self {
            schedule,
            coordinator,
            last_fired: None,
        })
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.clone()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("cron scheduler started ({})", self.schedule);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("cron scheduler received shutdown signal");
                    break;
                }
                _ = sleep(Duration::from_secs(10)) => {
                    let now = Utc::now();
                    // Align to minute start
                    if let Some(minute) =
                        Utc.timestamp_opt(now.timestamp() / 60 * 60, 0).single()
                    {
                        self.tick(minute).await;
                    }
                }
            }
        }
    }

    async fn tick(&mut self, minute: DateTime<Utc>) {
        if self.last_fired == Some(minute) {
            return;
        }
        if !Self::matches(&self.schedule, minute) {
            return;
        }
        self.last_fired = Some(minute);

        info!("scheduled reprocess run triggered at {minute}");
        match self.coordinator.execute(None).await {
            Ok(outcome) => {
                if let Some(failure) = &outcome.failure {
                    error!(
                        "scheduled reprocess stopped after {}/{} items: {failure}",
                        outcome.queued, outcome.planned
                    );
                } else {
                    debug!("scheduled reprocess queued {} items", outcome.queued);
                }
            }
            Err(e) => error!("scheduled reprocess failed: {e}"),
        }
    }

    /// The next occurrence after `target - 1s` equals `target` exactly when
    /// the schedule fires on that minute.
    fn matches(schedule: &Schedule, target: DateTime<Utc>) -> bool {
        let check_time = target - chrono::Duration::seconds(1);
        schedule.after(&check_time).next() == Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reprocess::FilesystemItemSource;
    use broker::{Broker, MemoryBroker};
    use common::model::Stage;
    use std::fs;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir, broker: Arc<MemoryBroker>) -> Arc<ReprocessCoordinator> {
        Arc::new(ReprocessCoordinator::new(
            broker,
            Arc::new(FilesystemItemSource::new(dir.path())),
            0.02,
            90,
        ))
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let dir = TempDir::new().unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let err = CronScheduler::new("not a cron", coordinator(&dir, broker))
            .err()
            .unwrap();
        assert!(err.to_string().contains("cron"));
    }

    #[test]
    fn test_minute_matching() {
        // Daily at 03:00:00 UTC.
        let schedule = Schedule::from_str("0 0 3 * * *").unwrap();
        let fire = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2026, 3, 1, 3, 1, 0).unwrap();
        assert!(CronScheduler::matches(&schedule, fire));
        assert!(!CronScheduler::matches(&schedule, miss));
    }

    #[tokio::test]
    async fn test_tick_fires_once_per_minute() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        let broker = Arc::new(MemoryBroker::new());
        // Every minute.
        let mut scheduler =
            CronScheduler::new("0 * * * * *", coordinator(&dir, broker.clone())).unwrap();

        let minute = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        scheduler.tick(minute).await;
        scheduler.tick(minute).await;
        // Second tick of the same minute is a no-op.
        assert_eq!(broker.depth(Stage::first()).await.unwrap(), 1);
    }
}
