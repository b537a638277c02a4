//! Periodic maintenance: approval expiry and lease reclamation.

use crate::approvals::ApprovalService;
use crate::messages::MessageBus;
use crate::queue::JobQueue;
use chrono::Utc;
use keel_core::{CancelToken, JobStatus, MessageStatus, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_approvals: usize,
    pub requeued_jobs: usize,
    pub dead_lettered_jobs: usize,
    pub requeued_messages: usize,
    pub dead_lettered_messages: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs set-based expiry and reclamation on an interval.
///
/// Every step is a single conditional statement, so several instances may
/// sweep at once without double-processing a row.
pub struct Sweeper {
    approvals: Arc<ApprovalService>,
    jobs: Arc<JobQueue>,
    messages: Arc<MessageBus>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        approvals: Arc<ApprovalService>,
        jobs: Arc<JobQueue>,
        messages: Arc<MessageBus>,
        interval: Duration,
    ) -> Self {
        Self {
            approvals,
            jobs,
            messages,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            expired_approvals: self.approvals.expire_overdue(Utc::now()).await?.len(),
            ..Default::default()
        };

        for job in self.jobs.reclaim_expired().await? {
            if job.status == JobStatus::Failed {
                report.dead_lettered_jobs += 1;
            } else {
                report.requeued_jobs += 1;
            }
        }

        for message in self.messages.reclaim_expired().await? {
            if message.status == MessageStatus::Failed {
                report.dead_lettered_messages += 1;
            } else {
                report.requeued_messages += 1;
            }
        }

        Ok(report)
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancelToken) {
        info!(interval = ?self.interval, "Starting sweeper");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            match self.sweep_once().await {
                Ok(report) if !report.is_empty() => info!(?report, "Sweep completed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Sweep failed"),
            }
        }
        info!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ApprovalStatus, NewJob, RetryPolicy};
    use keel_db::memory::MemoryStore;

    struct Fixture {
        approvals: Arc<ApprovalService>,
        jobs: Arc<JobQueue>,
        messages: Arc<MessageBus>,
        sweeper: Sweeper,
    }

    fn fixture(lease: Duration) -> Fixture {
        let store = MemoryStore::new();
        let approvals = Arc::new(ApprovalService::new(Arc::new(store.clone())));
        let jobs = Arc::new(
            JobQueue::new(Arc::new(store.clone()), RetryPolicy::default()).with_lease(lease),
        );
        let messages = Arc::new(
            MessageBus::new(Arc::new(store.clone()), RetryPolicy::default()).with_lease(lease),
        );
        let sweeper = Sweeper::new(
            approvals.clone(),
            jobs.clone(),
            messages.clone(),
            Duration::from_millis(10),
        );
        Fixture {
            approvals,
            jobs,
            messages,
            sweeper,
        }
    }

    #[tokio::test]
    async fn test_sweep_expires_and_reclaims() {
        let f = fixture(Duration::from_millis(10));

        let request = f
            .approvals
            .create("deploy-1", "alice", &[], Duration::from_millis(5))
            .await
            .unwrap();
        f.jobs.enqueue("job-1", serde_json::json!({})).await.unwrap();
        f.jobs
            .enqueue_job(NewJob {
                dedup_key: "job-2".to_string(),
                payload: serde_json::json!({}),
                max_retries: 1,
            })
            .await
            .unwrap();
        f.messages.publish("t1", serde_json::json!({}), 0).await.unwrap();

        assert_eq!(f.jobs.claim("crashed-worker", 10).await.unwrap().len(), 2);
        assert_eq!(f.messages.consume("t1", "crashed-consumer", 10).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired_approvals: 1,
                requeued_jobs: 1,
                dead_lettered_jobs: 1,
                requeued_messages: 1,
                dead_lettered_messages: 0,
            }
        );
        assert_eq!(
            f.approvals.get(request.id).await.unwrap().status,
            ApprovalStatus::Expired
        );

        // Reclaimed work is immediately claimable by someone else.
        let reclaimed = f.jobs.claim("worker-2", 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry_count, 1);
        f.jobs.complete(&reclaimed[0]).await.unwrap();

        assert!(f.sweeper.sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture(Duration::from_secs(60));
        let cancel = CancelToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(1), f.sweeper.run(cancel))
            .await
            .unwrap();
    }
}
