//! Durable job queue with leases, retries and dead-lettering.

use chrono::Utc;
use keel_core::{
    Enqueued, Error, ExecutionError, Job, JobId, JobStatus, NewJob, QueueDepth, Result, RetryPolicy,
    TransientRetry, time,
};
use keel_db::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default lease granted to a worker per claim or heartbeat.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5 * 60);

/// Job queue over a [`JobStore`].
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    lease: Duration,
    retry: TransientRetry,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            lease: DEFAULT_LEASE,
            retry: TransientRetry::default(),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_transient_retry(mut self, retry: TransientRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Enqueue a job with the default retry budget.
    ///
    /// Idempotent while a job with the same dedup key is pending or running.
    pub async fn enqueue(
        &self,
        dedup_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Enqueued> {
        self.enqueue_job(NewJob {
            dedup_key: dedup_key.into(),
            payload,
            max_retries: self.policy.max_retries,
        })
        .await
    }

    pub async fn enqueue_job(&self, job: NewJob) -> Result<Enqueued> {
        job.validate()?;
        let enqueued = self
            .retry
            .run("enqueue", || async {
                self.store.enqueue(&job, Utc::now()).await.map_err(Error::from)
            })
            .await?;

        if enqueued.created {
            info!(job_id = %enqueued.id, dedup_key = %job.dedup_key, "Enqueued job");
        } else {
            info!(job_id = %enqueued.id, dedup_key = %job.dedup_key, "Job already queued");
        }
        Ok(enqueued)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.retry
            .run("get_job", || async { self.store.get(id).await.map_err(Error::from) })
            .await
    }

    /// Claim up to `batch_size` due jobs for `owner`.
    ///
    /// Uses SKIP LOCKED to prevent contention in distributed environments.
    /// Not retried on transient failure: a claim that committed before its
    /// reply was lost would strand that batch until the lease lapses, and the
    /// lapse costs each job an attempt. Callers poll again instead.
    pub async fn claim(&self, owner: &str, batch_size: u32) -> Result<Vec<Job>> {
        let now = Utc::now();
        let lease_until = time::saturating_add(now, self.lease);
        let jobs = self.store.claim(owner, batch_size, lease_until, now).await?;

        for job in &jobs {
            info!(job_id = %job.id, worker_id = %owner, attempt = job.retry_count + 1, "Claimed job");
        }
        Ok(jobs)
    }

    /// Extend the lease on a job the caller is running.
    ///
    /// Returns false once the caller no longer owns the job.
    pub async fn heartbeat(&self, job: &Job) -> Result<bool> {
        let owner = job_owner(job)?;
        self.retry
            .run("heartbeat", || async {
                let now = Utc::now();
                let lease_until = time::saturating_add(now, self.lease);
                self.store.extend_lease(job.id, owner, lease_until, now).await.map_err(Error::from)
            })
            .await
    }

    /// Mark a claimed job succeeded.
    pub async fn complete(&self, job: &Job) -> Result<Job> {
        let owner = job_owner(job)?;
        let done = self
            .retry
            .run("complete", || async {
                self.store
                    .complete(job.id, owner, job.retry_count, Utc::now())
                    .await
                    .map_err(Error::from)
            })
            .await?;
        info!(job_id = %job.id, "Job succeeded");
        Ok(done)
    }

    /// Record a failed attempt of a claimed job.
    ///
    /// Retryable failures go back to pending with exponential backoff until
    /// the retry budget is spent; terminal failures dead-letter at once.
    pub async fn fail(&self, job: &Job, failure: &ExecutionError) -> Result<Job> {
        let owner = job_owner(job)?;
        let message = failure.to_string();
        let failures = u32::try_from(job.retry_count.saturating_add(1)).unwrap_or(u32::MAX);
        let max_retries = u32::try_from(job.max_retries).unwrap_or(0);

        let retry_at = if failure.is_terminal() {
            None
        } else {
            self.policy.next_retry_at(failures, max_retries, Utc::now())
        };

        match retry_at {
            Some(retry_at) => {
                let job = self
                    .retry
                    .run("reschedule", || async {
                        self.store
                            .reschedule(job.id, owner, job.retry_count, &message, retry_at, Utc::now())
                            .await
                            .map_err(Error::from)
                    })
                    .await?;
                warn!(
                    job_id = %job.id,
                    attempt = failures,
                    retry_at = %retry_at,
                    error = %message,
                    "Job failed, retry scheduled"
                );
                Ok(job)
            }
            None => {
                let job = self
                    .retry
                    .run("dead_letter", || async {
                        self.store
                            .dead_letter(job.id, owner, job.retry_count, &message, Utc::now())
                            .await
                            .map_err(Error::from)
                    })
                    .await?;
                error!(job_id = %job.id, attempts = failures, error = %message, "Job dead-lettered");
                Ok(job)
            }
        }
    }

    /// Cancel a pending or running job.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let job = self.store.cancel(id, Utc::now()).await?;
        info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    /// Return running jobs whose lease ran out to the queue, counting the
    /// lost attempt against their budget.
    pub async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        let reclaimed = self
            .retry
            .run("reclaim_jobs", || async {
                self.store.reclaim_expired(Utc::now()).await.map_err(Error::from)
            })
            .await?;

        for job in &reclaimed {
            if job.status == JobStatus::Failed {
                error!(job_id = %job.id, "Abandoned job dead-lettered");
            } else {
                warn!(job_id = %job.id, attempt = job.retry_count, "Reclaimed abandoned job");
            }
        }
        Ok(reclaimed)
    }

    /// Most recently dead-lettered jobs first.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<Job>> {
        self.retry
            .run("dead_letters", || async {
                self.store.list_dead_letters(limit).await.map_err(Error::from)
            })
            .await
    }

    /// Put a dead-lettered job back in the queue with a fresh retry budget.
    pub async fn requeue(&self, id: JobId) -> Result<Job> {
        let job = self.store.requeue(id, Utc::now()).await?;
        info!(job_id = %id, "Requeued dead-lettered job");
        Ok(job)
    }

    pub async fn stats(&self) -> Result<QueueDepth> {
        self.retry
            .run("stats", || async { self.store.depth().await.map_err(Error::from) })
            .await
    }
}

fn job_owner(job: &Job) -> Result<&str> {
    job.owner.as_deref().ok_or_else(|| {
        Error::InvalidInput(format!("job {} has not been claimed", job.id))
    })
}
