//! Worker that processes jobs from the queue.

use crate::messages::MessageBus;
use crate::queue::JobQueue;
use keel_config::WorkerConfig;
use keel_core::message::topics;
use keel_core::{CancelToken, ExecutionError, Job, JobStatus, OperationExecutor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Tuning for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum number of jobs executing at once.
    pub concurrency: u32,
    /// Upper bound on jobs claimed per poll.
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub heartbeat: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 4,
            poll_interval: Duration::from_secs(1),
            heartbeat: Duration::from_secs(60),
        }
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            heartbeat: config.heartbeat,
        }
    }
}

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    executor: Arc<dyn OperationExecutor>,
    bus: Option<Arc<MessageBus>>,
    options: WorkerOptions,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<JobQueue>,
        executor: Arc<dyn OperationExecutor>,
        options: WorkerOptions,
    ) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            id: id.into(),
            queue,
            executor,
            bus: None,
            options: WorkerOptions {
                concurrency,
                // tokio intervals reject a zero period.
                heartbeat: options.heartbeat.max(Duration::from_millis(1)),
                ..options
            },
            permits: Arc::new(Semaphore::new(concurrency as usize)),
        }
    }

    /// Publish `job-completed` / `job-failed` messages for finished jobs.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `shutdown` fires, then wait for in-flight
    /// jobs to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancelToken) {
        info!(
            worker_id = %self.id,
            executor = self.executor.name(),
            concurrency = self.options.concurrency,
            "Starting worker"
        );

        loop {
            // Wait for at least one free slot before claiming anything.
            let first = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let mut permits = vec![first];
            while permits.len() < self.options.batch_size.max(1) as usize {
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let claimed = match self.queue.claim(&self.id, permits.len() as u32).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim jobs");
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                drop(permits);
                debug!(worker_id = %self.id, "No jobs available");
                tokio::select! {
                    _ = sleep(self.options.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }

            // Unused permits drop here and free their slots.
            for (job, permit) in claimed.into_iter().zip(permits) {
                let worker = self.clone();
                tokio::spawn(async move { worker.process(job, permit).await });
            }
        }

        info!(worker_id = %self.id, "Worker stopping; waiting for in-flight jobs");
        let all = self.options.concurrency;
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.options.concurrency as usize - self.permits.available_permits()
    }

    async fn process(&self, job: Job, _permit: OwnedSemaphorePermit) {
        let cancel = CancelToken::new();
        let execution = self.executor.execute(&job.payload, cancel.clone());
        tokio::pin!(execution);

        let mut heartbeat = tokio::time::interval(self.options.heartbeat);
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                _ = heartbeat.tick(), if !cancel.is_cancelled() => {
                    match self.queue.heartbeat(&job).await {
                        Ok(true) => debug!(job_id = %job.id, "Lease extended"),
                        Ok(false) => {
                            warn!(job_id = %job.id, worker_id = %self.id, "Lease lost; cancelling execution");
                            cancel.cancel();
                        }
                        Err(e) => warn!(job_id = %job.id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        };

        match result {
            Ok(()) => match self.queue.complete(&job).await {
                Ok(done) => self.announce(topics::JOB_COMPLETED, &done).await,
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to record job success"),
            },
            Err(failure) => {
                let failure = if cancel.is_cancelled() {
                    ExecutionError::Cancelled
                } else {
                    failure
                };
                match self.queue.fail(&job, &failure).await {
                    Ok(failed) if failed.status == JobStatus::Failed => {
                        self.announce(topics::JOB_FAILED, &failed).await
                    }
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to record job failure"),
                }
            }
        }
    }

    async fn announce(&self, topic: &str, job: &Job) {
        let Some(bus) = &self.bus else {
            return;
        };
        // A dead-letter write has already counted the final failure.
        let attempts = if job.status == JobStatus::Failed {
            job.retry_count
        } else {
            job.retry_count + 1
        };
        let payload = serde_json::json!({
            "job_id": job.id,
            "dedup_key": job.dedup_key,
            "status": job.status,
            "attempts": attempts,
            "error": job.last_error,
        });
        if let Err(e) = bus.publish(topic, payload, 0).await {
            warn!(job_id = %job.id, topic, error = %e, "Failed to publish job event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::{JobId, RetryPolicy, TransientRetry};
    use keel_db::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that tracks how many executions overlap.
    #[derive(Default)]
    struct CountingExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OperationExecutor for CountingExecutor {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn execute(
            &self,
            _payload: &serde_json::Value,
            _cancel: CancelToken,
        ) -> Result<(), ExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExecutionError::Retryable("execution failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn queue(store: &MemoryStore) -> Arc<JobQueue> {
        Arc::new(
            JobQueue::new(Arc::new(store.clone()), RetryPolicy::default()).with_transient_retry(
                TransientRetry {
                    attempts: 3,
                    initial_backoff: Duration::from_millis(1),
                },
            ),
        )
    }

    fn fast_options(concurrency: u32) -> WorkerOptions {
        WorkerOptions {
            concurrency,
            batch_size: concurrency,
            poll_interval: Duration::from_millis(10),
            heartbeat: Duration::from_secs(60),
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        for i in 0..12 {
            queue.enqueue(format!("job-{i}"), serde_json::json!({})).await.unwrap();
        }

        let executor = Arc::new(CountingExecutor::default());
        let worker = Arc::new(Worker::new("worker-1", queue.clone(), executor.clone(), fast_options(3)));
        let shutdown = CancelToken::new();
        let running = tokio::spawn(worker.clone().run(shutdown.clone()));

        wait_until(|| executor.finished.load(Ordering::SeqCst) == 12).await;
        shutdown.cancel();
        running.await.unwrap();

        assert!(executor.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.stats().await.unwrap().succeeded, 12);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_jobs() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        queue.enqueue("job-1", serde_json::json!({})).await.unwrap();

        let executor = Arc::new(CountingExecutor::default());
        let worker = Arc::new(Worker::new("worker-1", queue.clone(), executor.clone(), fast_options(2)));
        let shutdown = CancelToken::new();
        let running = tokio::spawn(worker.clone().run(shutdown.clone()));

        wait_until(|| executor.running.load(Ordering::SeqCst) == 1).await;
        shutdown.cancel();
        running.await.unwrap();

        // run() returned only after the job finished and was recorded.
        assert_eq!(executor.finished.load(Ordering::SeqCst), 1);
        assert_eq!(worker.in_flight(), 0);
        assert_eq!(queue.stats().await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn test_failures_reschedule_and_announce_dead_letter() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        let bus = Arc::new(MessageBus::new(Arc::new(store.clone()), RetryPolicy::default()));
        let enqueued = queue
            .enqueue_job(keel_core::NewJob {
                dedup_key: "job-1".to_string(),
                payload: serde_json::json!({}),
                max_retries: 1,
            })
            .await
            .unwrap();

        let executor = Arc::new(CountingExecutor {
            fail: true,
            ..Default::default()
        });
        let worker = Arc::new(
            Worker::new("worker-1", queue.clone(), executor.clone(), fast_options(1)).with_bus(bus.clone()),
        );
        let shutdown = CancelToken::new();
        let running = tokio::spawn(worker.clone().run(shutdown.clone()));

        wait_until(|| executor.finished.load(Ordering::SeqCst) == 1).await;
        let id: JobId = enqueued.id;
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.get(id).await.unwrap().status != JobStatus::Failed {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        running.await.unwrap();

        let events = bus.consume(topics::JOB_FAILED, "notifier", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["job_id"], serde_json::json!(id));
        assert_eq!(events[0].payload["attempts"], serde_json::json!(1));
        assert_eq!(events[0].payload["status"], serde_json::json!("failed"));
    }

    #[tokio::test]
    async fn test_successful_job_is_announced() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        let bus = Arc::new(MessageBus::new(Arc::new(store.clone()), RetryPolicy::default()));
        queue.enqueue("job-1", serde_json::json!({})).await.unwrap();

        let executor = Arc::new(CountingExecutor::default());
        let worker = Arc::new(
            Worker::new("worker-1", queue.clone(), executor.clone(), fast_options(1)).with_bus(bus.clone()),
        );
        let shutdown = CancelToken::new();
        let running = tokio::spawn(worker.clone().run(shutdown.clone()));

        wait_until(|| executor.finished.load(Ordering::SeqCst) == 1).await;
        shutdown.cancel();
        running.await.unwrap();

        let events = bus.consume(topics::JOB_COMPLETED, "notifier", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["attempts"], serde_json::json!(1));
    }
}
