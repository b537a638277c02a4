//! Wires the coordination components to one set of stores.

use crate::approvals::ApprovalService;
use crate::lock::DistributedLock;
use crate::messages::{MessageBus, Subscriber};
use crate::queue::JobQueue;
use crate::sweeper::Sweeper;
use crate::worker::{Worker, WorkerOptions};
use keel_config::CoordinatorConfig;
use keel_core::{Error, MessageHandler, OperationExecutor, Result};
use keel_db::Stores;
use std::sync::Arc;

/// The components of one coordinator instance.
pub struct Coordinator {
    pub locks: Arc<DistributedLock>,
    pub approvals: Arc<ApprovalService>,
    pub jobs: Arc<JobQueue>,
    pub messages: Arc<MessageBus>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(stores: Stores, config: CoordinatorConfig) -> Self {
        let messages = Arc::new(
            MessageBus::new(stores.messages, config.message_retry_policy())
                .with_lease(config.messages.lease),
        );
        let jobs = Arc::new(
            JobQueue::new(stores.jobs, config.job_retry_policy()).with_lease(config.worker.lease),
        );
        let approvals = Arc::new(ApprovalService::new(stores.approvals).with_bus(messages.clone()));
        let locks = Arc::new(
            DistributedLock::new(stores.locks).with_poll_interval(config.locks.poll_interval),
        );

        Self {
            locks,
            approvals,
            jobs,
            messages,
            config,
        }
    }

    /// Connect to PostgreSQL using the configured database.
    pub async fn connect(config: CoordinatorConfig) -> Result<Self> {
        let url = config
            .database
            .require_url()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let pool = keel_db::create_pool(url, config.database.max_connections).await?;
        Ok(Self::new(Stores::postgres(pool), config))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.approvals.clone(),
            self.jobs.clone(),
            self.messages.clone(),
            self.config.sweeper.interval,
        )
    }

    /// A worker identified by the configured worker id.
    pub fn worker(&self, executor: Arc<dyn OperationExecutor>) -> Worker {
        Worker::new(
            self.config.worker.id.clone(),
            self.jobs.clone(),
            executor,
            WorkerOptions::from(&self.config.worker),
        )
        .with_bus(self.messages.clone())
    }

    pub fn subscriber(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Subscriber {
        Subscriber::new(
            self.messages.clone(),
            topic,
            self.config.worker.id.clone(),
            handler,
        )
        .with_batch_size(self.config.messages.batch_size)
        .with_poll_interval(self.config.messages.poll_interval)
    }
}
