//! Topic-based message bus with at-least-once delivery.
//!
//! Subscribers are woken by the store's publish signal and also poll on a
//! fixed interval, so a signal missed while disconnected only delays
//! delivery until the next tick.

use chrono::Utc;
use futures::StreamExt;
use keel_core::{
    CancelToken, Error, ExecutionError, Message, MessageHandler, MessageId, NewMessage, Result,
    RetryPolicy, TransientRetry, time,
};
use keel_db::{MessageStore, WakeStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default lease on a claimed message.
pub const DEFAULT_MESSAGE_LEASE: Duration = Duration::from_secs(60);

pub struct MessageBus {
    store: Arc<dyn MessageStore>,
    policy: RetryPolicy,
    lease: Duration,
    retry: TransientRetry,
}

impl MessageBus {
    pub fn new(store: Arc<dyn MessageStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            lease: DEFAULT_MESSAGE_LEASE,
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

    /// Publish with the bus's default retry budget.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Message> {
        self.publish_message(NewMessage {
            topic: topic.to_string(),
            payload,
            priority,
            max_retries: self.policy.max_retries,
        })
        .await
    }

    pub async fn publish_message(&self, message: NewMessage) -> Result<Message> {
        message.validate()?;
        let published = self
            .retry
            .run("publish", || async {
                self.store
                    .publish(&message, Utc::now())
                    .await
                    .map_err(Error::from)
            })
            .await?;
        debug!(
            message_id = %published.id,
            topic = %published.topic,
            priority = published.priority,
            "Published message"
        );
        Ok(published)
    }

    pub async fn get(&self, id: MessageId) -> Result<Message> {
        self.retry
            .run("get_message", || async {
                self.store.get(id).await.map_err(Error::from)
            })
            .await
    }

    /// Claim up to `batch_size` messages on `topic`, highest priority first.
    ///
    /// Not retried on transient failure, for the same reason as
    /// [`JobQueue::claim`](crate::JobQueue::claim).
    pub async fn consume(&self, topic: &str, owner: &str, batch_size: u32) -> Result<Vec<Message>> {
        let now = Utc::now();
        let lease_until = time::saturating_add(now, self.lease);
        Ok(self
            .store
            .claim(topic, owner, batch_size, lease_until, now)
            .await?)
    }

    pub async fn acknowledge(&self, message: &Message) -> Result<Message> {
        let owner = message_owner(message)?;
        self.retry
            .run("acknowledge", || async {
                self.store
                    .acknowledge(message.id, owner, message.retry_count, Utc::now())
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    /// Record a failed delivery: retry with backoff, or dead-letter once the
    /// message's budget is spent or the failure is terminal.
    pub async fn fail(&self, message: &Message, failure: &ExecutionError) -> Result<Message> {
        let owner = message_owner(message)?;
        let error = failure.to_string();
        let failures = u32::try_from(message.retry_count.saturating_add(1)).unwrap_or(u32::MAX);
        let max_retries = u32::try_from(message.max_retries).unwrap_or(0);

        let retry_at = if failure.is_terminal() {
            None
        } else {
            self.policy.next_retry_at(failures, max_retries, Utc::now())
        };

        if let Some(retry_at) = retry_at {
            let updated = self
                .retry
                .run("reschedule_message", || async {
                    self.store
                        .reschedule(message.id, owner, message.retry_count, &error, retry_at, Utc::now())
                        .await
                        .map_err(Error::from)
                })
                .await?;
            warn!(
                message_id = %message.id,
                topic = %message.topic,
                retry_at = %retry_at,
                error = %error,
                "Message delivery failed, retry scheduled"
            );
            return Ok(updated);
        }

        let updated = self
            .retry
            .run("dead_letter_message", || async {
                self.store
                    .dead_letter(message.id, owner, message.retry_count, &error, Utc::now())
                    .await
                    .map_err(Error::from)
            })
            .await?;
        error!(message_id = %message.id, topic = %message.topic, error = %error, "Message dead-lettered");
        Ok(updated)
    }

    pub async fn reclaim_expired(&self) -> Result<Vec<Message>> {
        self.retry
            .run("reclaim_messages", || async {
                self.store
                    .reclaim_expired(Utc::now())
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    pub async fn pending_count(&self, topic: &str) -> Result<i64> {
        self.retry
            .run("pending_count", || async {
                self.store.pending_count(topic).await.map_err(Error::from)
            })
            .await
    }

    pub async fn subscribe(&self) -> Result<WakeStream> {
        Ok(self.store.subscribe().await?)
    }
}

fn message_owner(message: &Message) -> Result<&str> {
    message.owner.as_deref().ok_or_else(|| {
        Error::InvalidInput(format!("message {} has not been claimed", message.id))
    })
}

/// Delivers one topic's messages to a handler until cancelled.
pub struct Subscriber {
    bus: Arc<MessageBus>,
    topic: String,
    owner: String,
    handler: Arc<dyn MessageHandler>,
    batch_size: u32,
    poll_interval: Duration,
}

impl Subscriber {
    pub fn new(
        bus: Arc<MessageBus>,
        topic: impl Into<String>,
        owner: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            owner: owner.into(),
            handler,
            batch_size: 16,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        // tokio intervals reject a zero period.
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Run until `cancel` fires, draining the topic on every wake signal
    /// and poll tick.
    pub async fn run(&self, cancel: CancelToken) {
        info!(topic = %self.topic, consumer = %self.owner, "Starting subscriber");

        let mut wake = self.open_wake_stream().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'deliver: loop {
            if let Err(e) = self.drain().await {
                warn!(topic = %self.topic, error = %e, "Failed to drain topic");
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'deliver,
                    _ = ticker.tick() => {
                        debug!(topic = %self.topic, "Poll tick");
                        break;
                    }
                    signal = wake.next() => match signal {
                        Some(topic) if topic == self.topic => {
                            debug!(topic = %topic, "Wake signal");
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!(topic = %self.topic, "Wake stream closed; polling only");
                            wake = futures::stream::pending().boxed();
                        }
                    },
                }
            }
        }

        info!(topic = %self.topic, consumer = %self.owner, "Subscriber stopped");
    }

    /// Claim and handle batches until the topic has nothing due.
    /// Returns the number of messages handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let batch = self
                .bus
                .consume(&self.topic, &self.owner, self.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(handled);
            }
            for message in &batch {
                self.deliver(message).await;
                handled += 1;
            }
        }
    }

    async fn deliver(&self, message: &Message) {
        let outcome = match self.handler.handle(message).await {
            Ok(()) => self.bus.acknowledge(message).await,
            Err(failure) => self.bus.fail(message, &failure).await,
        };
        if let Err(e) = outcome {
            // The lease will lapse and the sweeper returns the message.
            warn!(message_id = %message.id, error = %e, "Failed to record delivery outcome");
        }
    }

    async fn open_wake_stream(&self) -> WakeStream {
        match self.bus.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Wake signal unavailable; polling only");
                futures::stream::pending().boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use keel_core::MessageStatus;
    use keel_db::DbResult;
    use keel_db::memory::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn bus(store: &MemoryStore) -> Arc<MessageBus> {
        Arc::new(MessageBus::new(Arc::new(store.clone()), RetryPolicy::default()))
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MessageId>>,
        fail_with: Option<ExecutionError>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &Message) -> std::result::Result<(), ExecutionError> {
            self.seen.lock().unwrap().push(message.id);
            match &self.fail_with {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_consume_returns_higher_priority_first() {
        let store = MemoryStore::new();
        let bus = bus(&store);

        let low = bus.publish("t1", serde_json::json!({"n": 1}), 1).await.unwrap();
        let high = bus.publish("t1", serde_json::json!({"n": 5}), 5).await.unwrap();

        let first = bus.consume("t1", "consumer-1", 1).await.unwrap();
        assert_eq!(first[0].id, high.id);
        let second = bus.consume("t1", "consumer-1", 1).await.unwrap();
        assert_eq!(second[0].id, low.id);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_get_distinct_messages() {
        let store = MemoryStore::new();
        let bus = bus(&store);
        for i in 0..30 {
            bus.publish("t1", serde_json::json!({ "n": i }), 0).await.unwrap();
        }

        let mut handles = Vec::new();
        for c in 0..6 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                bus.consume("t1", &format!("consumer-{c}"), 4).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for message in handle.await.unwrap() {
                assert!(seen.insert(message.id), "message {} delivered twice", message.id);
            }
        }
        assert_eq!(seen.len(), 24);
        assert_eq!(bus.pending_count("t1").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_failed_message_dead_letters_after_budget() {
        let store = MemoryStore::new();
        let bus = bus(&store);
        bus.publish_message(NewMessage {
            topic: "t1".to_string(),
            payload: serde_json::json!({}),
            priority: 0,
            max_retries: 1,
        })
        .await
        .unwrap();

        let message = bus.consume("t1", "consumer-1", 1).await.unwrap().remove(0);
        let failed = bus
            .fail(&message, &ExecutionError::Retryable("smtp down".to_string()))
            .await
            .unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(bus.consume("t1", "consumer-1", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_acknowledges_handled_messages() {
        let store = MemoryStore::new();
        let bus = bus(&store);
        let published = bus.publish("t1", serde_json::json!({}), 0).await.unwrap();
        bus.publish("t2", serde_json::json!({}), 0).await.unwrap();

        let handler = Arc::new(Recorder::default());
        let subscriber = Subscriber::new(bus.clone(), "t1", "consumer-1", handler.clone());
        assert_eq!(subscriber.drain().await.unwrap(), 1);

        assert_eq!(*handler.seen.lock().unwrap(), vec![published.id]);
        assert_eq!(bus.get(published.id).await.unwrap().status, MessageStatus::Completed);
        assert_eq!(bus.pending_count("t2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_reschedules_message() {
        let store = MemoryStore::new();
        let bus = bus(&store);
        let published = bus.publish("t1", serde_json::json!({}), 0).await.unwrap();

        let handler = Arc::new(Recorder {
            fail_with: Some(ExecutionError::Retryable("downstream busy".to_string())),
            ..Default::default()
        });
        let subscriber = Subscriber::new(bus.clone(), "t1", "consumer-1", handler);
        assert_eq!(subscriber.drain().await.unwrap(), 1);

        let message = bus.get(published.id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.retry_count, 1);
        assert!(message.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_subscriber_is_woken_by_publish() {
        let store = MemoryStore::new();
        let bus = bus(&store);
        let handler = Arc::new(Recorder::default());
        let subscriber = Arc::new(
            Subscriber::new(bus.clone(), "t1", "consumer-1", handler.clone())
                .with_poll_interval(Duration::from_secs(3600)),
        );

        let cancel = CancelToken::new();
        let running = {
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.run(cancel).await })
        };

        // Let the subscriber connect and pass its first poll tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let published = bus.publish("t1", serde_json::json!({}), 0).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![published.id]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
    }

    /// Store whose publishes never reach subscribers as wake signals.
    struct SilentStore(MemoryStore);

    #[async_trait]
    impl MessageStore for SilentStore {
        async fn publish(&self, new: &NewMessage, now: DateTime<Utc>) -> DbResult<Message> {
            self.0.publish(new, now).await
        }

        async fn get(&self, id: MessageId) -> DbResult<Message> {
            MessageStore::get(&self.0, id).await
        }

        async fn claim(
            &self,
            topic: &str,
            owner: &str,
            batch_size: u32,
            lease_until: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> DbResult<Vec<Message>> {
            MessageStore::claim(&self.0, topic, owner, batch_size, lease_until, now).await
        }

        async fn acknowledge(
            &self,
            id: MessageId,
            owner: &str,
            retry_count: i32,
            now: DateTime<Utc>,
        ) -> DbResult<Message> {
            self.0.acknowledge(id, owner, retry_count, now).await
        }

        async fn reschedule(
            &self,
            id: MessageId,
            owner: &str,
            retry_count: i32,
            error: &str,
            retry_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> DbResult<Message> {
            MessageStore::reschedule(&self.0, id, owner, retry_count, error, retry_at, now).await
        }

        async fn dead_letter(
            &self,
            id: MessageId,
            owner: &str,
            retry_count: i32,
            error: &str,
            now: DateTime<Utc>,
        ) -> DbResult<Message> {
            MessageStore::dead_letter(&self.0, id, owner, retry_count, error, now).await
        }

        async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Message>> {
            MessageStore::reclaim_expired(&self.0, now).await
        }

        async fn pending_count(&self, topic: &str) -> DbResult<i64> {
            self.0.pending_count(topic).await
        }

        async fn subscribe(&self) -> DbResult<WakeStream> {
            Ok(futures::stream::pending().boxed())
        }
    }

    #[tokio::test]
    async fn test_poll_tick_delivers_when_signal_is_missed() {
        let store = MemoryStore::new();
        let bus = Arc::new(MessageBus::new(
            Arc::new(SilentStore(store.clone())),
            RetryPolicy::default(),
        ));
        let handler = Arc::new(Recorder::default());
        let subscriber = Arc::new(
            Subscriber::new(bus.clone(), "t1", "consumer-1", handler.clone())
                .with_poll_interval(Duration::from_millis(150)),
        );

        let cancel = CancelToken::new();
        let running = {
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.run(cancel).await })
        };

        // Past the startup drain and the interval's immediate first tick.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let published = bus.publish("t1", serde_json::json!({}), 0).await.unwrap();
        let published_at = std::time::Instant::now();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handler.seen.lock().unwrap().is_empty(), "delivered without a tick");

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![published.id]);
        assert!(published_at.elapsed() < Duration::from_millis(600));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_startup_drain_delivers_backlog() {
        let store = MemoryStore::new();
        let bus = bus(&store);
        let published = bus.publish("t1", serde_json::json!({}), 0).await.unwrap();

        // Published before the subscriber connected: no signal will follow.
        let handler = Arc::new(Recorder::default());
        let subscriber = Subscriber::new(bus.clone(), "t1", "consumer-1", handler.clone())
            .with_poll_interval(Duration::from_millis(20));

        let cancel = CancelToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        subscriber.run(cancel).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![published.id]);
    }
}
