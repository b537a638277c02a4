//! Message store with a low-latency wake signal.
//!
//! Publishing commits the row and a `NOTIFY` on [`MESSAGE_CHANNEL`] in the
//! same transaction. The signal only shortens latency: subscribers still poll,
//! because notifications are dropped while a listener is disconnected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use keel_core::{Message, MessageId, MessageStatus, NewMessage};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::warn;

use crate::{DbError, DbResult};

/// Notification channel carrying the topic of each published message.
pub const MESSAGE_CHANNEL: &str = "keel_messages";

/// Stream of topics that just received a message.
pub type WakeStream = BoxStream<'static, String>;

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: uuid::Uuid,
    topic: String,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    owner: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = DbError;

    fn try_from(row: MessageRow) -> DbResult<Self> {
        Ok(Message {
            id: row.id.into(),
            topic: row.topic,
            payload: row.payload,
            priority: row.priority,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_retry_at: row.next_retry_at,
            lease_expires_at: row.lease_expires_at,
            owner: row.owner,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a pending message and signal listeners.
    async fn publish(&self, new: &NewMessage, now: DateTime<Utc>) -> DbResult<Message>;
    async fn get(&self, id: MessageId) -> DbResult<Message>;

    /// Atomically claim up to `batch_size` pending messages on `topic`,
    /// highest priority first, then oldest first.
    async fn claim(
        &self,
        topic: &str,
        owner: &str,
        batch_size: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Message>>;

    async fn acknowledge(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> DbResult<Message>;

    async fn reschedule(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Message>;

    async fn dead_letter(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Message>;

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Message>>;

    async fn pending_count(&self, topic: &str) -> DbResult<i64>;

    /// Subscribe to wake signals.
    async fn subscribe(&self) -> DbResult<WakeStream>;
}

pub(crate) fn lost_message(current: &Message) -> DbError {
    let status = match (&current.status, &current.owner) {
        (MessageStatus::Processing, Some(owner)) => format!("processing (owned by {})", owner),
        (status, _) => status.to_string(),
    };
    DbError::InvalidState {
        entity: "message",
        id: current.id.to_string(),
        status,
    }
}

/// PostgreSQL implementation of MessageStore.
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fenced(&self, id: MessageId, updated: Option<MessageRow>) -> DbResult<Message> {
        match updated {
            Some(row) => row.try_into(),
            None => Err(lost_message(&self.get(id).await?)),
        }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn publish(&self, new: &NewMessage, now: DateTime<Utc>) -> DbResult<Message> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages
                (id, topic, payload, priority, status, max_retries, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $6)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&new.topic)
        .bind(&new.payload)
        .bind(new.priority)
        .bind(i32::try_from(new.max_retries).unwrap_or(i32::MAX))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(MESSAGE_CHANNEL)
            .bind(&new.topic)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get(&self, id: MessageId) -> DbResult<Message> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("message {}", id)))?
            .try_into()
    }

    async fn claim(
        &self,
        topic: &str,
        owner: &str,
        batch_size: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages
            SET status = 'processing', owner = $2, lease_expires_at = $3, updated_at = $4
            WHERE id IN (
                SELECT id FROM messages
                WHERE topic = $1
                  AND status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $4)
                ORDER BY priority DESC, created_at, id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(topic)
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(Message::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        sort_for_delivery(&mut messages);
        Ok(messages)
    }

    async fn acknowledge(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> DbResult<Message> {
        let updated = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages
            SET status = 'completed', lease_expires_at = NULL, last_error = NULL, updated_at = $4
            WHERE id = $1 AND status = 'processing' AND owner = $2 AND retry_count = $3
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(retry_count)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        self.fenced(id, updated).await
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
        let updated = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages
            SET status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = $5,
                last_error = $4,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = $6
            WHERE id = $1 AND status = 'processing' AND owner = $2 AND retry_count = $3
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(retry_count)
        .bind(error)
        .bind(retry_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        self.fenced(id, updated).await
    }

    async fn dead_letter(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Message> {
        let updated = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages
            SET status = 'failed',
                retry_count = retry_count + 1,
                next_retry_at = NULL,
                last_error = $4,
                lease_expires_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'processing' AND owner = $2 AND retry_count = $3
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(retry_count)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        self.fenced(id, updated).await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                last_error = 'lease expired (owner ' || COALESCE(owner, 'unknown') || ')',
                next_retry_at = NULL,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE id IN (
                SELECT id FROM messages
                WHERE status = 'processing' AND lease_expires_at < $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn pending_count(&self, topic: &str) -> DbResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE topic = $1 AND status = 'pending'")
                .bind(topic)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    async fn subscribe(&self) -> DbResult<WakeStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(MESSAGE_CHANNEL).await?;

        let stream = listener
            .into_stream()
            .filter_map(|notification| async move {
                match notification {
                    Ok(n) => Some(n.payload().to_string()),
                    Err(e) => {
                        warn!(error = %e, "Message listener error");
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }
}

/// Delivery order within one claim batch.
pub(crate) fn sort_for_delivery(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}
