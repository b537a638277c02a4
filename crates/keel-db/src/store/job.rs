//! Deployment job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never receive
//! the same row. Every write by a worker is fenced on `(status, owner,
//! retry_count)`: once a lease is reclaimed the old owner's writes match no
//! row and fail with [`DbError::InvalidState`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Enqueued, Job, JobId, JobStatus, NewJob, QueueDepth};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    dedup_key: String,
    status: String,
    payload: serde_json::Value,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    owner: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        Ok(Job {
            id: row.id.into(),
            dedup_key: row.dedup_key,
            status: row.status.parse()?,
            payload: row.payload,
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
pub trait JobStore: Send + Sync {
    /// Insert a pending job, or return the live job holding `dedup_key`.
    async fn enqueue(&self, new: &NewJob, now: DateTime<Utc>) -> DbResult<Enqueued>;
    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// Atomically mark up to `batch_size` claimable jobs as running for `owner`.
    async fn claim(
        &self,
        owner: &str,
        batch_size: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Job>>;

    /// Push the lease out; false when `owner` no longer holds the job.
    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> DbResult<Job>;

    /// Record a failed attempt and make the job claimable again at `retry_at`.
    async fn reschedule(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Job>;

    /// Record a failed attempt and move the job to `Failed` for good.
    async fn dead_letter(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Job>;

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job>;

    /// Return running jobs whose lease ran out to `Pending`, counting the
    /// lost attempt; jobs out of budget go to `Failed`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Job>>;

    async fn list_dead_letters(&self, limit: i64) -> DbResult<Vec<Job>>;

    /// Give a dead-lettered job a fresh budget.
    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job>;

    async fn depth(&self) -> DbResult<QueueDepth>;
}

/// Error for a fenced write that matched no row.
pub(crate) fn lost_job(current: &Job) -> DbError {
    let status = match (&current.status, &current.owner) {
        (JobStatus::Running, Some(owner)) => format!("running (owned by {})", owner),
        (status, _) => status.to_string(),
    };
    DbError::InvalidState {
        entity: "job",
        id: current.id.to_string(),
        status,
    }
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fenced(&self, id: JobId, updated: Option<JobRow>) -> DbResult<Job> {
        match updated {
            Some(row) => row.try_into(),
            None => Err(lost_job(&self.get(id).await?)),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, new: &NewJob, now: DateTime<Utc>) -> DbResult<Enqueued> {
        // The live job can finish between the insert and the lookup, so retry
        // a few times before giving up.
        for _ in 0..3 {
            let inserted: Option<(uuid::Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO deployment_jobs
                    (id, dedup_key, status, payload, max_retries, created_at, updated_at)
                VALUES ($1, $2, 'pending', $3, $4, $5, $5)
                ON CONFLICT (dedup_key) WHERE status IN ('pending', 'running') DO NOTHING
                RETURNING id
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(&new.dedup_key)
            .bind(&new.payload)
            .bind(i32::try_from(new.max_retries).unwrap_or(i32::MAX))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = inserted {
                return Ok(Enqueued {
                    id: id.into(),
                    created: true,
                });
            }

            let existing: Option<(uuid::Uuid,)> = sqlx::query_as(
                r#"
                SELECT id FROM deployment_jobs
                WHERE dedup_key = $1 AND status IN ('pending', 'running')
                "#,
            )
            .bind(&new.dedup_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = existing {
                return Ok(Enqueued {
                    id: id.into(),
                    created: false,
                });
            }
        }

        Err(DbError::Duplicate(format!(
            "job with dedup key {} kept changing state during enqueue",
            new.dedup_key
        )))
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM deployment_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn claim(
        &self,
        owner: &str,
        batch_size: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'running', owner = $1, lease_expires_at = $2, updated_at = $3
            WHERE id IN (
                SELECT id FROM deployment_jobs
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $3)
                ORDER BY created_at, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(jobs)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deployment_jobs
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND owner = $2 AND status = 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> DbResult<Job> {
        let updated = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'succeeded', lease_expires_at = NULL, last_error = NULL, updated_at = $4
            WHERE id = $1 AND status = 'running' AND owner = $2 AND retry_count = $3
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
        id: JobId,
        owner: &str,
        retry_count: i32,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Job> {
        let updated = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = $5,
                last_error = $4,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = $6
            WHERE id = $1 AND status = 'running' AND owner = $2 AND retry_count = $3
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
        id: JobId,
        owner: &str,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Job> {
        let updated = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'failed',
                retry_count = retry_count + 1,
                next_retry_at = NULL,
                last_error = $4,
                lease_expires_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'running' AND owner = $2 AND retry_count = $3
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

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job> {
        let updated = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'cancelled', lease_expires_at = NULL, next_retry_at = NULL, updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        self.fenced(id, updated).await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                last_error = 'lease expired (owner ' || COALESCE(owner, 'unknown') || ')',
                next_retry_at = NULL,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE id IN (
                SELECT id FROM deployment_jobs
                WHERE status = 'running' AND lease_expires_at < $1
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

    async fn list_dead_letters(&self, limit: i64) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM deployment_jobs
            WHERE status = 'failed'
            ORDER BY updated_at DESC, id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job> {
        let updated = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'pending',
                retry_count = 0,
                next_retry_at = NULL,
                owner = NULL,
                lease_expires_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match updated {
            Ok(row) => self.fenced(id, row).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::Duplicate(
                format!("job {} shares its dedup key with a live job", id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn depth(&self) -> DbResult<QueueDepth> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM deployment_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut depth = QueueDepth::default();
        for (status, count) in counts {
            depth.record(status.parse()?, count);
        }
        Ok(depth)
    }
}
