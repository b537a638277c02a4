//! Approval request store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{ApprovalDecision, ApprovalId, ApprovalRequest, ApprovalStatus, NewApproval};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct ApprovalRow {
    id: uuid::Uuid,
    operation_id: String,
    requester: String,
    approvers: Vec<String>,
    status: String,
    requested_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
    responder: Option<String>,
    reason: Option<String>,
}

impl TryFrom<ApprovalRow> for ApprovalRequest {
    type Error = DbError;

    fn try_from(row: ApprovalRow) -> DbResult<Self> {
        Ok(ApprovalRequest {
            id: row.id.into(),
            operation_id: row.operation_id,
            requester: row.requester,
            approvers: row.approvers,
            status: row.status.parse()?,
            requested_at: row.requested_at,
            timeout_at: row.timeout_at,
            responded_at: row.responded_at,
            responder: row.responder,
            reason: row.reason,
        })
    }
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, new: &NewApproval, now: DateTime<Utc>) -> DbResult<ApprovalRequest>;
    async fn get(&self, id: ApprovalId) -> DbResult<ApprovalRequest>;

    /// Record a decision. Succeeds only while the request is pending, not
    /// past its deadline, and `responder` is an eligible approver.
    async fn decide(
        &self,
        id: ApprovalId,
        decision: &ApprovalDecision,
        responder: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ApprovalRequest>;

    /// Move every overdue pending request to `Expired` in one statement.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> DbResult<Vec<ApprovalRequest>>;

    async fn list_pending(&self, limit: i64) -> DbResult<Vec<ApprovalRequest>>;
    async fn list_for_operation(&self, operation_id: &str) -> DbResult<Vec<ApprovalRequest>>;
}

/// Explain why a decision on `current` matched no row.
pub(crate) fn refused_decision(
    current: &ApprovalRequest,
    responder: &str,
    now: DateTime<Utc>,
) -> DbError {
    let invalid = |status: String| DbError::InvalidState {
        entity: "approval",
        id: current.id.to_string(),
        status,
    };

    if current.status.is_terminal() {
        invalid(current.status.to_string())
    } else if current.timeout_at <= now {
        invalid(format!("{} past its timeout", ApprovalStatus::Pending))
    } else if !current.is_eligible(responder) {
        DbError::NotEligible(format!(
            "{} is not an approver of {}",
            responder, current.id
        ))
    } else {
        invalid(current.status.to_string())
    }
}

/// PostgreSQL implementation of ApprovalStore.
pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn create(&self, new: &NewApproval, now: DateTime<Utc>) -> DbResult<ApprovalRequest> {
        let row = sqlx::query_as::<_, ApprovalRow>(
            r#"
            INSERT INTO approval_requests
                (id, operation_id, requester, approvers, status, requested_at, timeout_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&new.operation_id)
        .bind(&new.requester)
        .bind(&new.approvers)
        .bind(now)
        .bind(new.timeout_at(now))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get(&self, id: ApprovalId) -> DbResult<ApprovalRequest> {
        sqlx::query_as::<_, ApprovalRow>("SELECT * FROM approval_requests WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("approval {}", id)))?
            .try_into()
    }

    async fn decide(
        &self,
        id: ApprovalId,
        decision: &ApprovalDecision,
        responder: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ApprovalRequest> {
        let updated = sqlx::query_as::<_, ApprovalRow>(
            r#"
            UPDATE approval_requests
            SET status = $2, responder = $3, reason = $4, responded_at = $5
            WHERE id = $1
              AND status = 'pending'
              AND timeout_at > $5
              AND (cardinality(approvers) = 0 OR $3 = ANY(approvers))
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(decision.status().as_str())
        .bind(responder)
        .bind(decision.reason())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => row.try_into(),
            None => {
                let current = self.get(id).await?;
                Err(refused_decision(&current, responder, now))
            }
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> DbResult<Vec<ApprovalRequest>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
            UPDATE approval_requests
            SET status = 'expired', responded_at = $1
            WHERE status = 'pending' AND timeout_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_pending(&self, limit: i64) -> DbResult<Vec<ApprovalRequest>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT * FROM approval_requests
            WHERE status = 'pending'
            ORDER BY timeout_at, id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_for_operation(&self, operation_id: &str) -> DbResult<Vec<ApprovalRequest>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
            SELECT * FROM approval_requests
            WHERE operation_id = $1
            ORDER BY requested_at, id
            "#,
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
