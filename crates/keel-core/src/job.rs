//! Durable jobs for long-running background operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, JobId, Result};

/// Status of a job.
///
/// A retryable failure puts the job back to `Pending` with `next_retry_at`
/// set; `Failed` is reserved for jobs that exhausted their budget or hit a
/// terminal error (dead-lettered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status: {}", s)))
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Caller-supplied key; unique among non-terminal jobs.
    pub dedup_key: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a claim at `now` may pick this job up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether the job is running under a lease that has run out.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }

    /// The terminal failure of a dead-lettered job, if it is one.
    pub fn failure(&self) -> Option<Error> {
        if self.status != JobStatus::Failed {
            return None;
        }
        Some(Error::PermanentFailure(format!(
            "job {} ({}) failed after {} attempts: {}",
            self.id,
            self.dedup_key,
            self.retry_count,
            self.last_error.as_deref().unwrap_or("no error recorded")
        )))
    }
}

/// Input for enqueuing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub dedup_key: String,
    pub payload: serde_json::Value,
    pub max_retries: u32,
}

impl NewJob {
    pub fn validate(&self) -> Result<()> {
        if self.dedup_key.trim().is_empty() {
            return Err(Error::InvalidInput("dedup key is empty".to_string()));
        }
        Ok(())
    }
}

/// Result of an enqueue: the id of the live job for the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: JobId,
    /// False when an existing non-terminal job was returned instead.
    pub created: bool,
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl QueueDepth {
    pub fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            dedup_key: "job-1".to_string(),
            status,
            payload: serde_json::json!({}),
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            lease_expires_at: None,
            owner: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_pending_job_waits_for_retry_time() {
        let now = Utc::now();
        let mut pending = job(JobStatus::Pending);
        assert!(pending.is_claimable(now));

        pending.next_retry_at = Some(now + chrono::Duration::minutes(5));
        assert!(!pending.is_claimable(now));
        assert!(pending.is_claimable(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_running_job_with_expired_lease_is_abandoned() {
        let now = Utc::now();
        let mut running = job(JobStatus::Running);
        running.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(running.is_abandoned(now));
        assert!(!running.is_claimable(now));

        running.lease_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!running.is_abandoned(now));
    }

    #[test]
    fn test_only_dead_letters_report_a_failure() {
        assert!(job(JobStatus::Running).failure().is_none());

        let mut failed = job(JobStatus::Failed);
        failed.retry_count = 3;
        failed.last_error = Some("cluster unreachable".to_string());
        let err = failed.failure().unwrap();
        assert!(matches!(err, Error::PermanentFailure(_)));
        assert!(err.to_string().contains("after 3 attempts: cluster unreachable"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert_eq!("cancelled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("done".parse::<JobStatus>().is_err());
    }
}
