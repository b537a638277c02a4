//! Approval requests and their state machine.
//!
//! ```text
//! Pending -> Approved | Rejected | Expired
//! ```
//!
//! Every status except `Pending` is terminal. Requests are never deleted so
//! the decision history stays available for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ApprovalId, Error, Result};

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(Error::InvalidInput(format!(
                "unknown approval status: {}",
                other
            ))),
        }
    }
}

/// A persisted approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    /// The operation (typically a deployment) awaiting the decision.
    pub operation_id: String,
    pub requester: String,
    /// Identities allowed to decide, in the order they were requested.
    /// An empty list means anyone may decide.
    pub approvers: Vec<String>,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub responder: Option<String>,
    pub reason: Option<String>,
}

impl ApprovalRequest {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.timeout_at <= now
    }

    pub fn is_eligible(&self, approver: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == approver)
    }
}

/// A human decision on a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
}

impl ApprovalDecision {
    /// The status the request moves to.
    pub fn status(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject { .. } => ApprovalStatus::Rejected,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ApprovalDecision::Approve => None,
            ApprovalDecision::Reject { reason } => Some(reason),
        }
    }
}

/// Input for creating an approval request.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub operation_id: String,
    pub requester: String,
    pub approvers: Vec<String>,
    pub timeout: Duration,
}

impl NewApproval {
    /// Build a request, dropping duplicate approvers while keeping their order.
    pub fn new(
        operation_id: impl Into<String>,
        requester: impl Into<String>,
        approvers: impl IntoIterator<Item = impl Into<String>>,
        timeout: Duration,
    ) -> Self {
        let mut unique: Vec<String> = Vec::new();
        for approver in approvers {
            let approver = approver.into();
            if !unique.contains(&approver) {
                unique.push(approver);
            }
        }

        Self {
            operation_id: operation_id.into(),
            requester: requester.into(),
            approvers: unique,
            timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_id.trim().is_empty() {
            return Err(Error::InvalidInput("operation id is empty".to_string()));
        }
        if self.requester.trim().is_empty() {
            return Err(Error::InvalidInput("requester is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput(
                "approval timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The deadline for a request created at `now`.
    pub fn timeout_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        crate::time::saturating_add(now, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_approval_dedupes_approvers_in_order() {
        let new = NewApproval::new(
            "deploy-1",
            "alice",
            ["bob", "carol", "bob"],
            Duration::from_secs(60),
        );
        assert_eq!(new.approvers, vec!["bob", "carol"]);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let new = NewApproval::new("deploy-1", "alice", ["bob"], Duration::ZERO);
        assert!(matches!(new.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<ApprovalStatus>().unwrap(), status);
        }
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
    }

    #[test]
    fn test_empty_approver_list_allows_anyone() {
        let now = Utc::now();
        let request = ApprovalRequest {
            id: ApprovalId::new(),
            operation_id: "deploy-1".to_string(),
            requester: "alice".to_string(),
            approvers: vec![],
            status: ApprovalStatus::Pending,
            requested_at: now,
            timeout_at: now,
            responded_at: None,
            responder: None,
            reason: None,
        };
        assert!(request.is_eligible("mallory"));
        assert!(request.is_overdue(now));
    }
}
