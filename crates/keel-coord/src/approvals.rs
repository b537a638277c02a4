//! Human approval gates.
//!
//! Decisions live in the store. [`ApprovalService::wait`] is a same-process
//! fast path only: it is woken when *this* service records the decision or
//! expires the request. A decision written by another instance is invisible
//! to it, so callers that may be served by different instances must use
//! [`ApprovalService::poll_decision`].

use chrono::{DateTime, Utc};
use keel_core::message::topics;
use keel_core::{
    ApprovalDecision, ApprovalId, ApprovalRequest, CancelToken, Error, NewApproval, Result,
    TransientRetry,
};
use keel_db::ApprovalStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::messages::MessageBus;

/// How a wait for a decision ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The request reached a terminal status.
    Decided(ApprovalRequest),
    /// No decision arrived before the caller's deadline.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
    /// This instance did not create the request and it is still pending;
    /// only polling can observe its decision.
    NotLocal,
}

struct Waiter {
    tx: watch::Sender<Option<ApprovalRequest>>,
    timeout_at: DateTime<Utc>,
}

pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    bus: Option<Arc<MessageBus>>,
    retry: TransientRetry,
    waiters: Mutex<HashMap<ApprovalId, Waiter>>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self {
            store,
            bus: None,
            retry: TransientRetry::default(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `approval-*` messages after each state change.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_transient_retry(mut self, retry: TransientRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Open a pending request for `operation_id`.
    ///
    /// Not retried on transient failure: a lost acknowledgement could
    /// otherwise open a second request for the same operation.
    pub async fn create(
        &self,
        operation_id: &str,
        requester: &str,
        approvers: &[String],
        timeout: Duration,
    ) -> Result<ApprovalRequest> {
        let new = NewApproval::new(operation_id, requester, approvers.iter().cloned(), timeout);
        new.validate()?;

        let now = Utc::now();
        let request = self.store.create(&new, now).await?;
        {
            let mut waiters = self.waiters();
            // Requests decided or expired elsewhere are never notified here.
            waiters.retain(|_, waiter| waiter.timeout_at > now);
            waiters.insert(
                request.id,
                Waiter {
                    tx: watch::Sender::new(None),
                    timeout_at: request.timeout_at,
                },
            );
        }

        info!(
            approval_id = %request.id,
            operation_id = %request.operation_id,
            timeout_at = %request.timeout_at,
            "Approval requested"
        );
        self.announce(topics::APPROVAL_REQUESTED, &request).await;
        Ok(request)
    }

    pub async fn approve(&self, id: ApprovalId, approver: &str) -> Result<ApprovalRequest> {
        self.decide(id, ApprovalDecision::Approve, approver).await
    }

    pub async fn reject(
        &self,
        id: ApprovalId,
        approver: &str,
        reason: impl Into<String>,
    ) -> Result<ApprovalRequest> {
        self.decide(
            id,
            ApprovalDecision::Reject {
                reason: reason.into(),
            },
            approver,
        )
        .await
    }

    async fn decide(
        &self,
        id: ApprovalId,
        decision: ApprovalDecision,
        approver: &str,
    ) -> Result<ApprovalRequest> {
        let request = self
            .store
            .decide(id, &decision, approver, Utc::now())
            .await?;

        info!(approval_id = %id, status = %request.status, responder = %approver, "Approval decided");
        self.notify_local(&request);
        self.announce(topics::APPROVAL_DECIDED, &request).await;
        Ok(request)
    }

    pub async fn get(&self, id: ApprovalId) -> Result<ApprovalRequest> {
        self.retry
            .run("get_approval", || async {
                self.store.get(id).await.map_err(Error::from)
            })
            .await
    }

    /// Pending requests, soonest deadline first.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<ApprovalRequest>> {
        self.retry
            .run("list_pending_approvals", || async {
                self.store.list_pending(limit).await.map_err(Error::from)
            })
            .await
    }

    pub async fn list_for_operation(&self, operation_id: &str) -> Result<Vec<ApprovalRequest>> {
        self.retry
            .run("list_operation_approvals", || async {
                self.store
                    .list_for_operation(operation_id)
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    /// Expire every pending request whose deadline is at or before `now`.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>> {
        let expired = self
            .retry
            .run("expire_approvals", || async {
                self.store.expire_overdue(now).await.map_err(Error::from)
            })
            .await?;

        for request in &expired {
            info!(approval_id = %request.id, operation_id = %request.operation_id, "Approval expired");
            self.notify_local(request);
            self.announce(topics::APPROVAL_EXPIRED, request).await;
        }

        // Requests expired by another instance never reach notify_local.
        self.waiters().retain(|_, waiter| waiter.timeout_at > now);
        Ok(expired)
    }

    /// Wait for a decision recorded by this process.
    pub async fn wait(
        &self,
        id: ApprovalId,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<WaitOutcome> {
        let rx = self.waiters().get(&id).map(|waiter| waiter.tx.subscribe());
        let Some(mut rx) = rx else {
            let request = self.get(id).await?;
            return Ok(if request.status.is_terminal() {
                WaitOutcome::Decided(request)
            } else {
                WaitOutcome::NotLocal
            });
        };

        let decided = async { rx.wait_for(Option::is_some).await.map(|request| request.clone()) };
        tokio::select! {
            decided = decided => match decided {
                Ok(request) => Ok(request.map_or(WaitOutcome::TimedOut, WaitOutcome::Decided)),
                // The waiter was pruned; fall back to the store.
                Err(_) => {
                    let request = self.get(id).await?;
                    Ok(if request.status.is_terminal() {
                        WaitOutcome::Decided(request)
                    } else {
                        WaitOutcome::TimedOut
                    })
                }
            },
            _ = sleep(timeout) => self.settle_from_store(id).await,
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
        }
    }

    /// After a local wait times out, drop the waiter if another instance
    /// already finished the request.
    async fn settle_from_store(&self, id: ApprovalId) -> Result<WaitOutcome> {
        let request = self.get(id).await?;
        if request.status.is_terminal() {
            self.waiters().remove(&id);
        }
        Ok(WaitOutcome::TimedOut)
    }

    /// Poll the store until the request is terminal.
    ///
    /// Works from any instance, at the cost of up to `interval` extra latency.
    pub async fn poll_decision(
        &self,
        id: ApprovalId,
        interval: Duration,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let request = self.get(id).await?;
            if request.status.is_terminal() {
                self.notify_local(&request);
                return Ok(WaitOutcome::Decided(request));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::select! {
                _ = sleep(interval.min(deadline - now)) => {}
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            }
        }
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<ApprovalId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_local(&self, request: &ApprovalRequest) {
        if let Some(waiter) = self.waiters().remove(&request.id) {
            waiter.tx.send_replace(Some(request.clone()));
        }
    }

    async fn announce(&self, topic: &str, request: &ApprovalRequest) {
        let Some(bus) = &self.bus else {
            return;
        };
        let payload = match serde_json::to_value(request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(approval_id = %request.id, error = %e, "Failed to encode approval event");
                return;
            }
        };
        // The decision is already committed; a lost event is logged, not raised.
        if let Err(e) = bus.publish(topic, payload, 0).await {
            warn!(approval_id = %request.id, topic, error = %e, "Failed to publish approval event");
        }
    }
}
