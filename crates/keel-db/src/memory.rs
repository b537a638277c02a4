//! In-process store for tests and single-node development.
//!
//! `MemoryStore` implements every store trait with the same conditional
//! semantics as the PostgreSQL implementations: a mutex stands in for row
//! locks, so a claim is as atomic as `FOR UPDATE SKIP LOCKED`. Nothing here is
//! durable, and nothing is shared between processes. Clones share state, so
//! two services built from clones of one store behave like two instances
//! talking to the same database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use keel_core::{
    ApprovalDecision, ApprovalId, ApprovalRequest, ApprovalStatus, Enqueued, Job, JobId,
    JobStatus, Message, MessageId, MessageStatus, NewApproval, NewJob, NewMessage, QueueDepth,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::store::approval::refused_decision;
use crate::store::job::lost_job;
use crate::store::message::{lost_message, sort_for_delivery};
use crate::{
    ApprovalStore, DbError, DbResult, JobStore, LockBackend, LockSession, MessageStore,
    WakeStream,
};

#[derive(Default)]
struct Tables {
    approvals: HashMap<ApprovalId, ApprovalRequest>,
    jobs: HashMap<JobId, Job>,
    messages: HashMap<MessageId, Message>,
}

struct Inner {
    tables: Mutex<Tables>,
    /// Advisory lock key -> holding session id.
    locks: Mutex<HashMap<i64, u64>>,
    next_session: AtomicU64,
    wake: broadcast::Sender<String>,
    injected_failures: AtomicU32,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<i64, u64>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (wake, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                locks: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                wake,
                injected_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` store calls fail with a transient error, as if
    /// the database were briefly unreachable.
    pub fn inject_transient_failures(&self, count: u32) {
        self.inner.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Drop every lock session's ownership, as a database restart would.
    pub fn terminate_lock_sessions(&self) {
        self.inner.locks().clear();
    }

    /// Insert or overwrite a job row directly.
    pub fn put_job(&self, job: Job) {
        self.inner.tables().jobs.insert(job.id, job);
    }

    fn check_available(&self) -> DbResult<()> {
        let remaining = self.inner.injected_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        match remaining {
            Ok(_) => Err(DbError::Database(sqlx::Error::PoolTimedOut)),
            Err(_) => Ok(()),
        }
    }
}

fn attempts_budget(max_retries: u32) -> i32 {
    i32::try_from(max_retries).unwrap_or(i32::MAX)
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn create(&self, new: &NewApproval, now: DateTime<Utc>) -> DbResult<ApprovalRequest> {
        self.check_available()?;
        let request = ApprovalRequest {
            id: ApprovalId::new(),
            operation_id: new.operation_id.clone(),
            requester: new.requester.clone(),
            approvers: new.approvers.clone(),
            status: ApprovalStatus::Pending,
            requested_at: now,
            timeout_at: new.timeout_at(now),
            responded_at: None,
            responder: None,
            reason: None,
        };
        self.inner
            .tables()
            .approvals
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: ApprovalId) -> DbResult<ApprovalRequest> {
        self.check_available()?;
        self.inner
            .tables()
            .approvals
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("approval {}", id)))
    }

    async fn decide(
        &self,
        id: ApprovalId,
        decision: &ApprovalDecision,
        responder: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ApprovalRequest> {
        self.check_available()?;
        let mut tables = self.inner.tables();
        let request = tables
            .approvals
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("approval {}", id)))?;

        let allowed = request.status == ApprovalStatus::Pending
            && request.timeout_at > now
            && request.is_eligible(responder);
        if !allowed {
            return Err(refused_decision(request, responder, now));
        }

        request.status = decision.status();
        request.responder = Some(responder.to_string());
        request.reason = decision.reason().map(str::to_string);
        request.responded_at = Some(now);
        Ok(request.clone())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> DbResult<Vec<ApprovalRequest>> {
        self.check_available()?;
        let mut tables = self.inner.tables();
        let mut expired: Vec<ApprovalRequest> = tables
            .approvals
            .values_mut()
            .filter(|r| r.is_overdue(now))
            .map(|r| {
                r.status = ApprovalStatus::Expired;
                r.responded_at = Some(now);
                r.clone()
            })
            .collect();
        expired.sort_by_key(|r| (r.timeout_at, r.id));
        Ok(expired)
    }

    async fn list_pending(&self, limit: i64) -> DbResult<Vec<ApprovalRequest>> {
        self.check_available()?;
        let tables = self.inner.tables();
        let mut pending: Vec<ApprovalRequest> = tables
            .approvals
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.timeout_at, r.id));
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn list_for_operation(&self, operation_id: &str) -> DbResult<Vec<ApprovalRequest>> {
        self.check_available()?;
        let tables = self.inner.tables();
        let mut requests: Vec<ApprovalRequest> = tables
            .approvals
            .values()
            .filter(|r| r.operation_id == operation_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| (r.requested_at, r.id));
        Ok(requests)
    }
}

impl MemoryStore {
    /// Apply `update` to a running job owned by `owner` at `retry_count`.
    fn fenced_job(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        update: impl FnOnce(&mut Job),
    ) -> DbResult<Job> {
        let mut tables = self.inner.tables();
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        let owned = job.status == JobStatus::Running
            && job.owner.as_deref() == Some(owner)
            && job.retry_count == retry_count;
        if !owned {
            return Err(lost_job(job));
        }
        update(job);
        Ok(job.clone())
    }

    fn fenced_message(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        update: impl FnOnce(&mut Message),
    ) -> DbResult<Message> {
        let mut tables = self.inner.tables();
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("message {}", id)))?;

        let owned = message.status == MessageStatus::Processing
            && message.owner.as_deref() == Some(owner)
            && message.retry_count == retry_count;
        if !owned {
            return Err(lost_message(message));
        }
        update(message);
        Ok(message.clone())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, new: &NewJob, now: DateTime<Utc>) -> DbResult<Enqueued> {
        self.check_available()?;
        let mut tables = self.inner.tables();

        let live = tables
            .jobs
            .values()
            .find(|j| j.dedup_key == new.dedup_key && !j.status.is_terminal());
        if let Some(existing) = live {
            return Ok(Enqueued {
                id: existing.id,
                created: false,
            });
        }

        let job = Job {
            id: JobId::new(),
            dedup_key: new.dedup_key.clone(),
            status: JobStatus::Pending,
            payload: new.payload.clone(),
            retry_count: 0,
            max_retries: attempts_budget(new.max_retries),
            next_retry_at: None,
            lease_expires_at: None,
            owner: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        tables.jobs.insert(id, job);
        Ok(Enqueued { id, created: true })
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.check_available()?;
        self.inner
            .tables()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn claim(
        &self,
        owner: &str,
        batch_size: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Job>> {
        self.check_available()?;
        let mut tables = self.inner.tables();

        let mut eligible: Vec<(DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| (j.created_at, j.id))
            .collect();
        eligible.sort();
        eligible.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(job) = tables.jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.owner = Some(owner.to_string());
                job.lease_expires_at = Some(lease_until);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.check_available()?;
        let mut tables = self.inner.tables();
        match tables.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running && job.owner.as_deref() == Some(owner) => {
                job.lease_expires_at = Some(lease_until);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> DbResult<Job> {
        self.check_available()?;
        self.fenced_job(id, owner, retry_count, |job| {
            job.status = JobStatus::Succeeded;
            job.lease_expires_at = None;
            job.last_error = None;
            job.updated_at = now;
        })
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
        self.check_available()?;
        self.fenced_job(id, owner, retry_count, |job| {
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.next_retry_at = Some(retry_at);
            job.last_error = Some(error.to_string());
            job.owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        })
    }

    async fn dead_letter(
        &self,
        id: JobId,
        owner: &str,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Job> {
        self.check_available()?;
        self.fenced_job(id, owner, retry_count, |job| {
            job.status = JobStatus::Failed;
            job.retry_count += 1;
            job.next_retry_at = None;
            job.last_error = Some(error.to_string());
            job.lease_expires_at = None;
            job.updated_at = now;
        })
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job> {
        self.check_available()?;
        let mut tables = self.inner.tables();
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if job.status.is_terminal() {
            return Err(lost_job(job));
        }
        job.status = JobStatus::Cancelled;
        job.lease_expires_at = None;
        job.next_retry_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Job>> {
        self.check_available()?;
        let mut tables = self.inner.tables();
        let mut reclaimed: Vec<Job> = tables
            .jobs
            .values_mut()
            .filter(|j| j.is_abandoned(now))
            .map(|job| {
                job.retry_count += 1;
                job.status = if job.retry_count >= job.max_retries {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                job.last_error = Some(format!(
                    "lease expired (owner {})",
                    job.owner.as_deref().unwrap_or("unknown")
                ));
                job.next_retry_at = None;
                job.owner = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                job.clone()
            })
            .collect();
        reclaimed.sort_by_key(|j| (j.created_at, j.id));
        Ok(reclaimed)
    }

    async fn list_dead_letters(&self, limit: i64) -> DbResult<Vec<Job>> {
        self.check_available()?;
        let tables = self.inner.tables();
        let mut dead: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        dead.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(dead)
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> DbResult<Job> {
        self.check_available()?;
        let mut tables = self.inner.tables();

        let dedup_key = match tables.jobs.get(&id) {
            Some(job) if job.status == JobStatus::Failed => job.dedup_key.clone(),
            Some(job) => return Err(lost_job(job)),
            None => return Err(DbError::NotFound(format!("job {}", id))),
        };
        let key_in_use = tables
            .jobs
            .values()
            .any(|j| j.id != id && j.dedup_key == dedup_key && !j.status.is_terminal());
        if key_in_use {
            return Err(DbError::Duplicate(format!(
                "job {} shares its dedup key with a live job",
                id
            )));
        }

        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.next_retry_at = None;
        job.owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn depth(&self) -> DbResult<QueueDepth> {
        self.check_available()?;
        let tables = self.inner.tables();
        let mut depth = QueueDepth::default();
        for job in tables.jobs.values() {
            depth.record(job.status, 1);
        }
        Ok(depth)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn publish(&self, new: &NewMessage, now: DateTime<Utc>) -> DbResult<Message> {
        self.check_available()?;
        let message = Message {
            id: MessageId::new(),
            topic: new.topic.clone(),
            payload: new.payload.clone(),
            priority: new.priority,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: attempts_budget(new.max_retries),
            next_retry_at: None,
            lease_expires_at: None,
            owner: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .tables()
            .messages
            .insert(message.id, message.clone());

        // No receivers is fine: the signal is only a latency hint.
        let _ = self.inner.wake.send(new.topic.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> DbResult<Message> {
        self.check_available()?;
        self.inner
            .tables()
            .messages
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("message {}", id)))
    }

    async fn claim(
        &self,
        topic: &str,
        owner: &str,
        batch_size: u32,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Message>> {
        self.check_available()?;
        let mut tables = self.inner.tables();

        let mut eligible: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.is_claimable(topic, now))
            .cloned()
            .collect();
        sort_for_delivery(&mut eligible);
        eligible.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for candidate in eligible {
            if let Some(message) = tables.messages.get_mut(&candidate.id) {
                message.status = MessageStatus::Processing;
                message.owner = Some(owner.to_string());
                message.lease_expires_at = Some(lease_until);
                message.updated_at = now;
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn acknowledge(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> DbResult<Message> {
        self.check_available()?;
        self.fenced_message(id, owner, retry_count, |message| {
            message.status = MessageStatus::Completed;
            message.lease_expires_at = None;
            message.last_error = None;
            message.updated_at = now;
        })
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
        self.check_available()?;
        self.fenced_message(id, owner, retry_count, |message| {
            message.status = MessageStatus::Pending;
            message.retry_count += 1;
            message.next_retry_at = Some(retry_at);
            message.last_error = Some(error.to_string());
            message.owner = None;
            message.lease_expires_at = None;
            message.updated_at = now;
        })
    }

    async fn dead_letter(
        &self,
        id: MessageId,
        owner: &str,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Message> {
        self.check_available()?;
        self.fenced_message(id, owner, retry_count, |message| {
            message.status = MessageStatus::Failed;
            message.retry_count += 1;
            message.next_retry_at = None;
            message.last_error = Some(error.to_string());
            message.lease_expires_at = None;
            message.updated_at = now;
        })
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> DbResult<Vec<Message>> {
        self.check_available()?;
        let mut tables = self.inner.tables();
        let mut reclaimed: Vec<Message> = tables
            .messages
            .values_mut()
            .filter(|m| {
                m.status == MessageStatus::Processing
                    && m.lease_expires_at.is_some_and(|at| at < now)
            })
            .map(|message| {
                message.retry_count += 1;
                message.status = if message.retry_count >= message.max_retries {
                    MessageStatus::Failed
                } else {
                    MessageStatus::Pending
                };
                message.last_error = Some(format!(
                    "lease expired (owner {})",
                    message.owner.as_deref().unwrap_or("unknown")
                ));
                message.next_retry_at = None;
                message.owner = None;
                message.lease_expires_at = None;
                message.updated_at = now;
                message.clone()
            })
            .collect();
        sort_for_delivery(&mut reclaimed);
        Ok(reclaimed)
    }

    async fn pending_count(&self, topic: &str) -> DbResult<i64> {
        self.check_available()?;
        let tables = self.inner.tables();
        let count = tables
            .messages
            .values()
            .filter(|m| m.topic == topic && m.status == MessageStatus::Pending)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn subscribe(&self) -> DbResult<WakeStream> {
        self.check_available()?;
        let stream = BroadcastStream::new(self.inner.wake.subscribe())
            .filter_map(|signal| async move { signal.ok() });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl LockBackend for MemoryStore {
    async fn open_session(&self) -> DbResult<Box<dyn LockSession>> {
        self.check_available()?;
        Ok(Box::new(MemoryLockSession {
            id: self.inner.next_session.fetch_add(1, Ordering::SeqCst),
            inner: self.inner.clone(),
            keys: HashSet::new(),
        }))
    }
}

/// Lock session whose locks vanish when it is dropped.
struct MemoryLockSession {
    id: u64,
    inner: Arc<Inner>,
    keys: HashSet<i64>,
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn try_lock(&mut self, key: i64) -> DbResult<bool> {
        let mut locks = self.inner.locks();
        match locks.get(&key) {
            Some(holder) if *holder != self.id => Ok(false),
            _ => {
                locks.insert(key, self.id);
                self.keys.insert(key);
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: i64) -> DbResult<bool> {
        self.keys.remove(&key);
        let mut locks = self.inner.locks();
        if locks.get(&key) == Some(&self.id) {
            locks.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn is_held(&mut self, key: i64) -> DbResult<bool> {
        Ok(self.inner.locks().get(&key) == Some(&self.id))
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        let mut locks = self.inner.locks();
        for key in &self.keys {
            if locks.get(key) == Some(&self.id) {
                locks.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_job(key: &str) -> NewJob {
        NewJob {
            dedup_key: key.to_string(),
            payload: serde_json::json!({ "service": "api" }),
            max_retries: 3,
        }
    }

    fn new_message(topic: &str, priority: i32) -> NewMessage {
        NewMessage {
            topic: topic.to_string(),
            payload: serde_json::json!({ "priority": priority }),
            priority,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn test_expire_overdue_only_touches_due_requests() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let past = now - chrono::Duration::hours(1);

        let mut overdue = Vec::new();
        for i in 0..3 {
            let new = NewApproval::new(format!("op-{i}"), "alice", ["bob"], Duration::from_secs(60));
            overdue.push(store.create(&new, past).await.unwrap().id);
        }
        let mut waiting = Vec::new();
        for i in 0..2 {
            let new = NewApproval::new(format!("op-w{i}"), "alice", ["bob"], Duration::from_secs(3600));
            waiting.push(store.create(&new, now).await.unwrap().id);
        }

        let expired = store.expire_overdue(now).await.unwrap();
        assert_eq!(expired.len(), 3);

        for id in overdue {
            let request = ApprovalStore::get(&store, id).await.unwrap();
            assert_eq!(request.status, ApprovalStatus::Expired);
            assert_eq!(request.responded_at, Some(now));
        }
        for id in waiting {
            let request = ApprovalStore::get(&store, id).await.unwrap();
            assert_eq!(request.status, ApprovalStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_decision_on_terminal_request_leaves_row_unchanged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let new = NewApproval::new("op-1", "alice", ["bob"], Duration::from_secs(60));
        let created = store.create(&new, now).await.unwrap();

        let approved = store
            .decide(created.id, &ApprovalDecision::Approve, "bob", now)
            .await
            .unwrap();

        let err = store
            .decide(
                created.id,
                &ApprovalDecision::Reject {
                    reason: "too late".to_string(),
                },
                "bob",
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));

        let reread = ApprovalStore::get(&store, created.id).await.unwrap();
        assert_eq!(reread, approved);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_live() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = store.enqueue(&new_job("job-1"), now).await.unwrap();
        let second = store.enqueue(&new_job("job-1"), now).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.depth().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..20 {
            store.enqueue(&new_job(&format!("job-{i}")), now).await.unwrap();
        }

        let lease = now + chrono::Duration::minutes(5);
        let mut handles = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                JobStore::claim(&store, &format!("worker-{w}"), 3, lease, now).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_fenced_write_after_reclaim_is_refused() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(&new_job("job-1"), now).await.unwrap();

        let lease = now + chrono::Duration::seconds(30);
        let claimed = JobStore::claim(&store, "worker-a", 1, lease, now).await.unwrap();
        let job = &claimed[0];

        let later = now + chrono::Duration::minutes(1);
        let reclaimed = JobStore::reclaim_expired(&store, later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, JobStatus::Pending);
        assert_eq!(reclaimed[0].retry_count, 1);

        let err = store
            .complete(job.id, "worker-a", job.retry_count, later)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let low = store.publish(&new_message("t1", 1), now).await.unwrap();
        let high = store
            .publish(&new_message("t1", 5), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        store.publish(&new_message("t2", 9), now).await.unwrap();

        let lease = now + chrono::Duration::minutes(1);
        let later = now + chrono::Duration::seconds(2);
        let claimed = MessageStore::claim(&store, "t1", "consumer", 10, lease, later)
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.inject_transient_failures(1);
        let err = store.depth().await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.depth().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_lock_session_releases_its_locks() {
        let store = MemoryStore::new();
        let mut first = store.open_session().await.unwrap();
        let mut second = store.open_session().await.unwrap();

        assert!(first.try_lock(42).await.unwrap());
        assert!(!second.try_lock(42).await.unwrap());

        drop(first);
        assert!(second.try_lock(42).await.unwrap());
        assert!(second.is_held(42).await.unwrap());
    }
}
