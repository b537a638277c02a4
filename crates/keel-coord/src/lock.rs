//! Distributed mutual exclusion over store advisory locks.
//!
//! Each held resource owns its own lock session. If that session dies the
//! store drops the lock, so a holder that cannot confirm its session with
//! [`DistributedLock::ensure_held`] must assume another instance may already
//! be working on the resource.

use keel_core::{Error, Result, lock_key};
use keel_db::{LockBackend, LockSession};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Default delay between two lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct HeldLock {
    key: i64,
    session: Box<dyn LockSession>,
}

/// Handle for taking and releasing named locks.
///
/// Every acquire contends in the store with its own session, so two tasks
/// sharing one handle exclude each other like two instances do. Locks are
/// not re-entrant: acquiring a resource this handle already holds waits for
/// its release.
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    poll_interval: Duration,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Try to take `resource` until `timeout` elapses.
    ///
    /// Returns `Ok(false)` when the deadline passes; that is the expected
    /// outcome under contention, not a fault. Dropping the returned future
    /// mid-attempt drops the session with it, which releases anything the
    /// attempt may have taken.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<bool> {
        let key = lock_key(resource);
        let mut session = self.backend.open_session().await?;
        let deadline = Instant::now() + timeout;

        loop {
            debug!(resource, key, "Attempting lock");
            if session.try_lock(key).await? {
                // The store grants a key to one session at a time, so no
                // other entry for this resource can exist.
                self.held
                    .lock()
                    .await
                    .insert(resource.to_string(), HeldLock { key, session });
                info!(resource, "Lock acquired");
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(resource, ?timeout, "Lock not acquired before deadline");
                close_session(resource, session).await;
                return Ok(false);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Like [`acquire`](Self::acquire), but a missed deadline is a `LockTimeout`.
    pub async fn acquire_or_timeout(&self, resource: &str, timeout: Duration) -> Result<()> {
        if self.acquire(resource, timeout).await? {
            Ok(())
        } else {
            Err(Error::LockTimeout(format!(
                "{} not acquired within {:?}",
                resource, timeout
            )))
        }
    }

    /// Release `resource`. Releasing a lock this handle does not hold is a no-op.
    pub async fn release(&self, resource: &str) -> Result<()> {
        let Some(HeldLock { key, mut session }) = self.held.lock().await.remove(resource) else {
            debug!(resource, "Release of unheld lock ignored");
            return Ok(());
        };

        match session.unlock(key).await {
            Ok(true) => info!(resource, "Lock released"),
            Ok(false) => warn!(resource, "Lock was no longer held at release"),
            Err(e) => warn!(resource, error = %e, "Unlock failed; closing session instead"),
        }
        close_session(resource, session).await;
        Ok(())
    }

    /// Verify with the store that this handle still holds `resource`.
    ///
    /// Fails with `LockLost` when the session died or never held the lock;
    /// the local entry is dropped so a later acquire starts fresh.
    pub async fn ensure_held(&self, resource: &str) -> Result<()> {
        let mut held = self.held.lock().await;
        let Some(lock) = held.get_mut(resource) else {
            return Err(Error::LockLost(format!("{} is not held", resource)));
        };

        match lock.session.is_held(lock.key).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                held.remove(resource);
                warn!(resource, "Lock lost");
                Err(Error::LockLost(format!("{} was released by the store", resource)))
            }
            Err(e) => {
                held.remove(resource);
                warn!(resource, error = %e, "Lock session failed");
                Err(Error::LockLost(format!("{}: {}", resource, e)))
            }
        }
    }

    /// Whether this handle believes it holds `resource`, without asking the store.
    pub async fn is_held_locally(&self, resource: &str) -> bool {
        self.held.lock().await.contains_key(resource)
    }

    /// Run `f` while holding `resource`, releasing afterwards whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_or_timeout(resource, timeout).await?;
        let result = f().await;
        self.release(resource).await?;
        result
    }
}

async fn close_session(resource: &str, session: Box<dyn LockSession>) {
    if let Err(e) = session.close().await {
        warn!(resource, error = %e, "Failed to close lock session");
    }
}
