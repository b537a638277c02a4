//! Session-scoped advisory locks.
//!
//! A lock belongs to the database session that took it and disappears with
//! that session. Each [`LockSession`] therefore owns one dedicated connection
//! outside the pool: dropping the session closes the connection, and the
//! server releases whatever it held. A pooled connection would instead go
//! back to the pool still holding the lock.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, PgPool};
use std::sync::Arc;

use crate::DbResult;

/// One store session able to hold advisory locks.
#[async_trait]
pub trait LockSession: Send {
    /// Non-blocking attempt to take `key`.
    async fn try_lock(&mut self, key: i64) -> DbResult<bool>;

    /// Release `key`; false when this session did not hold it.
    async fn unlock(&mut self, key: i64) -> DbResult<bool>;

    /// Whether this session still holds `key` according to the store.
    async fn is_held(&mut self, key: i64) -> DbResult<bool>;

    /// End the session, releasing everything it holds.
    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// Opens lock sessions.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn open_session(&self) -> DbResult<Box<dyn LockSession>>;
}

/// PostgreSQL advisory locks (`pg_try_advisory_lock`).
pub struct PgLockBackend {
    options: Arc<PgConnectOptions>,
}

impl PgLockBackend {
    /// Sessions connect with the same options as `pool`.
    pub fn new(pool: &PgPool) -> Self {
        Self {
            options: pool.connect_options(),
        }
    }
}

#[async_trait]
impl LockBackend for PgLockBackend {
    async fn open_session(&self) -> DbResult<Box<dyn LockSession>> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(Box::new(PgLockSession { conn }))
    }
}

struct PgLockSession {
    conn: PgConnection,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_lock(&mut self, key: i64) -> DbResult<bool> {
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(locked)
    }

    async fn unlock(&mut self, key: i64) -> DbResult<bool> {
        let (released,): (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(released)
    }

    async fn is_held(&mut self, key: i64) -> DbResult<bool> {
        // A bigint advisory key is split across classid (high 32 bits) and
        // objid (low 32 bits), with objsubid = 1.
        let (held,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND pid = pg_backend_pid()
                  AND granted
                  AND objsubid = 1
                  AND classid = ((($1::bigint) >> 32) & 4294967295)::oid
                  AND objid = (($1::bigint) & 4294967295)::oid
            )
            "#,
        )
        .bind(key)
        .fetch_one(&mut self.conn)
        .await?;
        Ok(held)
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}
