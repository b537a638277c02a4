//! Database layer for Keel.
//!
//! Provides the store traits used by the coordination services, their
//! PostgreSQL implementations, and an in-process [`memory::MemoryStore`].

pub mod error;
pub mod memory;
pub mod store;

pub use error::{DbError, DbResult};
pub use store::*;

use memory::MemoryStore;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

/// One implementation of every store trait, shared by the services of an
/// instance.
#[derive(Clone)]
pub struct Stores {
    pub approvals: Arc<dyn ApprovalStore>,
    pub jobs: Arc<dyn JobStore>,
    pub messages: Arc<dyn MessageStore>,
    pub locks: Arc<dyn LockBackend>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            approvals: Arc::new(PgApprovalStore::new(pool.clone())),
            jobs: Arc::new(PgJobStore::new(pool.clone())),
            messages: Arc::new(PgMessageStore::new(pool.clone())),
            locks: Arc::new(PgLockBackend::new(&pool)),
        }
    }

    pub fn memory(store: &MemoryStore) -> Self {
        Self {
            approvals: Arc::new(store.clone()),
            jobs: Arc::new(store.clone()),
            messages: Arc::new(store.clone()),
            locks: Arc::new(store.clone()),
        }
    }
}

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations are up to date");
    Ok(())
}
