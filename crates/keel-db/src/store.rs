//! Store traits and PostgreSQL implementations.

pub mod approval;
pub mod job;
pub mod lock;
pub mod message;

pub use approval::{ApprovalStore, PgApprovalStore};
pub use job::{JobStore, PgJobStore};
pub use lock::{LockBackend, LockSession, PgLockBackend};
pub use message::{MESSAGE_CHANNEL, MessageStore, PgMessageStore, WakeStream};
