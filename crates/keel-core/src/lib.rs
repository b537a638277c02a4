//! Core domain types and traits for Keel.
//!
//! This crate contains:
//! - Typed identifiers for approvals, jobs and messages
//! - The approval, job and message state machines
//! - The coordination error taxonomy
//! - Retry/backoff policy and transient-failure retry helper
//! - Lock key hashing
//! - The executor and message handler traits implemented by callers

pub mod approval;
pub mod cancel;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod lock;
pub mod message;
pub mod retry;
pub mod time;

pub use approval::{ApprovalDecision, ApprovalRequest, ApprovalStatus, NewApproval};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use executor::{ExecutionError, MessageHandler, OperationExecutor};
pub use id::{ApprovalId, JobId, MessageId};
pub use job::{Enqueued, Job, JobStatus, NewJob, QueueDepth};
pub use lock::lock_key;
pub use message::{Message, MessageStatus, NewMessage};
pub use retry::{RetryPolicy, TransientRetry};
