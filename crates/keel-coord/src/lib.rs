//! Store-backed coordination for Keel.
//!
//! Every component keeps its state in the shared store and coordinates
//! through conditional, single-statement updates, so any number of
//! instances can run side by side:
//!
//! - [`DistributedLock`]: session-scoped advisory locks
//! - [`ApprovalService`]: human approval gates with expiry
//! - [`JobQueue`] and [`Worker`]: leased jobs with retries and dead-lettering
//! - [`MessageBus`] and [`Subscriber`]: prioritized at-least-once messages
//! - [`Sweeper`]: approval expiry and lease reclamation

pub mod approvals;
pub mod coordinator;
pub mod lock;
pub mod messages;
pub mod queue;
pub mod sweeper;
pub mod worker;

pub use approvals::{ApprovalService, WaitOutcome};
pub use coordinator::Coordinator;
pub use lock::DistributedLock;
pub use messages::{MessageBus, Subscriber};
pub use queue::JobQueue;
pub use sweeper::{SweepReport, Sweeper};
pub use worker::{Worker, WorkerOptions};
