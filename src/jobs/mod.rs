//! Persistent job queue and in-process runner (§4.6 "Job Runner").

pub mod runner;
pub mod store;

pub use runner::{JobRunner, ProgressReporter, ToolContext, ToolDispatch};
pub use store::{default_idempotency_key, Job, JobEvent, JobEventKind, JobStatus, JobStore};
