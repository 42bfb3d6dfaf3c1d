//! contaforge: asynchronous orchestration of browser-automation account
//! creation.
//!
//! The engine accepts single jobs or batches of jobs, runs them on a
//! bounded worker pool, correlates inbound SMS-verification webhooks to the
//! workers waiting on them, and notifies caller-supplied webhook URLs when
//! jobs and batches settle. The browser automation itself lives behind the
//! [`executor::AutomationExecutor`] trait.

pub mod cli;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
mod scheduler;

pub use config::EngineConfig;
pub use correlation::SmsEvent;
pub use engine::{BatchTicket, Engine, JobTicket};
pub use error::{EngineError, FailureKind, JobError};
pub use registry::{BatchReport, BatchRequest, BatchStatus, Job, JobSpec, JobState};
