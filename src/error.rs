use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::job::JobState;

/// Errors surfaced synchronously to callers of the engine.
///
/// Failures that happen *during* execution never travel through this type:
/// they are captured into the job's terminal `failed` state as a [`JobError`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("activation not found: {0}")]
    ActivationNotFound(String),

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("job already scheduled: {0}")]
    AlreadyScheduled(String),

    #[error("batch has no profiles to process")]
    EmptyBatch,

    #[error("invalid webhook payload: {0}")]
    InvalidWebhook(String),

    #[error("submission queue is closed")]
    QueueClosed,
}

/// Classifies the cause of a terminal `failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The automation collaborator reported a step failure.
    AutomationError,
    /// The job exceeded its `max_wait_time`, or the verification wait expired.
    Timeout,
    /// The verification provider reported a failed activation.
    VerificationFailed,
    /// The referenced automation profile does not exist.
    ProfileNotFound,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::AutomationError => write!(f, "automation_error"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::VerificationFailed => write!(f, "verification_failed"),
            FailureKind::ProfileNotFound => write!(f, "profile_not_found"),
        }
    }
}

/// Structured error recorded on a job that reached the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Failure reported by the automation collaborator while driving a profile.
#[derive(Debug, Error)]
pub enum AutomationFailure {
    /// A browser-automation step failed (navigation, form fill, detection).
    #[error("automation step failed: {0}")]
    Step(String),

    /// The profile handed to the executor does not exist on the provider side.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// The verification provider reported the activation as failed.
    #[error("phone verification failed: {0}")]
    Verification(String),

    /// No verification code arrived within the configured wait.
    #[error("timed out waiting for verification code")]
    SmsTimeout,

    /// The worker observed its cancellation token between steps.
    #[error("cancelled before completion")]
    Cancelled,
}

impl AutomationFailure {
    /// Maps the collaborator failure onto the job error taxonomy.
    /// `Cancelled` has no mapping: it terminates the job as `cancelled`,
    /// not `failed`.
    pub fn into_job_error(self) -> Option<JobError> {
        match self {
            AutomationFailure::Step(msg) => {
                Some(JobError::new(FailureKind::AutomationError, msg))
            }
            AutomationFailure::ProfileNotFound(profile) => Some(JobError::new(
                FailureKind::ProfileNotFound,
                format!("profile {profile} not found"),
            )),
            AutomationFailure::Verification(msg) => {
                Some(JobError::new(FailureKind::VerificationFailed, msg))
            }
            AutomationFailure::SmsTimeout => Some(JobError::new(
                FailureKind::Timeout,
                "timed out waiting for verification code",
            )),
            AutomationFailure::Cancelled => None,
        }
    }
}
