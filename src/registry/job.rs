use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// The lifecycle states of a job.
///
/// Each job flows through: QUEUED → RUNNING → {SUCCEEDED | FAILED | CANCELLED}.
/// A queued job may also be cancelled directly, without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Cancelled) => true,
            (JobState::Running, JobState::Succeeded) => true,
            (JobState::Running, JobState::Failed) => true,
            (JobState::Running, JobState::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A requested state change plus the payload that travels with it.
#[derive(Debug, Clone)]
pub enum Transition {
    /// queued → running.
    Start,
    /// running → succeeded, carrying the produced account data.
    Succeed(serde_json::Value),
    /// running → failed, carrying the captured error.
    Fail(JobError),
    /// queued/running → cancelled.
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Succeed(_) => JobState::Succeeded,
            Transition::Fail(_) => JobState::Failed,
            Transition::Cancel => JobState::Cancelled,
        }
    }
}

/// Caller-supplied parameters for one unit of account-creation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Opaque handle to the automation profile being driven.
    pub profile_ref: String,
    /// Opaque parameters forwarded to the automation collaborator
    /// (phone parameters, headless flag, and so on).
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
    /// URL notified once, when the job reaches a terminal state.
    #[serde(default)]
    pub webhook_callback: Option<String>,
    /// Execution deadline in seconds; exceeding it fails the job with
    /// kind `timeout`.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobSpec {
    pub fn new(profile_ref: impl Into<String>) -> Self {
        Self {
            profile_ref: profile_ref.into(),
            params: default_params(),
            webhook_callback: None,
            max_wait_secs: None,
        }
    }
}

/// A single account-creation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub profile_ref: String,
    pub params: serde_json::Value,
    pub state: JobState,
    /// Free-text progress note, updated on every transition.
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Present only in `succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present only in `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_callback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub max_wait_secs: u64,
    /// Callback-delivery bookkeeping; the only field that may change after
    /// a terminal transition.
    #[serde(default)]
    pub callback_delivered: bool,
    /// Set once the job has been handed to the scheduler; duplicate
    /// submissions are rejected.
    #[serde(skip)]
    pub(crate) scheduled: bool,
}

impl Job {
    pub fn new(spec: JobSpec, batch_id: Option<String>, default_max_wait_secs: u64) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            profile_ref: spec.profile_ref,
            params: spec.params,
            state: JobState::Queued,
            message: "job created, waiting for a worker slot".to_string(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            webhook_callback: spec.webhook_callback,
            batch_id,
            max_wait_secs: spec.max_wait_secs.unwrap_or(default_max_wait_secs),
            callback_delivered: false,
            scheduled: false,
        }
    }

    /// Applies a validated transition in place. Callers must have checked
    /// `can_transition_to` first; this only records the side data.
    pub(crate) fn apply(&mut self, transition: Transition) {
        let now = Utc::now();
        match transition {
            Transition::Start => {
                self.state = JobState::Running;
                self.started_at = Some(now);
                self.message = "automation running".to_string();
            }
            Transition::Succeed(result) => {
                self.state = JobState::Succeeded;
                self.finished_at = Some(now);
                self.message = "account created successfully".to_string();
                self.result = Some(result);
            }
            Transition::Fail(error) => {
                self.state = JobState::Failed;
                self.finished_at = Some(now);
                self.message = error.to_string();
                self.error = Some(error);
            }
            Transition::Cancel => {
                self.state = JobState::Cancelled;
                self.finished_at = Some(now);
                self.message = "job cancelled".to_string();
            }
        }
    }
}
