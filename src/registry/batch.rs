use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::job::{Job, JobState};

/// Aggregate batch status, derived from member job states on every read.
/// Never stored independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Running => write!(f, "running"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A caller-defined group of jobs submitted together.
///
/// The job set is fixed at creation; only the cancellation and
/// callback-delivery flags mutate afterwards.
#[derive(Debug)]
pub struct Batch {
    pub batch_id: String,
    /// Insertion order equals submission order.
    pub job_ids: Vec<String>,
    /// Batch-scoped ceiling; narrows the global one, never raises it.
    pub max_concurrent: usize,
    pub webhook_callback: Option<String>,
    pub created_at: DateTime<Utc>,
    cancel_requested: AtomicBool,
    callback_fired: AtomicBool,
    /// FIFO-fair permits enforcing `max_concurrent` for this batch.
    pub(crate) permits: Arc<Semaphore>,
}

impl Batch {
    pub fn new(
        job_ids: Vec<String>,
        max_concurrent: usize,
        webhook_callback: Option<String>,
    ) -> Self {
        Self::with_id(Self::generate_id(), job_ids, max_concurrent, webhook_callback)
    }

    /// Batch ids are minted before the batch exists, so member jobs can be
    /// created already pointing at it.
    pub fn generate_id() -> String {
        format!("batch-{}", Uuid::new_v4())
    }

    pub fn with_id(
        batch_id: String,
        job_ids: Vec<String>,
        max_concurrent: usize,
        webhook_callback: Option<String>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            batch_id,
            job_ids,
            max_concurrent,
            webhook_callback,
            created_at: Utc::now(),
            cancel_requested: AtomicBool::new(false),
            callback_fired: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Returns true exactly once, for the caller that should fire the
    /// batch callback.
    pub fn claim_callback(&self) -> bool {
        !self.callback_fired.swap(true, Ordering::SeqCst)
    }

    /// Derives the aggregate status from member snapshots: `cancelled` when
    /// an explicit cancel terminated member jobs, `completed` when every job
    /// is terminal, `running` otherwise.
    pub fn status_from(&self, jobs: &[Job]) -> BatchStatus {
        let all_terminal = jobs.iter().all(|j| j.state.is_terminal());
        if !all_terminal {
            return BatchStatus::Running;
        }
        let any_cancelled = jobs.iter().any(|j| j.state == JobState::Cancelled);
        if self.cancel_requested() && any_cancelled {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        }
    }
}

/// Request shape for batch submission: one spec per profile plus parameters
/// shared by every job in the group.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub profiles: Vec<super::job::JobSpec>,
    /// Merged into each profile's params; profile-specific keys win.
    #[serde(default)]
    pub common_params: Option<serde_json::Value>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub webhook_callback: Option<String>,
}

/// Merges `common` into `specific`, keeping `specific` keys on conflict.
pub fn merge_params(
    common: Option<&serde_json::Value>,
    specific: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = match common {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let serde_json::Value::Object(map) = specific {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    serde_json::Value::Object(merged)
}

/// Aggregate view returned by batch status queries. Counters are recomputed
/// from the job registry on every call.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<Job>>,
    /// Success payloads of succeeded jobs, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<serde_json::Value>>,
}

impl BatchReport {
    pub fn build(batch: &Batch, jobs: &[Job], include_jobs: bool, include_results: bool) -> Self {
        let count = |s: JobState| jobs.iter().filter(|j| j.state == s).count();
        let results = include_results.then(|| {
            jobs.iter()
                .filter(|j| j.state == JobState::Succeeded)
                .filter_map(|j| j.result.clone())
                .collect()
        });
        Self {
            batch_id: batch.batch_id.clone(),
            status: batch.status_from(jobs),
            created_at: batch.created_at,
            total_jobs: jobs.len(),
            queued: count(JobState::Queued),
            running: count(JobState::Running),
            succeeded: count(JobState::Succeeded),
            failed: count(JobState::Failed),
            cancelled: count(JobState::Cancelled),
            jobs: include_jobs.then(|| jobs.to_vec()),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::job::{JobSpec, Transition};
    use serde_json::json;

    fn job_in_state(state: JobState) -> Job {
        let mut job = Job::new(JobSpec::new("p"), None, 600);
        match state {
            JobState::Queued => {}
            JobState::Running => job.apply(Transition::Start),
            JobState::Succeeded => {
                job.apply(Transition::Start);
                job.apply(Transition::Succeed(json!({"email": "x@y.z"})));
            }
            JobState::Failed => {
                job.apply(Transition::Start);
                job.apply(Transition::Fail(crate::error::JobError::new(
                    crate::error::FailureKind::AutomationError,
                    "boom",
                )));
            }
            JobState::Cancelled => job.apply(Transition::Cancel),
        }
        job
    }

    #[test]
    fn status_running_while_any_job_active() {
        let batch = Batch::new(vec![], 2, None);
        let jobs = vec![
            job_in_state(JobState::Succeeded),
            job_in_state(JobState::Running),
        ];
        assert_eq!(batch.status_from(&jobs), BatchStatus::Running);
    }

    #[test]
    fn status_completed_when_all_terminal() {
        let batch = Batch::new(vec![], 2, None);
        let jobs = vec![
            job_in_state(JobState::Succeeded),
            job_in_state(JobState::Failed),
        ];
        assert_eq!(batch.status_from(&jobs), BatchStatus::Completed);
    }

    #[test]
    fn status_cancelled_only_after_explicit_cancel() {
        let batch = Batch::new(vec![], 2, None);
        let jobs = vec![
            job_in_state(JobState::Succeeded),
            job_in_state(JobState::Cancelled),
        ];
        // A member job cancelled without an explicit batch cancel still
        // counts as a completed batch.
        assert_eq!(batch.status_from(&jobs), BatchStatus::Completed);

        batch.request_cancel();
        assert_eq!(batch.status_from(&jobs), BatchStatus::Cancelled);
    }

    #[test]
    fn callback_claimed_exactly_once() {
        let batch = Batch::new(vec![], 2, None);
        assert!(batch.claim_callback());
        assert!(!batch.claim_callback());
        assert!(!batch.claim_callback());
    }

    #[test]
    fn max_concurrent_floor_of_one() {
        let batch = Batch::new(vec![], 0, None);
        assert_eq!(batch.max_concurrent, 1);
        assert_eq!(batch.permits.available_permits(), 1);
    }

    #[test]
    fn merge_params_profile_keys_win() {
        let common = json!({"headless": true, "max_wait_time": 60});
        let specific = json!({"headless": false, "country": "73"});
        let merged = merge_params(Some(&common), &specific);
        assert_eq!(merged["headless"], false);
        assert_eq!(merged["max_wait_time"], 60);
        assert_eq!(merged["country"], "73");
    }

    #[test]
    fn merge_params_without_common() {
        let specific = json!({"country": "151"});
        let merged = merge_params(None, &specific);
        assert_eq!(merged, specific);
    }

    #[test]
    fn report_counts_states() {
        let batch = Batch::new(vec![], 2, None);
        let jobs = vec![
            job_in_state(JobState::Queued),
            job_in_state(JobState::Running),
            job_in_state(JobState::Succeeded),
            job_in_state(JobState::Succeeded),
            job_in_state(JobState::Failed),
        ];
        let report = BatchReport::build(&batch, &jobs, false, true);
        assert_eq!(report.total_jobs, 5);
        assert_eq!(report.queued, 1);
        assert_eq!(report.running, 1);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cancelled, 0);
        assert!(report.jobs.is_none());
        assert_eq!(report.results.as_ref().unwrap().len(), 2);
    }
}
