//! Canonical record of every job and batch in the process.
//!
//! The registry is an arena of records addressed by generated ids. The outer
//! maps are only locked to insert or fetch a handle; every read-modify-write
//! on a job goes through that job's own lock, so mutations on different ids
//! never serialize against each other.

pub mod batch;
pub mod job;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::EngineError;

pub use batch::{Batch, BatchReport, BatchRequest, BatchStatus};
pub use job::{Job, JobSpec, JobState, Transition};

pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Mutex<Job>>>>,
    batches: RwLock<HashMap<String, Arc<Batch>>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a job record in `queued` and returns a snapshot of it.
    pub fn create_job(
        &self,
        spec: JobSpec,
        batch_id: Option<String>,
        default_max_wait_secs: u64,
    ) -> Job {
        let job = Job::new(spec, batch_id, default_max_wait_secs);
        let snapshot = job.clone();
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.job_id.clone(), Arc::new(Mutex::new(job)));
        snapshot
    }

    pub fn insert_batch(&self, batch: Batch) -> Arc<Batch> {
        let batch = Arc::new(batch);
        self.batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.batch_id.clone(), Arc::clone(&batch));
        batch
    }

    fn job_handle(&self, job_id: &str) -> Result<Arc<Mutex<Job>>, EngineError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    /// Returns a point-in-time snapshot of the job. Readers never observe a
    /// half-applied transition because snapshots are taken under the job lock.
    pub fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let handle = self.job_handle(job_id)?;
        let job = handle.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(job.clone())
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Arc<Batch>, EngineError> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(batch_id)
            .cloned()
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))
    }

    /// Applies a state transition, rejecting anything the state machine does
    /// not permit. Validation and mutation happen under the job lock, so a
    /// job visits each state at most once no matter how many workers race.
    pub fn transition(&self, job_id: &str, transition: Transition) -> Result<Job, EngineError> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock().unwrap_or_else(PoisonError::into_inner);
        let target = transition.target();
        if !job.state.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.state,
                to: target,
            });
        }
        job.apply(transition);
        Ok(job.clone())
    }

    /// Claims the job for the scheduler. Fails with `AlreadyScheduled` when
    /// the job was submitted before or has already left `queued`.
    pub fn mark_scheduled(&self, job_id: &str) -> Result<(), EngineError> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock().unwrap_or_else(PoisonError::into_inner);
        if job.scheduled || job.state != JobState::Queued {
            return Err(EngineError::AlreadyScheduled(job_id.to_string()));
        }
        job.scheduled = true;
        Ok(())
    }

    /// Terminal-state bookkeeping: records that the job's callback was handed
    /// to the dispatcher. The one mutation allowed after a terminal state.
    pub fn mark_callback_delivered(&self, job_id: &str) -> Result<(), EngineError> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.lock().unwrap_or_else(PoisonError::into_inner);
        job.callback_delivered = true;
        Ok(())
    }

    /// Snapshots every member job of a batch, in submission order.
    pub fn batch_jobs(&self, batch: &Batch) -> Vec<Job> {
        batch
            .job_ids
            .iter()
            .filter_map(|id| self.get_job(id).ok())
            .collect()
    }
}
