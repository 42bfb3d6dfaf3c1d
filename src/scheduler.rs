//! The worker pool.
//!
//! A fixed number of workers pull job ids off a shared queue, so at most
//! `max_concurrent` jobs run at once. A worker processing a batch member
//! additionally holds one of the batch's permits, which narrows the batch
//! to its own ceiling without giving up the global one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::EngineCore;
use crate::error::{EngineError, FailureKind, JobError};
use crate::executor::VerificationContext;
use crate::registry::{Job, JobState, Transition};

pub(crate) type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

pub(crate) fn spawn_workers(
    core: Arc<EngineCore>,
    queue: JobQueue,
    count: usize,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let core = Arc::clone(&core);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                debug!(worker, "worker started");
                loop {
                    // Hold the queue lock only while receiving, never while
                    // running a job.
                    let job_id = {
                        let mut rx = queue.lock().await;
                        rx.recv().await
                    };
                    let Some(job_id) = job_id else { break };
                    run_one(&core, &job_id).await;
                }
                debug!(worker, "worker stopped");
            })
        })
        .collect()
}

async fn run_one(core: &Arc<EngineCore>, job_id: &str) {
    let snapshot = match core.registry.get_job(job_id) {
        Ok(job) => job,
        Err(err) => {
            warn!(job_id, error = %err, "queued job vanished from the registry");
            return;
        }
    };
    if snapshot.state != JobState::Queued {
        debug!(job_id, state = %snapshot.state, "job left the queue before pickup");
        return;
    }

    // A batch member also claims one of its batch's permits. The worker's
    // global slot stays occupied while it waits, which is what keeps the
    // batch ceiling from raising the global one.
    let _permit = match &snapshot.batch_id {
        Some(batch_id) => {
            let batch = match core.registry.get_batch(batch_id) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(job_id, batch_id, error = %err, "batch missing for member job");
                    return;
                }
            };
            match Arc::clone(&batch.permits).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            }
        }
        None => None,
    };

    // The token must exist before the job is visibly running, so a batch
    // cancel that observes `running` always finds something to signal.
    let cancel = core.register_cancel_token(job_id);

    // Cancellation may have landed while the job sat in the queue.
    let job = match core.registry.transition(job_id, Transition::Start) {
        Ok(job) => job,
        Err(EngineError::InvalidTransition { .. }) => {
            core.remove_cancel_token(job_id);
            debug!(job_id, "job no longer queued, skipping");
            return;
        }
        Err(err) => {
            core.remove_cancel_token(job_id);
            error!(job_id, error = %err, "failed to start job");
            return;
        }
    };
    info!(job_id, profile = %job.profile_ref, "job started");

    let transition = drive(core, &job, cancel).await;
    core.remove_cancel_token(job_id);

    match core.finish_job(job_id, transition) {
        Ok(job) => info!(job_id, state = %job.state, "job finished"),
        // The cancel grace deadline may have forced a terminal state already.
        Err(EngineError::InvalidTransition { .. }) => {
            debug!(job_id, "job reached a terminal state elsewhere");
        }
        Err(err) => error!(job_id, error = %err, "failed to record job outcome"),
    }
}

/// Runs the automation under the job's deadline and maps the outcome onto
/// a terminal transition.
async fn drive(
    core: &Arc<EngineCore>,
    job: &Job,
    cancel: tokio_util::sync::CancellationToken,
) -> Transition {
    if core.profiles.get_profile(&job.profile_ref).await.is_none() {
        return Transition::Fail(JobError::new(
            FailureKind::ProfileNotFound,
            format!("profile {} not found", job.profile_ref),
        ));
    }

    let ctx = VerificationContext::new(Arc::clone(&core.correlator), cancel, core.sms_wait());
    let deadline = Duration::from_secs(job.max_wait_secs);
    match tokio::time::timeout(deadline, core.executor.run(&job.profile_ref, &job.params, &ctx))
        .await
    {
        Ok(Ok(result)) => Transition::Succeed(result),
        Ok(Err(failure)) => match failure.into_job_error() {
            Some(err) => Transition::Fail(err),
            None => Transition::Cancel,
        },
        Err(_) => {
            warn!(job_id = %job.job_id, "job exceeded its deadline");
            Transition::Fail(JobError::new(
                FailureKind::Timeout,
                format!("exceeded max_wait_time of {}s", job.max_wait_secs),
            ))
        }
    }
}
