//! The orchestration engine: ties the registry, scheduler, correlation
//! store and callback dispatcher together behind one public handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::correlation::{SmsCorrelator, SmsEvent};
use crate::dispatcher::{CallbackDispatcher, RetryPolicy};
use crate::error::EngineError;
use crate::executor::{AutomationExecutor, ProfileProvider};
use crate::registry::batch::merge_params;
use crate::registry::{
    Batch, BatchReport, BatchRequest, Job, JobRegistry, JobSpec, JobState, Transition,
};
use crate::scheduler;

/// Shared state behind the public [`Engine`] handle. Workers and deadline
/// tasks hold an `Arc` to this.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) registry: JobRegistry,
    pub(crate) correlator: Arc<SmsCorrelator>,
    pub(crate) dispatcher: CallbackDispatcher,
    pub(crate) executor: Arc<dyn AutomationExecutor>,
    pub(crate) profiles: Arc<dyn ProfileProvider>,
    cancel_tokens: StdMutex<HashMap<String, CancellationToken>>,
}

impl EngineCore {
    pub(crate) fn sms_wait(&self) -> Duration {
        Duration::from_secs(self.config.sms_wait_secs)
    }

    pub(crate) fn register_cancel_token(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string(), token.clone());
        token
    }

    pub(crate) fn remove_cancel_token(&self, job_id: &str) {
        self.cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }

    fn cancel_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.cancel_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    /// After the grace window a cancelled worker that has not stopped on its
    /// own gets its job forced into `cancelled`.
    fn spawn_cancel_deadline(self: &Arc<Self>, job_id: String) {
        let core = Arc::clone(self);
        let grace = Duration::from_secs(core.config.cancel_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match core.finish_job(&job_id, Transition::Cancel) {
                Ok(_) => warn!(job_id, "worker missed the cancel grace window, state forced"),
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(err) => warn!(job_id, error = %err, "cancel deadline bookkeeping failed"),
            }
        });
    }

    /// Applies a terminal transition and performs the settlement that hangs
    /// off it: the per-job callback, and the batch callback when this job
    /// was the batch's last active member.
    pub(crate) fn finish_job(
        &self,
        job_id: &str,
        transition: Transition,
    ) -> Result<Job, EngineError> {
        let job = self.registry.transition(job_id, transition)?;

        if let Some(url) = &job.webhook_callback
            && !job.callback_delivered
        {
            match serde_json::to_value(&job) {
                Ok(payload) => {
                    self.dispatcher.notify(url.clone(), payload);
                    self.registry.mark_callback_delivered(job_id)?;
                }
                Err(err) => warn!(job_id, error = %err, "failed to encode callback payload"),
            }
        }

        if let Some(batch_id) = &job.batch_id {
            self.settle_batch(batch_id);
        }
        Ok(job)
    }

    /// Recomputes the batch status and fires the batch callback exactly once
    /// when the batch has just settled.
    fn settle_batch(&self, batch_id: &str) {
        let Ok(batch) = self.registry.get_batch(batch_id) else {
            return;
        };
        let jobs = self.registry.batch_jobs(&batch);
        let report = BatchReport::build(&batch, &jobs, false, true);
        if report.status == crate::registry::BatchStatus::Running {
            return;
        }
        if !batch.claim_callback() {
            return;
        }
        info!(batch_id, status = %report.status, "batch settled");
        if let Some(url) = &batch.webhook_callback {
            match serde_json::to_value(&report) {
                Ok(payload) => self.dispatcher.notify(url.clone(), payload),
                Err(err) => {
                    warn!(batch_id, error = %err, "failed to encode batch callback payload");
                }
            }
        }
    }
}

/// Receipt returned for a single-job submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobTicket {
    pub job_id: String,
    pub status: JobState,
    pub status_url: String,
}

/// Receipt returned for a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchTicket {
    pub batch_id: String,
    pub job_ids: Vec<String>,
    pub total_jobs: usize,
    pub max_concurrent: usize,
    pub status_url: String,
}

/// The public engine handle. Construction spawns the worker pool, so it
/// must happen inside a Tokio runtime.
pub struct Engine {
    core: Arc<EngineCore>,
    tx: mpsc::UnboundedSender<String>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn AutomationExecutor>,
        profiles: Arc<dyn ProfileProvider>,
    ) -> Self {
        let worker_count = config.max_concurrent;
        let dispatcher = CallbackDispatcher::new(RetryPolicy {
            max_attempts: config.callback_attempts,
            base_delay_ms: config.callback_base_delay_ms,
        });
        let correlator = Arc::new(SmsCorrelator::new(Duration::from_secs(
            config.sms_grace_secs,
        )));
        let core = Arc::new(EngineCore {
            config,
            registry: JobRegistry::new(),
            correlator,
            dispatcher,
            executor,
            profiles,
            cancel_tokens: StdMutex::new(HashMap::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let queue: scheduler::JobQueue = Arc::new(Mutex::new(rx));
        let workers = scheduler::spawn_workers(Arc::clone(&core), queue, worker_count);
        Self { core, tx, workers }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Submits one job for asynchronous execution.
    pub fn submit_job(&self, spec: JobSpec) -> Result<JobTicket, EngineError> {
        let job = self
            .core
            .registry
            .create_job(spec, None, self.core.config.default_max_wait_secs);
        self.enqueue(&job.job_id)?;
        info!(job_id = %job.job_id, profile = %job.profile_ref, "job submitted");
        Ok(JobTicket {
            status_url: format!("/jobs/{}", job.job_id),
            job_id: job.job_id,
            status: JobState::Queued,
        })
    }

    /// Submits a group of jobs that share a concurrency ceiling and an
    /// optional batch callback. Jobs start in submission order.
    pub fn submit_batch(&self, request: BatchRequest) -> Result<BatchTicket, EngineError> {
        if request.profiles.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        let max_concurrent = self
            .core
            .config
            .clamp_batch_concurrency(request.max_concurrent);
        let batch_id = Batch::generate_id();

        let mut job_ids = Vec::with_capacity(request.profiles.len());
        for mut spec in request.profiles {
            spec.params = merge_params(request.common_params.as_ref(), &spec.params);
            let job = self.core.registry.create_job(
                spec,
                Some(batch_id.clone()),
                self.core.config.default_max_wait_secs,
            );
            job_ids.push(job.job_id);
        }

        self.core.registry.insert_batch(Batch::with_id(
            batch_id.clone(),
            job_ids.clone(),
            max_concurrent,
            request.webhook_callback,
        ));
        for job_id in &job_ids {
            self.enqueue(job_id)?;
        }
        info!(
            batch_id,
            total_jobs = job_ids.len(),
            max_concurrent,
            "batch submitted"
        );
        Ok(BatchTicket {
            status_url: format!("/batches/{batch_id}"),
            batch_id,
            total_jobs: job_ids.len(),
            job_ids,
            max_concurrent,
        })
    }

    fn enqueue(&self, job_id: &str) -> Result<(), EngineError> {
        self.core.registry.mark_scheduled(job_id)?;
        self.tx
            .send(job_id.to_string())
            .map_err(|_| EngineError::QueueClosed)
    }

    /// Point-in-time snapshot of a job.
    pub fn job_status(&self, job_id: &str) -> Result<Job, EngineError> {
        self.core.registry.get_job(job_id)
    }

    /// Aggregate batch view, recomputed from member jobs on every call.
    pub fn batch_status(
        &self,
        batch_id: &str,
        include_jobs: bool,
        include_results: bool,
    ) -> Result<BatchReport, EngineError> {
        let batch = self.core.registry.get_batch(batch_id)?;
        let jobs = self.core.registry.batch_jobs(&batch);
        Ok(BatchReport::build(
            &batch,
            &jobs,
            include_jobs,
            include_results,
        ))
    }

    /// Cancels a batch: queued members terminate immediately, running
    /// members are asked to stop and forced after the grace window.
    /// Returns how many jobs this call moved toward cancellation; repeating
    /// the call is harmless and reports zero.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<usize, EngineError> {
        let batch = self.core.registry.get_batch(batch_id)?;
        batch.request_cancel();

        let mut cancelled = 0usize;
        for job in self.core.registry.batch_jobs(&batch) {
            match job.state {
                JobState::Queued => {
                    if self
                        .core
                        .finish_job(&job.job_id, Transition::Cancel)
                        .is_ok()
                    {
                        cancelled += 1;
                    }
                }
                JobState::Running => match self.core.cancel_token(&job.job_id) {
                    Some(token) if !token.is_cancelled() => {
                        token.cancel();
                        self.core.spawn_cancel_deadline(job.job_id.clone());
                        cancelled += 1;
                    }
                    Some(_) => {}
                    // The worker already cleaned its token up, meaning it is
                    // in the middle of recording a terminal state. The grace
                    // deadline still forces `cancelled` should that stall.
                    None => self.core.spawn_cancel_deadline(job.job_id.clone()),
                },
                _ => {}
            }
        }
        info!(batch_id, cancelled, "batch cancel requested");
        Ok(cancelled)
    }

    /// Feeds an inbound SMS webhook into the correlation store.
    pub fn resolve_sms(&self, event: SmsEvent) -> Result<(), EngineError> {
        if event.activation_id.trim().is_empty() {
            return Err(EngineError::InvalidWebhook(
                "missing activation id".to_string(),
            ));
        }
        if event.code.trim().is_empty() {
            return Err(EngineError::InvalidWebhook(
                "missing verification code".to_string(),
            ));
        }
        debug!(activation_id = %event.activation_id, "sms webhook received");
        self.core.correlator.resolve(event)
    }

    /// Number of jobs currently suspended on a verification wait.
    pub fn pending_verifications(&self) -> usize {
        self.core.correlator.pending_waits()
    }

    /// Closes the submission queue and waits for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
