use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::config::QueueConfig;
use crate::dead_letter::{DeadLetterId, DeadLetterQueue};
use crate::error::QueueResult;
use crate::job::{Job, JobError, JobId};
use crate::registry::HandlerRegistry;
use crate::retry::{FinalizeDecision, decide_after_failure};
use crate::store::JobStore;
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Result of one worker iteration that claimed a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Handler returned a result and the job is `succeeded`.
    Succeeded {
        /// The processed job.
        job_id: JobId,
    },
    /// Handler failed with attempts left; the job is `queued` again.
    Retrying {
        /// The processed job.
        job_id: JobId,
        /// Claims made so far.
        attempts: u32,
        /// Backoff before the job becomes claimable.
        delay: Duration,
    },
    /// The job is `failed` and was copied into the dead-letter store.
    Failed {
        /// The processed job.
        job_id: JobId,
        /// Claims made so far.
        attempts: u32,
        /// `None` when the dead-letter insert itself failed.
        dead_letter_id: Option<DeadLetterId>,
    },
    /// Another worker took over the lock; nothing was written.
    LockLost {
        /// The processed job.
        job_id: JobId,
    },
}

impl WorkOutcome {
    /// Job the iteration touched.
    pub fn job_id(&self) -> JobId {
        match self {
            WorkOutcome::Succeeded { job_id }
            | WorkOutcome::Retrying { job_id, .. }
            | WorkOutcome::Failed { job_id, .. }
            | WorkOutcome::LockLost { job_id } => *job_id,
        }
    }

    /// Label used in logs and metrics.
    pub fn status(&self) -> &'static str {
        match self {
            WorkOutcome::Succeeded { .. } => "succeeded",
            WorkOutcome::Retrying { .. } => "retrying",
            WorkOutcome::Failed { .. } => "failed",
            WorkOutcome::LockLost { .. } => "lock_lost",
        }
    }
}

/// One competing consumer.
///
/// Each iteration releases stuck jobs, claims the next job, runs its handler
/// under a heartbeat and records the outcome.
pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    dead_letters: DeadLetterQueue,
    registry: Arc<HandlerRegistry>,
    config: Arc<QueueConfig>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Build a worker; [`QueueRuntime`](super::QueueRuntime) does this per pool slot.
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        dead_letters: DeadLetterQueue,
        registry: Arc<HandlerRegistry>,
        config: Arc<QueueConfig>,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            dead_letters,
            registry,
            config,
        }
    }

    /// Identity written into `lock_owner`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Loop until `shutdown` is cancelled.
    ///
    /// The current iteration always completes; only the idle sleep is cut
    /// short by shutdown. Store failures are logged and followed by the idle
    /// sleep.
    pub async fn run(self, shutdown: ShutdownToken) {
        info!(worker_id = %self.id, "worker started");
        let idle = self.config.idle_poll_interval();

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) if err.is_infrastructure() => {
                    error!(worker_id = %self.id, error = %err, "store unavailable, backing off");
                }
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "worker iteration failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Run exactly one iteration.
    ///
    /// Returns `Ok(None)` when nothing was claimable.
    pub async fn run_once(&self) -> QueueResult<Option<WorkOutcome>> {
        let claimed = async {
            self.release_stuck().await;
            self.store.claim_next(&self.id, Utc::now()).await
        }
        .instrument(telemetry::claim_span(&self.id))
        .await?;

        match claimed {
            Some(job) => self.process(job).await.map(Some),
            None => {
                trace!(worker_id = %self.id, "no claimable job");
                Ok(None)
            }
        }
    }

    async fn release_stuck(&self) {
        let release = match self.store.release_stuck(Utc::now()).await {
            Ok(release) => release,
            Err(err) => {
                warn!(worker_id = %self.id, error = %err, "unstick pass failed");
                return;
            }
        };
        if release.is_empty() {
            return;
        }

        telemetry::record_stuck_released(
            &self.id,
            release.requeued,
            release.exhausted.len() as u64,
        );
        for job in &release.exhausted {
            telemetry::record_job_finalized(job.id, &job.job_type, "failed");
            if let Err(err) = self.dead_letters.move_job(job).await {
                error!(job_id = %job.id, error = %err, "failed to dead-letter timed out job");
            }
        }
    }

    async fn process(&self, job: Job) -> QueueResult<WorkOutcome> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                "no handler registered for job type"
            );
            let outcome = self
                .fail(&job, JobError::invalid_job_type(&job.job_type))
                .await?;
            telemetry::record_job_finalized(job.id, &job.job_type, outcome.status());
            return Ok(outcome);
        };

        let timing = telemetry::record_job_start(job.id);
        let heartbeat = self.spawn_heartbeat(job.id);

        let result = AssertUnwindSafe(handler.handle(&job))
            .catch_unwind()
            .instrument(telemetry::dispatch_span(job.id, &job.job_type, job.attempts))
            .await;

        heartbeat.stop().await;

        let outcome = async {
            match result {
                Ok(Ok(value)) => self.succeed(&job, value).await,
                Ok(Err(err)) => {
                    debug!(job_id = %job.id, error = %format!("{err:#}"), "handler failed");
                    self.handle_failure(&job, JobError::from_handler(&err)).await
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(job_id = %job.id, panic = %message, "handler panicked");
                    self.handle_failure(&job, JobError::handler_panic(message))
                        .await
                }
            }
        }
        .instrument(telemetry::finalize_span(job.id, &job.job_type, job.attempts))
        .await?;

        telemetry::record_job_end(timing, &job.job_type, outcome.status());
        telemetry::record_job_finalized(job.id, &job.job_type, outcome.status());
        Ok(outcome)
    }

    async fn succeed(&self, job: &Job, result: serde_json::Value) -> QueueResult<WorkOutcome> {
        if self
            .store
            .mark_succeeded(job.id, &self.id, result, Utc::now())
            .await?
        {
            Ok(WorkOutcome::Succeeded { job_id: job.id })
        } else {
            Ok(self.lock_lost(job))
        }
    }

    async fn handle_failure(&self, job: &Job, error: JobError) -> QueueResult<WorkOutcome> {
        match decide_after_failure(job.attempts, job.max_attempts, &self.config.backoff) {
            FinalizeDecision::Retry { delay } => {
                let now = Utc::now();
                let available_at = retry_at(now, delay);
                if !self
                    .store
                    .mark_retry(job.id, &self.id, error, available_at, now)
                    .await?
                {
                    return Ok(self.lock_lost(job));
                }

                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "job scheduled for retry"
                );
                Ok(WorkOutcome::Retrying {
                    job_id: job.id,
                    attempts: job.attempts,
                    delay,
                })
            }
            FinalizeDecision::DeadLetter => self.fail(job, error).await,
        }
    }

    async fn fail(&self, job: &Job, error: JobError) -> QueueResult<WorkOutcome> {
        let Some(failed) = self
            .store
            .mark_failed(job.id, &self.id, error, Utc::now())
            .await?
        else {
            return Ok(self.lock_lost(job));
        };

        let dead_letter_id = match self.dead_letters.move_job(&failed).await {
            Ok(record) => Some(record.id),
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to write dead-letter record");
                None
            }
        };

        Ok(WorkOutcome::Failed {
            job_id: job.id,
            attempts: failed.attempts,
            dead_letter_id,
        })
    }

    fn lock_lost(&self, job: &Job) -> WorkOutcome {
        warn!(
            job_id = %job.id,
            worker_id = %self.id,
            "lock lost before finalize; outcome discarded"
        );
        WorkOutcome::LockLost { job_id: job.id }
    }

    fn spawn_heartbeat(&self, job_id: JobId) -> HeartbeatHandle {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let store = Arc::clone(&self.store);
        let worker_id = self.id.clone();
        let period = self.config.heartbeat_interval();
        let span = telemetry::heartbeat_span(job_id, &worker_id);

        let handle = tokio::spawn(
            async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = cancel_rx.recv() => break,
                        _ = ticker.tick() => {}
                    }

                    match store.heartbeat(job_id, &worker_id, Utc::now()).await {
                        Ok(true) => trace!("heartbeat renewed lock"),
                        Ok(false) => {
                            warn!("heartbeat found lock gone; stopping");
                            break;
                        }
                        Err(err) => warn!(error = %err, "heartbeat failed"),
                    }
                }
            }
            .instrument(span),
        );

        HeartbeatHandle { cancel_tx, handle }
    }
}

struct HeartbeatHandle {
    cancel_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    async fn stop(self) {
        let _ = self.cancel_tx.try_send(());
        if let Err(err) = self.handle.await {
            warn!(error = %err, "heartbeat task failed");
        }
    }
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
