use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::broadcast::EventBroadcaster;
use crate::db::DbHandle;
use crate::errors::AnalyzerError;
use crate::models::{Job, JobStatus, ProgressEvent, RepoLocator};
use crate::stages::{Stage, StageContext, StageOutcome};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Owns the job lifecycle: creation, admission onto the bounded worker
/// pool, stage sequencing, retries, cancellation, and terminal publishing.
///
/// The semaphore is the admission-control boundary: at most `capacity` jobs
/// are Running at once, the rest sit in Queued until a permit frees up.
#[derive(Clone)]
pub struct PipelineRunner {
    db: DbHandle,
    broadcaster: EventBroadcaster,
    stages: Arc<Vec<Box<dyn Stage>>>,
    permits: Arc<Semaphore>,
    cancel_flags: Arc<std::sync::Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
    retry: RetryPolicy,
    stage_timeout: Duration,
}

impl PipelineRunner {
    pub fn new(
        db: DbHandle,
        broadcaster: EventBroadcaster,
        stages: Vec<Box<dyn Stage>>,
        capacity: usize,
        retry: RetryPolicy,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            db,
            broadcaster,
            stages: Arc::new(stages),
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            cancel_flags: Arc::new(std::sync::Mutex::new(HashMap::new())),
            retry,
            stage_timeout,
        }
    }

    /// Create a Queued job and hand it to the worker pool.
    pub async fn submit(&self, locator: RepoLocator) -> Result<Job, AnalyzerError> {
        let loc = locator.clone();
        let job = self.db.call(move |db| db.create_job(&loc)).await?;

        if let Ok(mut flags) = self.cancel_flags.lock() {
            flags.insert(job.id, Arc::new(AtomicBool::new(false)));
        }

        tracing::info!(job_id = %job.id, repo = %locator, "job submitted");
        let runner = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            runner.run_job(job_id, locator).await;
        });
        Ok(job)
    }

    /// Request cancellation. A Queued job fails immediately; a Running job
    /// is stopped at its next stage boundary (stage boundaries are the only
    /// cancellation points). Terminal jobs reject the request.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, AnalyzerError> {
        let job = self
            .db
            .call(move |db| db.get_job(job_id))
            .await?
            .ok_or(AnalyzerError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(AnalyzerError::InvalidTransition {
                from: job.status,
                to: JobStatus::Failed,
            });
        }

        if let Ok(flags) = self.cancel_flags.lock() {
            if let Some(flag) = flags.get(&job_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }

        if job.status == JobStatus::Queued {
            // Fail it right away; if the worker won the race to Running the
            // flag above still stops it at the first stage boundary.
            self.fail_job(job_id, cancelled_message(job_id)).await;
        }

        self.db
            .call(move |db| db.get_job(job_id))
            .await?
            .ok_or(AnalyzerError::NotFound(job_id))
    }

    fn is_cancelled(&self, job_id: Uuid) -> bool {
        self.cancel_flags
            .lock()
            .ok()
            .and_then(|flags| flags.get(&job_id).map(|f| f.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    fn remove_cancel_flag(&self, job_id: Uuid) {
        if let Ok(mut flags) = self.cancel_flags.lock() {
            flags.remove(&job_id);
        }
    }

    /// Transition to Failed, publish the terminal event, and tear down the
    /// job's channel. Losing the transition race (the job already went
    /// terminal through another path) means the winner published; only log.
    async fn fail_job(&self, job_id: Uuid, message: String) {
        let msg = message.clone();
        let result = self
            .db
            .call(move |db| {
                let job = db.transition(job_id, JobStatus::Failed, Some(&msg))?;
                let count = db.get_stage_results(job_id)?.len() as u64;
                Ok((job, count))
            })
            .await;
        match result {
            Ok((_, count)) => {
                tracing::info!(job_id = %job_id, error = %message, "job failed");
                self.broadcaster
                    .publish(&ProgressEvent::failed(job_id, count + 1, message));
                self.broadcaster.close(job_id);
            }
            Err(AnalyzerError::InvalidTransition { from, to }) => {
                tracing::debug!(job_id = %job_id, %from, %to, "job already terminal during failure handling");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to record job failure");
            }
        }
        self.remove_cancel_flag(job_id);
    }

    async fn transition(&self, job_id: Uuid, to: JobStatus) -> Result<Job, AnalyzerError> {
        self.db
            .call(move |db| db.transition(job_id, to, None))
            .await
    }

    async fn run_job(self, job_id: Uuid, locator: RepoLocator) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::error!(job_id = %job_id, "worker pool closed before job started");
                return;
            }
        };

        if self.is_cancelled(job_id) {
            self.fail_job(job_id, cancelled_message(job_id)).await;
            return;
        }
        match self.transition(job_id, JobStatus::Running).await {
            Ok(_) => {}
            Err(AnalyzerError::InvalidTransition { .. }) => {
                // Cancelled between submission and pickup.
                self.remove_cancel_flag(job_id);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to start job");
                self.remove_cancel_flag(job_id);
                return;
            }
        }
        tracing::info!(job_id = %job_id, repo = %locator, "job running");

        let mut ctx = StageContext::new(locator);
        let mut recorded: u64 = 0;

        for stage in self.stages.iter() {
            if self.is_cancelled(job_id) {
                self.fail_job(job_id, cancelled_message(job_id)).await;
                return;
            }
            let name = stage.name();
            let mut attempt = 1u32;
            loop {
                let outcome = match tokio::time::timeout(self.stage_timeout, stage.run(&mut ctx))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => StageOutcome::Retryable(anyhow::anyhow!(
                        "timed out after {:?}",
                        self.stage_timeout
                    )),
                };

                match outcome {
                    StageOutcome::Ok(payload) => {
                        let stored = payload.clone();
                        let result = self
                            .db
                            .call(move |db| db.append_stage_result(job_id, name, &stored, true))
                            .await;
                        let result = match result {
                            Ok(r) => r,
                            Err(e) => {
                                self.fail_job(
                                    job_id,
                                    format!("failed to record stage '{}': {}", name, e),
                                )
                                .await;
                                return;
                            }
                        };
                        recorded += 1;
                        tracing::debug!(job_id = %job_id, stage = name, "stage complete");
                        self.broadcaster.publish(&ProgressEvent::for_stage(&result));
                        ctx.completed.push((name.to_string(), payload));
                        break;
                    }
                    StageOutcome::Retryable(err) if attempt < self.retry.max_attempts => {
                        tracing::warn!(
                            job_id = %job_id,
                            stage = name,
                            attempt,
                            error = %err,
                            "recoverable stage failure, backing off"
                        );
                        if let Err(e) =
                            self.transition(job_id, JobStatus::PartiallyComplete).await
                        {
                            tracing::error!(job_id = %job_id, error = %e, "lost job during retry bookkeeping");
                            self.remove_cancel_flag(job_id);
                            return;
                        }
                        tokio::time::sleep(self.retry.backoff * attempt).await;
                        if self.is_cancelled(job_id) {
                            self.fail_job(job_id, cancelled_message(job_id)).await;
                            return;
                        }
                        if let Err(e) = self.transition(job_id, JobStatus::Running).await {
                            tracing::error!(job_id = %job_id, error = %e, "lost job during retry bookkeeping");
                            self.remove_cancel_flag(job_id);
                            return;
                        }
                        attempt += 1;
                    }
                    StageOutcome::Retryable(err) | StageOutcome::Fatal(err) => {
                        let failure = AnalyzerError::StageFailure {
                            stage: name.to_string(),
                            message: err.to_string(),
                        };
                        self.fail_job(job_id, failure.to_string()).await;
                        return;
                    }
                }
            }
        }

        match self.transition(job_id, JobStatus::Complete).await {
            Ok(_) => {
                tracing::info!(job_id = %job_id, stages = recorded, "job complete");
                self.broadcaster
                    .publish(&ProgressEvent::completed(job_id, recorded + 1));
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to complete job");
            }
        }
        self.broadcaster.close(job_id);
        self.remove_cancel_flag(job_id);
    }
}

fn cancelled_message(job_id: Uuid) -> String {
    AnalyzerError::Cancelled(job_id).to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────
