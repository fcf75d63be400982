//! In-process execution substrate: a bounded queue of job ids, a fixed pool of
//! workers, bounded dispatch retries and a registry of cancellation tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::analysis::repo_types::{AnalysisJob, StartOutcome};
use crate::analysis::types::JobStatus;
use crate::analysis::{AnalysisError, AnalysisRepo, MealAnalyzer};
use crate::config::AnalysisConfig;

const ORPHANED_MESSAGE: &str = "worker stopped before the analysis finished";

/// Issue the correlation id stored as `external_job_id`.
pub fn correlation_id() -> String {
    format!("mealscan-{}", Uuid::new_v4())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("analysis queue is full")]
    Full,
    #[error("analysis queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Dispatch {
    job_id: Uuid,
    /// Zero for the first delivery.
    retry: u32,
}

/// Handle used by the API to submit and cancel jobs.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Dispatch>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

/// Receiving half, consumed by [`spawn_workers`].
pub struct JobReceiver(mpsc::Receiver<Dispatch>);

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            running: Arc::new(Mutex::new(HashMap::new())),
        };
        (queue, JobReceiver(rx))
    }

    /// Submit a PENDING job without waiting for queue space.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), EnqueueError> {
        self.push(Dispatch { job_id, retry: 0 })
    }

    /// Submit a job, waiting for queue space. Used when replaying PENDING jobs at boot.
    pub async fn enqueue_wait(&self, job_id: Uuid) -> Result<(), EnqueueError> {
        self.tx
            .send(Dispatch { job_id, retry: 0 })
            .await
            .map_err(|_| EnqueueError::Closed)
    }

    fn push(&self, item: Dispatch) -> Result<(), EnqueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Signal a job a worker has picked up. Returns false when no worker holds it.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.lock_running().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn register(&self, job_id: Uuid) -> CancellationToken {
        self.lock_running()
            .entry(job_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn unregister(&self, job_id: Uuid) {
        self.lock_running().remove(&job_id);
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        // A poisoned map is still structurally valid.
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Moves queued jobs to STARTED and hands them to the analyzer.
pub struct Dispatcher {
    queue: JobQueue,
    repo: Arc<dyn AnalysisRepo>,
    analyzer: Arc<MealAnalyzer>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        repo: Arc<dyn AnalysisRepo>,
        analyzer: Arc<MealAnalyzer>,
        cfg: &AnalysisConfig,
    ) -> Self {
        Self {
            queue,
            repo,
            analyzer,
            max_retries: cfg.max_retries,
            retry_backoff: cfg.retry_backoff,
        }
    }

    #[instrument(skip(self, item), fields(job_id = %item.job_id, retry = item.retry))]
    async fn dispatch(&self, item: Dispatch) {
        if let Err(e) = self.repo.bump_attempts(item.job_id).await {
            warn!(error = %e, "could not record dispatch attempt");
        }

        let job = match self.repo.get_job(item.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("queued job no longer exists");
                return;
            }
            Err(e) => {
                self.retry(item, AnalysisError::persistence(format!("{e:#}")), None)
                    .await;
                return;
            }
        };

        let token = self.queue.register(job.id);
        match self.repo.start_job(job.id, job.meal_id).await {
            Ok(StartOutcome::Started) => {
                let job = AnalysisJob {
                    status: JobStatus::Started,
                    ..job
                };
                info!(meal_id = %job.meal_id, "analysis started");
                // The analyzer records its own terminal state.
                match self.analyzer.run(&job, &token).await {
                    Ok(report) if token.is_cancelled() => info!(
                        items = report.items_stored,
                        "cancel arrived after results were committed"
                    ),
                    Ok(report) => debug!(
                        items = report.items_stored,
                        skipped = report.skipped.len(),
                        "job succeeded"
                    ),
                    Err(e) => debug!(kind = e.kind(), error = %e, "job failed"),
                }
            }
            Ok(StartOutcome::NotPending(status)) => {
                debug!(%status, "job is no longer pending; dropping");
            }
            Ok(StartOutcome::Busy) => {
                self.retry(item, AnalysisError::Conflict(job.meal_id), Some(&token))
                    .await;
            }
            Err(e) => {
                self.retry(item, AnalysisError::persistence(format!("{e:#}")), Some(&token))
                    .await;
            }
        }
        self.queue.unregister(job.id);
    }

    /// Re-deliver a job that could not be started, or fail it once the retry
    /// budget is spent.
    async fn retry(&self, item: Dispatch, cause: AnalysisError, token: Option<&CancellationToken>) {
        if token.is_some_and(|t| t.is_cancelled()) {
            self.give_up(item.job_id, &AnalysisError::Cancelled).await;
            return;
        }
        if item.retry >= self.max_retries {
            error!(error = %cause, attempts = item.retry + 1, "dispatch retries exhausted");
            self.give_up(item.job_id, &cause).await;
            return;
        }

        let next = Dispatch {
            job_id: item.job_id,
            retry: item.retry + 1,
        };
        let delay = self.retry_backoff * next.retry;
        warn!(error = %cause, retry = next.retry, ?delay, "dispatch failed; retrying");

        let queue = self.queue.clone();
        let repo = self.repo.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.push(next) {
                error!(job_id = %next.job_id, error = %e, "could not requeue job");
                if let Err(e) = repo.fail_job(next.job_id, &e.to_string(), &[]).await {
                    error!(job_id = %next.job_id, error = %e, "could not record job failure");
                }
            }
        });
    }

    async fn give_up(&self, job_id: Uuid, cause: &AnalysisError) {
        if let Err(e) = self.repo.fail_job(job_id, &cause.to_string(), &[]).await {
            error!(%job_id, error = %e, "could not record job failure");
        }
    }
}

/// Start `workers` tasks that share one receiver and stop when `shutdown` fires.
pub fn spawn_workers(
    dispatcher: Arc<Dispatcher>,
    rx: JobReceiver,
    workers: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(AsyncMutex::new(rx.0));
    (0..workers.max(1))
        .map(|worker| {
            let dispatcher = dispatcher.clone();
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                debug!(worker, "analysis worker started");
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => None,
                        item = async { rx.lock().await.recv().await } => item,
                    };
                    let Some(item) = next else { break };
                    dispatcher.dispatch(item).await;
                }
                debug!(worker, "analysis worker stopped");
            })
        })
        .collect()
}

/// Boot-time recovery: fail jobs a previous process left STARTED, then replay
/// every PENDING job in the background.
pub async fn recover(repo: Arc<dyn AnalysisRepo>, queue: JobQueue) -> anyhow::Result<()> {
    let orphaned = repo.fail_orphaned_jobs(ORPHANED_MESSAGE).await?;
    let pending = repo.pending_jobs().await?;
    info!(orphaned, pending = pending.len(), "analysis jobs recovered");

    tokio::spawn(async move {
        for job in pending {
            if let Err(e) = queue.enqueue_wait(job.id).await {
                error!(job_id = %job.id, error = %e, "could not replay pending job");
                break;
            }
        }
    });
    Ok(())
}
