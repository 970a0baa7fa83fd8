// ABOUTME: Job queue seam and its in-process implementation
// ABOUTME: Per-kind channels with concurrency limits, per-attempt timeouts, exponential backoff and job-id de-duplication

use async_trait::async_trait;
use boxyard_config::{Backoff, StepKind, StepPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delivery options fixed at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl From<StepPolicy> for JobOptions {
    fn from(policy: StepPolicy) -> Self {
        Self {
            timeout: policy.timeout(),
            max_attempts: policy.max_attempts.max(1),
            backoff: policy.backoff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: StepKind,
    pub payload: JsonValue,
    pub options: JobOptions,
    /// Attempts started so far, including the one in progress
    pub attempts_made: u32,
}

impl Job {
    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made >= self.options.max_attempts
    }
}

/// Outcome of one failed attempt, as classified by the handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Terminal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_) | JobError::Timeout(_))
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue for {0} is already being consumed")]
    AlreadyConsumed(StepKind),

    #[error("Queue for {0} is closed")]
    Closed(StepKind),
}

/// Consumer of one job kind
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of the job
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called once when the job fails terminally or exhausts its attempts
    async fn on_failed(&self, job: &Job, error: &JobError);
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns false when a job with the same id is already
    /// queued, waiting out a backoff delay, or running.
    async fn enqueue(
        &self,
        kind: StepKind,
        job_id: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<bool, QueueError>;

    /// Start delivering jobs of `kind` to `handler`, at most `concurrency` at a time
    async fn consume(
        &self,
        kind: StepKind,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<(), QueueError>;
}

struct QueueState {
    senders: HashMap<StepKind, mpsc::UnboundedSender<Job>>,
    receivers: Mutex<HashMap<StepKind, mpsc::UnboundedReceiver<Job>>>,
    active: Mutex<HashSet<String>>,
}

impl QueueState {
    fn sender(&self, kind: StepKind) -> Result<&mpsc::UnboundedSender<Job>, QueueError> {
        self.senders.get(&kind).ok_or(QueueError::Closed(kind))
    }

    async fn release(&self, job_id: &str) {
        self.active.lock().await.remove(job_id);
    }
}

/// In-process queue. Jobs enqueued before a consumer registers are buffered.
pub struct LocalQueue {
    state: Arc<QueueState>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalQueue {
    pub fn new() -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in StepKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(kind, tx);
            receivers.insert(kind, rx);
        }

        Self {
            state: Arc::new(QueueState {
                senders,
                receivers: Mutex::new(receivers),
                active: Mutex::new(HashSet::new()),
            }),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    /// Jobs currently queued, delayed or running
    pub async fn active_jobs(&self) -> usize {
        self.state.active.lock().await.len()
    }

    /// Stop dispatching. Jobs already running are left to finish.
    pub async fn shutdown(&self) {
        let mut dispatchers = self.dispatchers.lock().await;
        for handle in dispatchers.drain(..) {
            handle.abort();
        }
        info!("Job queue dispatchers stopped");
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(
        &self,
        kind: StepKind,
        job_id: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<bool, QueueError> {
        if !self.state.active.lock().await.insert(job_id.to_string()) {
            debug!("Job {} already active, not enqueued again", job_id);
            return Ok(false);
        }

        let job = Job {
            id: job_id.to_string(),
            kind,
            payload,
            options,
            attempts_made: 0,
        };

        if self.state.sender(kind)?.send(job).is_err() {
            self.state.release(job_id).await;
            return Err(QueueError::Closed(kind));
        }

        debug!("Enqueued {} job {}", kind, job_id);
        Ok(true)
    }

    async fn consume(
        &self,
        kind: StepKind,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<(), QueueError> {
        let mut rx = self
            .state
            .receivers
            .lock()
            .await
            .remove(&kind)
            .ok_or(QueueError::AlreadyConsumed(kind))?;

        let state = self.state.clone();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let state = state.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    run_attempt(state, handler, job).await;
                    drop(permit);
                });
            }
            debug!("Dispatcher for {} exited", kind);
        });

        self.dispatchers.lock().await.push(handle);
        info!("Consuming {} jobs (concurrency {})", kind, concurrency);
        Ok(())
    }
}

async fn run_attempt(state: Arc<QueueState>, handler: Arc<dyn JobHandler>, mut job: Job) {
    job.attempts_made += 1;

    let result = match tokio::time::timeout(job.options.timeout, handler.handle(&job)).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Timeout(job.options.timeout)),
    };

    match result {
        Ok(()) => {
            debug!("{} job {} succeeded", job.kind, job.id);
            state.release(&job.id).await;
        }
        Err(err) if err.is_retryable() && !job.is_last_attempt() => {
            let delay = job.options.backoff.delay_after(job.attempts_made);
            warn!(
                "{} job {} failed (attempt {}/{}), retrying in {:?}: {}",
                job.kind, job.id, job.attempts_made, job.options.max_attempts, delay, err
            );
            let sender = match state.sender(job.kind) {
                Ok(sender) => sender.clone(),
                Err(e) => {
                    error!("Cannot retry job {}: {}", job.id, e);
                    state.release(&job.id).await;
                    return;
                }
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let job_id = job.id.clone();
                if sender.send(job).is_err() {
                    warn!("Queue closed before retry of job {}", job_id);
                    state.release(&job_id).await;
                }
            });
        }
        Err(err) => {
            error!(
                "{} job {} failed after {} attempt(s): {}",
                job.kind, job.id, job.attempts_made, err
            );
            handler.on_failed(&job, &err).await;
            state.release(&job.id).await;
        }
    }
}
