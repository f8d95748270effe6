//! A worker bound to one Sakura server.
//!
//! While running, the worker loops: pick the oldest pending job (chapters
//! before volumes), claim it, translate it on its server, then commit or
//! release the claim. A claimed job is always committed or released before
//! the loop looks at the cancellation token again, so stopping never leaves
//! a job stuck in `claimed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FleetConfig, next_backoff};
use crate::error::DatabaseError;
use crate::store::{Job, JobId, JobKind, JobSource, JobStatus, Server, ServerRegistry};
use crate::translate::{TranslationRequest, Translator};
use crate::worker::state::WorkerStatus;

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: Arc<dyn ServerRegistry>,
    pub jobs: Arc<dyn JobSource>,
    pub translator: Arc<dyn Translator>,
    pub config: FleetConfig,
}

/// Point-in-time view of a worker for observability.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub gpu: String,
    pub endpoint: String,
    pub status: WorkerStatus,
    /// When the current (or most recent) loop was started.
    pub started_at: Option<DateTime<Utc>>,
    /// Jobs translated and committed since the process started.
    pub completed: u64,
    /// Translation attempts that failed since the process started.
    pub failed: u64,
    pub current_job: Option<JobId>,
}

/// Handle to a running loop task.
struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared between the worker handle and its loop task.
struct Shared {
    server: Server,
    deps: WorkerDeps,
    status: watch::Sender<WorkerStatus>,
    current_job: watch::Sender<Option<JobId>>,
    /// Unix millis of the last start, 0 if never started.
    started_at: AtomicI64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// How one claimed job ended.
enum Outcome {
    Committed,
    Failed,
}

/// Runtime worker for one registered server.
pub struct Worker {
    shared: Arc<Shared>,
    /// Serializes start/stop; holds the loop task while one exists.
    run: Mutex<Option<RunHandle>>,
}

impl Worker {
    /// Create a stopped worker for `server`.
    pub fn new(server: Server, deps: WorkerDeps) -> Self {
        let (status, _) = watch::channel(WorkerStatus::Stopped);
        let (current_job, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                server,
                deps,
                status,
                current_job,
                started_at: AtomicI64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.server.id
    }

    pub fn server(&self) -> &Server {
        &self.shared.server
    }

    pub fn status(&self) -> WorkerStatus {
        *self.shared.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.shared.status.subscribe()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let server = &self.shared.server;
        WorkerSnapshot {
            id: server.id.clone(),
            gpu: server.gpu.clone(),
            endpoint: server.endpoint.clone(),
            status: self.status(),
            started_at: match self.shared.started_at.load(Ordering::Relaxed) {
                0 => None,
                millis => DateTime::from_timestamp_millis(millis),
            },
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            current_job: self.shared.current_job.borrow().clone(),
        }
    }

    /// Spawn the loop task. No-op while a loop is already running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if let Some(existing) = run.as_ref() {
            if !existing.handle.is_finished() {
                return;
            }
            debug!(worker_id = %self.id(), "Previous loop ended on its own, restarting");
        }

        self.shared.transition(WorkerStatus::Starting);
        self.shared.transition(WorkerStatus::Running);
        self.shared
            .started_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            shared.run_loop(token).await;
        });

        *run = Some(RunHandle { cancel, handle });
        info!(
            worker_id = %self.id(),
            gpu = %self.shared.server.gpu,
            endpoint = %self.shared.server.endpoint,
            "Worker started"
        );
    }

    /// Signal the loop to stop and wait for it to reach a safe point.
    ///
    /// An in-flight translation call is allowed to finish and its result is
    /// committed or released before this returns. No-op when stopped.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(RunHandle { cancel, handle }) = run.take() else {
            return;
        };

        if !handle.is_finished() {
            self.shared.transition(WorkerStatus::Stopping);
        }
        cancel.cancel();

        if let Err(e) = handle.await {
            error!(worker_id = %self.id(), error = %e, "Worker loop task failed");
        }

        self.shared.transition(WorkerStatus::Stopped);
        info!(worker_id = %self.id(), "Worker stopped");
    }
}

impl Shared {
    fn id(&self) -> &str {
        &self.server.id
    }

    fn jobs(&self) -> &Arc<dyn JobSource> {
        &self.deps.jobs
    }

    fn config(&self) -> &FleetConfig {
        &self.deps.config
    }

    /// Move to `target` if the state machine allows it.
    fn transition(&self, target: WorkerStatus) {
        self.status.send_if_modified(|status| {
            if *status == target {
                return false;
            }
            if !status.can_transition_to(target) {
                debug!(worker_id = %self.server.id, from = %status, to = %target, "Ignoring status transition");
                return false;
            }
            *status = target;
            true
        });
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = self.config().backoff_initial;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.deps.registry.get_server(self.id()).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    error!(
                        worker_id = %self.id(),
                        "Server is no longer registered, worker loop ending"
                    );
                    break;
                }
                Err(e) => {
                    warn!(worker_id = %self.id(), error = %e, "Failed to check server registration");
                    if !pause(backoff, &cancel).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.config());
                    continue;
                }
            }

            let job = match self.next_job().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(worker_id = %self.id(), "No pending jobs");
                    if !pause(self.config().idle_interval, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = %self.id(), error = %e, "Failed to poll pending jobs");
                    if !pause(backoff, &cancel).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.config());
                    continue;
                }
            };

            if cancel.is_cancelled() {
                break;
            }

            match self.jobs().try_claim(&job.id, self.id()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(worker_id = %self.id(), job = %job.id, "Job claimed by another worker");
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = %self.id(), job = %job.id, error = %e, "Failed to claim job");
                    if !pause(backoff, &cancel).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.config());
                    continue;
                }
            }

            if cancel.is_cancelled() {
                self.release(&job.id, None).await;
                break;
            }

            match self.process(&job).await {
                Outcome::Committed => backoff = self.config().backoff_initial,
                Outcome::Failed => {
                    if !pause(backoff, &cancel).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.config());
                }
            }
        }

        self.current_job.send_replace(None);
        self.transition(WorkerStatus::Stopped);
        debug!(worker_id = %self.id(), "Worker loop exited");
    }

    /// Oldest pending job, chapters first.
    async fn next_job(&self) -> Result<Option<Job>, DatabaseError> {
        for kind in JobKind::ALL {
            if let Some(job) = self.jobs().next_pending(kind).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Translate a claimed job, then commit or release it.
    async fn process(&self, job: &Job) -> Outcome {
        self.current_job.send_replace(Some(job.id.clone()));
        let request = TranslationRequest::from(job);
        let started = std::time::Instant::now();

        let outcome = match self
            .deps
            .translator
            .translate(&self.server.endpoint, &request)
            .await
        {
            Ok(output) => match self.jobs().commit_translation(&job.id, self.id(), &output.paragraphs).await {
                Ok(()) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        worker_id = %self.id(),
                        job = %job.id,
                        paragraphs = output.paragraphs.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Translation committed"
                    );
                    Outcome::Committed
                }
                Err(e) => {
                    warn!(worker_id = %self.id(), job = %job.id, error = %e, "Failed to commit translation");
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.release(&job.id, Some(&format!("commit failed: {e}"))).await;
                    Outcome::Failed
                }
            },
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker_id = %self.id(),
                    job = %job.id,
                    error = %e,
                    contract_violation = e.is_contract_violation(),
                    "Translation failed"
                );
                self.release(&job.id, Some(&e.to_string())).await;
                Outcome::Failed
            }
        };

        self.current_job.send_replace(None);
        outcome
    }

    /// Give a claim back to the job source.
    ///
    /// Store errors are retried with backoff until the release lands, also
    /// while stopping, so the claim never outlives this iteration. A claim
    /// that is no longer ours (`NotFound`) is dropped.
    async fn release(&self, job: &JobId, failure: Option<&str>) {
        let mut delay = self.config().backoff_initial;
        loop {
            match self.jobs().release_claim(job, self.id(), failure).await {
                Ok(JobStatus::Failed) => {
                    warn!(worker_id = %self.id(), job = %job, "Job parked after exhausting attempts");
                    return;
                }
                Ok(status) => {
                    debug!(worker_id = %self.id(), job = %job, status = %status, "Claim released");
                    return;
                }
                Err(DatabaseError::NotFound { .. }) => {
                    warn!(worker_id = %self.id(), job = %job, "Claim no longer held, nothing to release");
                    return;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id(),
                        job = %job,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to release claim, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay, self.config());
                }
            }
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancel.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_returns_false_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(Duration::from_secs(3600), &cancel).await);
    }

    #[tokio::test]
    async fn pause_returns_true_after_sleep() {
        let cancel = CancellationToken::new();
        assert!(pause(Duration::from_millis(1), &cancel).await);
    }
}
