//! Fleet manager: owns one worker per registered server.
//!
//! All administrative mutations go through here. The worker map write lock
//! is held across the short store calls that must stay consistent with it:
//! insert on create, delete on remove, the orphan reclaim and bootstrap
//! adoption. Admin start and stop happen on a cloned `Arc<Worker>` after the
//! lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::store::{JobSource, Server, ServerRegistry};
use crate::translate::Translator;
use crate::worker::{Worker, WorkerDeps, WorkerSnapshot, WorkerStatus};

pub struct FleetManager {
    deps: WorkerDeps,
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    /// Cancels the bootstrap sequence on shutdown.
    cancel: CancellationToken,
}

impl FleetManager {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        jobs: Arc<dyn JobSource>,
        translator: Arc<dyn Translator>,
        config: FleetConfig,
    ) -> Self {
        Self {
            deps: WorkerDeps {
                registry,
                jobs,
                translator,
                config,
            },
            workers: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the startup sequence in the background.
    ///
    /// After the warmup delay, claims left behind by a previous process are
    /// returned to the pool, then every registered server gets a worker which
    /// is started, one every `stagger` interval. Cancelled by [`shutdown`].
    ///
    /// [`shutdown`]: FleetManager::shutdown
    pub fn spawn_bootstrap(self: &Arc<Self>) -> JoinHandle<()> {
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            fleet.bootstrap().await;
        })
    }

    async fn bootstrap(&self) {
        let config = &self.deps.config;
        info!(warmup_ms = config.warmup.as_millis() as u64, "Fleet bootstrap scheduled");
        if !self.pause(config.warmup).await {
            debug!("Bootstrap cancelled during warmup");
            return;
        }

        self.reclaim_orphaned().await;

        let servers = match self.deps.registry.list_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                error!(error = %e, "Failed to load server registry, no workers started");
                return;
            }
        };
        info!(count = servers.len(), "Loaded server registry");

        for (index, server) in servers.into_iter().enumerate() {
            if index > 0 && !self.pause(config.stagger).await {
                debug!("Bootstrap cancelled during stagger");
                return;
            }
            if !self.adopt(server).await {
                return;
            }
        }
        info!("Fleet bootstrap complete");
    }

    /// Return claims left behind by a previous process to the pool.
    ///
    /// Workers created and started by admin calls during warmup already hold
    /// live claims; the map write lock keeps that set fixed while it is read.
    async fn reclaim_orphaned(&self) {
        let workers = self.workers.write().await;
        let live: Vec<String> = workers.keys().cloned().collect();
        match self.deps.jobs.reclaim_orphaned(&live).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Returned orphaned claims to the pool"),
            Err(e) => warn!(error = %e, "Failed to reclaim orphaned claims"),
        }
    }

    /// Add and start a worker for a server loaded from the registry.
    ///
    /// Servers that already have a worker or were deleted after the registry
    /// was listed are skipped. Returns `false` once shutdown has begun.
    async fn adopt(&self, server: Server) -> bool {
        let mut workers = self.workers.write().await;
        if self.cancel.is_cancelled() {
            debug!("Bootstrap cancelled before adopting a worker");
            return false;
        }
        if workers.contains_key(&server.id) {
            return true;
        }
        match self.deps.registry.get_server(&server.id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(server_id = %server.id, "Server deleted before bootstrap reached it");
                return true;
            }
            Err(e) => {
                warn!(server_id = %server.id, error = %e, "Failed to confirm server, skipping");
                return true;
            }
        }
        // Started under the lock so shutdown's snapshot either sees it
        // running or cancels first.
        let worker = Arc::new(Worker::new(server.clone(), self.deps.clone()));
        worker.start().await;
        workers.insert(server.id, worker);
        true
    }

    /// Register a new server and add a stopped worker for it.
    pub async fn create_worker(&self, gpu: &str, endpoint: &str) -> Result<String, FleetError> {
        let gpu = gpu.trim();
        let endpoint = endpoint.trim();
        if gpu.is_empty() {
            return Err(FleetError::InvalidInput("gpu must not be empty".into()));
        }
        validate_endpoint(endpoint)?;

        // Held across the insert so bootstrap cannot adopt the server first.
        let mut workers = self.workers.write().await;
        let server = self.deps.registry.insert_server(gpu, endpoint).await?;
        let id = server.id.clone();
        workers.insert(id.clone(), Arc::new(Worker::new(server, self.deps.clone())));
        drop(workers);

        info!(worker_id = %id, gpu, endpoint, "Worker created");
        Ok(id)
    }

    /// Start the worker for `id`. Unknown ids are ignored.
    pub async fn start_worker(&self, id: &str) {
        match self.worker(id).await {
            Some(worker) => worker.start().await,
            None => debug!(worker_id = %id, "Start requested for unknown worker"),
        }
    }

    /// Stop the worker for `id`, waiting for its loop to reach a safe point.
    /// Unknown ids are ignored.
    pub async fn stop_worker(&self, id: &str) {
        match self.worker(id).await {
            Some(worker) => worker.stop().await,
            None => debug!(worker_id = %id, "Stop requested for unknown worker"),
        }
    }

    /// Stop the worker for `id`, delete its server record and drop it.
    ///
    /// Unknown ids are ignored. If the registry delete fails the worker stays
    /// in the fleet, stopped.
    pub async fn delete_worker(&self, id: &str) -> Result<(), FleetError> {
        let Some(worker) = self.worker(id).await else {
            debug!(worker_id = %id, "Delete requested for unknown worker");
            return Ok(());
        };
        worker.stop().await;

        let removed = {
            let mut workers = self.workers.write().await;
            self.deps.registry.delete_server(id).await?;
            workers.remove(id)
        };

        // A concurrent start may have slipped in between stop and removal.
        if let Some(worker) = removed {
            worker.stop().await;
        }
        info!(worker_id = %id, "Worker deleted");
        Ok(())
    }

    /// Snapshots of every worker, ordered by id.
    pub async fn list_workers(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<_> = self
            .workers
            .read()
            .await
            .values()
            .map(|worker| worker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn get_worker(&self, id: &str) -> Option<WorkerSnapshot> {
        self.worker(id).await.map(|worker| worker.snapshot())
    }

    /// Watch status changes of one worker.
    pub async fn subscribe_status(&self, id: &str) -> Option<watch::Receiver<WorkerStatus>> {
        self.worker(id).await.map(|worker| worker.subscribe_status())
    }

    /// Cancel bootstrap and stop every worker concurrently.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        info!(count = workers.len(), "Stopping all workers");
        futures::future::join_all(workers.iter().map(|worker| worker.stop())).await;
        info!("Fleet shut down");
    }

    async fn worker(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.read().await.get(id).cloned()
    }

    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Endpoints must be absolute http(s) URLs.
fn validate_endpoint(endpoint: &str) -> Result<(), FleetError> {
    if endpoint.is_empty() {
        return Err(FleetError::InvalidInput("endpoint must not be empty".into()));
    }
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| FleetError::InvalidInput(format!("endpoint {endpoint:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(FleetError::InvalidInput(format!(
            "endpoint scheme must be http or https, got {scheme}"
        ))),
    }
}
