//! Integration tests for the fleet manager: administration, bootstrap and
//! shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;

use sakura_fleet::config::FleetConfig;
use sakura_fleet::error::TranslateError;
use sakura_fleet::fleet::FleetManager;
use sakura_fleet::store::{JobId, JobSource, JobStatus, LibSqlBackend, ServerRegistry};
use sakura_fleet::translate::{TranslationOutput, TranslationRequest, Translator};
use sakura_fleet::worker::WorkerStatus;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct EchoTranslator;

#[async_trait]
impl Translator for EchoTranslator {
    async fn translate(
        &self,
        _endpoint: &str,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, TranslateError> {
        Ok(TranslationOutput {
            paragraphs: request.paragraphs.clone(),
        })
    }
}

/// Blocks every call until `release` is notified.
#[derive(Default)]
struct GatedTranslator {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Translator for GatedTranslator {
    async fn translate(
        &self,
        _endpoint: &str,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, TranslateError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(TranslationOutput {
            paragraphs: request.paragraphs.clone(),
        })
    }
}

/// Echoes after a fixed delay and counts calls.
struct SlowTranslator {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Translator for SlowTranslator {
    async fn translate(
        &self,
        _endpoint: &str,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(TranslationOutput {
            paragraphs: request.paragraphs.clone(),
        })
    }
}

fn config(warmup_ms: u64, stagger_ms: u64) -> FleetConfig {
    FleetConfig {
        warmup: Duration::from_millis(warmup_ms),
        stagger: Duration::from_millis(stagger_ms),
        idle_interval: Duration::from_millis(20),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        ..FleetConfig::default()
    }
}

async fn fleet_with(
    translator: Arc<dyn Translator>,
    config: FleetConfig,
) -> (Arc<FleetManager>, Arc<LibSqlBackend>) {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let fleet = Arc::new(FleetManager::new(db.clone(), db.clone(), translator, config));
    (fleet, db)
}

async fn worker_ids(fleet: &FleetManager) -> HashSet<String> {
    fleet.list_workers().await.into_iter().map(|w| w.id).collect()
}

async fn server_ids(db: &LibSqlBackend) -> HashSet<String> {
    db.list_servers().await.unwrap().into_iter().map(|s| s.id).collect()
}

async fn wait_for_job(db: &LibSqlBackend, id: &JobId, status: JobStatus) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if db.get_job(id).await.unwrap().map(|j| j.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {status}"));
}

// ── Administration ──────────────────────────────────────────────────

#[tokio::test]
async fn workers_track_registry_through_create_and_delete() {
    let (fleet, db) = fleet_with(Arc::new(EchoTranslator), config(0, 0)).await;

    let a = fleet.create_worker("A100", "http://h1/translate").await.unwrap();
    let b = fleet.create_worker("T4", "http://h2/translate").await.unwrap();
    let c = fleet.create_worker("A100", "http://h1/translate").await.unwrap();
    assert_eq!(worker_ids(&fleet).await, server_ids(&db).await);
    assert_eq!(worker_ids(&fleet).await.len(), 3);

    fleet.start_worker(&b).await;
    fleet.delete_worker(&b).await.unwrap();
    assert_eq!(worker_ids(&fleet).await, server_ids(&db).await);
    assert_eq!(worker_ids(&fleet).await, HashSet::from([a.clone(), c.clone()]));

    // Deleting again is a no-op.
    fleet.delete_worker(&b).await.unwrap();
    assert_eq!(worker_ids(&fleet).await, server_ids(&db).await);
}

#[tokio::test]
async fn created_worker_translates_once_started() {
    let (fleet, db) = fleet_with(Arc::new(EchoTranslator), config(0, 0)).await;
    let id = fleet.create_worker("A100", "http://h1/translate").await.unwrap();
    assert_eq!(
        fleet.get_worker(&id).await.unwrap().status,
        WorkerStatus::Stopped
    );

    let job = JobId::chapter("n1", "1");
    db.enqueue(&job, &["こんにちは".to_string()]).await.unwrap();

    fleet.start_worker(&id).await;
    fleet.start_worker(&id).await;
    wait_for_job(&db, &job, JobStatus::Done).await;

    fleet.stop_worker(&id).await;
    let snapshot = fleet.get_worker(&id).await.unwrap();
    assert_eq!(snapshot.status, WorkerStatus::Stopped);
    assert_eq!(snapshot.completed, 1);
}

#[tokio::test]
async fn delete_waits_for_in_flight_translation() {
    let translator = Arc::new(GatedTranslator::default());
    let (fleet, db) = fleet_with(translator.clone(), config(0, 0)).await;
    let id = fleet.create_worker("A100", "http://h1/translate").await.unwrap();

    let job = JobId::chapter("n1", "1");
    db.enqueue(&job, &["こんにちは".to_string()]).await.unwrap();
    fleet.start_worker(&id).await;
    timeout(TEST_TIMEOUT, translator.started.notified())
        .await
        .expect("translation never started");

    let deleting = {
        let fleet = Arc::clone(&fleet);
        let id = id.clone();
        tokio::spawn(async move { fleet.delete_worker(&id).await })
    };
    let mut status = fleet.subscribe_status(&id).await.unwrap();
    timeout(TEST_TIMEOUT, status.wait_for(|s| *s == WorkerStatus::Stopping))
        .await
        .unwrap()
        .unwrap();

    translator.release.notify_one();
    timeout(TEST_TIMEOUT, deleting).await.unwrap().unwrap().unwrap();

    assert!(fleet.get_worker(&id).await.is_none());
    assert!(db.get_server(&id).await.unwrap().is_none());
    let job = db.get_job(&job).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

// ── Bootstrap ───────────────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_staggers_worker_starts() {
    let (fleet, db) = fleet_with(Arc::new(EchoTranslator), config(50, 150)).await;
    for endpoint in ["http://h1/translate", "http://h2/translate", "http://h3/translate"] {
        db.insert_server("A100", endpoint).await.unwrap();
    }

    let handle = fleet.spawn_bootstrap();
    // Nothing is loaded before the warmup has passed.
    assert!(fleet.list_workers().await.is_empty());
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

    let mut started: Vec<_> = fleet
        .list_workers()
        .await
        .into_iter()
        .map(|w| {
            assert_eq!(w.status, WorkerStatus::Running);
            w.started_at.expect("worker was started")
        })
        .collect();
    started.sort();
    assert_eq!(started.len(), 3);
    for pair in started.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap.num_milliseconds() >= 150,
            "workers started {}ms apart",
            gap.num_milliseconds()
        );
    }
    assert_eq!(worker_ids(&fleet).await, server_ids(&db).await);

    fleet.shutdown().await;
}

#[tokio::test]
async fn bootstrap_reclaims_orphaned_claims() {
    let (fleet, db) = fleet_with(Arc::new(EchoTranslator), config(0, 0)).await;
    db.insert_server("A100", "http://h1/translate").await.unwrap();

    let job = JobId::volume("w1", "v1");
    db.enqueue(&job, &["第一巻".to_string()]).await.unwrap();
    assert!(db.try_claim(&job, "worker-from-last-run").await.unwrap());

    timeout(TEST_TIMEOUT, fleet.spawn_bootstrap())
        .await
        .unwrap()
        .unwrap();
    wait_for_job(&db, &job, JobStatus::Done).await;

    fleet.shutdown().await;
}

#[tokio::test]
async fn bootstrap_keeps_claims_of_workers_started_during_warmup() {
    let translator = Arc::new(SlowTranslator {
        delay: Duration::from_millis(400),
        calls: AtomicUsize::new(0),
    });
    let (fleet, db) = fleet_with(translator.clone(), config(200, 0)).await;

    let handle = fleet.spawn_bootstrap();
    let a = fleet.create_worker("A100", "http://h1/translate").await.unwrap();
    let b = fleet.create_worker("A100", "http://h2/translate").await.unwrap();
    let job = JobId::chapter("n1", "1");
    db.enqueue(&job, &["こんにちは".to_string()]).await.unwrap();
    fleet.start_worker(&a).await;
    fleet.start_worker(&b).await;

    // The reclaim at the end of warmup runs while the job is mid-translation.
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    let stored = db.get_job(&job).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Claimed);

    wait_for_job(&db, &job, JobStatus::Done).await;
    // Let the other worker poll a few more times.
    tokio::time::sleep(Duration::from_millis(100)).await;
    fleet.shutdown().await;

    assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
    let workers = fleet.list_workers().await;
    assert_eq!(workers.iter().map(|w| w.completed).sum::<u64>(), 1);
    assert_eq!(workers.iter().map(|w| w.failed).sum::<u64>(), 0);
}

#[tokio::test]
async fn shutdown_during_bootstrap_leaves_no_running_worker() {
    let (fleet, db) = fleet_with(Arc::new(EchoTranslator), config(0, 50)).await;
    for endpoint in ["http://h1/translate", "http://h2/translate", "http://h3/translate"] {
        db.insert_server("A100", endpoint).await.unwrap();
    }

    let handle = fleet.spawn_bootstrap();
    // Land the shutdown inside the stagger, after the first worker started.
    tokio::time::sleep(Duration::from_millis(20)).await;
    timeout(TEST_TIMEOUT, fleet.shutdown()).await.unwrap();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

    let workers = fleet.list_workers().await;
    assert!(workers.len() < 3);
    for snapshot in workers {
        assert_eq!(snapshot.status, WorkerStatus::Stopped);
    }
}

#[tokio::test]
async fn bootstrap_skips_workers_created_meanwhile() {
    let (fleet, db) = fleet_with(Arc::new(EchoTranslator), config(100, 0)).await;
    db.insert_server("A100", "http://h1/translate").await.unwrap();

    let handle = fleet.spawn_bootstrap();
    let created = fleet.create_worker("T4", "http://h2/translate").await.unwrap();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

    // One worker per server. The admin-created worker already existed when
    // bootstrap reached it, so it was left alone.
    assert_eq!(worker_ids(&fleet).await, server_ids(&db).await);
    assert_eq!(
        fleet.get_worker(&created).await.unwrap().status,
        WorkerStatus::Stopped
    );

    fleet.shutdown().await;
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let (fleet, _db) = fleet_with(Arc::new(EchoTranslator), config(0, 0)).await;
    for _ in 0..3 {
        let id = fleet.create_worker("A100", "http://h1/translate").await.unwrap();
        fleet.start_worker(&id).await;
    }

    timeout(TEST_TIMEOUT, fleet.shutdown()).await.unwrap();

    for snapshot in fleet.list_workers().await {
        assert_eq!(snapshot.status, WorkerStatus::Stopped);
    }
}
