//! libSQL backend — async `ServerRegistry` and `JobSource` implementation.
//!
//! Supports local file and in-memory databases. The chapter and volume
//! queues share one row shape and differ only by table.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Job, JobId, JobKind, JobSource, JobStatus, Server, ServerRegistry};

/// Failed attempts before a job is parked as `failed`, unless overridden.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const SERVER_COLUMNS: &str = "id, gpu, endpoint, created_at";

const JOB_COLUMNS: &str = "novel_id, content_id, source, translation, status, claimed_by, \
                           claimed_at, attempts, last_error, queued_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    max_attempts: u32,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Override how many failed attempts a job gets before it is parked.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Content repository helpers ──────────────────────────────────

    /// Queue content for translation.
    ///
    /// Re-queuing an existing job resets it to `pending` and discards any
    /// previous translation, unless it is currently claimed.
    pub async fn enqueue(&self, job: &JobId, paragraphs: &[String]) -> Result<(), DatabaseError> {
        let source = serde_json::to_string(paragraphs)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = now();

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO {table} (novel_id, content_id, source, status, attempts, queued_at, updated_at)
                     VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
                     ON CONFLICT (novel_id, content_id) DO UPDATE SET
                        source = excluded.source,
                        translation = NULL,
                        status = 'pending',
                        attempts = 0,
                        last_error = NULL,
                        queued_at = excluded.queued_at,
                        updated_at = excluded.updated_at
                     WHERE status != 'claimed'",
                    table = table(job.kind)
                ),
                params![job.novel_id.as_str(), job.content_id.as_str(), source, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(job = %job, paragraphs = paragraphs.len(), "Job queued");
        Ok(())
    }

    /// Look up a job by id regardless of status.
    pub async fn get_job(&self, job: &JobId) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM {table} WHERE novel_id = ?1 AND content_id = ?2",
                    table = table(job.kind)
                ),
                params![job.novel_id.as_str(), job.content_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(job.kind, &row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn table(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Chapter => "web_chapters",
        JobKind::Volume => "wenku_volumes",
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_paragraphs(raw: &str, column: &str) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("job.{column}: {e}")))
}

fn row_to_server(row: &libsql::Row) -> Result<Server, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("server.id: {e}")))?;
    let gpu: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("server.gpu: {e}")))?;
    let endpoint: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("server.endpoint: {e}")))?;
    let created_str: String = row.get(3).unwrap_or_default();

    Ok(Server {
        id,
        gpu,
        endpoint,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(kind: JobKind, row: &libsql::Row) -> Result<Job, DatabaseError> {
    let novel_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job.novel_id: {e}")))?;
    let content_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.content_id: {e}")))?;
    let source: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job.source: {e}")))?;
    let translation = match row.get::<String>(3).ok() {
        Some(raw) => Some(parse_paragraphs(&raw, "translation")?),
        None => None,
    };
    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("job.status: {e}")))?;
    let claimed_by: Option<String> = row.get(5).ok();
    let claimed_at: Option<String> = row.get(6).ok();
    let attempts: i64 = row.get(7).unwrap_or(0);
    let last_error: Option<String> = row.get(8).ok();
    let queued_str: String = row.get(9).unwrap_or_default();

    Ok(Job {
        id: JobId::new(kind, novel_id, content_id),
        paragraphs: parse_paragraphs(&source, "source")?,
        translation,
        status: status_str.parse()?,
        claimed_by,
        claimed_at: claimed_at.as_deref().map(parse_datetime),
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error,
        queued_at: parse_datetime(&queued_str),
    })
}

async fn returned_status(
    mut rows: libsql::Rows,
    op: &str,
    job: &JobId,
) -> Result<JobStatus, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
            status.parse()
        }
        Ok(None) => Err(DatabaseError::NotFound {
            entity: "claimed job".to_string(),
            id: job.to_string(),
        }),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Server registry ─────────────────────────────────────────────────

#[async_trait]
impl ServerRegistry for LibSqlBackend {
    async fn insert_server(&self, gpu: &str, endpoint: &str) -> Result<Server, DatabaseError> {
        let server = Server {
            id: Uuid::new_v4().to_string(),
            gpu: gpu.to_string(),
            endpoint: endpoint.to_string(),
            created_at: Utc::now(),
        };

        self.conn()
            .execute(
                "INSERT INTO sakura_servers (id, gpu, endpoint, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    server.id.as_str(),
                    gpu,
                    endpoint,
                    server.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_server: {e}")))?;

        Ok(server)
    }

    async fn list_servers(&self) -> Result<Vec<Server>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SERVER_COLUMNS} FROM sakura_servers ORDER BY created_at ASC, rowid ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_servers: {e}")))?;

        let mut servers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            servers.push(row_to_server(&row)?);
        }
        Ok(servers)
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SERVER_COLUMNS} FROM sakura_servers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_server: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_server(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_server: {e}"))),
        }
    }

    async fn delete_server(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM sakura_servers WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_server: {e}")))?;
        Ok(count > 0)
    }
}

// ── Job source ──────────────────────────────────────────────────────

#[async_trait]
impl JobSource for LibSqlBackend {
    async fn next_pending(&self, kind: JobKind) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM {table} WHERE status = 'pending'
                     ORDER BY queued_at ASC, rowid ASC LIMIT 1",
                    table = table(kind)
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("next_pending: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(kind, &row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("next_pending: {e}"))),
        }
    }

    async fn try_claim(&self, job: &JobId, worker_id: &str) -> Result<bool, DatabaseError> {
        let now = now();
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {table} SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
                     WHERE novel_id = ?3 AND content_id = ?4 AND status = 'pending'",
                    table = table(job.kind)
                ),
                params![worker_id, now, job.novel_id.as_str(), job.content_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim: {e}")))?;
        Ok(count == 1)
    }

    async fn commit_translation(
        &self,
        job: &JobId,
        worker_id: &str,
        paragraphs: &[String],
    ) -> Result<(), DatabaseError> {
        let translation = serde_json::to_string(paragraphs)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = now();

        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {table} SET translation = ?1, status = 'done', claimed_by = NULL,
                        claimed_at = NULL, last_error = NULL, updated_at = ?2
                     WHERE novel_id = ?3 AND content_id = ?4 AND status = 'claimed'
                        AND claimed_by = ?5",
                    table = table(job.kind)
                ),
                params![
                    translation,
                    now,
                    job.novel_id.as_str(),
                    job.content_id.as_str(),
                    worker_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_translation: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "claimed job".to_string(),
                id: job.to_string(),
            });
        }
        Ok(())
    }

    async fn release_claim(
        &self,
        job: &JobId,
        worker_id: &str,
        failure: Option<&str>,
    ) -> Result<JobStatus, DatabaseError> {
        let now = now();
        let table = table(job.kind);

        // SQLite evaluates every SET expression against the pre-update row.
        let rows = match failure {
            None => self
                .conn()
                .query(
                    &format!(
                        "UPDATE {table} SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                            updated_at = ?1
                         WHERE novel_id = ?2 AND content_id = ?3 AND status = 'claimed'
                            AND claimed_by = ?4
                         RETURNING status"
                    ),
                    params![now, job.novel_id.as_str(), job.content_id.as_str(), worker_id],
                )
                .await,
            Some(reason) => self
                .conn()
                .query(
                    &format!(
                        "UPDATE {table} SET
                            attempts = attempts + 1,
                            last_error = ?1,
                            status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'pending' END,
                            claimed_by = NULL, claimed_at = NULL, updated_at = ?3
                         WHERE novel_id = ?4 AND content_id = ?5 AND status = 'claimed'
                            AND claimed_by = ?6
                         RETURNING status"
                    ),
                    params![
                        reason,
                        i64::from(self.max_attempts),
                        now,
                        job.novel_id.as_str(),
                        job.content_id.as_str(),
                        worker_id
                    ],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;

        returned_status(rows, "release_claim", job).await
    }

    async fn reclaim_orphaned(&self, live_workers: &[String]) -> Result<usize, DatabaseError> {
        let now = now();
        let live = serde_json::to_string(live_workers)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let mut total = 0;
        for kind in JobKind::ALL {
            let count = self
                .conn()
                .execute(
                    &format!(
                        "UPDATE {table} SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                            updated_at = ?1
                         WHERE status = 'claimed'
                            AND (claimed_by IS NULL OR claimed_by NOT IN (SELECT value FROM json_each(?2)))",
                        table = table(kind)
                    ),
                    params![now.as_str(), live.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("reclaim_orphaned: {e}")))?;
            total += count as usize;
        }
        Ok(total)
    }
}
