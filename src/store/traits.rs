//! Persistence contracts: the durable server registry and the shared job pool.
//!
//! Workers only ever touch the job pool through [`JobSource`]; every mutation
//! there is a single conditional statement, never a read-modify-write in
//! application code.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// A registered remote inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub id: String,
    /// Free-text capability label, e.g. `"A100"`.
    pub gpu: String,
    /// URL of the remote inference service.
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

/// The two content queues that feed the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A web novel chapter.
    Chapter,
    /// A wenku novel volume.
    Volume,
}

impl JobKind {
    /// Poll order: chapters before volumes.
    pub const ALL: [JobKind; 2] = [JobKind::Chapter, JobKind::Volume];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one unit of translatable content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub kind: JobKind,
    pub novel_id: String,
    /// Chapter id or volume id, depending on `kind`.
    pub content_id: String,
}

impl JobId {
    pub fn new(kind: JobKind, novel_id: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            kind,
            novel_id: novel_id.into(),
            content_id: content_id.into(),
        }
    }

    pub fn chapter(novel_id: impl Into<String>, chapter_id: impl Into<String>) -> Self {
        Self::new(JobKind::Chapter, novel_id, chapter_id)
    }

    pub fn volume(novel_id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self::new(JobKind::Volume, novel_id, volume_id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.novel_id, self.content_id)
    }
}

/// Translation status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Serialization(format!(
                "unknown job status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored in its content repository.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Source paragraphs to translate.
    pub paragraphs: Vec<String>,
    /// Translated paragraphs, present once the job is done.
    pub translation: Option<Vec<String>>,
    pub status: JobStatus,
    /// Worker id holding the claim, if any.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Failed translation attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// Durable set of registered inference servers.
///
/// Mutated only by the fleet manager.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Register a server. The id is generated here.
    async fn insert_server(&self, gpu: &str, endpoint: &str) -> Result<Server, DatabaseError>;

    /// All registered servers, oldest first.
    async fn list_servers(&self) -> Result<Vec<Server>, DatabaseError>;

    async fn get_server(&self, id: &str) -> Result<Option<Server>, DatabaseError>;

    /// Remove a server. Returns `false` if it was not registered.
    async fn delete_server(&self, id: &str) -> Result<bool, DatabaseError>;
}

/// The narrow contract workers need from the chapter and volume repositories.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Oldest pending job of the given kind, if any.
    async fn next_pending(&self, kind: JobKind) -> Result<Option<Job>, DatabaseError>;

    /// Atomically move a job from `pending` to `claimed` for `worker_id`.
    ///
    /// Returns `false` when the job was no longer pending (another worker
    /// claimed it first).
    async fn try_claim(&self, job: &JobId, worker_id: &str) -> Result<bool, DatabaseError>;

    /// Store the translation of a job claimed by `worker_id` and mark it
    /// `done`. Fails with `NotFound` if that worker no longer holds the claim.
    async fn commit_translation(
        &self,
        job: &JobId,
        worker_id: &str,
        paragraphs: &[String],
    ) -> Result<(), DatabaseError>;

    /// Give back a job claimed by `worker_id`.
    ///
    /// `None` releases it to `pending` without counting an attempt. `Some(reason)`
    /// records a failed attempt; the source decides whether the job goes back to
    /// `pending` or is parked as `failed`. Returns the resulting status, or
    /// `NotFound` if that worker no longer holds the claim.
    async fn release_claim(
        &self,
        job: &JobId,
        worker_id: &str,
        failure: Option<&str>,
    ) -> Result<JobStatus, DatabaseError>;

    /// Reset to `pending` every `claimed` job whose holder is not in
    /// `live_workers`. Returns how many were reset.
    ///
    /// Claims do not survive a process restart. Bootstrap calls this with the
    /// workers already running in this process, whose claims are left alone.
    async fn reclaim_orphaned(&self, live_workers: &[String]) -> Result<usize, DatabaseError>;
}
