//! Translation client.
//!
//! Workers submit content to their server's inference endpoint through the
//! [`Translator`] trait. One instance is shared by the whole fleet; the
//! endpoint is supplied per call.

mod http;

pub use http::HttpTranslator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::store::{Job, JobKind};

/// Body sent to an inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationRequest {
    pub kind: JobKind,
    pub novel_id: String,
    pub content_id: String,
    pub paragraphs: Vec<String>,
}

impl From<&Job> for TranslationRequest {
    fn from(job: &Job) -> Self {
        Self {
            kind: job.id.kind,
            novel_id: job.id.novel_id.clone(),
            content_id: job.id.content_id.clone(),
            paragraphs: job.paragraphs.clone(),
        }
    }
}

/// Translated content returned by an endpoint.
///
/// Fields the client does not know about are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranslationOutput {
    pub paragraphs: Vec<String>,
}

/// Submits content to a remote inference endpoint.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `request` on the server at `endpoint`.
    ///
    /// Any non-success status, transport failure or contract violation is an
    /// error; there is no partial success.
    async fn translate(
        &self,
        endpoint: &str,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, TranslateError>;
}
