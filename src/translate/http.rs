//! HTTP transport for [`Translator`] using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;

use super::{TranslationOutput, TranslationRequest, Translator};
use crate::error::TranslateError;

/// Translator that POSTs JSON to the server endpoint.
///
/// Wraps a single [`reqwest::Client`], so connections are pooled across
/// every worker and endpoint.
#[derive(Clone)]
pub struct HttpTranslator {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTranslator {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    /// Reuse an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Ensure the response has a success status code, or turn it into a
    /// [`TranslateError::Status`] carrying the body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TranslateError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TranslateError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Decode a response body and check it against the request.
fn parse_output(
    body: &str,
    request: &TranslationRequest,
) -> Result<TranslationOutput, TranslateError> {
    let output: TranslationOutput =
        serde_json::from_str(body).map_err(|e| TranslateError::Malformed(e.to_string()))?;

    if output.paragraphs.len() != request.paragraphs.len() {
        return Err(TranslateError::Malformed(format!(
            "expected {} paragraphs, got {}",
            request.paragraphs.len(),
            output.paragraphs.len()
        )));
    }
    Ok(output)
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        endpoint: &str,
        request: &TranslationRequest,
    ) -> Result<TranslationOutput, TranslateError> {
        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;
        parse_output(&body, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobKind;

    fn request(paragraphs: &[&str]) -> TranslationRequest {
        TranslationRequest {
            kind: JobKind::Chapter,
            novel_id: "n1".into(),
            content_id: "1".into(),
            paragraphs: paragraphs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = r#"{"paragraphs": ["你好"], "model": "sakura-14b", "elapsed_ms": 812}"#;
        let output = parse_output(body, &request(&["こんにちは"])).unwrap();
        assert_eq!(output.paragraphs, vec!["你好"]);
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = parse_output(r#"{"text": "你好"}"#, &request(&["a"])).unwrap_err();
        assert!(matches!(err, TranslateError::Malformed(_)));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let err = parse_output(r#"{"paragraphs": "你好"}"#, &request(&["a"])).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn paragraph_count_mismatch_is_malformed() {
        let err = parse_output(r#"{"paragraphs": ["x"]}"#, &request(&["a", "b"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Malformed response: expected 2 paragraphs, got 1"
        );
    }

    #[test]
    fn request_serializes_kind_in_snake_case() {
        let json = serde_json::to_value(request(&["a"])).unwrap();
        assert_eq!(json["kind"], "chapter");
        assert_eq!(json["paragraphs"][0], "a");
    }
}
