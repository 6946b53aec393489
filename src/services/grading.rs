//! Grading Service Client
//!
//! HTTP client for the external grading endpoint used by short and
//! long answer questions. The endpoint takes the student answer, the
//! rubric and the prompt, and returns a mark in `[0, 1]` with an
//! explanation. Calls are bounded by a timeout; callers treat any
//! failure as an incorrect answer so a stalled grader can never wedge
//! a round.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Grader, ServiceError};

/// Default bound on one grading call.
pub const DEFAULT_GRADING_TIMEOUT: Duration = Duration::from_secs(8);

/// Grading outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradeResult {
    /// Mark in `[0, 1]`.
    pub mark: f64,
    /// Grader's explanation, echoed to clients where useful.
    #[serde(default)]
    pub explanation: String,
}

#[derive(Serialize)]
struct GradeRequest<'a> {
    answer: &'a str,
    rubric: &'a str,
    prompt: &'a str,
}

/// Grader backed by an HTTP endpoint.
pub struct HttpGrader {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpGrader {
    /// Create a grader for `endpoint` with the default timeout.
    pub fn new(endpoint: String) -> Self {
        Self::with_timeout(endpoint, DEFAULT_GRADING_TIMEOUT)
    }

    /// Create a grader with an explicit per-call timeout.
    pub fn with_timeout(endpoint: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }
}

impl Grader for HttpGrader {
    fn grade<'a>(
        &'a self,
        answer: &'a str,
        rubric: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<GradeResult, ServiceError>> {
        Box::pin(async move {
            let body = GradeRequest {
                answer,
                rubric,
                prompt,
            };

            let response = tokio::time::timeout(
                self.timeout,
                self.client.post(&self.endpoint).json(&body).send(),
            )
            .await
            .map_err(|_| {
                warn!(endpoint = %self.endpoint, "grading call timed out");
                ServiceError::Unavailable("grading timeout".to_string())
            })?
            .map_err(|e| ServiceError::Unavailable(format!("grading request: {e}")))?;

            let result: GradeResult = response
                .error_for_status()
                .map_err(|e| ServiceError::Unavailable(format!("grading status: {e}")))?
                .json()
                .await
                .map_err(|e| ServiceError::Unavailable(format!("grading body: {e}")))?;

            Ok(GradeResult {
                mark: result.mark.clamp(0.0, 1.0),
                explanation: result.explanation,
            })
        })
    }
}

/// Grader that marks everything zero. Stands in when no grading
/// endpoint is configured, and in tests.
pub struct NullGrader;

impl Grader for NullGrader {
    fn grade<'a>(
        &'a self,
        _answer: &'a str,
        _rubric: &'a str,
        _prompt: &'a str,
    ) -> BoxFuture<'a, Result<GradeResult, ServiceError>> {
        Box::pin(async {
            Ok(GradeResult {
                mark: 0.0,
                explanation: "grading unavailable".to_string(),
            })
        })
    }
}
