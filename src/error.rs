//! Crate-wide error taxonomy.
//!
//! Kinds mirror the failure taxonomy of the sync core: what the pipeline can
//! raise, what the classifier can detect, and what the planner rejects at
//! construction time. Retryable kinds carry the data the retry loop needs
//! (`retry_after_ms`, `status`) rather than leaving callers to re-parse a
//! message string.

use thiserror::Error;

/// Failures surfaced by the request pipeline (4.A) up to the executor (4.D).
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// No bearer token was supplied; the call was never queued.
    #[error("no auth token supplied")]
    NoToken,

    /// Connection refused, DNS failure, TLS handshake failure, socket reset, etc.
    #[error("network transport error: {0}")]
    NetworkTransport(String),

    /// HTTP 429. Carries the resolved wait, already clamped/jittered.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    HttpRateLimited { retry_after_ms: u64 },

    /// HTTP 500-599.
    #[error("server error (status {status})")]
    HttpServer { status: u16 },

    /// Any other 4xx. Not retryable.
    #[error("client error (status {status})")]
    HttpClient { status: u16 },

    /// A well-formed GraphQL response whose errors indicate throttling.
    #[error("graphql rate limited, retry after {retry_after_ms}ms")]
    GraphqlRateLimited { retry_after_ms: u64 },

    /// A well-formed GraphQL response with other, non-retryable errors.
    #[error("graphql error: {0}")]
    GraphqlDomain(String),

    /// Expected fields missing from both unwrap shapes.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Retry budget (5 attempts) exhausted.
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// External cancellation signal observed. Terminal for the batch, not per-entry.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether the pipeline's own retry loop should keep retrying this error,
    /// as opposed to surfacing it to the caller immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::NetworkTransport(_)
                | PipelineError::HttpRateLimited { .. }
                | PipelineError::HttpServer { .. }
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            PipelineError::HttpRateLimited { retry_after_ms }
            | PipelineError::GraphqlRateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Failures raised while constructing a plan (4.C).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The same media id appeared more than once in the matched-pairs input.
    #[error("duplicate media id {0} in matched pairs")]
    DuplicateMediaId(u64),
}
