//! Thin GraphQL wire client (spec §4's "Module I" / §6 wire protocol).
//!
//! A pure transport leaf: builds the request, attaches the fixed headers,
//! and hands back the raw HTTP status + parsed JSON body. It never retries
//! or rate-limits itself — that's the pipeline's job (`pipeline.rs`).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineError;

pub const USER_AGENT: &str = concat!("anilist-sync-core/", env!("CARGO_PKG_VERSION"));
const ENDPOINT: &str = "https://graphql.anilist.co";

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// `Retry-After` header value, if present and numeric (seconds).
    pub retry_after_secs: Option<u64>,
    pub body: Value,
}

/// Transport seam so pipeline/executor tests can inject canned responses
/// instead of making real network calls.
#[async_trait]
pub trait GraphQLTransport: Send + Sync {
    async fn send(
        &self,
        query: &str,
        variables: Value,
        token: Option<&str>,
    ) -> Result<RawResponse, PipelineError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: ENDPOINT.to_string(),
        }
    }

    /// Overrides the GraphQL endpoint — used in tests against a local mock
    /// server.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphQLTransport for ReqwestTransport {
    async fn send(
        &self,
        query: &str,
        variables: Value,
        token: Option<&str>,
    ) -> Result<RawResponse, PipelineError> {
        let body = serde_json::json!({ "query": query, "variables": variables });

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .json(&body);

        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::NetworkTransport(e.to_string()))?;

        let status = resp.status().as_u16();
        let retry_after_secs = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let text = resp
            .text()
            .await
            .map_err(|e| PipelineError::NetworkTransport(e.to_string()))?;

        let parsed: Value = serde_json::from_str(&text).unwrap_or_else(|_| {
            serde_json::json!({ "errors": [{ "message": text }] })
        });

        Ok(RawResponse {
            status,
            retry_after_secs,
            body: parsed,
        })
    }
}
