//! Process-wide FIFO, rate-limited, retrying GraphQL dispatcher, plus a
//! small in-memory read cache for idempotent search queries (spec §4.A).
//!
//! One [`Pipeline`] instance is constructed per process and shared (via
//! `Arc`) across however many batch executors are running; `enqueue` takes
//! `&self` and serializes callers through an internal fair mutex, so the
//! FIFO and one-in-flight guarantees hold across concurrently started
//! batches (spec §5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::client::{GraphQLTransport, RawResponse, ReqwestTransport};
use crate::error::PipelineError;
use crate::mutation::{self, VariableSet};
use crate::model::PlannedEntry;

const MAX_RPM: u64 = 28;
/// 60_000 / MAX_RPM, rounded to the nearest millisecond.
const INTERVAL: Duration = Duration::from_millis(2143);
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_ATTEMPTS: u32 = 5;
const RETRY_FLOOR_MS: u64 = 1000;
const SOFT_ITERATION_BUDGET: Duration = Duration::from_millis(250);
const SOFT_ITERATION_YIELD: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct GateState {
    last_dequeue_time: Option<Instant>,
    rate_limit_reset_time: Option<Instant>,
}

#[derive(Clone)]
struct CacheEntry {
    response: Value,
    inserted_at: Instant,
}

#[derive(Default)]
struct ReadCache {
    entries: HashMap<String, CacheEntry>,
    /// normalized search term -> set of cache keys, for precise invalidation.
    term_index: HashMap<String, HashSet<String>>,
}

impl ReadCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).and_then(|e| {
            if e.inserted_at.elapsed() < CACHE_TTL {
                Some(e.response.clone())
            } else {
                None
            }
        })
    }

    fn put(&mut self, key: String, term: Option<String>, response: Value) {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                response,
                inserted_at: Instant::now(),
            },
        );
        if let Some(term) = term {
            self.term_index.entry(term).or_default().insert(key);
        }
    }

    fn clear(&mut self, term: Option<&str>) {
        match term {
            None => {
                self.entries.clear();
                self.term_index.clear();
            }
            Some(term) => {
                if let Some(keys) = self.term_index.remove(term) {
                    for key in keys {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }
}

fn normalize_term(term: &str) -> String {
    term.trim().to_ascii_lowercase()
}

fn cache_key(query: &str, variables: &Value) -> String {
    let canonical = serde_json::to_string(variables).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Applies ±10% jitter and a 1000ms floor, per spec §4.A.
fn with_jitter_floor(ms: u64) -> u64 {
    let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
    let jittered = (ms as f64) * (1.0 + jitter_frac);
    (jittered.round() as u64).max(RETRY_FLOOR_MS)
}

fn http_429_backoff(attempt: u32, retry_after_header: Option<u64>) -> u64 {
    if let Some(secs) = retry_after_header {
        return secs * 1000;
    }
    let base = 5000u64.saturating_mul(1u64 << attempt.min(20)).min(60_000);
    with_jitter_floor(base)
}

fn http_5xx_backoff(attempt: u32) -> u64 {
    let base = 3000u64.saturating_mul(1u64 << attempt.min(20)).min(60_000);
    with_jitter_floor(base)
}

fn network_backoff(attempt: u32) -> u64 {
    1000u64.saturating_mul(1u64 << attempt.min(20))
}

pub struct Pipeline {
    transport: Arc<dyn GraphQLTransport>,
    gate: Mutex<GateState>,
    cache: Mutex<ReadCache>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_transport(Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(transport: Arc<dyn GraphQLTransport>) -> Self {
        Self {
            transport,
            gate: Mutex::new(GateState::default()),
            cache: Mutex::new(ReadCache::default()),
        }
    }

    /// Dispatches one GraphQL operation through the FIFO gate, honoring
    /// spacing, observed rate limits, and the HTTP-layer retry policy
    /// (429 / 5xx / network failures). GraphQL-shaped errors in a 200
    /// response are not retried here — the executor classifies and drives
    /// those (spec §4.D/§4.E).
    pub async fn enqueue(
        &self,
        query: &str,
        variables: Value,
        token: Option<&str>,
    ) -> Result<RawResponse, PipelineError> {
        if token.is_none() {
            return Err(PipelineError::NoToken);
        }

        let mut guard = self.gate.lock().await;
        self.wait_for_slot(&mut guard).await;

        let iteration_start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let result = self.transport.send(query, variables.clone(), token).await;
            guard.last_dequeue_time = Some(Instant::now());

            match result {
                Ok(resp) if resp.status == 429 => {
                    attempt += 1;
                    let wait_ms = http_429_backoff(attempt - 1, resp.retry_after_secs);
                    guard.rate_limit_reset_time = Some(
                        guard
                            .rate_limit_reset_time
                            .map(|t| t.max(Instant::now() + Duration::from_millis(wait_ms)))
                            .unwrap_or_else(|| Instant::now() + Duration::from_millis(wait_ms)),
                    );
                    if attempt >= MAX_ATTEMPTS {
                        return Err(PipelineError::HttpRateLimited {
                            retry_after_ms: wait_ms,
                        });
                    }
                    tracing::warn!(attempt, wait_ms, "429 received; backing off before retry");
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    self.maybe_yield(iteration_start).await;
                    continue;
                }
                Ok(resp) if (500..600).contains(&resp.status) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(PipelineError::HttpServer {
                            status: resp.status,
                        });
                    }
                    let wait_ms = http_5xx_backoff(attempt - 1);
                    tracing::warn!(
                        attempt,
                        status = resp.status,
                        wait_ms,
                        "server error; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    self.maybe_yield(iteration_start).await;
                    continue;
                }
                Ok(resp) if (400..500).contains(&resp.status) => {
                    return Err(PipelineError::HttpClient {
                        status: resp.status,
                    });
                }
                Ok(resp) => return Ok(resp),
                Err(PipelineError::NetworkTransport(msg)) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(PipelineError::RetriesExhausted {
                            attempts: attempt,
                            last: msg,
                        });
                    }
                    let wait_ms = network_backoff(attempt - 1);
                    tracing::warn!(attempt, wait_ms, error = %msg, "network failure; retrying");
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    self.maybe_yield(iteration_start).await;
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn wait_for_slot(&self, guard: &mut GateState) {
        if let Some(reset) = guard.rate_limit_reset_time {
            let now = Instant::now();
            if now < reset {
                tokio::time::sleep(reset - now).await;
            }
        }
        if let Some(last) = guard.last_dequeue_time {
            let earliest = last + INTERVAL;
            let now = Instant::now();
            if now < earliest {
                tokio::time::sleep(earliest - now).await;
            }
        }
    }

    /// Soft fairness yield: if a single operation's retry loop has been
    /// running past the iteration budget, yield briefly so other tasks
    /// waiting on the gate aren't starved by one pathological retry storm.
    async fn maybe_yield(&self, iteration_start: Instant) {
        if iteration_start.elapsed() >= SOFT_ITERATION_BUDGET {
            tokio::time::sleep(SOFT_ITERATION_YIELD).await;
        }
    }

    // ---- §6 core operations ----

    pub async fn update_manga_entry(
        &self,
        planned: &PlannedEntry,
        step: Option<crate::model::StepIndex>,
        token: Option<&str>,
    ) -> Result<RawResponse, PipelineError> {
        let vars: VariableSet = mutation::build_variables(planned, step);
        let query = mutation::build_mutation(&vars);
        let json_vars = mutation::variables_to_json(&vars);
        self.enqueue(&query, json_vars, token).await
    }

    pub async fn delete_manga_entry(
        &self,
        remote_entry_id: u64,
        token: Option<&str>,
    ) -> Result<RawResponse, PipelineError> {
        let query = "mutation ($id: Int) {\n  DeleteMediaListEntry(id: $id) {\n    deleted\n  }\n}";
        let vars = serde_json::json!({ "id": remote_entry_id });
        self.enqueue(query, vars, token).await
    }

    pub async fn search_manga(
        &self,
        search: &str,
        page: u32,
        per_page: u32,
        token: Option<&str>,
        bypass_cache: bool,
    ) -> Result<RawResponse, PipelineError> {
        let query = "query ($search: String, $page: Int, $perPage: Int) {\n  Page(page: $page, perPage: $perPage) {\n    media(search: $search, type: MANGA) {\n      id\n      title { romaji }\n    }\n  }\n}";
        let vars = serde_json::json!({ "search": search, "page": page, "perPage": per_page });

        let key = cache_key(query, &vars);

        if !bypass_cache {
            let cached = self.cache.lock().await.get(&key);
            if let Some(cached) = cached {
                return Ok(RawResponse {
                    status: 200,
                    retry_after_secs: None,
                    body: cached,
                });
            }
        }

        let resp = self.enqueue(query, vars, token).await?;

        if resp.status == 200 {
            let term = normalize_term(search);
            self.cache
                .lock()
                .await
                .put(key, Some(term), resp.body.clone());
        }

        Ok(resp)
    }

    /// Invalidates the read cache. `None` wipes everything; `Some(term)`
    /// only clears entries keyed under that (normalized) search term.
    pub async fn clear_cache(&self, term: Option<&str>) {
        let normalized = term.map(normalize_term);
        self.cache.lock().await.clear(normalized.as_deref());
    }

    pub async fn get_manga_by_ids(
        &self,
        ids: &[u64],
        token: Option<&str>,
    ) -> Result<RawResponse, PipelineError> {
        let query = "query ($ids: [Int]) {\n  Page {\n    media(id_in: $ids, type: MANGA) {\n      id\n      title { romaji }\n    }\n  }\n}";
        let vars = serde_json::json!({ "ids": ids });
        self.enqueue(query, vars, token).await
    }

    /// Issues a `Viewer` query, then iterates a chunked `MediaListCollection`
    /// query (`perPage = 500`) until a short chunk signals the end.
    pub async fn get_user_manga_list(
        &self,
        token: Option<&str>,
    ) -> Result<Vec<Value>, PipelineError> {
        const PER_PAGE: u32 = 500;

        let viewer_query = "query {\n  Viewer {\n    id\n  }\n}";
        let viewer_resp = self.enqueue(viewer_query, serde_json::json!({}), token).await?;
        let viewer_id = viewer_resp
            .body
            .get("data")
            .and_then(|d| d.get("Viewer"))
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| PipelineError::MalformedResponse("missing Viewer.id".to_string()))?;

        let list_query = "query ($userId: Int, $page: Int, $perPage: Int) {\n  MediaListCollection(userId: $userId, type: MANGA, page: $page, perPage: $perPage) {\n    lists {\n      entries {\n        id\n        status\n        progress\n        score\n        private\n        media { id }\n      }\n    }\n  }\n}";

        let mut all_entries = Vec::new();
        let mut page = 1u32;
        loop {
            let vars =
                serde_json::json!({ "userId": viewer_id, "page": page, "perPage": PER_PAGE });
            let resp = self.enqueue(list_query, vars, token).await?;

            let entries = extract_list_entries(&resp.body);
            let chunk_len = entries.len();
            all_entries.extend(entries);

            if chunk_len < PER_PAGE as usize {
                break;
            }
            page += 1;
        }

        Ok(all_entries)
    }

    /// Opens an external URL in the host's system browser, after validating
    /// the scheme is `http` or `https` (spec §4.A security side-channel).
    pub fn validate_external_url(url: &str) -> Result<(), PipelineError> {
        let scheme = url.split_once("://").map(|(s, _)| s.to_ascii_lowercase());
        match scheme.as_deref() {
            Some("http") | Some("https") => Ok(()),
            _ => Err(PipelineError::GraphqlDomain(format!(
                "rejected URL scheme for {url}"
            ))),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_list_entries(body: &Value) -> Vec<Value> {
    let lists = body
        .get("data")
        .and_then(|d| d.get("MediaListCollection"))
        .and_then(|c| c.get("lists"))
        .and_then(|l| l.as_array())
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for list in lists {
        if let Some(entries) = list.get("entries").and_then(|e| e.as_array()) {
            out.extend(entries.iter().cloned());
        }
    }
    out
}
