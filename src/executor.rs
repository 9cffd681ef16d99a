//! Drives a planned batch to completion, one media id at a time (spec
//! §4.D). Media ids run strictly sequentially — the pipeline itself already
//! owns FIFO ordering and spacing, so fanning out here would only add
//! contention without buying throughput.
//!
//! Two retry layers meet here: GraphQL-shaped rate-limit errors (well-formed
//! 200 responses whose `errors` say "too many requests") and the "thrown
//! 500-class" exception path both enter a visible countdown and re-dispatch
//! the same step, without consuming the pipeline's own HTTP-layer retry
//! budget. This mirrors `scanner.rs`'s `fetch_logs_with_retries`, except the
//! wait is driven by the server's own hint rather than a fixed backoff.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::classify::{self, ClassifiedOutcome, ThrownError, ThrownOutcome};
use crate::error::PipelineError;
use crate::model::{EntryDisplay, PlannedEntry, ProgressSnapshot, StepIndex, SyncError, SyncReport};
use crate::pipeline::Pipeline;
use crate::planner;
use crate::report::{self, MediaOutcome};
use crate::stats;
use crate::storage::SyncStore;

/// Defensive cap on the countdown-and-redispatch loop. The spec describes
/// this as bounded only by cancellation; an explicit finite cap keeps a
/// misbehaving server from wedging a batch forever.
const MAX_SOFT_RETRIES: u32 = 10;
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Cooperative cancellation flag, observed between media ids, between steps,
/// and on every countdown tick.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

#[derive(Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
}

struct Counters {
    total: usize,
    completed: usize,
    successful: usize,
    failed: usize,
    skipped: usize,
}

fn snapshot(
    counters: &Counters,
    current_entry: Option<EntryDisplay>,
    current_step: Option<StepIndex>,
    total_steps: Option<u8>,
    rate_limited: bool,
    retry_after_ms: Option<u64>,
) -> ProgressSnapshot {
    ProgressSnapshot {
        total: counters.total,
        completed: counters.completed,
        successful: counters.successful,
        failed: counters.failed,
        skipped: counters.skipped,
        current_entry,
        current_step,
        total_steps,
        rate_limited,
        retry_after_ms,
    }
}

/// Runs every media id in `plan`, in the planner's own insertion order (key
/// order, since `plan` is a `BTreeMap`), to completion or cancellation.
/// Returns the aggregated report regardless of outcome; a mid-batch
/// cancellation simply leaves the remaining media ids out of it. Persists
/// the running totals to `store` before returning (spec §4.D step 5/§4.F),
/// swallowing any storage error.
pub async fn run_batch(
    pipeline: &Pipeline,
    plan: BTreeMap<u64, Vec<PlannedEntry>>,
    token: Option<&str>,
    progress: &dyn ProgressSink,
    cancel: &Cancellation,
    store: &dyn SyncStore,
) -> SyncReport {
    run_batch_ordered(pipeline, plan, None, token, progress, cancel, store).await
}

/// Same as [`run_batch`], but drives media ids in `order` instead of the
/// plan's own key order (spec §4.D step 2: "if `order` is given, iterate
/// it"). Media ids in `order` that aren't in `plan` are silently skipped;
/// media ids in `plan` that aren't in `order` are not processed.
#[allow(clippy::too_many_arguments)]
pub async fn run_batch_ordered(
    pipeline: &Pipeline,
    mut plan: BTreeMap<u64, Vec<PlannedEntry>>,
    order: Option<&[u64]>,
    token: Option<&str>,
    progress: &dyn ProgressSink,
    cancel: &Cancellation,
    store: &dyn SyncStore,
) -> SyncReport {
    let ids: Vec<u64> = match order {
        Some(order) => order.iter().copied().filter(|id| plan.contains_key(id)).collect(),
        None => plan.keys().copied().collect(),
    };

    let mut counters = Counters {
        total: ids.len(),
        completed: 0,
        successful: 0,
        failed: 0,
        skipped: 0,
    };
    let mut outcomes = Vec::with_capacity(ids.len());

    for media_id in ids {
        if cancel.is_cancelled() {
            break;
        }

        let steps = plan.remove(&media_id).unwrap_or_default();
        if steps.is_empty() {
            counters.skipped += 1;
            counters.completed += 1;
            progress.on_progress(&snapshot(&counters, None, None, None, false, None));
            outcomes.push(MediaOutcome::Skipped);
            continue;
        }

        match execute_media_id(pipeline, media_id, &steps, token, progress, cancel, &mut counters)
            .await
        {
            MediaExecResult::Done(outcome) => {
                counters.completed += 1;
                progress.on_progress(&snapshot(&counters, None, None, None, false, None));
                outcomes.push(outcome);
            }
            // Cancellation mid-media: the interrupted media is excluded from
            // the report entirely (spec §4.D step 4 only fires "after each
            // media completes (success, skip, or fail)" — cancellation isn't
            // one of those terminal states), and the batch stops here.
            MediaExecResult::Cancelled => break,
        }
    }

    let report = report::aggregate(&outcomes);
    stats::record(store, &report).await;
    report
}

/// Re-runs one media id's already-planned steps from `resume_from` onward,
/// e.g. after the host reports a prior failure partway through its step
/// sequence. Re-enters the same per-media-id execution path `run_batch`
/// uses, rather than re-invoking the planner.
#[allow(clippy::too_many_arguments)]
pub async fn retry_failed(
    pipeline: &Pipeline,
    media_id: u64,
    steps: Vec<PlannedEntry>,
    resume_from: StepIndex,
    token: Option<&str>,
    progress: &dyn ProgressSink,
    cancel: &Cancellation,
    store: &dyn SyncStore,
) -> SyncReport {
    let filtered = planner::apply_resume_filter(steps, resume_from);
    let mut counters = Counters {
        total: 1,
        completed: 0,
        successful: 0,
        failed: 0,
        skipped: 0,
    };

    let outcomes = if filtered.is_empty() {
        counters.skipped += 1;
        counters.completed += 1;
        vec![MediaOutcome::Skipped]
    } else {
        match execute_media_id(pipeline, media_id, &filtered, token, progress, cancel, &mut counters)
            .await
        {
            MediaExecResult::Done(outcome) => {
                counters.completed += 1;
                vec![outcome]
            }
            MediaExecResult::Cancelled => Vec::new(),
        }
    };

    let report = report::aggregate(&outcomes);
    stats::record(store, &report).await;
    report
}

/// Outcome of driving one media id's steps to completion. `Cancelled` means
/// the external signal fired partway through and the media must be excluded
/// from the report's counts entirely, not recorded as failed.
enum MediaExecResult {
    Done(MediaOutcome),
    Cancelled,
}

async fn execute_media_id(
    pipeline: &Pipeline,
    media_id: u64,
    steps: &[PlannedEntry],
    token: Option<&str>,
    progress: &dyn ProgressSink,
    cancel: &Cancellation,
    counters: &mut Counters,
) -> MediaExecResult {
    let display = EntryDisplay {
        media_id,
        title: steps[0].title.clone(),
        cover_url: steps[0].cover_url.clone(),
    };
    let total_steps = if steps.len() > 1 {
        Some(steps.len() as u8)
    } else {
        None
    };

    for planned in steps {
        if cancel.is_cancelled() {
            return MediaExecResult::Cancelled;
        }

        let step = planned.sync_metadata.as_ref().and_then(|m| m.step);
        progress.on_progress(&snapshot(
            counters,
            Some(display.clone()),
            step,
            total_steps,
            false,
            None,
        ));

        match dispatch_step(
            pipeline,
            planned,
            step,
            token,
            media_id,
            counters,
            &display,
            total_steps,
            progress,
            cancel,
        )
        .await
        {
            Ok(()) => continue,
            Err(StepError::Cancelled) => return MediaExecResult::Cancelled,
            Err(StepError::Failed(sync_err)) => {
                counters.failed += 1;
                return MediaExecResult::Done(MediaOutcome::Failed(sync_err));
            }
        }
    }

    counters.successful += 1;
    MediaExecResult::Done(MediaOutcome::Success)
}

/// A single step's dispatch either succeeds, fails for good (consumes the
/// per-media error budget), or is cut short by cancellation (doesn't).
enum StepError {
    Cancelled,
    Failed(SyncError),
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_step(
    pipeline: &Pipeline,
    planned: &PlannedEntry,
    step: Option<StepIndex>,
    token: Option<&str>,
    media_id: u64,
    counters: &Counters,
    display: &EntryDisplay,
    total_steps: Option<u8>,
    progress: &dyn ProgressSink,
    cancel: &Cancellation,
) -> Result<(), StepError> {
    let mut soft_retries: u32 = 0;

    loop {
        match pipeline.update_manga_entry(planned, step, token).await {
            Ok(resp) => match classify::classify_response(&resp.body) {
                ClassifiedOutcome::Success { .. } => return Ok(()),
                ClassifiedOutcome::GraphqlRateLimited { retry_after_ms } => {
                    if soft_retries >= MAX_SOFT_RETRIES {
                        return Err(StepError::Failed(SyncError {
                            media_id,
                            message: format!(
                                "graphql rate limited after {soft_retries} soft retries"
                            ),
                        }));
                    }
                    soft_retries += 1;
                    if !countdown(
                        retry_after_ms,
                        counters,
                        display,
                        step,
                        total_steps,
                        progress,
                        cancel,
                    )
                    .await
                    {
                        return Err(StepError::Cancelled);
                    }
                }
                ClassifiedOutcome::GraphqlDomain(msg) => {
                    return Err(StepError::Failed(SyncError { media_id, message: msg }));
                }
                ClassifiedOutcome::Malformed(msg) => {
                    return Err(StepError::Failed(SyncError { media_id, message: msg }));
                }
            },
            Err(PipelineError::Cancelled) => {
                return Err(StepError::Cancelled);
            }
            Err(err) => {
                let thrown = ThrownError {
                    message: err.to_string(),
                    status: match &err {
                        PipelineError::HttpServer { status } => Some(*status),
                        PipelineError::HttpClient { status } => Some(*status),
                        _ => None,
                    },
                    serialized: format!("{err:?}"),
                };

                match classify::classify_thrown(&thrown) {
                    ThrownOutcome::SoftRetry { hint_ms } => {
                        if soft_retries >= MAX_SOFT_RETRIES {
                            return Err(StepError::Failed(SyncError {
                                media_id,
                                message: err.to_string(),
                            }));
                        }
                        soft_retries += 1;
                        if !countdown(
                            hint_ms,
                            counters,
                            display,
                            step,
                            total_steps,
                            progress,
                            cancel,
                        )
                        .await
                        {
                            return Err(StepError::Cancelled);
                        }
                    }
                    ThrownOutcome::NonRetryable(msg) => {
                        return Err(StepError::Failed(SyncError { media_id, message: msg }));
                    }
                }
            }
        }
    }
}

/// Sleeps out `wait_ms`, in ~1s ticks, emitting a progress snapshot each
/// tick. Returns `false` if cancellation was observed mid-wait.
#[allow(clippy::too_many_arguments)]
async fn countdown(
    wait_ms: u64,
    counters: &Counters,
    display: &EntryDisplay,
    current_step: Option<StepIndex>,
    total_steps: Option<u8>,
    progress: &dyn ProgressSink,
    cancel: &Cancellation,
) -> bool {
    let mut remaining = Duration::from_millis(wait_ms);
    progress.on_progress(&snapshot(
        counters,
        Some(display.clone()),
        current_step,
        total_steps,
        true,
        Some(wait_ms),
    ));

    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return false;
        }
        let tick = remaining.min(COUNTDOWN_TICK);
        tokio::time::sleep(tick).await;
        remaining = remaining.saturating_sub(tick);
        progress.on_progress(&snapshot(
            counters,
            Some(display.clone()),
            current_step,
            total_steps,
            true,
            Some(remaining.as_millis() as u64),
        ));
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GraphQLTransport, RawResponse};
    use crate::model::{MediaStatus, RemoteEntry};
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TokioMutex;

    struct ScriptedTransport {
        responses: TokioMutex<Vec<Result<RawResponse, PipelineError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<RawResponse, PipelineError>>) -> Self {
            Self {
                responses: TokioMutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GraphQLTransport for ScriptedTransport {
        async fn send(
            &self,
            _query: &str,
            _variables: Value,
            _token: Option<&str>,
        ) -> Result<RawResponse, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                panic!("scripted transport exhausted");
            }
            responses.remove(0)
        }
    }

    fn ok(body: Value) -> Result<RawResponse, PipelineError> {
        Ok(RawResponse {
            status: 200,
            retry_after_secs: None,
            body,
        })
    }

    fn planned(media_id: u64) -> PlannedEntry {
        PlannedEntry {
            media_id,
            status: MediaStatus::Current,
            progress: 5,
            score: 7.0,
            private: false,
            previous_values: Some(RemoteEntry {
                entry_id: 1,
                status: MediaStatus::Current,
                progress: 1,
                score: 0.0,
                private: false,
            }),
            sync_metadata: None,
            title: "Test".into(),
            cover_url: None,
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        snapshots: StdMutex<Vec<ProgressSnapshot>>,
    }

    impl ProgressSink for CollectingSink {
        fn on_progress(&self, snapshot: &ProgressSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn s4_successful_single_step_batch() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(
            serde_json::json!({"data": {"SaveMediaListEntry": {"id": 77}}}),
        )]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, vec![planned(1)]);

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        let report = run_batch(&pipeline, plan, Some("tok"), &sink, &cancel, &store).await;

        assert_eq!(report.successful_updates, 1);
        assert_eq!(report.failed_updates, 0);
        assert!(!sink.snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn s5_graphql_rate_limit_countdown_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(serde_json::json!({"errors": [{"message": "Rate limited, retry in 2 seconds"}]})),
            ok(serde_json::json!({"data": {"SaveMediaListEntry": {"id": 1}}})),
        ]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, vec![planned(1)]);

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        let start = tokio::time::Instant::now();
        let report = run_batch(&pipeline, plan, Some("tok"), &sink, &cancel, &store).await;

        assert_eq!(report.successful_updates, 1);
        assert!(start.elapsed() >= Duration::from_secs(2));
        let saw_rate_limited = sink
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.rate_limited);
        assert!(saw_rate_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn domain_error_fails_entry_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(
            serde_json::json!({"errors": [{"message": "Invalid media id"}]}),
        )]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, vec![planned(1)]);

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        let report = run_batch(&pipeline, plan, Some("tok"), &sink, &cancel, &store).await;

        assert_eq!(report.failed_updates, 1);
        assert_eq!(report.errors[0].message, "Invalid media id");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_steps_count_as_skipped_without_dispatch() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, Vec::new());

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        let report = run_batch(&pipeline, plan, Some("tok"), &sink, &cancel, &store).await;

        assert_eq!(report.skipped_entries, 1);
        assert_eq!(report.total_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_observed_before_next_media_id() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(
            serde_json::json!({"data": {"SaveMediaListEntry": {"id": 1}}}),
        )]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, vec![planned(1)]);
        plan.insert(2, vec![planned(2)]);

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        cancel.cancel();
        let report = run_batch(&pipeline, plan, Some("tok"), &sink, &cancel, &store).await;

        assert_eq!(report.total_entries, 0);
    }

    /// S5: cancellation firing partway through the second media's rate-limit
    /// countdown must not be recorded as failed, and must not advance
    /// `completed` — the report reflects only the completed prefix.
    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_countdown_excludes_interrupted_media() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(serde_json::json!({"data": {"SaveMediaListEntry": {"id": 1}}})),
            ok(serde_json::json!({"errors": [{"message": "Rate limited, retry in 5 seconds"}]})),
        ]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, vec![planned(1)]);
        plan.insert(2, vec![planned(2)]);

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel_clone.cancel();
        });

        let report = run_batch(&pipeline, plan, Some("tok"), &sink, &cancel, &store).await;

        assert_eq!(report.total_entries, 1);
        assert_eq!(report.successful_updates, 1);
        assert_eq!(report.failed_updates, 0);
        assert_eq!(report.skipped_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_order_overrides_plan_key_order() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(serde_json::json!({"data": {"SaveMediaListEntry": {"id": 1}}})),
            ok(serde_json::json!({"data": {"SaveMediaListEntry": {"id": 1}}})),
        ]));
        let pipeline = Pipeline::with_transport(transport);
        let mut plan = BTreeMap::new();
        plan.insert(1, vec![planned(1)]);
        plan.insert(2, vec![planned(2)]);

        let sink = Arc::new(CollectingSink::default());
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        let report = run_batch_ordered(
            &pipeline,
            plan,
            Some(&[2, 1]),
            Some("tok"),
            sink.as_ref(),
            &cancel,
            &store,
        )
        .await;

        assert_eq!(report.successful_updates, 2);
        let first_entry = sink
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .find_map(|s| s.current_entry.as_ref().map(|e| e.media_id));
        assert_eq!(first_entry, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_resumes_from_requested_step() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(
            serde_json::json!({"data": {"SaveMediaListEntry": {"id": 1}}}),
        )]));
        let pipeline = Pipeline::with_transport(transport.clone());

        let mut step1 = planned(1);
        step1.sync_metadata = Some(crate::model::SyncMetadata {
            incremental: true,
            target_progress: 5,
            step: Some(1),
            resume_from_step: None,
            retry_count: 0,
            retry_timestamp: None,
        });
        let mut step3 = planned(1);
        step3.sync_metadata = Some(crate::model::SyncMetadata {
            incremental: true,
            target_progress: 5,
            step: Some(3),
            resume_from_step: None,
            retry_count: 0,
            retry_timestamp: None,
        });

        let sink = CollectingSink::default();
        let cancel = Cancellation::new();
        let store = InMemoryStore::new();
        let report = retry_failed(
            &pipeline,
            1,
            vec![step1, step3],
            3,
            Some("tok"),
            &sink,
            &cancel,
            &store,
        )
        .await;

        assert_eq!(report.successful_updates, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
