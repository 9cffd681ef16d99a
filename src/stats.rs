//! Running-totals bookkeeping, merged across sync runs and persisted through
//! a [`SyncStore`] (spec §4.F). Never lets a persistence failure fail the
//! sync it's recording.

use serde::{Deserialize, Serialize};

use crate::model::SyncReport;
use crate::storage::SyncStore;

const STATS_KEY: &str = "sync_stats";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTotals {
    pub total_syncs: u64,
    pub entries_synced: u64,
    pub failed_syncs: u64,
    pub last_sync_time: u64,
}

/// `totalSyncs` and `entriesSynced` accumulate; `failedSyncs` reflects only
/// the most recent run, not a running sum (spec §4.F).
pub fn merge(existing: &RunningTotals, report: &SyncReport) -> RunningTotals {
    RunningTotals {
        total_syncs: existing.total_syncs + 1,
        entries_synced: existing.entries_synced + report.successful_updates as u64,
        failed_syncs: report.failed_updates as u64,
        last_sync_time: report.timestamp,
    }
}

/// Loads the current totals, merges in `report`, and persists the result.
/// Logs and swallows any storage error rather than propagating it.
pub async fn record(store: &dyn SyncStore, report: &SyncReport) {
    let existing = match store.get(STATS_KEY).await {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        None => RunningTotals::default(),
    };

    let merged = merge(&existing, report);

    match serde_json::to_string(&merged) {
        Ok(json) => store.set(STATS_KEY, json).await,
        Err(err) => tracing::warn!(error = %err, "failed to serialize running totals; not persisted"),
    }
}

pub fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
