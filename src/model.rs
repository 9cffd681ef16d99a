//! Shared data types for the sync core: local/remote entries, planned
//! entries, configuration, progress, and reports (spec §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    Current,
    Planning,
    Completed,
    Dropped,
    Paused,
    Repeating,
}

/// A tracked manga row from the user's exported file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntry {
    pub media_id: u64,
    pub status: MediaStatus,
    /// Chapters read. Non-negative.
    pub progress: u32,
    /// 0 means unscored.
    pub score: f64,
    pub private: bool,
    pub title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
}

/// The user's current state on AniList for a given media id, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub entry_id: u64,
    pub status: MediaStatus,
    pub progress: u32,
    pub score: f64,
    pub private: bool,
}

/// Sub-mutation ordinal within one media id's step sequence. Never 0.
pub type StepIndex = u8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub incremental: bool,
    pub target_progress: u32,
    #[serde(default)]
    pub step: Option<StepIndex>,
    #[serde(default)]
    pub resume_from_step: Option<StepIndex>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_timestamp: Option<u64>,
}

/// One media id's desired end state, produced by the planner (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedEntry {
    pub media_id: u64,
    pub status: MediaStatus,
    pub progress: u32,
    pub score: f64,
    pub private: bool,
    /// Presence is the canonical "is update, not create" flag.
    #[serde(default)]
    pub previous_values: Option<RemoteEntry>,
    #[serde(default)]
    pub sync_metadata: Option<SyncMetadata>,
    pub title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
}

impl PlannedEntry {
    pub fn is_create(&self) -> bool {
        self.previous_values.is_none()
    }
}

/// The five tunable bits the planner consults, plus an opaque auto-pause
/// policy (spec §3: "exposed as a pure function `effectiveStatus`").
#[derive(Clone)]
pub struct SyncConfig {
    pub preserve_completed_status: bool,
    pub prioritize_anilist_status: bool,
    pub prioritize_anilist_progress: bool,
    pub prioritize_anilist_score: bool,
    pub set_private: bool,
    pub auto_pause: std::sync::Arc<dyn AutoPauseRule>,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("preserve_completed_status", &self.preserve_completed_status)
            .field("prioritize_anilist_status", &self.prioritize_anilist_status)
            .field(
                "prioritize_anilist_progress",
                &self.prioritize_anilist_progress,
            )
            .field("prioritize_anilist_score", &self.prioritize_anilist_score)
            .field("set_private", &self.set_private)
            .finish_non_exhaustive()
    }
}

/// The host's policy for turning a local entry's raw status into the status
/// the sync would apply absent remote precedence (spec §3/§9: kept opaque,
/// modeled as a pluggable rule rather than hardcoded "auto-pause" logic).
pub trait AutoPauseRule: Send + Sync {
    fn effective_status(&self, local: &LocalEntry) -> MediaStatus;
}

/// Default rule: no auto-pause behavior, the local status passes through
/// unchanged. Hosts that want e.g. "pause entries with no recent activity"
/// provide their own `AutoPauseRule`.
#[derive(Debug, Default)]
pub struct IdentityAutoPause;

impl AutoPauseRule for IdentityAutoPause {
    fn effective_status(&self, local: &LocalEntry) -> MediaStatus {
        local.status
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            preserve_completed_status: false,
            prioritize_anilist_status: false,
            prioritize_anilist_progress: false,
            prioritize_anilist_score: false,
            set_private: false,
            auto_pause: std::sync::Arc::new(IdentityAutoPause),
        }
    }
}

impl SyncConfig {
    pub fn effective_status(&self, local: &LocalEntry) -> MediaStatus {
        self.auto_pause.effective_status(local)
    }
}

/// Snapshot published to the host's progress sink at least once per state
/// transition, and at least once per second during rate-limit countdowns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default)]
    pub current_entry: Option<EntryDisplay>,
    #[serde(default)]
    pub current_step: Option<StepIndex>,
    #[serde(default)]
    pub total_steps: Option<u8>,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDisplay {
    pub media_id: u64,
    pub title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub media_id: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub total_entries: usize,
    pub successful_updates: usize,
    pub failed_updates: usize,
    pub skipped_entries: usize,
    pub errors: Vec<SyncError>,
    pub timestamp: u64,
}

/// Status of a matched pair as supplied by the external fuzzy-matching
/// collaborator (spec §6). Only `Matched`/`Manual` with an accepted
/// candidate are synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Matched,
    Manual,
    Pending,
    Skipped,
}

/// One (local entry, optional remote snapshot) pair handed to the planner,
/// carrying the match provider's verdict.
#[derive(Debug, Clone)]
pub struct MatchedPair {
    pub local: LocalEntry,
    pub remote: Option<RemoteEntry>,
    pub match_status: MatchStatus,
    /// Whether the fuzzy-matching engine produced an accepted AniList
    /// candidate for this pair at all.
    pub has_accepted_candidate: bool,
    /// Whether this entry should be synced incrementally (1-3 step
    /// expansion) rather than as a single mutation.
    pub incremental: bool,
}
