//! Core sync engine: reconciles a local Kenmei export against a remote
//! AniList collection through a rate-limited, retrying GraphQL pipeline.
//!
//! Host applications (CLI, desktop shell, etc.) own fuzzy-matching the
//! local export against AniList search results and producing the
//! [`model::MatchedPair`] list this crate's [`planner`] consumes; everything
//! downstream of that — planning, mutation minimization, dispatch, retry,
//! classification, and reporting — lives here.

pub mod classify;
pub mod client;
pub mod error;
pub mod executor;
pub mod model;
pub mod mutation;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod stats;
pub mod storage;

pub use error::{PipelineError, PlanError};
pub use executor::{
    retry_failed, run_batch, run_batch_ordered, Cancellation, NoopProgressSink, ProgressSink,
};
pub use model::{
    EntryDisplay, LocalEntry, MatchStatus, MatchedPair, MediaStatus, PlannedEntry,
    ProgressSnapshot, RemoteEntry, SyncConfig, SyncError, SyncMetadata, SyncReport,
};
pub use pipeline::Pipeline;
pub use planner::plan;
