//! From matched pairs + config, emits the ordered per-media step plan
//! (spec §4.C). Pure transformation, no I/O.

use std::collections::{BTreeMap, HashSet};

use crate::error::PlanError;
use crate::model::{
    MatchStatus, MatchedPair, MediaStatus, PlannedEntry, RemoteEntry, StepIndex, SyncConfig,
    SyncMetadata,
};
use crate::mutation;

const SCORE_CHANGE_THRESHOLD: f64 = 0.5;

/// Builds the per-media plan from matched pairs. Rejects the whole batch if
/// the same media id appears twice in `pairs` (spec §9 open question).
pub fn plan(
    pairs: &[MatchedPair],
    config: &SyncConfig,
) -> Result<BTreeMap<u64, Vec<PlannedEntry>>, PlanError> {
    let mut seen = HashSet::with_capacity(pairs.len());
    for pair in pairs {
        if !seen.insert(pair.local.media_id) {
            return Err(PlanError::DuplicateMediaId(pair.local.media_id));
        }
    }

    let mut out = BTreeMap::new();

    for pair in pairs {
        // Selection: only accepted matched/manual pairs proceed at all.
        if !pair.has_accepted_candidate {
            continue;
        }
        if !matches!(pair.match_status, MatchStatus::Matched | MatchStatus::Manual) {
            continue;
        }

        let media_id = pair.local.media_id;
        let steps = plan_one(pair, config);
        out.insert(media_id, steps);
    }

    Ok(out)
}

fn plan_one(pair: &MatchedPair, config: &SyncConfig) -> Vec<PlannedEntry> {
    let local = &pair.local;
    let remote = pair.remote.as_ref();

    // Preserve-completed short-circuit: zero steps, still present for the
    // executor to count as skipped.
    if let Some(r) = remote {
        if r.status == MediaStatus::Completed && config.preserve_completed_status {
            return Vec::new();
        }
    }

    let desired = compose_desired(local, remote, config);

    let changed = match remote {
        None => true,
        Some(r) => is_changed(local, r, &desired, config),
    };
    if !changed {
        return Vec::new();
    }

    let base = PlannedEntry {
        media_id: local.media_id,
        status: desired.status,
        progress: desired.progress,
        score: desired.score,
        private: desired.private,
        previous_values: remote.cloned(),
        sync_metadata: None,
        title: local.title.clone(),
        cover_url: local.cover_url.clone(),
    };

    if !pair.incremental {
        return vec![base];
    }

    let metadata_changed = step3_has_payload(&base);
    let steps = step_sequence(base.is_create(), desired.progress, remote, metadata_changed);

    steps
        .into_iter()
        .map(|step| {
            let mut entry = base.clone();
            entry.sync_metadata = Some(SyncMetadata {
                incremental: true,
                target_progress: desired.progress,
                step: Some(step),
                resume_from_step: None,
                retry_count: 0,
                retry_timestamp: None,
            });
            entry
        })
        .collect()
}

struct Desired {
    status: MediaStatus,
    progress: u32,
    score: f64,
    private: bool,
}

fn compose_desired(
    local: &crate::model::LocalEntry,
    remote: Option<&RemoteEntry>,
    config: &SyncConfig,
) -> Desired {
    let status = match remote {
        Some(r) if config.prioritize_anilist_status => r.status,
        _ => config.effective_status(local),
    };

    let progress = match remote {
        Some(r) if config.prioritize_anilist_progress && r.progress > 0 => {
            r.progress.max(local.progress)
        }
        _ => local.progress,
    };

    let score = match remote {
        Some(r) if config.prioritize_anilist_score && r.score > 0.0 => r.score,
        _ => local.score,
    };

    let private = match remote {
        Some(r) => {
            if config.set_private {
                true
            } else {
                r.private
            }
        }
        None => config.set_private,
    };

    Desired {
        status,
        progress,
        score,
        private,
    }
}

fn is_changed(
    local: &crate::model::LocalEntry,
    remote: &RemoteEntry,
    desired: &Desired,
    config: &SyncConfig,
) -> bool {
    let status_changes = !config.prioritize_anilist_status && desired.status != remote.status;

    let progress_changes = if config.prioritize_anilist_progress {
        desired.progress > remote.progress
    } else {
        desired.progress != remote.progress
    };

    let preserve_completed_guard =
        config.preserve_completed_status && remote.status == MediaStatus::Completed;
    let prioritize_guard = config.prioritize_anilist_score && remote.score > 0.0;
    let score_changes = !preserve_completed_guard
        && !prioritize_guard
        && local.score > 0.0
        && (remote.score == 0.0 || (local.score - remote.score).abs() >= SCORE_CHANGE_THRESHOLD);

    let privacy_changes = config.set_private && !remote.private;

    status_changes || progress_changes || score_changes || privacy_changes
}

fn step3_has_payload(planned: &PlannedEntry) -> bool {
    let vars = mutation::build_variables(planned, Some(3));
    vars.status.is_some() || vars.score.is_some() || vars.private.is_some()
}

/// Step-expansion table (spec §4.C item 5).
fn step_sequence(
    is_create: bool,
    target_progress: u32,
    remote: Option<&RemoteEntry>,
    metadata_changed: bool,
) -> Vec<StepIndex> {
    if is_create {
        return match target_progress {
            0 => vec![3],
            1 => vec![1, 3],
            _ => vec![1, 2, 3],
        };
    }

    let previous_progress = remote.map(|r| r.progress).unwrap_or(0);
    let delta = target_progress as i64 - previous_progress as i64;

    if delta <= 0 {
        if metadata_changed {
            vec![3]
        } else {
            Vec::new()
        }
    } else if delta == 1 {
        if metadata_changed {
            vec![1, 3]
        } else {
            vec![1]
        }
    } else if metadata_changed {
        vec![1, 2, 3]
    } else {
        vec![1, 2]
    }
}

/// Drops steps with index `< resume_from` (spec §4.C item 6). Used by the
/// executor's retry-failed entry point when re-running a partially failed
/// media id.
pub fn apply_resume_filter(steps: Vec<PlannedEntry>, resume_from: StepIndex) -> Vec<PlannedEntry> {
    steps
        .into_iter()
        .filter(|e| {
            e.sync_metadata
                .as_ref()
                .and_then(|m| m.step)
                .map(|step| step >= resume_from)
                .unwrap_or(true)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalEntry;

    fn local(media_id: u64, status: MediaStatus, progress: u32, score: f64) -> LocalEntry {
        LocalEntry {
            media_id,
            status,
            progress,
            score,
            private: false,
            title: "Test".into(),
            cover_url: None,
        }
    }

    fn pair(local: LocalEntry, remote: Option<RemoteEntry>, incremental: bool) -> MatchedPair {
        MatchedPair {
            local,
            remote,
            match_status: MatchStatus::Matched,
            has_accepted_candidate: true,
            incremental,
        }
    }

    #[test]
    fn s1_pure_create() {
        let l = local(1, MediaStatus::Current, 5, 7.0);
        let pairs = vec![pair(l, None, false)];
        let plan = plan(&pairs, &SyncConfig::default()).unwrap();
        let steps = &plan[&1];
        assert_eq!(steps.len(), 1);
        let vars = mutation::build_variables(&steps[0], None);
        assert_eq!(vars.status, Some(MediaStatus::Current));
        assert_eq!(vars.progress, Some(5));
        assert_eq!(vars.score, Some(7.0));
        assert_eq!(vars.private, None);
    }

    #[test]
    fn s2_preserve_completed_short_circuits() {
        let l = local(2, MediaStatus::Current, 120, 10.0);
        let remote = RemoteEntry {
            entry_id: 9,
            status: MediaStatus::Completed,
            progress: 100,
            score: 9.0,
            private: false,
        };
        let mut cfg = SyncConfig::default();
        cfg.preserve_completed_status = true;
        let pairs = vec![pair(l, Some(remote), false)];
        let plan = plan(&pairs, &cfg).unwrap();
        assert_eq!(plan[&2].len(), 0);
    }

    #[test]
    fn s3_incremental_big_jump_with_score_bump() {
        let l = local(3, MediaStatus::Current, 30, 9.0);
        let remote = RemoteEntry {
            entry_id: 9,
            status: MediaStatus::Current,
            progress: 20,
            score: 8.0,
            private: false,
        };
        let pairs = vec![pair(l, Some(remote), true)];
        let plan = plan(&pairs, &SyncConfig::default()).unwrap();
        let steps = &plan[&3];
        assert_eq!(steps.len(), 3);
        let s1 = mutation::build_variables(&steps[0], Some(1));
        assert_eq!(s1.progress, Some(21));
        let s2 = mutation::build_variables(&steps[1], Some(2));
        assert_eq!(s2.progress, Some(30));
        let s3 = mutation::build_variables(&steps[2], Some(3));
        assert_eq!(s3.score, Some(9.0));
        assert_eq!(s3.status, None);
    }

    #[test]
    fn no_change_drops_to_empty() {
        let l = local(4, MediaStatus::Current, 20, 8.0);
        let remote = RemoteEntry {
            entry_id: 9,
            status: MediaStatus::Current,
            progress: 20,
            score: 8.0,
            private: false,
        };
        let pairs = vec![pair(l, Some(remote), false)];
        let plan = plan(&pairs, &SyncConfig::default()).unwrap();
        assert_eq!(plan[&4].len(), 0);
    }

    #[test]
    fn duplicate_media_id_rejected() {
        let l1 = local(5, MediaStatus::Current, 1, 0.0);
        let l2 = local(5, MediaStatus::Current, 2, 0.0);
        let pairs = vec![pair(l1, None, false), pair(l2, None, false)];
        let err = plan(&pairs, &SyncConfig::default()).unwrap_err();
        assert_eq!(err, PlanError::DuplicateMediaId(5));
    }

    #[test]
    fn metadata_only_update_yields_step_three() {
        let l = local(6, MediaStatus::Completed, 20, 8.0);
        let remote = RemoteEntry {
            entry_id: 9,
            status: MediaStatus::Current,
            progress: 20,
            score: 8.0,
            private: false,
        };
        let pairs = vec![pair(l, Some(remote), true)];
        let plan = plan(&pairs, &SyncConfig::default()).unwrap();
        let steps = &plan[&6];
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].sync_metadata.as_ref().unwrap().step, Some(3));
    }

    #[test]
    fn delta_plus_one_metadata_unchanged_yields_step_one_only() {
        let l = local(7, MediaStatus::Current, 21, 8.0);
        let remote = RemoteEntry {
            entry_id: 9,
            status: MediaStatus::Current,
            progress: 20,
            score: 8.0,
            private: false,
        };
        let pairs = vec![pair(l, Some(remote), true)];
        let plan = plan(&pairs, &SyncConfig::default()).unwrap();
        let steps = &plan[&7];
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].sync_metadata.as_ref().unwrap().step, Some(1));
    }

    #[test]
    fn create_target_one_yields_one_and_three() {
        let l = local(8, MediaStatus::Current, 1, 0.0);
        let pairs = vec![pair(l, None, true)];
        let plan = plan(&pairs, &SyncConfig::default()).unwrap();
        let steps = &plan[&8];
        let idxs: Vec<StepIndex> = steps
            .iter()
            .map(|e| e.sync_metadata.as_ref().unwrap().step.unwrap())
            .collect();
        assert_eq!(idxs, vec![1, 3]);
    }

    #[test]
    fn plan_is_deterministic_across_runs() {
        let l = local(9, MediaStatus::Current, 30, 9.0);
        let remote = RemoteEntry {
            entry_id: 9,
            status: MediaStatus::Current,
            progress: 20,
            score: 8.0,
            private: false,
        };
        let pairs = vec![pair(l, Some(remote), true)];
        let cfg = SyncConfig::default();
        let plan_a = plan(&pairs, &cfg).unwrap();
        let plan_b = plan(&pairs, &cfg).unwrap();
        assert_eq!(plan_a[&9].len(), plan_b[&9].len());
        for (a, b) in plan_a[&9].iter().zip(plan_b[&9].iter()) {
            assert_eq!(a.progress, b.progress);
            assert_eq!(
                a.sync_metadata.as_ref().unwrap().step,
                b.sync_metadata.as_ref().unwrap().step
            );
        }
    }
}
