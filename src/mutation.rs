//! Converts a planned entry (+ optional step) into a minimal GraphQL
//! variable set and the corresponding mutation text (spec §4.B).
//!
//! Pure, no I/O. `build_variables` decides *which* fields to write;
//! `build_mutation` renders *only* the declarations for the fields present.

use crate::model::{MediaStatus, PlannedEntry, StepIndex};

const SCORE_EPSILON: f64 = 1e-9;

/// The minimized set of fields a single `SaveMediaListEntry` call should
/// write. `media_id` is always present; everything else is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSet {
    pub media_id: u64,
    pub status: Option<MediaStatus>,
    pub progress: Option<u32>,
    pub private: Option<bool>,
    pub score: Option<f64>,
}

fn status_text(status: MediaStatus) -> &'static str {
    match status {
        MediaStatus::Current => "CURRENT",
        MediaStatus::Planning => "PLANNING",
        MediaStatus::Completed => "COMPLETED",
        MediaStatus::Dropped => "DROPPED",
        MediaStatus::Paused => "PAUSED",
        MediaStatus::Repeating => "REPEATING",
    }
}

fn scores_differ(a: f64, b: f64) -> bool {
    (a - b).abs() >= SCORE_EPSILON
}

/// Builds the minimized variable set for one step of a planned entry.
/// `step = None` means "non-incremental": one mutation carrying every
/// field the minimization rules select.
pub fn build_variables(planned: &PlannedEntry, step: Option<StepIndex>) -> VariableSet {
    match step {
        Some(1) => build_step1(planned),
        Some(2) => VariableSet {
            media_id: planned.media_id,
            progress: Some(planned.progress),
            ..Default::default()
        },
        Some(3) => build_step3(planned),
        Some(other) => {
            // Defensive: unknown step numbers fall back to the non-incremental
            // minimization, since this layer must never silently drop a write.
            tracing::warn!(step = other, "unrecognized step index; using full minimization");
            build_minimized(planned)
        }
        None => build_minimized(planned),
    }
}

fn build_step1(planned: &PlannedEntry) -> VariableSet {
    let progress = match &planned.previous_values {
        Some(prev) => prev.progress + 1,
        None => 1,
    };
    VariableSet {
        media_id: planned.media_id,
        progress: Some(progress),
        ..Default::default()
    }
}

fn build_step3(planned: &PlannedEntry) -> VariableSet {
    let mut vars = VariableSet {
        media_id: planned.media_id,
        ..Default::default()
    };

    let status_changed = match &planned.previous_values {
        None => true,
        Some(prev) => prev.status != planned.status,
    };
    if status_changed {
        vars.status = Some(planned.status);
    }

    let score_changed = planned.score != 0.0
        && match &planned.previous_values {
            None => true,
            Some(prev) => scores_differ(prev.score, planned.score),
        };
    if score_changed {
        vars.score = Some(planned.score);
    }

    if planned.private {
        vars.private = Some(true);
    }

    vars
}

fn build_minimized(planned: &PlannedEntry) -> VariableSet {
    match &planned.previous_values {
        None => build_create(planned),
        Some(prev) => {
            let mut vars = VariableSet {
                media_id: planned.media_id,
                ..Default::default()
            };
            if prev.status != planned.status {
                vars.status = Some(planned.status);
            }
            if prev.progress != planned.progress {
                vars.progress = Some(planned.progress);
            }
            if scores_differ(prev.score, planned.score) {
                vars.score = Some(planned.score);
            }
            if prev.private != planned.private {
                vars.private = Some(planned.private);
            }
            vars
        }
    }
}

fn build_create(planned: &PlannedEntry) -> VariableSet {
    VariableSet {
        media_id: planned.media_id,
        status: Some(planned.status),
        progress: if planned.progress > 0 {
            Some(planned.progress)
        } else {
            None
        },
        score: if planned.score > 0.0 {
            Some(planned.score)
        } else {
            None
        },
        private: if planned.private { Some(true) } else { None },
    }
}

/// Renders the GraphQL mutation text for a variable set. Declares only the
/// variables actually present, `mediaId` always required.
pub fn build_mutation(vars: &VariableSet) -> String {
    let mut decls = vec!["$mediaId: Int".to_string()];
    let mut args = vec!["mediaId: $mediaId".to_string()];

    if vars.status.is_some() {
        decls.push("$status: MediaListStatus".to_string());
        args.push("status: $status".to_string());
    }
    if vars.progress.is_some() {
        decls.push("$progress: Int".to_string());
        args.push("progress: $progress".to_string());
    }
    if vars.score.is_some() {
        decls.push("$score: Float".to_string());
        args.push("score: $score".to_string());
    }
    if vars.private.is_some() {
        decls.push("$private: Boolean".to_string());
        args.push("private: $private".to_string());
    }

    format!(
        "mutation ({decls}) {{\n  SaveMediaListEntry({args}) {{\n    id\n  }}\n}}",
        decls = decls.join(", "),
        args = args.join(", "),
    )
}

/// Serializes a [`VariableSet`] to the JSON object the wire client sends
/// alongside the mutation text.
pub fn variables_to_json(vars: &VariableSet) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("mediaId".to_string(), serde_json::json!(vars.media_id));
    if let Some(status) = vars.status {
        map.insert(
            "status".to_string(),
            serde_json::json!(status_text(status)),
        );
    }
    if let Some(progress) = vars.progress {
        map.insert("progress".to_string(), serde_json::json!(progress));
    }
    if let Some(score) = vars.score {
        map.insert("score".to_string(), serde_json::json!(score));
    }
    if let Some(private) = vars.private {
        map.insert("private".to_string(), serde_json::json!(private));
    }
    serde_json::Value::Object(map)
}
