//! Parses a pipeline response into a success/failure classification
//! (spec §4.E). Response unwrapping tries both `data.X` and the
//! double-wrapped `data.data.X` transport shape before declaring
//! `MalformedResponse`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedOutcome {
    /// `SaveMediaListEntry.id` or `DeleteMediaListEntry.deleted = true`.
    Success { entry_id: Option<u64>, deleted: bool },
    /// GraphQL errors matching the rate-limit pattern.
    GraphqlRateLimited { retry_after_ms: u64 },
    /// Other GraphQL errors, not retryable at this layer.
    GraphqlDomain(String),
    /// Expected fields missing under both unwrap shapes.
    Malformed(String),
}

/// A normalized view of a thrown/transport-level error, built by the caller
/// from whatever their HTTP client raised. Carries the structural and
/// string cues the 500-class detector inspects (spec §9: "deliberately
/// over-inclusive").
#[derive(Debug, Clone)]
pub struct ThrownError {
    pub message: String,
    pub status: Option<u16>,
    pub serialized: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThrownOutcome {
    /// Detected 500-class; executor should treat as a 3000ms soft-retry hint.
    SoftRetry { hint_ms: u64 },
    /// Anything else: non-retryable, original message preserved.
    NonRetryable(String),
}

const SOFT_RETRY_HINT_MS: u64 = 3000;

pub fn classify_thrown(err: &ThrownError) -> ThrownOutcome {
    let looks_like_500 = err.status == Some(500)
        || err.message.contains("500")
        || err.message.contains("Internal Server Error")
        || err.serialized.contains("\"status\":500");

    if looks_like_500 {
        ThrownOutcome::SoftRetry {
            hint_ms: SOFT_RETRY_HINT_MS,
        }
    } else {
        ThrownOutcome::NonRetryable(err.message.clone())
    }
}

/// Classifies a well-formed `{data?, errors?}` envelope for a save/delete
/// mutation response.
pub fn classify_response(envelope: &Value) -> ClassifiedOutcome {
    if let Some(errors) = envelope.get("errors").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            if let Some(retry_after_ms) = rate_limit_retry_after(errors) {
                return ClassifiedOutcome::GraphqlRateLimited { retry_after_ms };
            }
            let joined = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return ClassifiedOutcome::GraphqlDomain(joined);
        }
    }

    if let Some(id) = unwrap_field_u64(envelope, "SaveMediaListEntry", "id") {
        return ClassifiedOutcome::Success {
            entry_id: Some(id),
            deleted: false,
        };
    }

    if let Some(true) = unwrap_field_bool(envelope, "DeleteMediaListEntry", "deleted") {
        return ClassifiedOutcome::Success {
            entry_id: None,
            deleted: true,
        };
    }

    ClassifiedOutcome::Malformed("Update failed: No entry ID returned in response".to_string())
}

fn unwrap_data<'a>(envelope: &'a Value, type_name: &str) -> Option<&'a Value> {
    envelope
        .get("data")
        .and_then(|d| d.get(type_name))
        .or_else(|| {
            envelope
                .get("data")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.get(type_name))
        })
}

fn unwrap_field_u64(envelope: &Value, type_name: &str, field: &str) -> Option<u64> {
    unwrap_data(envelope, type_name)?.get(field)?.as_u64()
}

fn unwrap_field_bool(envelope: &Value, type_name: &str, field: &str) -> Option<bool> {
    unwrap_data(envelope, type_name)?.get(field)?.as_bool()
}

const RATE_LIMIT_DEFAULT_MS: u64 = 60_000;

fn rate_limit_retry_after(errors: &[Value]) -> Option<u64> {
    let matches_rate_limit = errors.iter().any(|e| {
        e.get("message")
            .and_then(|m| m.as_str())
            .map(|m| {
                let lower = m.to_ascii_lowercase();
                lower.contains("rate limit") || lower.contains("too many requests")
            })
            .unwrap_or(false)
    });

    if !matches_rate_limit {
        return None;
    }

    for e in errors {
        if let Some(secs) = e
            .get("extensions")
            .and_then(|ext| ext.get("retryAfter"))
            .and_then(|v| v.as_u64())
        {
            return Some(secs * 1000);
        }
    }

    for e in errors {
        if let Some(msg) = e.get("message").and_then(|m| m.as_str()) {
            if let Some(secs) = parse_seconds_from_message(msg) {
                return Some(secs * 1000);
            }
        }
    }

    Some(RATE_LIMIT_DEFAULT_MS)
}

/// Parses `/(\d+)\s*(second|sec|s)/i` out of a free-form message.
fn parse_seconds_from_message(msg: &str) -> Option<u64> {
    let bytes = msg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let digits = &msg[start..i];
            let mut rest = &msg[i..];
            while rest.starts_with(' ') {
                rest = &rest[1..];
            }
            let lower = rest.to_ascii_lowercase();
            if lower.starts_with("second") || lower.starts_with("sec") || lower.starts_with('s') {
                if let Ok(v) = digits.parse::<u64>() {
                    return Some(v);
                }
            }
        } else {
            i += 1;
        }
    }
    None
}
