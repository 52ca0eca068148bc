//! Classification rulebook for probe responses.
//!
//! Maps the final response (status code, body snippet, response time) onto
//! the `{status, detailed}` pair. Sentinel codes: 0 = connection error,
//! -1 = timeout.

use crate::core::types::{
    BodyValidator, DetailedStatus, TargetStatus, STATUS_CODE_CONNECTION_ERROR, STATUS_CODE_TIMEOUT,
};

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: TargetStatus,
    pub detailed: DetailedStatus,
    pub error: Option<String>,
}

impl Classification {
    fn online(detailed: DetailedStatus) -> Self {
        Self {
            status: TargetStatus::Online,
            detailed,
            error: None,
        }
    }

    fn offline(detailed: DetailedStatus, error: String) -> Self {
        Self {
            status: TargetStatus::Offline,
            detailed,
            error: Some(error),
        }
    }
}

/// Rulebook over the numeric status code alone.
pub fn classify_status_code(code: i32) -> Classification {
    match code {
        STATUS_CODE_TIMEOUT => Classification::offline(DetailedStatus::Down, "Timed out".into()),
        STATUS_CODE_CONNECTION_ERROR => {
            Classification::offline(DetailedStatus::Down, "Connection error".into())
        }
        200..=299 => Classification::online(DetailedStatus::Up),
        300..=399 => Classification::online(DetailedStatus::Redirect),
        401 | 403 => Classification::online(DetailedStatus::Up),
        400..=599 => Classification::offline(
            DetailedStatus::Down,
            format!("HTTP status {code}"),
        ),
        other => Classification::offline(
            DetailedStatus::Down,
            format!("Unexpected status {other}"),
        ),
    }
}

/// Full classification of an HTTP response.
///
/// An explicit expected-status set overrides the rulebook ranges. The body
/// validator and the response-time ceiling only demote responses that were
/// otherwise online; a demotion keeps the endpoint "reachable" in the
/// detailed status.
pub fn classify_response(
    code: i32,
    expected_status_codes: &[u16],
    validator: Option<&BodyValidator>,
    body_snippet: Option<&str>,
    response_time_ms: u32,
    response_time_limit_ms: Option<u32>,
) -> Classification {
    let mut classification = if !expected_status_codes.is_empty() && code > 0 {
        if expected_status_codes.iter().any(|&c| i32::from(c) == code) {
            Classification::online(DetailedStatus::Up)
        } else {
            Classification::offline(
                DetailedStatus::Down,
                format!(
                    "Status code {code} not in expected set [{}]",
                    expected_status_codes
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
        }
    } else {
        classify_status_code(code)
    };

    if classification.status != TargetStatus::Online {
        return classification;
    }

    if let Some(validator) = validator.filter(|v| v.is_configured()) {
        if let Err(reason) = validate_body(validator, body_snippet) {
            return Classification::offline(
                DetailedStatus::ReachableWithError,
                format!("Response validation failed: {reason}"),
            );
        }
    }

    if let Some(limit) = response_time_limit_ms {
        if response_time_ms > limit {
            classification = Classification::offline(
                DetailedStatus::ReachableWithError,
                format!("Response time {response_time_ms}ms exceeded limit {limit}ms"),
            );
        }
    }

    classification
}

/// Body validation against the (possibly truncated) snippet. The validator
/// only ever sees the first snippet-cap bytes of the body.
fn validate_body(validator: &BodyValidator, body_snippet: Option<&str>) -> Result<(), String> {
    let body = body_snippet.unwrap_or("");

    if !validator.contains_text.is_empty() {
        let haystack = body.to_lowercase();
        for needle in &validator.contains_text {
            if !haystack.contains(&needle.to_lowercase()) {
                return Err(format!("missing text {needle:?}"));
            }
        }
    }

    if validator.json_path.is_some() {
        // TODO: evaluate json_path against the parsed document once the
        // expected-value semantics are settled; for now only require that
        // the body parses as JSON.
        if serde_json::from_str::<serde_json::Value>(body).is_err() {
            return Err("body is not valid JSON".to_string());
        }
    }

    Ok(())
}
