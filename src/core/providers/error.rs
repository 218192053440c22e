use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Normalized provider failure, independent of the wire format that produced
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("context too large: {0}")]
    ContextTooLarge(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether a later attempt of the same request might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Unavailable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP status and its body.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        let summary = summarize_error_body(body, status);
        match status.as_u16() {
            401 | 403 => ProviderError::Auth(summary),
            429 => ProviderError::RateLimited {
                retry_after,
                message: summary,
            },
            413 => ProviderError::ContextTooLarge(summary),
            400 | 422 if mentions_context_overflow(body) => ProviderError::ContextTooLarge(summary),
            408 | 529 => ProviderError::Unavailable(summary),
            code if (500..600).contains(&code) => ProviderError::Unavailable(summary),
            _ => ProviderError::Malformed(summary),
        }
    }

    /// Classify an error object delivered inside an otherwise successful
    /// response, such as an SSE `error` event.
    pub fn from_payload(value: &Value) -> Self {
        let error = value.get("error").unwrap_or(value);
        let kind = ["type", "code", "status"]
            .iter()
            .find_map(|key| error.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_ascii_lowercase();
        let message = extract_error_summary(value).unwrap_or_else(|| compact(&value.to_string()));

        match kind.as_str() {
            "authentication_error" | "permission_error" | "invalid_api_key"
            | "unauthenticated" | "permission_denied" => ProviderError::Auth(message),
            "rate_limit_error" | "rate_limit_exceeded" | "resource_exhausted" => {
                ProviderError::RateLimited {
                    retry_after: None,
                    message,
                }
            }
            _ if mentions_context_overflow(&message) => ProviderError::ContextTooLarge(message),
            "invalid_request_error" | "invalid_argument" | "not_found_error" => {
                ProviderError::Malformed(message)
            }
            _ => ProviderError::Unavailable(message),
        }
    }

    /// Map a transport-level failure. Anything that never produced a usable
    /// response is treated as an outage.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if err.is_timeout() {
            ProviderError::Unavailable(format!("request timed out: {err}"))
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        ProviderError::Unavailable(format!("no response within {}s", after.as_secs_f32()))
    }
}

/// Delay requested through `Retry-After` (seconds or HTTP date) or the
/// non-standard `retry-after-ms`.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
    {
        return Duration::try_from_secs_f64(ms / 1000.0).ok();
    }

    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok().or(Some(Duration::ZERO))
}

/// Whether the status and body describe a provider refusing a streaming
/// request rather than failing it outright.
pub fn rejects_streaming(status: StatusCode, body: &str) -> bool {
    if !matches!(status.as_u16(), 400 | 404 | 405 | 415 | 422 | 501) {
        return false;
    }
    let lower = body.to_ascii_lowercase();
    if !lower.contains("stream") {
        return false;
    }
    [
        "not supported",
        "unsupported",
        "does not support",
        "not allowed",
        "unknown",
        "unrecognized",
        "invalid",
    ]
    .iter()
    .any(|signal| lower.contains(signal))
}

pub(crate) fn mentions_context_overflow(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    [
        "context length",
        "context_length_exceeded",
        "context window",
        "maximum context",
        "too many tokens",
        "prompt is too long",
        "input is too long",
        "token limit",
    ]
    .iter()
    .any(|phrase| lower.contains(phrase))
}

pub(crate) fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|error| match error {
                Value::String(text) => Some(text.clone()),
                _ => None,
            })
        })
        .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_owned))
        // Gemini wraps errors in a one-element array.
        .or_else(|| value.get(0).and_then(extract_error_summary));

    summary
        .map(|text| compact(&text))
        .filter(|text| !text.is_empty())
}

fn summarize_error_body(body: &str, status: StatusCode) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }

    let summary = serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|value| extract_error_summary(&value))
        .unwrap_or_else(|| compact(trimmed));
    format!("HTTP {}: {summary}", status.as_u16())
}

fn compact(text: &str) -> String {
    const LIMIT: usize = 300;
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= LIMIT {
        return collapsed;
    }
    let mut shortened: String = collapsed.chars().take(LIMIT).collect();
    shortened.push('…');
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, RETRY_AFTER};

    #[test]
    fn statuses_map_to_failure_kinds() {
        let cases = [
            (401, "ProviderError::Auth"),
            (403, "ProviderError::Auth"),
            (413, "ProviderError::ContextTooLarge"),
            (500, "ProviderError::Unavailable"),
            (503, "ProviderError::Unavailable"),
            (529, "ProviderError::Unavailable"),
            (404, "ProviderError::Malformed"),
        ];
        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).expect("status");
            let error = ProviderError::from_status(status, None, "{}");
            let kind = match error {
                ProviderError::Auth(_) => "ProviderError::Auth",
                ProviderError::RateLimited { .. } => "ProviderError::RateLimited",
                ProviderError::ContextTooLarge(_) => "ProviderError::ContextTooLarge",
                ProviderError::Unavailable(_) => "ProviderError::Unavailable",
                ProviderError::Malformed(_) => "ProviderError::Malformed",
            };
            assert_eq!(kind, expected, "status {code}");
        }
    }

    #[test]
    fn rate_limit_keeps_retry_hint_and_summary() {
        let body = r#"{"error":{"message":"Too many   requests","type":"rate_limit_error"}}"#;
        let error = ProviderError::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            body,
        );
        assert_eq!(
            error,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
                message: "HTTP 429: Too many requests".into(),
            }
        );
    }

    #[test]
    fn bad_request_about_context_is_context_too_large() {
        let body = r#"{"error":{"message":"This model's maximum context length is 4096 tokens","code":"context_length_exceeded"}}"#;
        let error = ProviderError::from_status(StatusCode::BAD_REQUEST, None, body);
        assert!(matches!(error, ProviderError::ContextTooLarge(_)));

        let other = ProviderError::from_status(StatusCode::BAD_REQUEST, None, "bad field");
        assert_eq!(other, ProviderError::Malformed("HTTP 400: bad field".into()));
    }

    #[test]
    fn payload_errors_follow_their_type() {
        let overloaded: Value = serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        });
        assert_eq!(
            ProviderError::from_payload(&overloaded),
            ProviderError::Unavailable("Overloaded".into())
        );

        let auth: Value = serde_json::json!({
            "error": {"code": 401, "status": "UNAUTHENTICATED", "message": "bad key"}
        });
        assert_eq!(
            ProviderError::from_payload(&auth),
            ProviderError::Auth("bad key".into())
        );

        let invalid: Value = serde_json::json!({
            "error": {"type": "invalid_request_error", "message": "bad role"}
        });
        assert_eq!(
            ProviderError::from_payload(&invalid),
            ProviderError::Malformed("bad role".into())
        );
    }

    #[test]
    fn retry_after_reads_seconds_and_milliseconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn out_of_range_retry_hints_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e30"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("-5"));
        assert_eq!(parse_retry_after(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1e300"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert("retry-after-ms", HeaderValue::from_static("NaN"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn retry_after_in_the_past_means_now() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn streaming_rejection_needs_status_and_wording() {
        let body = r#"{"error":{"message":"Streaming is not supported for this model"}}"#;
        assert!(rejects_streaming(StatusCode::BAD_REQUEST, body));
        assert!(!rejects_streaming(StatusCode::INTERNAL_SERVER_ERROR, body));
        assert!(!rejects_streaming(StatusCode::BAD_REQUEST, "invalid temperature"));
    }

    #[test]
    fn summaries_are_collapsed_and_bounded() {
        let long = "x ".repeat(400);
        let error = ProviderError::from_status(StatusCode::BAD_GATEWAY, None, &long);
        let ProviderError::Unavailable(message) = error else {
            panic!("expected unavailable");
        };
        assert!(message.starts_with("HTTP 502: x x"));
        assert!(message.ends_with('…'));

        let empty = ProviderError::from_status(StatusCode::BAD_GATEWAY, None, "  ");
        assert_eq!(
            empty,
            ProviderError::Unavailable("HTTP 502 Bad Gateway".into())
        );
    }
}
