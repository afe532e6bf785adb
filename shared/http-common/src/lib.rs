//! Shared HTTP utilities for the item service workspace.
//!
//! Provides the JSON error envelope, pagination checks and timestamp
//! formatting used by the api-server.

use chrono::{DateTime, SecondsFormat, Utc};

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "bad_request" => "Bad request",
        "invalid_id" => "Invalid item id",
        "conflict" => "Resource already exists",
        "timeout" => "Request timed out",
        "unavailable" => "Service unavailable",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

// ============================================================================
// Pagination
// ============================================================================

/// Page size used when the client does not send `limit`.
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Largest accepted `limit`; it also bounds the per-request transform fan-out.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Resolve the requested page size.
///
/// `None` yields the default; values outside `1..=MAX_PAGE_LIMIT` are rejected.
pub fn resolve_limit(requested: Option<usize>) -> Option<usize> {
    match requested {
        None => Some(DEFAULT_PAGE_LIMIT),
        Some(n) if (1..=MAX_PAGE_LIMIT).contains(&n) => Some(n),
        Some(_) => None,
    }
}

// ============================================================================
// Time Utilities
// ============================================================================

/// Format a UTC timestamp as RFC3339 with millisecond precision.
pub fn datetime_to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_json_err() {
        let err = json_err("not_found");
        assert_eq!(err, serde_json::json!({"error": {"code": "not_found", "message": "Resource not found"}}));

        // Unknown code falls back to code as message
        let err = json_err("custom_error");
        assert_eq!(err, serde_json::json!({"error": {"code": "custom_error", "message": "custom_error"}}));
    }

    #[test]
    fn test_json_error_with_message() {
        let err = json_error_with_message("bad_request", "Invalid input");
        assert_eq!(
            err,
            serde_json::json!({"error": {"code": "bad_request", "message": "Invalid input"}})
        );
    }

    #[test]
    fn test_resolve_limit() {
        assert_eq!(resolve_limit(None), Some(DEFAULT_PAGE_LIMIT));
        assert_eq!(resolve_limit(Some(1)), Some(1));
        assert_eq!(resolve_limit(Some(500)), Some(500));
        assert_eq!(resolve_limit(Some(0)), None);
        assert_eq!(resolve_limit(Some(501)), None);
    }

    #[test]
    fn test_datetime_to_rfc3339() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(datetime_to_rfc3339(t), "2024-01-02T03:04:05.000Z");
    }
}
