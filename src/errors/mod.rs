// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing error handling for the HTTP API.
//!
//! Responses carry:
//! - A short actionable message
//! - A unique reference code that also appears in the server log
//!
//! Internal details (paths, upstream addresses, URLs) are logged after
//! sanitization and never returned to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::download::DownloadError;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Job or file not found (404)
    NotFound {
        message: String,
        reference: String,
    },

    /// Internal server error (500)
    InternalError {
        message: String,
        reference: String,
    },

    /// Upstream index or mirror failed (502)
    BadGateway {
        message: String,
        reference: String,
    },

    /// Upstream did not answer in time (504)
    GatewayTimeout {
        message: String,
        reference: String,
    },
}

impl UserError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::NotFound { .. } => StatusCode::NOT_FOUND,
            UserError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UserError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            UserError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            UserError::InvalidRequest { reference, .. }
            | UserError::NotFound { reference, .. }
            | UserError::InternalError { reference, .. }
            | UserError::BadGateway { reference, .. }
            | UserError::GatewayTimeout { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UserError::InvalidRequest { message, .. }
            | UserError::NotFound { message, .. }
            | UserError::InternalError { message, .. }
            | UserError::BadGateway { message, .. }
            | UserError::GatewayTimeout { message, .. } => message,
        }
    }
}

/// JSON error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

// =============================================================================
// ERROR CONSTRUCTORS (WITH LOGGING)
// =============================================================================

impl UserError {
    pub fn invalid_request(user_message: &str, field: Option<&str>, internal_details: Option<&str>) -> Self {
        let reference = generate_reference_code();

        if let Some(details) = internal_details {
            let sanitized = sanitize_error_details(details);
            tracing::warn!(
                reference = %reference,
                internal_details = %sanitized,
                field = ?field,
                "Invalid request"
            );
        }

        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    /// Missing or empty required field.
    pub fn missing_field(field: &str) -> Self {
        Self::invalid_request(&format!("Missing required field: {}", field), Some(field), None)
    }

    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();

        tracing::info!(
            reference = %reference,
            resource = %resource,
            "Resource not found"
        );

        Self::NotFound {
            message: format!("The requested {} was not found.", resource),
            reference,
        }
    }

    /// Create an InternalError, logging full details internally.
    /// The details are never part of the response.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);

        tracing::error!(
            reference = %reference,
            internal_error = %sanitized,
            "Internal server error"
        );

        Self::InternalError {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }

    pub fn bad_gateway(internal_details: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_details);

        tracing::error!(
            reference = %reference,
            internal_details = %sanitized,
            "Bad gateway"
        );

        Self::BadGateway {
            message: "The book index could not be reached. Please try again later.".to_string(),
            reference,
        }
    }

    pub fn gateway_timeout(internal_details: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_details);

        tracing::error!(
            reference = %reference,
            internal_details = %sanitized,
            "Gateway timeout"
        );

        Self::GatewayTimeout {
            message: "The book index did not respond in time. Please try again.".to_string(),
            reference,
        }
    }
}

// =============================================================================
// ERROR SANITIZATION
// =============================================================================

/// Patterns for redacting local and network details from log lines.
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // File paths (Windows and Unix)
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root|Users)/[^\s]+").expect("Unix path regex"), "[PATH_REDACTED]"),

        // Query strings can carry session tokens from mirrors
        (Regex::new(r"\?[^\s]*(?:key|token)=[^\s]+").expect("Query token regex"), "?[QUERY_REDACTED]"),

        // IP addresses
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("IPv4 regex"), "[IP_REDACTED]"),
        (Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b").expect("IPv6 full regex"), "[IP_REDACTED]"),

        // Stack traces
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").expect("Rust location regex"), "[LOCATION_REDACTED]"),
        (Regex::new(r"thread '[^']+' panicked at").expect("Panic regex"), "[PANIC_REDACTED]"),
        (Regex::new(r"stack backtrace:[\s\S]*").expect("Stack trace regex"), "[STACK_TRACE_REDACTED]"),
    ]
});

/// Sanitize error details before they reach the log.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();

    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }

    result
}

// =============================================================================
// ERROR MAPPING FROM INTERNAL ERRORS
// =============================================================================

impl From<DownloadError> for UserError {
    fn from(error: DownloadError) -> Self {
        match &error {
            DownloadError::Validation(reason) => {
                UserError::invalid_request(reason, None, Some(&error.to_string()))
            }
            DownloadError::NotFound(_) | DownloadError::Resolution(_) => {
                tracing::debug!("{}", sanitize_error_details(&error.to_string()));
                UserError::not_found("resource")
            }
            DownloadError::Transfer(_) | DownloadError::Storage(_) | DownloadError::DuplicateJob(_) => {
                UserError::internal_error(&error.to_string())
            }
        }
    }
}

/// Map an upstream (search or mirror) failure.
pub fn map_upstream_error(error: &anyhow::Error) -> UserError {
    let details = format!("{:#}", error);
    let timed_out = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(|e| e.is_timeout());

    if timed_out || details.to_lowercase().contains("timed out") {
        UserError::gateway_timeout(&details)
    } else {
        UserError::bad_gateway(&details)
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================

/// Result type that uses UserError for the error variant.
pub type ApiResult<T> = Result<T, UserError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_reference_code() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19); // ERR-YYYYMMDD-XXXXXX = 4+8+1+6

        let code2 = generate_reference_code();
        assert_ne!(code, code2);
    }

    #[test]
    fn test_download_error_status_codes() {
        let cases = [
            (DownloadError::Validation("title is required".into()), StatusCode::BAD_REQUEST),
            (DownloadError::NotFound("file x".into()), StatusCode::NOT_FOUND),
            (DownloadError::Resolution("link not found".into()), StatusCode::NOT_FOUND),
            (DownloadError::Transfer("HTTP 503".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (DownloadError::Storage("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (DownloadError::DuplicateJob("abc".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(UserError::from(error).status_code(), status);
        }
    }

    #[test]
    fn test_validation_message_is_passed_through() {
        let err = UserError::from(DownloadError::Validation("title is required".into()));
        assert_eq!(err.message(), "title is required");
    }

    #[test]
    fn test_storage_error_hides_details() {
        let err = UserError::from(DownloadError::Storage(
            "rename /home/reader/books/temp_abc.part failed".into(),
        ));
        assert!(!err.message().contains("/home"));
        assert!(err.message().contains(err.reference()));
    }

    #[test]
    fn test_upstream_error_mapping() {
        let err = map_upstream_error(&anyhow::anyhow!("connection refused"));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err = map_upstream_error(&anyhow::anyhow!("operation timed out"));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_sanitize_file_paths() {
        let sanitized = sanitize_error_details("Error at /home/user/books/My_Book.epub");
        assert!(!sanitized.contains("home"));
        assert!(sanitized.contains("[PATH_REDACTED]"));

        let sanitized = sanitize_error_details(r"Error at C:\Users\reader\books\a.pdf");
        assert!(!sanitized.contains("reader"));
    }

    #[test]
    fn test_sanitize_ip_and_tokens() {
        let sanitized = sanitize_error_details("GET http://10.0.0.7/get.php?md5=abc&key=SECRET failed");
        assert!(!sanitized.contains("10.0.0.7"));
        assert!(!sanitized.contains("SECRET"));
    }

    #[test]
    fn test_user_error_serialization() {
        let error = UserError::missing_field("md5");
        let json = serde_json::to_string(&error).unwrap();

        assert!(json.contains("invalid_request"));
        assert!(json.contains("md5"));
        assert!(json.contains("reference"));
    }
}
