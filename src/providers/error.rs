//! Error type shared by every provider client.
//!
//! The retryable flag is derived from the failure class, not chosen by the
//! caller: credential and request-shape errors are permanent, rate limits,
//! server errors and transport failures are transient.

use thiserror::Error;

/// Provider error code for an over-long synthesis input.
const INPUT_TOO_LONG_CODE: &str = "string_above_max_length";
/// Message fragment providers use for the same condition.
const INPUT_TOO_LONG_MESSAGE: &str = "maximum input limit";

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The provider answered with a non-success HTTP status.
    #[error("{provider} returned HTTP {status}: {message}")]
    Status {
        provider: &'static str,
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// HTTP transport or connection error.
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,

    /// The response body did not have the expected shape.
    #[error("failed to parse provider response: {0}")]
    Parse(String),

    #[error("provider returned an empty response")]
    EmptyResponse,

    /// No API key in `settings.toml` or the environment.
    #[error("no API key configured (set provider.api_key or OPENAI_API_KEY)")]
    MissingApiKey,

    /// Reading the recording or writing the audio file failed.
    #[error("file error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Request(e.to_string())
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Io(e.to_string())
    }
}

impl ApiError {
    /// Build a [`ApiError::Status`] from a failed response body, extracting
    /// `{"error": {"message", "code"}}` when the provider sent one.
    pub fn from_body(provider: &'static str, status: u16, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let error = parsed.as_ref().map(|v| &v["error"]);

        let message = error
            .and_then(|e| e["message"].as_str().or_else(|| e.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("HTTP {status}")
                } else {
                    trimmed.chars().take(300).collect()
                }
            });
        let code = error
            .and_then(|e| e["code"].as_str())
            .map(str::to_string);

        ApiError::Status {
            provider,
            status,
            code,
            message,
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => status_is_retryable(*status),
            ApiError::Request(_)
            | ApiError::Timeout
            | ApiError::Parse(_)
            | ApiError::EmptyResponse => true,
            ApiError::MissingApiKey | ApiError::Io(_) => false,
        }
    }

    /// The provider rejected the input as too long for one request.
    pub fn is_input_too_long(&self) -> bool {
        match self {
            ApiError::Status { code, message, .. } => {
                code.as_deref() == Some(INPUT_TOO_LONG_CODE)
                    || message.to_lowercase().contains(INPUT_TOO_LONG_MESSAGE)
            }
            _ => false,
        }
    }
}

/// 400/401/403/404/422 are caller errors; everything else (408, 409, 429,
/// 5xx, unknown codes) may clear up on its own.
pub fn status_is_retryable(status: u16) -> bool {
    !matches!(status, 400 | 401 | 403 | 404 | 422)
}

/// Turn a non-success response into [`ApiError::Status`].
pub(crate) async fn check_status(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    log::warn!("{provider}: HTTP {} ({} body bytes)", status.as_u16(), body.len());
    Err(ApiError::from_body(provider, status.as_u16(), &body))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [400, 401, 403, 404, 422] {
            assert!(!status_is_retryable(status), "{status}");
        }
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        for status in [408, 409, 429, 500, 502, 503, 504] {
            assert!(status_is_retryable(status), "{status}");
        }
    }

    #[test]
    fn from_body_reads_provider_error_object() {
        let body = r#"{"error": {"message": "Invalid API key", "code": "invalid_api_key"}}"#;
        let err = ApiError::from_body("openai", 401, body);
        match &err {
            ApiError::Status { status, code, message, .. } => {
                assert_eq!(*status, 401);
                assert_eq!(code.as_deref(), Some("invalid_api_key"));
                assert_eq!(message, "Invalid API key");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn from_body_falls_back_to_raw_text() {
        let err = ApiError::from_body("openai", 502, "Bad Gateway");
        assert!(err.to_string().contains("Bad Gateway"));
        assert!(err.is_retryable());
    }

    #[test]
    fn input_too_long_is_detected_by_message_or_code() {
        let by_message = ApiError::from_body(
            "speech",
            400,
            r#"{"error": {"message": "Input exceeds the Maximum Input Limit of 4096"}}"#,
        );
        assert!(by_message.is_input_too_long());

        let by_code = ApiError::from_body(
            "speech",
            400,
            r#"{"error": {"message": "too long", "code": "string_above_max_length"}}"#,
        );
        assert!(by_code.is_input_too_long());

        assert!(!ApiError::Timeout.is_input_too_long());
    }

    #[test]
    fn missing_key_is_permanent() {
        assert!(!ApiError::MissingApiKey.is_retryable());
        assert!(ApiError::Timeout.is_retryable());
    }
}
