// =============================================================================
// Error taxonomy — the kinds of failure the core distinguishes
// =============================================================================
//
// Propagation policy:
//   - Transient network errors are absorbed at the component owning the call
//     (retry/backoff + circuit breaker); they never cross the event bus.
//   - Rate-limit and hard-quota conditions publish on dedicated bus tags.
//   - Parse failures fall through to the API fallback path.
//   - Business-logic rejections stay inside the opportunity core and show up
//     in the status report, not as errors.
//   - Fatal errors surface at startup only.
// =============================================================================

use thiserror::Error;

use crate::types::ModelKind;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Timeout, 5xx, connection reset. Retried with backoff and counted
    /// against the owning circuit breaker.
    #[error("transient network error: {0}")]
    Transient(String),

    /// 429 or a provider-specific throttle response.
    #[error("provider {provider} rate limited (reset in {reset_secs}s)")]
    RateLimited { provider: String, reset_secs: u64 },

    /// Daily hard quota reached. The provider is excluded for the UTC day.
    #[error("provider {0} hard quota exhausted for the UTC day")]
    QuotaExhausted(String),

    /// Decoder non-zero exit or malformed output.
    #[error("parse failure for {model}: {detail}")]
    Parse { model: ModelKind, detail: String },

    /// External call exceeded its deadline.
    #[error("{operation} timed out after {ms}ms")]
    Timeout { operation: &'static str, ms: u64 },

    /// Circuit breaker is open; the call was not attempted.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Startup-only: configuration inconsistency or venue auth failure.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error should be counted against a circuit breaker.
    pub fn is_breaker_relevant(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout { .. } | Self::Http(_) | Self::Io(_)
        )
    }

    /// Map a reqwest error into the taxonomy, preserving 429s.
    pub fn from_response_status(provider: &str, status: reqwest::StatusCode) -> Self {
        if status.as_u16() == 429 {
            Self::RateLimited {
                provider: provider.to_string(),
                reset_secs: 60,
            }
        } else if status.is_server_error() {
            Self::Transient(format!("{provider} returned {status}"))
        } else {
            Self::Transient(format!("{provider} unexpected status {status}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_preserves_rate_limits() {
        let err = EngineError::from_response_status(
            "meteosource",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
        );
        assert!(matches!(err, EngineError::RateLimited { .. }));

        let err =
            EngineError::from_response_status("meteosource", reqwest::StatusCode::BAD_GATEWAY);
        assert!(matches!(err, EngineError::Transient(_)));
    }

    #[test]
    fn breaker_relevance() {
        assert!(EngineError::Transient("x".into()).is_breaker_relevant());
        assert!(EngineError::Timeout {
            operation: "head",
            ms: 2000
        }
        .is_breaker_relevant());
        assert!(!EngineError::QuotaExhausted("openmeteo".into()).is_breaker_relevant());
    }
}
