//! # Errors
//!
//! Error surfaces of the pipeline.
//!
//! - [`ServiceError`] is what external collaborators (message source, LLM
//!   analysis, embeddings) return. Its variants split into transient failures
//!   the stage runner retries and permanent failures that fail a unit of work.
//! - [`CheckpointError`] is what the checkpoint store returns. A corrupt record
//!   never shows up here; it is logged and reported as `NotFound`.
//! - [`PipelineError`] is what the runner and orchestrator return.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::{Stage, StageState};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
}

impl ServiceError {
    /// Transient failures: rate limiting, network trouble, timeouts and
    /// temporarily unavailable upstreams.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited { .. }
                | ServiceError::Network(_)
                | ServiceError::Timeout
                | ServiceError::Unavailable(_)
        )
    }

    /// Delay requested by the upstream, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status to an error, keeping the response body as context.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 200));
        match status {
            429 => ServiceError::RateLimited {
                message,
                retry_after,
            },
            408 => ServiceError::Timeout,
            401 | 403 => ServiceError::Config(message),
            404 => ServiceError::NotFound(message),
            400..=499 => ServiceError::InvalidInput(message),
            _ => ServiceError::Unavailable(message),
        }
    }

    /// Classify an opaque error coming back from the LLM framework.
    ///
    /// The framework reports provider failures as formatted messages, so this
    /// looks for the usual status codes and phrases.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(service) = err.downcast_ref::<ServiceError>() {
            return service.clone();
        }
        if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
            return ServiceError::from_reqwest(reqwest_err);
        }

        let message = format!("{:#}", err);
        let lower = message.to_lowercase();

        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
        {
            ServiceError::RateLimited {
                message,
                retry_after: None,
            }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ServiceError::Timeout
        } else if lower.contains("overloaded")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("500 internal")
        {
            ServiceError::Unavailable(message)
        } else if lower.contains("connection") || lower.contains("dns") || lower.contains("network")
        {
            ServiceError::Network(message)
        } else if lower.contains("api_key") || lower.contains("api key") || lower.contains("environment variable")
        {
            ServiceError::Config(message)
        } else {
            ServiceError::InvalidResponse(message)
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout
        } else if let Some(status) = err.status() {
            ServiceError::from_status(status.as_u16(), &err.to_string(), None)
        } else if err.is_connect() || err.is_request() {
            ServiceError::Network(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ServiceError::InvalidResponse(err.to_string())
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::from_reqwest(&err)
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ServiceError::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => ServiceError::Timeout,
            _ => ServiceError::Io(err.to_string()),
        }
    }
}

/// Failure returned by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint for {stage}{}", chat_suffix(.chat_id))]
    NotFound {
        stage: Stage,
        chat_id: Option<String>,
    },
    #[error("invalid checkpoint key: {0}")]
    InvalidKey(String),
    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

impl CheckpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

/// Failure of a stage or of the run as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage} failed: {reason}")]
    StageFatal { stage: Stage, reason: String },
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid transition for {stage}: {from:?} -> {to:?}")]
    InvalidTransition {
        stage: Stage,
        from: StageState,
        to: StageState,
    },
    #[error("{stage} started without its {input} input")]
    MissingInput { stage: Stage, input: Stage },
    #[error("expected a {expected} payload, found {found}")]
    PayloadMismatch { expected: Stage, found: Stage },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn chat_suffix(chat_id: &Option<String>) -> String {
    chat_id
        .as_ref()
        .map(|id| format!(" (chat {})", id))
        .unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(ServiceError::Timeout.is_retryable());
        assert!(ServiceError::Network("reset".into()).is_retryable());
        assert!(ServiceError::Unavailable("503".into()).is_retryable());
        assert!(!ServiceError::InvalidInput("empty".into()).is_retryable());
        assert!(!ServiceError::NotFound("chat".into()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        let err = ServiceError::from_status(429, "slow down", Some(Duration::from_secs(2)));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        assert!(ServiceError::from_status(503, "", None).is_retryable());
        assert!(!ServiceError::from_status(400, "bad", None).is_retryable());
        assert!(matches!(
            ServiceError::from_status(401, "", None),
            ServiceError::Config(_)
        ));
    }

    #[test]
    fn test_classify_framework_errors() {
        let err = anyhow::anyhow!("OpenAI API error: 429 Too Many Requests");
        assert!(matches!(
            ServiceError::classify(&err),
            ServiceError::RateLimited { .. }
        ));

        let err = anyhow::anyhow!("request timed out after 60s");
        assert_eq!(ServiceError::classify(&err), ServiceError::Timeout);

        let err = anyhow::anyhow!("failed to parse structured output");
        assert!(!ServiceError::classify(&err).is_retryable());
    }

    #[test]
    fn test_classify_keeps_service_errors() {
        let err: anyhow::Error = ServiceError::NotFound("chat-1".into()).into();
        assert_eq!(
            ServiceError::classify(&err),
            ServiceError::NotFound("chat-1".into())
        );
    }
}
