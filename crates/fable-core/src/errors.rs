use std::time::Duration;

/// Failures reported by the narrative generation capability.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GenerationError {
    // Fatal
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("generation backend rejected the request: {0}")]
    Rejected(String),

    // Retryable
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::StreamInterrupted(_) | Self::Timeout(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Rejected(_) => "rejected",
            Self::Unavailable(_) => "unavailable",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Raised by a world-state engine that cannot fold directives into a snapshot.
#[derive(Clone, Debug, thiserror::Error)]
#[error("world state parse failed: {0}")]
pub struct WorldStateError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(GenerationError::Unavailable("down".into()).is_retryable());
        assert!(GenerationError::StreamInterrupted("eof".into()).is_retryable());
        assert!(GenerationError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!GenerationError::InvalidRequest("bad".into()).is_retryable());
        assert!(!GenerationError::Cancelled.is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(GenerationError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            GenerationError::StreamInterrupted("x".into()).error_kind(),
            "stream_interrupted"
        );
    }

    #[test]
    fn world_state_error_message() {
        let e = WorldStateError("unbalanced directive".into());
        assert_eq!(e.to_string(), "world state parse failed: unbalanced directive");
    }
}
