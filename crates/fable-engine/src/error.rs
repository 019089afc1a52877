use fable_core::errors::GenerationError;
use fable_core::ids::TurnId;
use fable_store::StoreError;

use crate::lifecycle::LifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session name already in use: {0}")]
    DuplicateName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("generation interrupted")]
    GenerationInterrupted,

    #[error("turn {turn_id} still present after delete")]
    InconsistentDeleteState { turn_id: TurnId },

    #[error("generation failed: {0}")]
    Generation(GenerationError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("coordinator busy: {0:?}")]
    Busy(LifecycleState),

    /// The user turn was persisted but no reply was produced for it.
    #[error("no reply for turn {user_turn_id}: {source}")]
    TurnFailed {
        user_turn_id: TurnId,
        #[source]
        source: Box<EngineError>,
    },
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateName(name) => Self::DuplicateName(name),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Unavailable(reason) => Self::PersistenceUnavailable(reason),
            other => Self::Store(other),
        }
    }
}

impl From<GenerationError> for EngineError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Cancelled => Self::GenerationInterrupted,
            other => Self::Generation(other),
        }
    }
}

impl EngineError {
    /// Stable classification string for logs and callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateName(_) => "duplicate_name",
            Self::NotFound(_) => "not_found",
            Self::PersistenceUnavailable(_) => "persistence_unavailable",
            Self::GenerationInterrupted => "generation_interrupted",
            Self::InconsistentDeleteState { .. } => "inconsistent_delete_state",
            Self::Generation(_) => "generation_failed",
            Self::Store(_) => "store",
            Self::Busy(_) => "busy",
            Self::TurnFailed { source, .. } => source.kind(),
        }
    }

    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PersistenceUnavailable(_) | Self::GenerationInterrupted | Self::Busy(_) => true,
            Self::Generation(e) => e.is_retryable(),
            Self::TurnFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
