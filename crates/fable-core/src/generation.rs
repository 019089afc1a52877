use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;
use crate::ids::TurnId;
use crate::turn::{Role, Snapshot};

/// How a turn is represented inside a history window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentMode {
    Full,
    LongSummary,
    ShortSummary,
}

/// One entry of the history handed to the generation capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptFragment {
    pub turn_id: TurnId,
    pub role: Role,
    pub mode: FragmentMode,
    pub content: String,
}

/// Streaming or batched generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Sync,
    #[default]
    Stream,
}

/// Input for a single generation call. `history` replaces the capability's
/// own default history; everything else about its configuration is untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub input: String,
    pub history: Vec<PromptFragment>,
    pub mode: GenerationMode,
}

/// Events emitted by a streaming generation. Ordering contract:
///
/// Start → (Increment | FullText)* → End
///
/// Error may replace End at any point.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    Start,
    /// Newly produced text, appended to what came before.
    Increment { delta: String },
    /// Cumulative text so far, replacing any earlier text.
    FullText { text: String },
    End { text: String },
    Error { error: String },
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// Final result of a completed generation.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub rendered_text: String,
    pub new_snapshot: Option<Snapshot>,
    pub warnings: Vec<GenerationWarning>,
}

/// Non-fatal problems surfaced next to a usable result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationWarning {
    WorldStateParseFailed(String),
}

impl GenerationWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorldStateParseFailed(_) => "world_state_parse_failed",
        }
    }
}

impl std::fmt::Display for GenerationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorldStateParseFailed(reason) => write!(f, "world state parse failed: {reason}"),
        }
    }
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

/// The external text-generation capability.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the complete reply in one call.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Produce the reply as a stream of events.
    async fn stream(&self, request: &GenerationRequest) -> Result<GenerationStream, GenerationError>;
}
