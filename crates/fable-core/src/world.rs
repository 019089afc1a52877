use serde::{Deserialize, Serialize};

use crate::errors::WorldStateError;
use crate::turn::Snapshot;

/// In-story date and time, used to stamp turn summaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeTime {
    pub date: String,
    pub time: String,
}

/// External engine owning the mutable world state a story runs against.
pub trait WorldStateEngine: Send + Sync {
    /// Fold the directives embedded in `text` into `prior`.
    /// Returns `Ok(None)` when the text carries no directives.
    fn parse(&self, text: &str, prior: &Snapshot) -> Result<Option<Snapshot>, WorldStateError>;

    fn narrative_time(&self) -> Option<NarrativeTime>;

    /// The snapshot the world is currently in.
    fn current(&self) -> Option<Snapshot>;

    /// Replace the current world state.
    fn restore(&self, snapshot: Option<Snapshot>);
}
