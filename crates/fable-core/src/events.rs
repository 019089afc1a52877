use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{GenerationId, SessionId, TurnId};
use crate::turn::Role;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnPersisted {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTerminal {
    pub generation_id: GenerationId,
    pub outcome: GenerationOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldStateUpdated {
    pub session_id: SessionId,
    /// True when the world was rolled back rather than advanced.
    pub restored: bool,
}

/// One broadcast channel per event category, injected into collaborators.
///
/// Cloning shares the underlying channels.
#[derive(Clone, Debug)]
pub struct EngineEvents {
    turn_persisted: broadcast::Sender<TurnPersisted>,
    generation_terminal: broadcast::Sender<GenerationTerminal>,
    world_state_updated: broadcast::Sender<WorldStateUpdated>,
}

impl Default for EngineEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineEvents {
    pub fn new() -> Self {
        Self {
            turn_persisted: broadcast::channel(CHANNEL_CAPACITY).0,
            generation_terminal: broadcast::channel(CHANNEL_CAPACITY).0,
            world_state_updated: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnPersisted> {
        self.turn_persisted.subscribe()
    }

    pub fn subscribe_generations(&self) -> broadcast::Receiver<GenerationTerminal> {
        self.generation_terminal.subscribe()
    }

    pub fn subscribe_world_state(&self) -> broadcast::Receiver<WorldStateUpdated> {
        self.world_state_updated.subscribe()
    }

    /// Returns false when nobody is listening.
    pub fn turn_persisted(&self, event: TurnPersisted) -> bool {
        self.turn_persisted.send(event).is_ok()
    }

    pub fn generation_terminal(&self, event: GenerationTerminal) -> bool {
        self.generation_terminal.send(event).is_ok()
    }

    pub fn world_state_updated(&self, event: WorldStateUpdated) -> bool {
        self.world_state_updated.send(event).is_ok()
    }
}
