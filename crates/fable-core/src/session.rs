use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, TurnId};
use crate::turn::{Role, Turn};

/// Derived counters kept in lock-step with the turn log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub total_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn_id: Option<TurnId>,
}

impl SessionMetadata {
    pub fn from_turns(turns: &[Turn]) -> Self {
        Self {
            total_turns: turns.len() as u32,
            last_turn_id: turns.last().map(|t| t.id.clone()),
        }
    }
}

/// A named, independently persisted conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: SessionId::new(),
            name: name.into(),
            created_at: now.clone(),
            updated_at: now,
            turns: Vec::new(),
            metadata: SessionMetadata::default(),
        }
    }

    /// Recompute metadata from the log and bump `updated_at`.
    ///
    /// Every mutation of `turns` must be followed by this call.
    pub fn touch(&mut self) {
        self.metadata = SessionMetadata::from_turns(&self.turns);
        self.updated_at = Utc::now().to_rfc3339();
    }

    pub fn metadata_consistent(&self) -> bool {
        self.metadata == SessionMetadata::from_turns(&self.turns)
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn last_turn_by_role(&self, role: Role) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == role)
    }

    pub fn turns_by_role(&self, role: Role) -> Vec<&Turn> {
        self.turns.iter().filter(|t| t.role == role).collect()
    }

    pub fn turn_by_id(&self, id: &TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| &t.id == id)
    }

    pub fn position(&self, id: &TurnId) -> Option<usize> {
        self.turns.iter().position(|t| &t.id == id)
    }

    pub fn listing(&self) -> SessionListing {
        SessionListing {
            id: self.id.clone(),
            name: self.name.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Row shown by a session picker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListing {
    pub id: SessionId,
    pub name: String,
    pub updated_at: String,
}
