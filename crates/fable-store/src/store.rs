use std::time::Duration;

use fable_core::ids::{SessionId, TurnId};
use fable_core::session::{Session, SessionListing};
use fable_core::turn::{NewTurn, Role, Turn, TurnPatch};

use crate::error::StoreError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Durable, keyed-by-session turn log.
///
/// Reads never fail: storage errors are logged and surface as `None` or an
/// empty list. Writes propagate their errors. Every mutation keeps the turn
/// log and its metadata in lock-step. There are no multi-call transactions;
/// callers needing cross-call consistency must read back.
pub trait SessionStore: Send + Sync {
    fn is_ready(&self) -> bool;

    fn create_session(&self, name: &str) -> Result<Session, StoreError>;
    fn get_session(&self, id: &SessionId) -> Option<Session>;
    /// Idempotent upsert; metadata is recomputed from the turn log.
    fn put_session(&self, session: Session) -> Result<Session, StoreError>;
    fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError>;
    fn rename_session(&self, id: &SessionId, name: &str) -> Result<(), StoreError>;
    /// Newest first.
    fn list_sessions(&self) -> Vec<SessionListing>;

    /// Assign id and timestamp, append, persist.
    fn append_turn(&self, session_id: &SessionId, turn: NewTurn) -> Result<Turn, StoreError>;
    /// Insert a fully formed turn at `index` (clamped to the log length).
    fn insert_turn(&self, session_id: &SessionId, index: usize, turn: Turn) -> Result<Turn, StoreError>;
    fn delete_turn(&self, session_id: &SessionId, turn_id: &TurnId) -> Result<bool, StoreError>;
    fn update_turn(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        patch: TurnPatch,
    ) -> Result<bool, StoreError>;

    fn last_turn(&self, session_id: &SessionId) -> Option<Turn> {
        self.get_session(session_id)?.turns.pop()
    }

    fn last_turn_by_role(&self, session_id: &SessionId, role: Role) -> Option<Turn> {
        self.get_session(session_id)?
            .turns
            .into_iter()
            .rev()
            .find(|t| t.role == role)
    }

    fn turns_by_role(&self, session_id: &SessionId, role: Role) -> Vec<Turn> {
        self.get_session(session_id)
            .map(|s| s.turns.into_iter().filter(|t| t.role == role).collect())
            .unwrap_or_default()
    }

    fn turn_by_id(&self, session_id: &SessionId, turn_id: &TurnId) -> Option<Turn> {
        self.get_session(session_id)?
            .turns
            .into_iter()
            .find(|t| &t.id == turn_id)
    }
}

/// Poll until the store reports ready, failing with `Unavailable` after `timeout`.
pub async fn wait_until_ready(store: &dyn SessionStore, timeout: Duration) -> Result<(), StoreError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if store.is_ready() {
            return Ok(());
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(StoreError::Unavailable(format!(
                "store not ready after {}ms",
                timeout.as_millis()
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
    }
}
