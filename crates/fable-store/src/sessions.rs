use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::{instrument, warn};

use fable_core::ids::{SessionId, TurnId};
use fable_core::session::{Session, SessionListing, SessionMetadata};
use fable_core::turn::{NewTurn, Turn, TurnPatch};

use crate::database::{Database, DatabaseCell};
use crate::error::{map_name_conflict, StoreError};
use crate::row_helpers;
use crate::store::SessionStore;

const SELECT_SESSION: &str = "SELECT id, name, created_at, updated_at, total_turns, last_turn_id, turns
     FROM sessions WHERE id = ?1";

/// SQLite-backed session store. One row per session holds the whole turn log.
///
/// Mutations are serialised per session: each takes that session's lock for
/// the full read-modify-write cycle.
pub struct SessionRepo {
    db: DatabaseCell,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self::with_cell(DatabaseCell::ready(db))
    }

    pub fn with_cell(db: DatabaseCell) -> Self {
        Self {
            db,
            locks: DashMap::new(),
        }
    }

    fn db(&self) -> Result<&Database, StoreError> {
        self.db
            .get()
            .ok_or_else(|| StoreError::Unavailable("database still opening".into()))
    }

    fn session_lock(&self, id: &SessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn try_get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db()?.with_conn(|conn| load(conn, id))
    }

    /// Load, mutate and save one session under its lock. The closure reports
    /// whether it changed the turn log; unchanged sessions are not rewritten.
    fn mutate<F, T>(&self, session_id: &SessionId, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Session) -> Result<(T, bool), StoreError>,
    {
        let db = self.db()?;
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        db.with_conn(|conn| {
            let mut session = load(conn, session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
            let (out, changed) = f(&mut session)?;
            if changed {
                session.touch();
                save(conn, &session)?;
            }
            Ok(out)
        })
    }
}

impl SessionStore for SessionRepo {
    fn is_ready(&self) -> bool {
        self.db.is_ready()
    }

    #[instrument(skip(self))]
    fn create_session(&self, name: &str) -> Result<Session, StoreError> {
        let session = Session::new(name);
        self.db()?.with_conn(|conn| {
            let taken: Option<String> = conn
                .query_row("SELECT id FROM sessions WHERE name = ?1", [name], |row| row.get(0))
                .optional()?;
            if taken.is_some() {
                return Err(StoreError::DuplicateName(name.to_string()));
            }
            insert(conn, &session)?;
            Ok(session)
        })
    }

    fn get_session(&self, id: &SessionId) -> Option<Session> {
        match self.try_get(id) {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %id, error = %e, "session read failed");
                None
            }
        }
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    fn put_session(&self, mut session: Session) -> Result<Session, StoreError> {
        session.metadata = SessionMetadata::from_turns(&session.turns);
        let db = self.db()?;
        let lock = self.session_lock(&session.id);
        let _guard = lock.lock();
        db.with_conn(|conn| {
            upsert(conn, &session)?;
            Ok(session)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let db = self.db()?;
        let lock = self.session_lock(id);
        let deleted = {
            let _guard = lock.lock();
            db.with_conn(|conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])? > 0))?
        };
        self.locks.remove(id);
        Ok(deleted)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn rename_session(&self, id: &SessionId, name: &str) -> Result<(), StoreError> {
        self.mutate(id, |session| {
            if session.name == name {
                return Ok(((), false));
            }
            session.name = name.to_string();
            Ok(((), true))
        })
    }

    fn list_sessions(&self) -> Vec<SessionListing> {
        let result = self.db().and_then(|db| {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, updated_at FROM sessions ORDER BY updated_at DESC, id DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut listings = Vec::new();
                while let Some(row) = rows.next()? {
                    listings.push(SessionListing {
                        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
                        name: row_helpers::get(row, 1, "sessions", "name")?,
                        updated_at: row_helpers::get(row, 2, "sessions", "updated_at")?,
                    });
                }
                Ok(listings)
            })
        });
        result.unwrap_or_else(|e| {
            warn!(error = %e, "session listing failed");
            Vec::new()
        })
    }

    #[instrument(skip(self, turn), fields(session_id = %session_id, role = %turn.role))]
    fn append_turn(&self, session_id: &SessionId, turn: NewTurn) -> Result<Turn, StoreError> {
        self.mutate(session_id, |session| {
            let turn = turn.into_turn();
            session.turns.push(turn.clone());
            Ok((turn, true))
        })
    }

    #[instrument(skip(self, turn), fields(session_id = %session_id, turn_id = %turn.id))]
    fn insert_turn(&self, session_id: &SessionId, index: usize, turn: Turn) -> Result<Turn, StoreError> {
        self.mutate(session_id, |session| {
            if session.turn_by_id(&turn.id).is_some() {
                return Err(StoreError::Database(format!(
                    "turn {} already present in session {}",
                    turn.id, session.id
                )));
            }
            let index = index.min(session.turns.len());
            session.turns.insert(index, turn.clone());
            Ok((turn, true))
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, turn_id = %turn_id))]
    fn delete_turn(&self, session_id: &SessionId, turn_id: &TurnId) -> Result<bool, StoreError> {
        self.mutate(session_id, |session| match session.position(turn_id) {
            Some(idx) => {
                session.turns.remove(idx);
                Ok((true, true))
            }
            None => Ok((false, false)),
        })
    }

    #[instrument(skip(self, patch), fields(session_id = %session_id, turn_id = %turn_id))]
    fn update_turn(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        patch: TurnPatch,
    ) -> Result<bool, StoreError> {
        self.mutate(session_id, |session| {
            match session.turns.iter_mut().find(|t| &t.id == turn_id) {
                Some(turn) => {
                    patch.apply(turn);
                    Ok((true, true))
                }
                None => Ok((false, false)),
            }
        })
    }
}

fn load(conn: &Connection, id: &SessionId) -> Result<Option<Session>, StoreError> {
    let mut stmt = conn.prepare(SELECT_SESSION)?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row).map(Some),
        None => Ok(None),
    }
}

fn insert(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let turns = serde_json::to_string(&session.turns)?;
    conn.execute(
        "INSERT INTO sessions (id, name, created_at, updated_at, total_turns, last_turn_id, turns)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            session.id.as_str(),
            session.name,
            session.created_at,
            session.updated_at,
            session.metadata.total_turns,
            session.metadata.last_turn_id.as_ref().map(|id| id.as_str()),
            turns,
        ],
    )
    .map_err(|e| map_name_conflict(e, &session.name))?;
    Ok(())
}

fn save(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let turns = serde_json::to_string(&session.turns)?;
    conn.execute(
        "UPDATE sessions SET name = ?1, updated_at = ?2, total_turns = ?3, last_turn_id = ?4, turns = ?5
         WHERE id = ?6",
        rusqlite::params![
            session.name,
            session.updated_at,
            session.metadata.total_turns,
            session.metadata.last_turn_id.as_ref().map(|id| id.as_str()),
            turns,
            session.id.as_str(),
        ],
    )
    .map_err(|e| map_name_conflict(e, &session.name))?;
    Ok(())
}

fn upsert(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let turns = serde_json::to_string(&session.turns)?;
    conn.execute(
        "INSERT INTO sessions (id, name, created_at, updated_at, total_turns, last_turn_id, turns)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            total_turns = excluded.total_turns,
            last_turn_id = excluded.last_turn_id,
            turns = excluded.turns",
        rusqlite::params![
            session.id.as_str(),
            session.name,
            session.created_at,
            session.updated_at,
            session.metadata.total_turns,
            session.metadata.last_turn_id.as_ref().map(|id| id.as_str()),
            turns,
        ],
    )
    .map_err(|e| map_name_conflict(e, &session.name))?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let raw_turns: String = row_helpers::get(row, 6, "sessions", "turns")?;
    let turns: Vec<Turn> = row_helpers::parse_json(&raw_turns, "sessions", "turns")?;

    let stored = SessionMetadata {
        total_turns: row_helpers::get(row, 4, "sessions", "total_turns")?,
        last_turn_id: row_helpers::get_opt::<String>(row, 5, "sessions", "last_turn_id")?
            .map(TurnId::from_raw),
    };
    let derived = SessionMetadata::from_turns(&turns);

    let mut session = Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        name: row_helpers::get(row, 1, "sessions", "name")?,
        created_at: row_helpers::get(row, 2, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 3, "sessions", "updated_at")?,
        turns,
        metadata: stored,
    };

    if session.metadata != derived {
        warn!(
            session_id = %session.id,
            stored_total = session.metadata.total_turns,
            actual_total = derived.total_turns,
            "stored metadata disagrees with turn log, recomputing"
        );
        session.metadata = derived;
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fable_core::turn::{Role, Snapshot, TurnSummary};

    fn setup() -> (Database, SessionRepo) {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        (db, repo)
    }

    #[test]
    fn create_and_get_session() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        assert!(session.id.as_str().starts_with("sess_"));

        let fetched = repo.get_session(&session.id).unwrap();
        assert_eq!(fetched.name, "S1");
        assert!(fetched.turns.is_empty());
        assert_eq!(fetched.metadata.total_turns, 0);
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_, repo) = setup();
        repo.create_session("S1").unwrap();
        let result = repo.create_session("S1");
        assert!(matches!(result, Err(StoreError::DuplicateName(name)) if name == "S1"));
    }

    #[test]
    fn get_nonexistent_is_none() {
        let (_, repo) = setup();
        assert!(repo.get_session(&SessionId::new()).is_none());
    }

    #[test]
    fn appended_turns_round_trip_in_order() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            let turn = if i % 2 == 0 {
                NewTurn::user(format!("user {i}"))
            } else {
                NewTurn::assistant(format!("assistant {i}"))
            };
            ids.push(repo.append_turn(&session.id, turn).unwrap().id);
        }

        let fetched = repo.get_session(&session.id).unwrap();
        let fetched_ids: Vec<_> = fetched.turns.iter().map(|t| t.id.clone()).collect();
        assert_eq!(fetched_ids, ids);
        assert_eq!(fetched.turns[3].text, "assistant 3");
        assert_eq!(fetched.turns[3].role, Role::Assistant);
        assert_eq!(fetched.metadata.total_turns, 6);
        assert_eq!(fetched.metadata.last_turn_id.as_ref(), ids.last());

        let mut unique = ids.clone();
        unique.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        unique.dedup();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn append_to_missing_session_fails() {
        let (_, repo) = setup();
        let result = repo.append_turn(&SessionId::new(), NewTurn::user("hi"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_turn_updates_metadata() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        let a = repo.append_turn(&session.id, NewTurn::user("a")).unwrap();
        let b = repo.append_turn(&session.id, NewTurn::assistant("b")).unwrap();

        assert!(repo.delete_turn(&session.id, &b.id).unwrap());
        assert!(!repo.delete_turn(&session.id, &b.id).unwrap());

        let fetched = repo.get_session(&session.id).unwrap();
        assert_eq!(fetched.metadata.total_turns, 1);
        assert_eq!(fetched.metadata.last_turn_id, Some(a.id));
        assert!(fetched.metadata_consistent());
    }

    #[test]
    fn insert_turn_at_position() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        let a = repo.append_turn(&session.id, NewTurn::user("a")).unwrap();
        let c = repo.append_turn(&session.id, NewTurn::user("c")).unwrap();

        let b = NewTurn::assistant("b").into_turn();
        repo.insert_turn(&session.id, 1, b.clone()).unwrap();

        let fetched = repo.get_session(&session.id).unwrap();
        let order: Vec<_> = fetched.turns.iter().map(|t| t.id.clone()).collect();
        assert_eq!(order, vec![a.id, b.id.clone(), c.id.clone()]);
        assert_eq!(fetched.metadata.last_turn_id, Some(c.id));

        assert!(repo.insert_turn(&session.id, 0, b).is_err());
    }

    #[test]
    fn insert_past_end_appends() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        let turn = NewTurn::assistant("late").into_turn();
        repo.insert_turn(&session.id, 99, turn.clone()).unwrap();
        assert_eq!(repo.last_turn(&session.id).unwrap().id, turn.id);
    }

    #[test]
    fn update_turn_applies_patch() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        let snapshot = Snapshot::new(serde_json::json!({"gold": 5}));
        let turn = repo
            .append_turn(
                &session.id,
                NewTurn::assistant("old").with_snapshot(Some(snapshot.clone())),
            )
            .unwrap();

        let patch = TurnPatch {
            text: Some("new".into()),
            rendered_text: Some("<p>new</p>".into()),
            summary: None,
        };
        assert!(repo.update_turn(&session.id, &turn.id, patch).unwrap());
        assert!(!repo
            .update_turn(&session.id, &TurnId::new(), TurnPatch::text("x"))
            .unwrap());

        let fetched = repo.turn_by_id(&session.id, &turn.id).unwrap();
        assert_eq!(fetched.text, "new");
        assert_eq!(fetched.rendered_text.as_deref(), Some("<p>new</p>"));
        assert_eq!(fetched.world_state_snapshot, Some(snapshot));
    }

    #[test]
    fn point_queries() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        repo.append_turn(&session.id, NewTurn::user("u1")).unwrap();
        let a1 = repo.append_turn(&session.id, NewTurn::assistant("a1")).unwrap();
        let u2 = repo.append_turn(&session.id, NewTurn::user("u2")).unwrap();

        assert_eq!(repo.last_turn(&session.id).unwrap().id, u2.id);
        assert_eq!(repo.last_turn_by_role(&session.id, Role::Assistant).unwrap().id, a1.id);
        assert_eq!(repo.turns_by_role(&session.id, Role::User).len(), 2);
        assert!(repo.turns_by_role(&SessionId::new(), Role::User).is_empty());
    }

    #[test]
    fn put_session_recomputes_metadata_and_is_idempotent() {
        let (_, repo) = setup();
        let mut session = Session::new("imported");
        session.turns.push(NewTurn::user("a").into_turn());
        session.turns.push(NewTurn::assistant("b").into_turn());

        let stored = repo.put_session(session.clone()).unwrap();
        assert_eq!(stored.metadata.total_turns, 2);
        let again = repo.put_session(session).unwrap();
        assert_eq!(stored, again);

        let fetched = repo.get_session(&stored.id).unwrap();
        assert_eq!(fetched, stored);
    }

    #[test]
    fn put_session_name_collision() {
        let (_, repo) = setup();
        repo.create_session("taken").unwrap();
        let result = repo.put_session(Session::new("taken"));
        assert!(matches!(result, Err(StoreError::DuplicateName(_))));
    }

    #[test]
    fn rename_and_list() {
        let (_, repo) = setup();
        let a = repo.create_session("A").unwrap();
        let b = repo.create_session("B").unwrap();

        assert!(matches!(
            repo.rename_session(&a.id, "B"),
            Err(StoreError::DuplicateName(_))
        ));
        repo.rename_session(&a.id, "A2").unwrap();

        let listings = repo.list_sessions();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, a.id, "renamed session is most recently updated");
        assert_eq!(listings[0].name, "A2");
        assert_eq!(listings[1].id, b.id);
    }

    #[test]
    fn delete_session_removes_row() {
        let (_, repo) = setup();
        let session = repo.create_session("S1").unwrap();
        assert!(repo.delete_session(&session.id).unwrap());
        assert!(!repo.delete_session(&session.id).unwrap());
        assert!(repo.get_session(&session.id).is_none());
        repo.create_session("S1").unwrap();
    }

    #[test]
    fn pending_store_reads_empty_and_rejects_writes() {
        let repo = SessionRepo::with_cell(DatabaseCell::pending());
        assert!(!repo.is_ready());
        assert!(repo.list_sessions().is_empty());
        assert!(repo.get_session(&SessionId::new()).is_none());
        assert!(matches!(repo.create_session("S1"), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn legacy_roles_and_stale_metadata_load() {
        let (db, repo) = setup();
        let turns = r#"[
            {"id":"turn_1","role":"narrator","timestamp":"2024-01-01T00:00:00Z","text":"once"},
            {"id":"turn_2","role":"assistant","timestamp":"2024-01-01T00:00:01Z","text":"upon",
             "summary":{"short":"s"}},
            {"id":"turn_3","role":null,"timestamp":"2024-01-01T00:00:02Z","text":"a"},
            {"id":"turn_4","role":7,"timestamp":"2024-01-01T00:00:03Z","text":"time"}
        ]"#;
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, created_at, updated_at, total_turns, last_turn_id, turns)
                 VALUES ('sess_legacy', 'legacy', 't', 't', 7, 'turn_x', ?1)",
                [turns],
            )?;
            Ok(())
        })
        .unwrap();

        let session = repo.get_session(&SessionId::from_raw("sess_legacy")).unwrap();
        assert_eq!(session.turns[0].role, Role::User);
        assert_eq!(session.turns[1].role, Role::Assistant);
        assert_eq!(session.turns[1].summary, Some(TurnSummary::short("s")));
        assert_eq!(session.turns[2].role, Role::User);
        assert_eq!(session.turns[3].role, Role::User);
        assert_eq!(session.metadata.total_turns, 4);
        assert_eq!(session.metadata.last_turn_id, Some(TurnId::from_raw("turn_4")));
    }

    #[test]
    fn corrupt_turn_log_reads_as_none() {
        let (db, repo) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, created_at, updated_at, turns)
                 VALUES ('sess_bad', 'bad', 't', 't', 'not json')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert!(repo.get_session(&SessionId::from_raw("sess_bad")).is_none());
        assert!(matches!(
            repo.append_turn(&SessionId::from_raw("sess_bad"), NewTurn::user("x")),
            Err(StoreError::CorruptRow { .. })
        ));
    }

    #[test]
    fn concurrent_appends_are_serialised() {
        let (_, repo) = setup();
        let repo = Arc::new(repo);
        let session = repo.create_session("busy").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = Arc::clone(&repo);
                let id = session.id.clone();
                std::thread::spawn(move || {
                    for j in 0..5 {
                        repo.append_turn(&id, NewTurn::user(format!("{i}-{j}"))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let fetched = repo.get_session(&session.id).unwrap();
        assert_eq!(fetched.turns.len(), 40);
        assert!(fetched.metadata_consistent());
    }
}
