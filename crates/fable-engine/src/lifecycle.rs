//! Turn lifecycle coordinator.
//!
//! Sequences the store, the window policy and the orchestrator for the three
//! user-facing operations: a new turn, regenerating an assistant turn, and
//! editing a turn in place. One operation runs at a time; each walks
//! `Idle → … → Idle` and any failure returns the coordinator to `Idle`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use fable_core::events::{EngineEvents, TurnPersisted, WorldStateUpdated};
use fable_core::generation::{GenerationMode, GenerationRequest, GenerationWarning};
use fable_core::ids::{SessionId, TurnId};
use fable_core::session::Session;
use fable_core::summarizer::Summarizer;
use fable_core::turn::{NewTurn, Role, Snapshot, Turn, TurnPatch, TurnSummary};
use fable_store::{wait_until_ready, SessionStore, SettingsRepo};

use crate::error::EngineError;
use crate::generation::{GenerationObserver, GenerationOrchestrator, NoopObserver};
use crate::window::{build_window, HistoryWindowConfig};

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the coordinator is in a lifecycle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Deleting,
    SnapshotRestoring,
    Generating,
    Persisting,
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How long to wait for the store before failing with `PersistenceUnavailable`.
    pub ready_timeout: Duration,
    pub mode: GenerationMode,
    /// Used when no window configuration is stored in settings.
    pub window: HistoryWindowConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            mode: GenerationMode::Stream,
            window: HistoryWindowConfig::default(),
        }
    }
}

/// Result of a new turn or a regenerate.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub user_turn: Turn,
    pub assistant_turn: Turn,
    pub warnings: Vec<GenerationWarning>,
}

enum Placement {
    Append,
    Insert(usize),
}

/// Resets the coordinator to `Idle` however the operation ends.
struct StateGuard<'a> {
    state: &'a Mutex<LifecycleState>,
}

impl StateGuard<'_> {
    fn advance(&self, next: LifecycleState) {
        debug!(?next, "lifecycle transition");
        *self.state.lock() = next;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = LifecycleState::Idle;
    }
}

pub struct TurnCoordinator {
    store: Arc<dyn SessionStore>,
    settings: Option<Arc<SettingsRepo>>,
    orchestrator: GenerationOrchestrator,
    summarizer: Option<Arc<dyn Summarizer>>,
    observer: Arc<dyn GenerationObserver>,
    events: EngineEvents,
    config: CoordinatorConfig,
    state: Mutex<LifecycleState>,
    cancel_requested: AtomicBool,
}

impl TurnCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        orchestrator: GenerationOrchestrator,
        events: EngineEvents,
    ) -> Self {
        Self {
            store,
            settings: None,
            orchestrator,
            summarizer: None,
            observer: Arc::new(NoopObserver),
            events,
            config: CoordinatorConfig::default(),
            state: Mutex::new(LifecycleState::Idle),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Read the history window configuration from settings on every turn.
    pub fn with_settings(mut self, settings: Arc<SettingsRepo>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn GenerationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn window_config(&self) -> HistoryWindowConfig {
        self.settings
            .as_ref()
            .and_then(|s| s.get(HistoryWindowConfig::SETTINGS_KEY))
            .map(|v| HistoryWindowConfig::from_value(&v))
            .unwrap_or(self.config.window)
            .sanitized()
    }

    /// Stop the generation in flight, if any. A generation whose text already
    /// arrived is still discarded as long as its turn is not yet persisted.
    pub fn cancel_generation(&self) -> bool {
        let active = self.state() != LifecycleState::Idle;
        if active {
            self.cancel_requested.store(true, Ordering::SeqCst);
        }
        self.orchestrator.cancel_current() || active
    }

    fn begin(&self, first: LifecycleState) -> Result<StateGuard<'_>, EngineError> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Idle {
            return Err(EngineError::Busy(*state));
        }
        *state = first;
        self.cancel_requested.store(false, Ordering::SeqCst);
        Ok(StateGuard { state: &self.state })
    }

    async fn resolve_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        wait_until_ready(self.store.as_ref(), self.config.ready_timeout)
            .await
            .map_err(|e| EngineError::PersistenceUnavailable(e.to_string()))?;
        self.store.get_session(session_id).ok_or_else(|| {
            EngineError::PersistenceUnavailable(format!("session {session_id} could not be resolved"))
        })
    }

    /// Persist the user's input, then generate and persist the reply.
    ///
    /// The user turn survives a failed generation; the failure is reported as
    /// [`EngineError::TurnFailed`] carrying its id.
    #[instrument(skip(self, input), fields(session_id = %session_id))]
    pub async fn submit_turn(&self, session_id: &SessionId, input: &str) -> Result<TurnOutcome, EngineError> {
        let guard = self.begin(LifecycleState::Persisting)?;
        self.resolve_session(session_id).await?;

        let user_turn = self
            .store
            .append_turn(session_id, NewTurn::user(input))
            .map_err(|e| match EngineError::from(e) {
                EngineError::NotFound(what) => EngineError::PersistenceUnavailable(what),
                other => other,
            })?;
        self.publish_turn(session_id, &user_turn);

        let result = async {
            let history = self
                .store
                .get_session(session_id)
                .map(|s| s.turns)
                .ok_or_else(|| EngineError::PersistenceUnavailable(format!("session {session_id} vanished")))?;
            let prior = self.orchestrator.world().current();
            self.generate_and_persist(&guard, session_id, input, &history, prior, Placement::Append)
                .await
        }
        .await;

        match result {
            Ok((assistant_turn, warnings)) => Ok(TurnOutcome {
                user_turn,
                assistant_turn,
                warnings,
            }),
            Err(e) => {
                warn!(turn_id = %user_turn.id, kind = e.kind(), error = %e, "no reply persisted for user turn");
                Err(EngineError::TurnFailed {
                    user_turn_id: user_turn.id,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Replace an assistant turn with a fresh generation from the same input,
    /// replaying the world state as it was before that turn.
    ///
    /// On failure after the delete, the original turn and world state are put
    /// back.
    #[instrument(skip(self), fields(session_id = %session_id, turn_id = %turn_id))]
    pub async fn regenerate(&self, session_id: &SessionId, turn_id: &TurnId) -> Result<TurnOutcome, EngineError> {
        let guard = self.begin(LifecycleState::Deleting)?;
        let session = self.resolve_session(session_id).await?;

        let index = session
            .position(turn_id)
            .ok_or_else(|| EngineError::NotFound(format!("turn {turn_id}")))?;
        let target = session.turns[index].clone();
        if !target.is_assistant() {
            return Err(EngineError::NotFound(format!("assistant turn {turn_id}")));
        }
        let history = &session.turns[..index];
        let user_turn = history
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("user turn preceding {turn_id}")))?;
        let prior = history
            .iter()
            .rev()
            .filter(|t| t.is_assistant())
            .find_map(|t| t.world_state_snapshot.clone());
        let world_before = self.orchestrator.world().current();

        let deleted = self.store.delete_turn(session_id, turn_id)?;
        match self.store.get_session(session_id) {
            Some(s) if s.turn_by_id(turn_id).is_none() => {}
            Some(_) => {
                error!("turn still present after delete, aborting regenerate");
                return Err(EngineError::InconsistentDeleteState {
                    turn_id: turn_id.clone(),
                });
            }
            None => {
                error!(deleted, "delete could not be verified, aborting regenerate");
                if deleted {
                    self.reinsert(session_id, index, target);
                }
                return Err(EngineError::InconsistentDeleteState {
                    turn_id: turn_id.clone(),
                });
            }
        }

        guard.advance(LifecycleState::SnapshotRestoring);
        self.restore_world(session_id, prior.clone());

        guard.advance(LifecycleState::Generating);
        let result = self
            .generate_and_persist(&guard, session_id, &user_turn.text, history, prior, Placement::Insert(index))
            .await;

        match result {
            Ok((assistant_turn, warnings)) => {
                // Later assistant turns hold newer world state than the one
                // just regenerated; the latest of them stays current.
                let latest = session.turns[index + 1..]
                    .iter()
                    .rev()
                    .filter(|t| t.is_assistant())
                    .find_map(|t| t.world_state_snapshot.clone());
                if latest.is_some() {
                    self.restore_world(session_id, latest);
                }
                info!(new_turn_id = %assistant_turn.id, "turn regenerated");
                Ok(TurnOutcome {
                    user_turn,
                    assistant_turn,
                    warnings,
                })
            }
            Err(e) => {
                self.roll_back_regenerate(session_id, index, target, world_before);
                Err(e)
            }
        }
    }

    fn roll_back_regenerate(
        &self,
        session_id: &SessionId,
        index: usize,
        original: Turn,
        world_before: Option<Snapshot>,
    ) {
        self.reinsert(session_id, index, original);
        self.restore_world(session_id, world_before);
    }

    /// Put a deleted turn back. A turn that is in fact still there is
    /// rejected by the store as a duplicate and left alone.
    fn reinsert(&self, session_id: &SessionId, index: usize, original: Turn) {
        let original_id = original.id.clone();
        match self.store.insert_turn(session_id, index, original) {
            Ok(_) => info!(turn_id = %original_id, "original turn restored"),
            Err(e) => error!(turn_id = %original_id, error = %e, "failed to restore original turn"),
        }
    }

    async fn generate_and_persist(
        &self,
        guard: &StateGuard<'_>,
        session_id: &SessionId,
        input: &str,
        history: &[Turn],
        prior: Option<Snapshot>,
        placement: Placement,
    ) -> Result<(Turn, Vec<GenerationWarning>), EngineError> {
        guard.advance(LifecycleState::Generating);
        let window = build_window(history, &self.window_config());
        debug!(
            full = window.stats.full,
            long_summary = window.stats.long_summary,
            short_summary = window.stats.short_summary,
            omitted = window.stats.omitted,
            "history window built"
        );

        let request = GenerationRequest {
            input: input.to_string(),
            history: window.fragments,
            mode: self.config.mode,
        };
        let output = self
            .orchestrator
            .start(request, prior.clone(), self.observer.clone())
            .await_result()
            .await?
            .ok_or(EngineError::GenerationInterrupted)?;

        guard.advance(LifecycleState::Persisting);
        let summary = self.summarize(history, &output.text).await;
        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(EngineError::GenerationInterrupted);
        }

        let advanced = output.new_snapshot.is_some();
        let snapshot = output.new_snapshot.or(prior);
        let mut turn = NewTurn::assistant(output.text)
            .with_rendered(output.rendered_text)
            .with_snapshot(snapshot.clone());
        turn.summary = summary;

        let persisted = match placement {
            Placement::Append => self.store.append_turn(session_id, turn)?,
            Placement::Insert(index) => self.store.insert_turn(session_id, index, turn.into_turn())?,
        };
        self.publish_turn(session_id, &persisted);

        if advanced {
            self.orchestrator.world().restore(snapshot);
            if !self.events.world_state_updated(WorldStateUpdated {
                session_id: session_id.clone(),
                restored: false,
            }) {
                warn!("no world-state listeners, event dropped");
            }
        }
        Ok((persisted, output.warnings))
    }

    /// Summarize a new assistant turn and stamp it with its sequence number
    /// and the narrative time.
    async fn summarize(&self, history: &[Turn], text: &str) -> Option<TurnSummary> {
        let summarizer = self.summarizer.as_ref()?;
        let summary = summarizer.summarize(text).await.filter(|s| !s.is_empty())?;
        let seq = history.iter().filter(|t| t.is_assistant() && t.has_summary()).count() + 1;
        let header = match self.orchestrator.world().narrative_time() {
            Some(time) => format!("#{seq} [{} {}] ", time.date, time.time),
            None => format!("#{seq} "),
        };
        Some(summary.with_header(&header))
    }

    /// Change a turn's text in place. Snapshots are untouched and nothing is
    /// regenerated.
    #[instrument(skip(self, text), fields(session_id = %session_id, turn_id = %turn_id))]
    pub async fn edit_turn(&self, session_id: &SessionId, turn_id: &TurnId, text: &str) -> Result<(), EngineError> {
        self.resolve_session(session_id).await?;
        let patch = TurnPatch {
            text: Some(text.to_string()),
            rendered_text: Some(self.orchestrator.render(text)),
            summary: None,
        };
        if self.store.update_turn(session_id, turn_id, patch)? {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("turn {turn_id}")))
        }
    }

    /// Attach a summary to a turn that has none. Returns false if the turn
    /// already carries one.
    #[instrument(skip(self, summary), fields(session_id = %session_id, turn_id = %turn_id))]
    pub async fn backfill_summary(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
        summary: TurnSummary,
    ) -> Result<bool, EngineError> {
        let session = self.resolve_session(session_id).await?;
        let turn = session
            .turn_by_id(turn_id)
            .ok_or_else(|| EngineError::NotFound(format!("turn {turn_id}")))?;
        if turn.has_summary() || summary.is_empty() {
            return Ok(false);
        }
        let patch = TurnPatch {
            summary: Some(summary),
            ..Default::default()
        };
        Ok(self.store.update_turn(session_id, turn_id, patch)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id, turn_id = %turn_id))]
    pub async fn delete_turn(&self, session_id: &SessionId, turn_id: &TurnId) -> Result<bool, EngineError> {
        self.resolve_session(session_id).await?;
        Ok(self.store.delete_turn(session_id, turn_id)?)
    }

    fn restore_world(&self, session_id: &SessionId, snapshot: Option<Snapshot>) {
        self.orchestrator.world().restore(snapshot);
        if !self.events.world_state_updated(WorldStateUpdated {
            session_id: session_id.clone(),
            restored: true,
        }) {
            warn!("no world-state listeners, event dropped");
        }
    }

    fn publish_turn(&self, session_id: &SessionId, turn: &Turn) {
        if !self.events.turn_persisted(TurnPersisted {
            session_id: session_id.clone(),
            turn_id: turn.id.clone(),
            role: turn.role,
        }) {
            warn!(turn_id = %turn.id, "no turn listeners, event dropped");
        }
    }
}
