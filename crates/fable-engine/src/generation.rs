//! Generation orchestrator.
//!
//! Drives one generation at a time against the narrative generator, feeding
//! streamed text to an observer and folding world-state directives out of the
//! final text. The orchestrator owns a single-slot register holding the
//! current generation; starting a new one cancels whatever occupied the slot.

use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fable_core::errors::GenerationError;
use fable_core::events::{EngineEvents, GenerationOutcome, GenerationTerminal};
use fable_core::generation::{
    GenerationEvent, GenerationMode, GenerationOutput, GenerationRequest, GenerationWarning,
    NarrativeGenerator,
};
use fable_core::ids::GenerationId;
use fable_core::render::{DisplayFormatter, PlainFormatter};
use fable_core::turn::Snapshot;
use fable_core::world::WorldStateEngine;

use crate::error::EngineError;

/// Receives progress for one generation. Calls for a given generation are
/// made in order from a single task, never concurrently.
pub trait GenerationObserver: Send + Sync {
    fn on_start(&self) {}
    /// Newly produced text.
    fn on_increment(&self, _delta: &str) {}
    /// Everything produced so far.
    fn on_full_text(&self, _text: &str) {}
    /// Only called once the generation has settled as completed.
    fn on_end(&self, _output: &GenerationOutput) {}
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl GenerationObserver for NoopObserver {}

#[derive(Clone)]
struct Backend {
    generator: Arc<dyn NarrativeGenerator>,
    world: Arc<dyn WorldStateEngine>,
    formatter: Arc<dyn DisplayFormatter>,
}

struct Shared {
    current: Mutex<Option<Arc<HandleState>>>,
    events: EngineEvents,
}

struct HandleState {
    id: GenerationId,
    cancel: CancellationToken,
    outcome: OnceLock<GenerationOutcome>,
}

impl HandleState {
    /// Record the outcome and release the slot. Only the first call has any
    /// effect.
    fn settle(self: &Arc<Self>, shared: &Shared, outcome: GenerationOutcome) -> bool {
        if self.outcome.set(outcome.clone()).is_err() {
            return false;
        }
        {
            let mut current = shared.current.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, self)) {
                *current = None;
            }
        }
        debug!(generation_id = %self.id, ?outcome, "generation settled");
        if !shared.events.generation_terminal(GenerationTerminal {
            generation_id: self.id.clone(),
            outcome,
        }) {
            warn!(generation_id = %self.id, "no generation listeners, terminal event dropped");
        }
        true
    }

    fn cancel(self: &Arc<Self>, shared: &Shared) {
        self.cancel.cancel();
        self.settle(shared, GenerationOutcome::Cancelled);
    }

    fn is_cancelled(&self) -> bool {
        self.outcome.get() == Some(&GenerationOutcome::Cancelled)
    }
}

/// A running generation.
pub struct GenerationHandle {
    state: Arc<HandleState>,
    shared: Arc<Shared>,
    join: JoinHandle<Result<GenerationOutput, GenerationError>>,
}

impl GenerationHandle {
    pub fn id(&self) -> &GenerationId {
        &self.state.id
    }

    /// Stop the generation. Safe to call repeatedly and after completion;
    /// a generation that already completed stays completed.
    pub fn cancel(&self) {
        self.state.cancel(&self.shared);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.state.outcome.get().is_some()
    }

    /// Wait for the terminal result. `None` means the generation was
    /// cancelled; its text, if any, must not be persisted.
    pub async fn await_result(self) -> Result<Option<GenerationOutput>, GenerationError> {
        let result = self
            .join
            .await
            .map_err(|e| GenerationError::StreamInterrupted(format!("generation task failed: {e}")))?;
        if self.state.is_cancelled() {
            return Ok(None);
        }
        match result {
            Ok(output) => Ok(Some(output)),
            Err(GenerationError::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub struct GenerationOrchestrator {
    backend: Backend,
    shared: Arc<Shared>,
}

impl GenerationOrchestrator {
    pub fn new(
        generator: Arc<dyn NarrativeGenerator>,
        world: Arc<dyn WorldStateEngine>,
        events: EngineEvents,
    ) -> Self {
        Self {
            backend: Backend {
                generator,
                world,
                formatter: Arc::new(PlainFormatter),
            },
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn DisplayFormatter>) -> Self {
        self.backend.formatter = formatter;
        self
    }

    pub fn world(&self) -> &Arc<dyn WorldStateEngine> {
        &self.backend.world
    }

    /// Display form of `text`, as produced for a terminal result.
    pub fn render(&self, text: &str) -> String {
        self.backend.formatter.to_display(text)
    }

    /// Start a generation, cancelling the one currently in the slot.
    ///
    /// `prior` is the snapshot world-state directives are folded into; with
    /// no prior the result carries no new snapshot.
    #[instrument(skip_all, fields(generator = self.backend.generator.name(), mode = ?request.mode))]
    pub fn start(
        &self,
        request: GenerationRequest,
        prior: Option<Snapshot>,
        observer: Arc<dyn GenerationObserver>,
    ) -> GenerationHandle {
        let state = Arc::new(HandleState {
            id: GenerationId::new(),
            cancel: CancellationToken::new(),
            outcome: OnceLock::new(),
        });

        let previous = self.shared.current.lock().replace(state.clone());
        if let Some(previous) = previous {
            info!(previous = %previous.id, next = %state.id, "cancelling superseded generation");
            previous.cancel(&self.shared);
        }

        let backend = self.backend.clone();
        let shared = self.shared.clone();
        let task_state = state.clone();
        let join = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = task_state.cancel.cancelled() => Err(GenerationError::Cancelled),
                r = backend.run(&request, prior.as_ref(), observer.as_ref()) => r,
            };
            let outcome = match &result {
                Ok(_) => GenerationOutcome::Completed,
                Err(GenerationError::Cancelled) => GenerationOutcome::Cancelled,
                Err(e) => {
                    warn!(generation_id = %task_state.id, kind = e.error_kind(), error = %e, "generation failed");
                    GenerationOutcome::Failed
                }
            };
            let completed = outcome == GenerationOutcome::Completed;
            if task_state.settle(&shared, outcome) && completed {
                if let Ok(output) = &result {
                    observer.on_end(output);
                }
            }
            result
        });

        GenerationHandle {
            state,
            shared: self.shared.clone(),
            join,
        }
    }

    /// Start and wait. Cancellation surfaces as `GenerationInterrupted`.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        prior: Option<Snapshot>,
    ) -> Result<GenerationOutput, EngineError> {
        self.start(request, prior, Arc::new(NoopObserver))
            .await_result()
            .await?
            .ok_or(EngineError::GenerationInterrupted)
    }

    /// Cancel whatever generation is current. Returns false if none was.
    pub fn cancel_current(&self) -> bool {
        let current = self.shared.current.lock().clone();
        match current {
            Some(state) => {
                state.cancel(&self.shared);
                true
            }
            None => false,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.shared.current.lock().is_some()
    }
}

impl Backend {
    async fn run(
        &self,
        request: &GenerationRequest,
        prior: Option<&Snapshot>,
        observer: &dyn GenerationObserver,
    ) -> Result<GenerationOutput, GenerationError> {
        let text = self.produce_text(request, observer).await?;
        Ok(self.finalize(text, prior))
    }

    async fn produce_text(
        &self,
        request: &GenerationRequest,
        observer: &dyn GenerationObserver,
    ) -> Result<String, GenerationError> {
        observer.on_start();
        if request.mode == GenerationMode::Sync {
            let text = self.generator.generate(request).await?;
            observer.on_full_text(&text);
            return Ok(text);
        }

        let mut stream = self.generator.stream(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                GenerationEvent::Start => {}
                GenerationEvent::Increment { delta } => {
                    text.push_str(&delta);
                    observer.on_increment(&delta);
                    observer.on_full_text(&text);
                }
                GenerationEvent::FullText { text: full } => {
                    text = full;
                    observer.on_full_text(&text);
                }
                // The terminal text wins over anything accumulated.
                GenerationEvent::End { text } => return Ok(text),
                GenerationEvent::Error { error } => return Err(GenerationError::StreamInterrupted(error)),
            }
        }
        Err(GenerationError::StreamInterrupted(
            "stream ended without a terminal event".into(),
        ))
    }

    fn finalize(&self, text: String, prior: Option<&Snapshot>) -> GenerationOutput {
        let rendered_text = self.formatter.to_display(&text);
        let mut warnings = Vec::new();
        let new_snapshot = match prior {
            None => None,
            Some(prior) => match self.world.parse(&text, prior) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let warning = GenerationWarning::WorldStateParseFailed(e.0);
                    warn!(kind = warning.kind(), %warning, "keeping generated text");
                    warnings.push(warning);
                    None
                }
            },
        };
        GenerationOutput {
            text,
            rendered_text,
            new_snapshot,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::mock::{MockGenerator, MockResponse, ScriptedWorld};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl GenerationObserver for Recorder {
        fn on_start(&self) {
            self.calls.lock().push("start".into());
        }
        fn on_increment(&self, delta: &str) {
            self.calls.lock().push(format!("inc:{delta}"));
        }
        fn on_full_text(&self, text: &str) {
            self.calls.lock().push(format!("full:{text}"));
        }
        fn on_end(&self, output: &GenerationOutput) {
            self.calls.lock().push(format!("end:{}", output.text));
        }
    }

    fn request(mode: GenerationMode) -> GenerationRequest {
        GenerationRequest {
            input: "go north".into(),
            history: Vec::new(),
            mode,
        }
    }

    fn setup(responses: Vec<MockResponse>) -> (GenerationOrchestrator, Arc<MockGenerator>, Arc<ScriptedWorld>, EngineEvents) {
        let generator = Arc::new(MockGenerator::new(responses));
        let world = Arc::new(ScriptedWorld::new(None));
        let events = EngineEvents::new();
        let orchestrator = GenerationOrchestrator::new(generator.clone(), world.clone(), events.clone());
        (orchestrator, generator, world, events)
    }

    #[tokio::test]
    async fn stream_callbacks_in_order() {
        let (orch, _, _, _) = setup(vec![MockResponse::chunks(&["Hel", "lo"])]);
        let recorder = Arc::new(Recorder::default());

        let output = orch
            .start(request(GenerationMode::Stream), None, recorder.clone())
            .await_result()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(output.text, "Hello");
        assert_eq!(
            recorder.calls(),
            vec!["start", "inc:Hel", "full:Hel", "inc:lo", "full:Hello", "end:Hello"]
        );
        assert!(!orch.is_generating());
    }

    #[tokio::test]
    async fn full_text_events_replace_accumulated_text() {
        let (orch, _, _, _) = setup(vec![MockResponse::Stream(vec![
            GenerationEvent::Start,
            GenerationEvent::Increment { delta: "draft".into() },
            GenerationEvent::FullText { text: "rewritten".into() },
            GenerationEvent::End { text: "rewritten!".into() },
        ])]);
        let recorder = Arc::new(Recorder::default());
        let output = orch
            .start(request(GenerationMode::Stream), None, recorder.clone())
            .await_result()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.text, "rewritten!");
        assert!(recorder.calls().contains(&"full:rewritten".to_string()));
    }

    #[tokio::test]
    async fn sync_mode_renders_once() {
        let (orch, generator, _, _) = setup(vec![MockResponse::text("  The gate opens.  ")]);
        let output = orch.generate(request(GenerationMode::Sync), None).await.unwrap();
        assert_eq!(output.rendered_text, "The gate opens.");
        assert_eq!(output.text, "  The gate opens.  ");
        assert_eq!(generator.requests()[0].mode, GenerationMode::Sync);
    }

    #[tokio::test]
    async fn directives_parsed_against_prior() {
        let (orch, _, world, _) = setup(vec![
            MockResponse::text("You step inside. [[set room=hall]]"),
            MockResponse::text("You step inside. [[set room=hall]]"),
        ]);
        let prior = Snapshot::new(json!({"room": "gate"}));

        let output = orch
            .generate(request(GenerationMode::Stream), Some(prior.clone()))
            .await
            .unwrap();
        assert_eq!(output.new_snapshot, Some(Snapshot::new(json!({"room": "hall"}))));
        assert_eq!(world.parse_priors(), vec![prior]);

        let output = orch.generate(request(GenerationMode::Stream), None).await.unwrap();
        assert_eq!(output.new_snapshot, None);
        assert_eq!(world.parse_priors().len(), 1);
    }

    #[tokio::test]
    async fn parse_failure_is_a_warning() {
        let (orch, _, world, _) = setup(vec![MockResponse::text("Text survives. [[set a=1]]")]);
        world.fail_next_parse("bad directive");

        let output = orch
            .generate(request(GenerationMode::Stream), Some(Snapshot::new(json!({}))))
            .await
            .unwrap();
        assert_eq!(output.text, "Text survives. [[set a=1]]");
        assert_eq!(output.new_snapshot, None);
        assert_eq!(
            output.warnings,
            vec![GenerationWarning::WorldStateParseFailed("bad directive".into())]
        );
    }

    #[tokio::test]
    async fn stream_error_fails_generation() {
        let (orch, _, _, events) = setup(vec![MockResponse::stream_error("connection reset")]);
        let mut rx = events.subscribe_generations();
        let result = orch
            .start(request(GenerationMode::Stream), None, Arc::new(NoopObserver))
            .await_result()
            .await;
        assert!(matches!(result, Err(GenerationError::StreamInterrupted(_))));
        assert_eq!(rx.recv().await.unwrap().outcome, GenerationOutcome::Failed);
    }

    #[tokio::test]
    async fn stream_without_terminal_event_is_interrupted() {
        let (orch, _, _, _) = setup(vec![MockResponse::Stream(vec![
            GenerationEvent::Start,
            GenerationEvent::Increment { delta: "half".into() },
        ])]);
        let result = orch.generate(request(GenerationMode::Stream), None).await;
        assert!(matches!(
            result,
            Err(EngineError::Generation(GenerationError::StreamInterrupted(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (orch, _, _, events) = setup(vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::text("too late"),
        )]);
        let mut rx = events.subscribe_generations();

        let handle = orch.start(request(GenerationMode::Stream), None, Arc::new(NoopObserver));
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(!orch.is_generating());

        assert_eq!(handle.await_result().await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap().outcome, GenerationOutcome::Cancelled);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let (orch, _, _, events) = setup(vec![MockResponse::text("done")]);
        let mut rx = events.subscribe_generations();

        let handle = orch.start(request(GenerationMode::Stream), None, Arc::new(NoopObserver));
        assert_eq!(rx.recv().await.unwrap().outcome, GenerationOutcome::Completed);
        handle.cancel();
        handle.cancel();
        assert!(!handle.is_cancelled());
        assert!(handle.is_finished());

        let output = handle.await_result().await.unwrap().unwrap();
        assert_eq!(output.text, "done");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_cancels_first() {
        let (orch, generator, _, events) = setup(vec![
            MockResponse::delayed(Duration::from_secs(30), MockResponse::text("first")),
            MockResponse::text("second"),
        ]);
        let mut rx = events.subscribe_generations();

        let first = orch.start(request(GenerationMode::Stream), None, Arc::new(NoopObserver));
        while generator.call_count() < 1 {
            tokio::task::yield_now().await;
        }
        let second = orch.start(request(GenerationMode::Stream), None, Arc::new(NoopObserver));

        assert!(first.is_cancelled());
        assert_eq!(first.await_result().await.unwrap(), None);
        let output = second.await_result().await.unwrap().unwrap();
        assert_eq!(output.text, "second");

        assert_eq!(rx.recv().await.unwrap().outcome, GenerationOutcome::Cancelled);
        assert_eq!(rx.recv().await.unwrap().outcome, GenerationOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_current_stops_paced_stream() {
        let (orch, _, _, _) = setup(vec![MockResponse::paced(
            Duration::from_secs(1),
            &["one ", "two ", "three"],
        )]);
        let recorder = Arc::new(Recorder::default());
        let handle = orch.start(request(GenerationMode::Stream), None, recorder.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(orch.cancel_current());
        assert!(!orch.cancel_current());

        assert_eq!(handle.await_result().await.unwrap(), None);
        assert!(!recorder.calls().iter().any(|c| c.starts_with("end:")));
    }

    /// Cancels the current generation as soon as any text arrives.
    struct CancelOnText {
        orchestrator: Arc<GenerationOrchestrator>,
        recorder: Recorder,
    }

    impl GenerationObserver for CancelOnText {
        fn on_full_text(&self, text: &str) {
            self.orchestrator.cancel_current();
            self.recorder.on_full_text(text);
        }
        fn on_end(&self, output: &GenerationOutput) {
            self.recorder.on_end(output);
        }
    }

    #[tokio::test]
    async fn no_end_callback_when_cancelled_before_settling() {
        let (orch, _, _, events) = setup(vec![MockResponse::chunks(&["all ", "at once"])]);
        let orch = Arc::new(orch);
        let mut rx = events.subscribe_generations();
        let observer = Arc::new(CancelOnText {
            orchestrator: orch.clone(),
            recorder: Recorder::default(),
        });

        let handle = orch.start(request(GenerationMode::Stream), None, observer.clone());

        assert_eq!(handle.await_result().await.unwrap(), None);
        let calls = observer.recorder.calls();
        assert_eq!(calls.first().map(String::as_str), Some("full:all "));
        assert!(!calls.iter().any(|c| c.starts_with("end:")));
        assert_eq!(rx.recv().await.unwrap().outcome, GenerationOutcome::Cancelled);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
