//! Deterministic collaborators for tests and demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use fable_core::errors::{GenerationError, WorldStateError};
use fable_core::generation::{GenerationEvent, GenerationRequest, GenerationStream, NarrativeGenerator};
use fable_core::summarizer::Summarizer;
use fable_core::turn::{Snapshot, TurnSummary};
use fable_core::world::{NarrativeTime, WorldStateEngine};

/// Pre-programmed generator responses, consumed one per call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// A complete reply; streamed as Start, one Increment, End.
    Text(String),
    /// Yield exactly these events.
    Stream(Vec<GenerationEvent>),
    /// Yield these events, one per interval.
    Paced(Duration, Vec<GenerationEvent>),
    /// Fail the call itself.
    Error(GenerationError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    /// Stream `chunks` as increments followed by an End carrying the joined text.
    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Stream(chunk_events(chunks))
    }

    pub fn paced(interval: Duration, chunks: &[&str]) -> Self {
        Self::Paced(interval, chunk_events(chunks))
    }

    /// A stream that starts, then fails.
    pub fn stream_error(error: &str) -> Self {
        Self::Stream(vec![
            GenerationEvent::Start,
            GenerationEvent::Error {
                error: error.to_string(),
            },
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn chunk_events(chunks: &[&str]) -> Vec<GenerationEvent> {
    let mut events = vec![GenerationEvent::Start];
    events.extend(chunks.iter().map(|c| GenerationEvent::Increment {
        delta: c.to_string(),
    }));
    events.push(GenerationEvent::End {
        text: chunks.concat(),
    });
    events
}

/// Generator that replays scripted responses in order and records every request.
pub struct MockGenerator {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<GenerationRequest>>,
    call_count: AtomicUsize,
}

impl MockGenerator {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self, request: &GenerationRequest) -> Result<MockResponse, GenerationError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());
        self.responses.lock().pop_front().ok_or_else(|| {
            GenerationError::InvalidRequest(format!("MockGenerator: no response configured for call {idx}"))
        })
    }
}

/// Unwrap delays iteratively, sleeping for each.
async fn resolve(mut response: MockResponse) -> MockResponse {
    while let MockResponse::Delay(duration, inner) = response {
        tokio::time::sleep(duration).await;
        response = *inner;
    }
    response
}

fn unresolved_delay() -> GenerationError {
    GenerationError::InvalidRequest("MockGenerator: unresolved delay".into())
}

#[async_trait]
impl NarrativeGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let response = self.next_response(request)?;
        let events = match resolve(response).await {
            MockResponse::Text(text) => return Ok(text),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Stream(events) | MockResponse::Paced(_, events) => events,
            MockResponse::Delay(..) => return Err(unresolved_delay()),
        };

        let mut text = String::new();
        for event in events {
            match event {
                GenerationEvent::Increment { delta } => text.push_str(&delta),
                GenerationEvent::FullText { text: full } => text = full,
                GenerationEvent::End { text } => return Ok(text),
                GenerationEvent::Error { error } => return Err(GenerationError::StreamInterrupted(error)),
                GenerationEvent::Start => {}
            }
        }
        Err(GenerationError::StreamInterrupted("script ended without End".into()))
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<GenerationStream, GenerationError> {
        let response = self.next_response(request)?;
        match resolve(response).await {
            MockResponse::Text(text) => Ok(Box::pin(stream::iter(vec![
                GenerationEvent::Start,
                GenerationEvent::Increment { delta: text.clone() },
                GenerationEvent::End { text },
            ]))),
            MockResponse::Stream(events) => Ok(Box::pin(stream::iter(events))),
            MockResponse::Paced(interval, events) => Ok(Box::pin(tokio_stream::StreamExt::throttle(
                stream::iter(events),
                interval,
            ))),
            MockResponse::Error(e) => Err(e),
            MockResponse::Delay(..) => Err(unresolved_delay()),
        }
    }
}

const DIRECTIVE_OPEN: &str = "[[set ";
const DIRECTIVE_CLOSE: &str = "]]";

/// World-state engine whose snapshots are JSON objects.
///
/// Generated text changes the world through `[[set key=value]]` markers;
/// values that parse as JSON are stored as such, anything else as a string.
#[derive(Default)]
pub struct ScriptedWorld {
    current: Mutex<Option<Snapshot>>,
    time: Mutex<Option<NarrativeTime>>,
    fail_next: Mutex<Option<String>>,
    parse_priors: Mutex<Vec<Snapshot>>,
    restores: AtomicUsize,
}

impl ScriptedWorld {
    pub fn new(initial: Option<Snapshot>) -> Self {
        Self {
            current: Mutex::new(initial),
            ..Default::default()
        }
    }

    pub fn with_time(self, date: &str, time: &str) -> Self {
        self.set_time(date, time);
        self
    }

    pub fn set_time(&self, date: &str, time: &str) {
        *self.time.lock() = Some(NarrativeTime {
            date: date.to_string(),
            time: time.to_string(),
        });
    }

    /// Make the next `parse` call fail with `reason`.
    pub fn fail_next_parse(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    /// Every prior snapshot `parse` was called with, in order.
    pub fn parse_priors(&self) -> Vec<Snapshot> {
        self.parse_priors.lock().clone()
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::Relaxed)
    }
}

impl WorldStateEngine for ScriptedWorld {
    fn parse(&self, text: &str, prior: &Snapshot) -> Result<Option<Snapshot>, WorldStateError> {
        self.parse_priors.lock().push(prior.clone());
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(WorldStateError(reason));
        }

        let mut assignments = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find(DIRECTIVE_OPEN) {
            let body_start = start + DIRECTIVE_OPEN.len();
            let len = rest[body_start..]
                .find(DIRECTIVE_CLOSE)
                .ok_or_else(|| WorldStateError("unterminated directive".into()))?;
            let body = &rest[body_start..body_start + len];
            let (key, value) = body
                .split_once('=')
                .ok_or_else(|| WorldStateError(format!("directive without '=': {body}")))?;
            let value = value.trim();
            let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            assignments.push((key.trim().to_string(), value));
            rest = &rest[body_start + len + DIRECTIVE_CLOSE.len()..];
        }

        if assignments.is_empty() {
            return Ok(None);
        }
        let mut object = prior
            .value()
            .as_object()
            .cloned()
            .ok_or_else(|| WorldStateError("prior snapshot is not an object".into()))?;
        object.extend(assignments);
        Ok(Some(Snapshot::new(serde_json::Value::Object(object))))
    }

    fn narrative_time(&self) -> Option<NarrativeTime> {
        self.time.lock().clone()
    }

    fn current(&self) -> Option<Snapshot> {
        self.current.lock().clone()
    }

    fn restore(&self, snapshot: Option<Snapshot>) {
        self.restores.fetch_add(1, Ordering::Relaxed);
        *self.current.lock() = snapshot;
    }
}

/// Summarizer that keeps the first sentence as the short form and the whole
/// text as the long form.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstSentenceSummarizer;

#[async_trait]
impl Summarizer for FirstSentenceSummarizer {
    async fn summarize(&self, text: &str) -> Option<TurnSummary> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let short = match text.find(['.', '!', '?']) {
            Some(end) => &text[..=end],
            None => text,
        };
        Some(TurnSummary {
            short: Some(short.to_string()),
            long: Some(text.to_string()),
        })
    }
}
