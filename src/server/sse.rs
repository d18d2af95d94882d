//! Server-sent events framing
//!
//! Every fragment becomes one SSE event. Each line of the fragment is sent
//! as its own `data:` line and the event ends with a blank line, so a client
//! joining the data lines of an event with `\n` recovers the fragment
//! exactly. The stream ends with a `done` event carrying `[DONE]`, or with an
//! `error` event when generation failed.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::{self, Stream, StreamExt};

use crate::inference::FragmentStream;

/// Payload of the terminal event
pub const DONE_DATA: &str = "[DONE]";

/// Event name of the terminal event
pub const DONE_EVENT: &str = "done";

/// Event name of a failure
pub const ERROR_EVENT: &str = "error";

// Event::data splits on '\n' but rejects '\r'
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// One fragment as a single SSE event
pub fn fragment_event(fragment: &str) -> Event {
    Event::default().data(normalize_newlines(fragment))
}

/// A generation failure as an `error` event
pub fn error_event(message: &str) -> Event {
    Event::default()
        .event(ERROR_EVENT)
        .data(normalize_newlines(message))
}

/// Terminal event sent after the last fragment
pub fn done_event() -> Event {
    Event::default().event(DONE_EVENT).data(DONE_DATA)
}

/// Turns a fragment stream into SSE events.
///
/// A cancelled generation ends the event stream silently: the client that
/// cancelled it is gone.
pub fn events(fragments: FragmentStream) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(Some(fragments), |state| async move {
        let mut fragments = state?;
        match fragments.next().await {
            Some(Ok(text)) => Some((fragment_event(&text), Some(fragments))),
            Some(Err(e)) if e.is_cancelled() => {
                tracing::debug!("Stream cancelled by client");
                None
            }
            Some(Err(e)) => {
                tracing::warn!("Stream failed: {}", e);
                Some((error_event(&e.to_string()), None))
            }
            None => Some((done_event(), None)),
        }
    })
    .map(Ok::<_, Infallible>)
}

/// One decoded SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if present
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.event.as_deref() == Some(DONE_EVENT) && self.data == DONE_DATA
    }
}

/// Incremental SSE parser for blank-line-terminated events
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds received text and returns every event it completes.
    ///
    /// Comment-only blocks (keep-alives) produce no event.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block[..end]) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in block.split('\n') {
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start().to_string());
        }
    }

    data.map(|data| SseEvent { event, data })
}
