//! Streaming inference support
//!
//! The blocking producer pushes [`StreamEvent`]s into a bounded channel and
//! the caller pulls them out through a [`FragmentStream`]. The execution
//! guard travels down the same channel as the last event, so the engine lock
//! is released only after the consumer has seen every fragment, or as soon as
//! the consumer goes away.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::inference::engine::{EngineError, Exclusive};

/// Number of fragments the producer may run ahead of the consumer
pub(crate) const FRAGMENT_BUFFER: usize = 32;

/// Messages from the generation worker to the consumer
pub(crate) enum StreamEvent {
    /// A generated piece of text
    Fragment(String),
    /// Generation failed; no more fragments follow
    Failed(EngineError),
    /// Generation is over; dropping the guard releases the engine
    Finished(Exclusive),
}

impl std::fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEvent::Fragment(text) => f.debug_tuple("Fragment").field(text).finish(),
            StreamEvent::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
            StreamEvent::Finished(_) => f.write_str("Finished"),
        }
    }
}

/// Lazy, single-pass sequence of generated text fragments.
///
/// Yields `Ok(fragment)` in production order. A terminal `Err` is yielded at
/// most once: [`EngineError::Cancelled`] when the caller's token fired, or the
/// executor's error. Dropping the stream cancels the producer.
pub struct FragmentStream {
    inner: BoxStream<'static, Result<String, EngineError>>,
}

impl FragmentStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, token: CancellationToken) -> Self {
        let consumer = Consumer {
            rx,
            _cancel_on_drop: token.clone().drop_guard(),
            token,
            done: false,
        };

        let inner = stream::unfold(consumer, |mut consumer| async move {
            let item = consumer.next().await?;
            Some((item, consumer))
        })
        .boxed();

        Self { inner }
    }

    /// Drains the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, EngineError> {
        let mut reply = String::new();
        while let Some(piece) = self.next().await {
            reply.push_str(&piece?);
        }
        Ok(reply)
    }
}

impl Stream for FragmentStream {
    type Item = Result<String, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct Consumer {
    rx: mpsc::Receiver<StreamEvent>,
    token: CancellationToken,
    // Fires the token when the stream is dropped early.
    _cancel_on_drop: DropGuard,
    done: bool,
}

impl Consumer {
    async fn next(&mut self) -> Option<Result<String, EngineError>> {
        if self.done {
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.shut();
                return Some(Err(EngineError::Cancelled));
            }
            event = self.rx.recv() => event,
        };

        match event {
            Some(StreamEvent::Fragment(text)) => Some(Ok(text)),
            Some(StreamEvent::Failed(error)) => {
                self.shut();
                Some(Err(error))
            }
            Some(StreamEvent::Finished(guard)) => {
                drop(guard);
                self.shut();
                None
            }
            None => {
                // Producer went away without handing back the guard.
                self.shut();
                if self.token.is_cancelled() {
                    Some(Err(EngineError::Cancelled))
                } else {
                    Some(Err(EngineError::Worker(
                        "generation worker exited unexpectedly".to_string(),
                    )))
                }
            }
        }
    }

    /// Stops accepting events and drops anything still buffered, including
    /// the execution guard if the producer already sent it.
    fn shut(&mut self) {
        self.done = true;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
