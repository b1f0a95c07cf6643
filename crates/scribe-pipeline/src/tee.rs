//! Pass-through stream that feeds the ordered queue.
//!
//! [`TeeStream`] yields every item of the provider stream unchanged and at
//! the moment it arrives. A clone of each chunk is enqueued on the side;
//! enqueueing never waits, so persistence latency never reaches the caller.
//! An error item is forwarded to the caller as-is and enqueued as a
//! transport failure. The queue is closed when the source ends or the tee is
//! dropped.

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use pin_project_lite::pin_project;
use scribe_core::StreamChunk;
use tracing::warn;

use crate::dispatcher::{QueueEvent, StreamDispatcher};
use crate::queue::QueueSender;

pin_project! {
    /// Wraps a provider stream, persisting a copy of every chunk.
    pub struct TeeStream<S> {
        #[pin]
        inner: S,
        sender: Option<QueueSender<StreamDispatcher>>,
    }
}

impl<S> TeeStream<S> {
    pub(crate) fn new(inner: S, sender: QueueSender<StreamDispatcher>) -> Self {
        Self {
            inner,
            sender: Some(sender),
        }
    }
}

impl<S, E> Stream for TeeStream<S>
where
    S: Stream<Item = Result<StreamChunk, E>>,
    E: Display,
{
    type Item = Result<StreamChunk, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));
        match &item {
            Some(item) => {
                if let Some(sender) = this.sender.as_ref() {
                    let event = match item {
                        Ok(chunk) => QueueEvent::Chunk(chunk.clone()),
                        Err(err) => QueueEvent::TransportFailure(err.to_string()),
                    };
                    if let Err(err) = sender.enqueue(event) {
                        warn!(error = %err, "could not enqueue chunk for persistence");
                    }
                }
            }
            None => *this.sender = None,
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
