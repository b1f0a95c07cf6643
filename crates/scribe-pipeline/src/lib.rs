//! # scribe-pipeline
//!
//! Ordered stream-to-storage persistence for model responses.
//!
//! A provider stream is wrapped in a [`TeeStream`]: the caller reads it
//! untouched while a copy of every chunk goes onto an [`OrderedQueue`]. One
//! worker drains the queue in arrival order, applying each chunk through the
//! [`StreamDispatcher`] to the turn's [`StreamContext`] and the
//! [`TranscriptStore`]. When the stream ends and the queue is empty the turn
//! is finalized and [`TurnHandle::finished`] resolves.
//!
//! ```text
//! provider ──► TeeStream ──► caller
//!                  │
//!                  └─► OrderedQueue ──► StreamDispatcher ──► TranscriptStore
//!                                             │ (drained)
//!                                             └─► finalize_turn ──► TurnOutcome
//! ```

#![deny(unsafe_code)]

pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod finalizer;
pub mod queue;
pub mod store;
pub mod tee;
pub mod title;

use std::sync::Arc;

use scribe_core::{ChatId, TurnStatus};
use scribe_settings::PipelineSettings;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

pub use context::StreamContext;
pub use dispatcher::{DispatchSnapshot, QueueEvent, StreamDispatcher};
pub use errors::{PipelineError, Result};
pub use finalizer::{CompactionHook, NoopCompaction, TurnOutcome, finalize_turn};
pub use queue::{OrderedQueue, QueueSender, TaskHandle, TaskProcessor};
pub use store::{SqliteTranscriptStore, TranscriptStore, TurnRequest};
pub use tee::TeeStream;

/// Starts turns and wires their persistence.
#[derive(Clone)]
pub struct TurnPipeline {
    store: Arc<dyn TranscriptStore>,
    settings: PipelineSettings,
    compaction: Arc<dyn CompactionHook>,
}

impl TurnPipeline {
    /// A pipeline writing through `store`.
    pub fn new(store: Arc<dyn TranscriptStore>, settings: PipelineSettings) -> Self {
        Self {
            store,
            settings,
            compaction: Arc::new(NoopCompaction),
        }
    }

    /// Run `hook` after every completed turn.
    #[must_use]
    pub fn with_compaction(mut self, hook: Arc<dyn CompactionHook>) -> Self {
        self.compaction = hook;
        self
    }

    /// Open a turn and start persisting `source`.
    ///
    /// Returns the pass-through stream for the caller and a handle that
    /// resolves once every chunk is persisted and the turn is finalized.
    /// The turn does not finish until the returned stream has ended or been
    /// dropped.
    pub async fn start<S>(&self, request: TurnRequest, source: S) -> Result<(TeeStream<S>, TurnHandle)> {
        let start = self
            .store
            .begin_turn(&request, self.settings.first_message_order)
            .await?;
        let chat_id = request.chat_id;
        let turn_id = start.turn.turn_id;
        info!(chat_id = %chat_id, turn_id, "turn started");

        let ctx = StreamContext::new(chat_id.clone(), turn_id, start.next_order);
        let queue = OrderedQueue::spawn(StreamDispatcher::new(Arc::clone(&self.store), ctx));
        let tee = TeeStream::new(source, queue.sender());

        let (done_tx, done_rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let settings = self.settings.clone();
        let compaction = Arc::clone(&self.compaction);
        let worker_chat = chat_id.clone();
        drop(tokio::spawn(async move {
            let outcome = match queue.drain().await {
                Ok(dispatcher) => {
                    let (store, ctx) = dispatcher.into_parts();
                    finalize_turn(store, ctx, &settings, compaction).await
                }
                Err(err) => {
                    error!(chat_id = %worker_chat, turn_id, error = %err, "turn queue failed");
                    if let Err(mark) = store.fail_turn(&worker_chat, turn_id, err.to_string()).await {
                        error!(chat_id = %worker_chat, turn_id, error = %mark, "failed to mark turn errored");
                    }
                    TurnOutcome {
                        chat_id: worker_chat,
                        turn_id,
                        final_text: String::new(),
                        errors: vec![err.to_string()],
                        turn_status: TurnStatus::Error,
                    }
                }
            };
            if done_tx.send(outcome).is_err() {
                debug!(turn_id, "turn handle dropped before the turn finished");
            }
        }));

        Ok((
            tee,
            TurnHandle {
                chat_id,
                turn_id,
                done: done_rx,
            },
        ))
    }
}

/// Completion handle for a running turn.
#[derive(Debug)]
pub struct TurnHandle {
    chat_id: ChatId,
    turn_id: i64,
    done: oneshot::Receiver<TurnOutcome>,
}

impl TurnHandle {
    /// Owning chat.
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// Turn number.
    pub fn turn_id(&self) -> i64 {
        self.turn_id
    }

    /// Wait until every chunk is persisted and the turn is finalized.
    pub async fn finished(self) -> Result<TurnOutcome> {
        self.done.await.map_err(|_| PipelineError::QueueClosed)
    }
}
