//! Ordered processing queue.
//!
//! Tasks are enqueued synchronously from the stream side and processed one
//! at a time by a single worker task that owns the [`TaskProcessor`]. Task
//! `n + 1` starts only after task `n` has finished, so side effects land in
//! enqueue order whatever their individual latency. Each enqueue gets a
//! [`TaskHandle`] that resolves when that task finishes; dropping the handle
//! does not cancel the task.
//!
//! A failed or panicking task is reported to its handle and to
//! [`TaskProcessor::task_failed`], and the worker moves on to the next task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{PipelineError, Result};

/// Processes queued tasks strictly one after another.
#[async_trait]
pub trait TaskProcessor: Send + 'static {
    /// Unit of work.
    type Task: Send + 'static;
    /// What a finished task reports back.
    type Output: Send + 'static;

    /// Process one task. State changes made here are visible to every later
    /// task.
    async fn process(&mut self, task_id: u64, task: Self::Task) -> Result<Self::Output>;

    /// Called after a task failed, before the next task starts.
    fn task_failed(&mut self, task_id: u64, error: &PipelineError) {
        let _ = (task_id, error);
    }
}

struct Job<T, O> {
    id: u64,
    task: T,
    reply: oneshot::Sender<Result<O>>,
}

/// Completion handle for one enqueued task.
#[derive(Debug)]
pub struct TaskHandle<O> {
    id: u64,
    rx: oneshot::Receiver<Result<O>>,
}

impl<O> TaskHandle<O> {
    /// Queue-assigned task id (monotonic from 1).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the task to finish.
    pub async fn wait(self) -> Result<O> {
        self.rx.await.map_err(|_| PipelineError::QueueClosed)?
    }
}

/// Enqueue side of an [`OrderedQueue`]. Cheap to clone; the queue drains and
/// stops once every sender is gone.
pub struct QueueSender<P: TaskProcessor> {
    tx: mpsc::UnboundedSender<Job<P::Task, P::Output>>,
    next_id: Arc<AtomicU64>,
}

impl<P: TaskProcessor> Clone for QueueSender<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<P: TaskProcessor> QueueSender<P> {
    /// Append a task. Never blocks.
    pub fn enqueue(&self, task: P::Task) -> Result<TaskHandle<P::Output>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { id, task, reply })
            .map_err(|_| PipelineError::QueueClosed)?;
        Ok(TaskHandle { id, rx })
    }
}

/// FIFO queue drained by a single worker.
pub struct OrderedQueue<P: TaskProcessor> {
    sender: QueueSender<P>,
    worker: JoinHandle<P>,
}

impl<P: TaskProcessor> OrderedQueue<P> {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn spawn(processor: P) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(rx, processor));
        Self {
            sender: QueueSender {
                tx,
                next_id: Arc::new(AtomicU64::new(0)),
            },
            worker,
        }
    }

    /// Another enqueue handle.
    pub fn sender(&self) -> QueueSender<P> {
        self.sender.clone()
    }

    /// Append a task.
    pub fn enqueue(&self, task: P::Task) -> Result<TaskHandle<P::Output>> {
        self.sender.enqueue(task)
    }

    /// Stop accepting tasks from this handle and wait until every queued
    /// task has run. Tasks from other senders are still accepted until those
    /// are dropped. Returns the processor.
    pub async fn drain(self) -> Result<P> {
        drop(self.sender);
        self.worker
            .await
            .map_err(|e| PipelineError::Handler(format!("queue worker failed: {e}")))
    }
}

async fn drain<P: TaskProcessor>(mut rx: mpsc::UnboundedReceiver<Job<P::Task, P::Output>>, mut processor: P) -> P {
    while let Some(job) = rx.recv().await {
        let outcome = AssertUnwindSafe(processor.process(job.id, job.task))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PipelineError::Handler(panic_message(&*panic))));

        if let Err(ref error) = outcome {
            warn!(task_id = job.id, error = %error, "queued task failed; continuing");
            processor.task_failed(job.id, error);
        }
        if job.reply.send(outcome).is_err() {
            debug!(task_id = job.id, "task handle dropped before completion");
        }
    }
    processor
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
