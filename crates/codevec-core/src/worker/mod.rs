//! Worker execution.
//!
//! A worker takes one task at a time from the queue, drives the answer
//! collaborator and publishes every fragment on the session channel:
//! `start`, then each `chunk` in generation order, then exactly one of
//! `complete` or `error`. Failures are handed back to the queue, whose retry
//! and dead-letter policy decides what happens next.

pub mod answer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use codevec_redis::{Broker, Delivery, NackOutcome, TaskQueue};
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{CodevecError, CodevecResult};
use crate::stream::model::StreamEvent;
use crate::stream::publish_event;
use crate::task::model::Task;
use answer::AnswerSource;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Received,
    Answering,
    Streaming,
    Completed,
    Failed,
}

/// Runs single tasks against the answer collaborator.
pub struct TaskExecutor {
    broker: Arc<dyn Broker>,
    answers: Arc<dyn AnswerSource>,
}

impl TaskExecutor {
    pub fn new(broker: Arc<dyn Broker>, answers: Arc<dyn AnswerSource>) -> Self {
        Self { broker, answers }
    }

    /// Execute one task. Returns the number of chunks published.
    ///
    /// On failure an `error` event is published (best effort) and the
    /// failure is returned so the queue can retry or dead-letter the task.
    pub async fn execute(&self, task: &Task) -> CodevecResult<usize> {
        let mut phase = TaskPhase::Received;
        match self.run(task, &mut phase).await {
            Ok(chunks) => Ok(chunks),
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(
                    session_id = task.session_id(),
                    ?phase,
                    error = %message,
                    "Task failed"
                );
                let event = StreamEvent::error(&message);
                if let Err(publish_err) =
                    publish_event(self.broker.as_ref(), task.session_id(), &event).await
                {
                    warn!(
                        session_id = task.session_id(),
                        error = %publish_err,
                        "Failed to publish error event"
                    );
                }
                Err(CodevecError::WorkerExecution(message))
            }
        }
    }

    async fn run(&self, task: &Task, phase: &mut TaskPhase) -> anyhow::Result<usize> {
        let session_id = task.session_id();
        let broker = self.broker.as_ref();

        publish_event(broker, session_id, &StreamEvent::start())
            .await
            .context("publish start")?;

        *phase = TaskPhase::Answering;
        let mut fragments = self.answers.answer(session_id, task.query()).await?;

        *phase = TaskPhase::Streaming;
        let mut chunks = 0;
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            publish_event(broker, session_id, &StreamEvent::chunk(fragment))
                .await
                .context("publish chunk")?;
            chunks += 1;
        }

        publish_event(broker, session_id, &StreamEvent::complete())
            .await
            .context("publish complete")?;
        *phase = TaskPhase::Completed;
        debug!(session_id, chunks, "Task completed");
        Ok(chunks)
    }
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { task_id: String, chunks: usize },
    Failed { task_id: String, outcome: NackOutcome },
}

/// A fixed number of worker slots sharing one queue.
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    executor: Arc<TaskExecutor>,
    concurrency: usize,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        executor: Arc<TaskExecutor>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            visibility_timeout: config.visibility_timeout(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Run all slots until `shutdown` is cancelled. A task already in flight
    /// finishes before its slot exits. Alongside the slots, rows abandoned
    /// by dead workers are swept back onto the queue.
    pub async fn run(&self, shutdown: CancellationToken) -> CodevecResult<()> {
        info!(concurrency = self.concurrency, "Worker pool started");
        let mut slots = JoinSet::new();
        {
            let queue = Arc::clone(&self.queue);
            let visibility = self.visibility_timeout;
            let shutdown = shutdown.clone();
            slots.spawn(async move {
                sweep_stale(queue.as_ref(), visibility, &shutdown).await;
            });
        }
        for slot in 0..self.concurrency {
            let queue = Arc::clone(&self.queue);
            let executor = Arc::clone(&self.executor);
            let poll = self.poll_interval;
            let shutdown = shutdown.clone();
            slots.spawn(async move {
                run_slot(slot, queue.as_ref(), &executor, poll, &shutdown).await;
            });
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker slot terminated abnormally");
            }
        }
        info!("Worker pool stopped");
        Ok(())
    }

    /// Take at most one delivery and handle it.
    pub async fn process_one(&self, wait: Duration) -> CodevecResult<Option<ProcessOutcome>> {
        match self.queue.dequeue(wait).await? {
            Some(delivery) => Ok(Some(
                process_delivery(self.queue.as_ref(), &self.executor, delivery).await?,
            )),
            None => Ok(None),
        }
    }
}

async fn run_slot(
    slot: usize,
    queue: &dyn TaskQueue,
    executor: &TaskExecutor,
    poll: Duration,
    shutdown: &CancellationToken,
) {
    debug!(slot, "Worker slot started");
    // The dequeue wait is bounded, so shutdown is seen between polls and a
    // row is never abandoned half-moved.
    while !shutdown.is_cancelled() {
        let delivery = match queue.dequeue(poll).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(slot, error = %e, "Failed to poll task queue");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => continue,
                }
            }
        };
        if let Err(e) = process_delivery(queue, executor, delivery).await {
            warn!(slot, error = %e, "Failed to settle delivery");
        }
    }
    debug!(slot, "Worker slot stopped");
}

async fn sweep_stale(queue: &dyn TaskQueue, visibility: Duration, shutdown: &CancellationToken) {
    let interval = (visibility / 2).max(Duration::from_millis(10));
    loop {
        match queue.requeue_stale(visibility).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered tasks abandoned by lost workers"),
            Err(e) => warn!(error = %e, "Failed to sweep stale tasks"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn process_delivery(
    queue: &dyn TaskQueue,
    executor: &TaskExecutor,
    delivery: Delivery,
) -> CodevecResult<ProcessOutcome> {
    let task_id = delivery.task.id.clone();
    let result = match Task::from_queued(&delivery.task) {
        Ok(task) => {
            info!(
                task_id = %task_id,
                session_id = task.session_id(),
                attempt = delivery.task.attempts + 1,
                "Task received"
            );
            executor.execute(&task).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(chunks) => {
            queue.ack(&delivery).await?;
            info!(task_id = %task_id, chunks, "Task completed");
            Ok(ProcessOutcome::Completed { task_id, chunks })
        }
        Err(e) => {
            let outcome = queue.nack(&delivery, &e.to_string()).await?;
            match outcome {
                NackOutcome::Requeued { attempts } => {
                    warn!(task_id = %task_id, attempts, error = %e, "Task failed, requeued")
                }
                NackOutcome::DeadLettered => {
                    error!(task_id = %task_id, error = %e, "Task failed, moved to dead-letter list")
                }
            }
            Ok(ProcessOutcome::Failed { task_id, outcome })
        }
    }
}
