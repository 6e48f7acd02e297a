//! Task workers
//!
//! Workers scan the queue in insertion order, claim the first due task they
//! can win, and dispatch it to the handler registered for its type. Handler
//! failures and panics become retries through [`TaskCollection::record_error`];
//! a failed task is not retried before its `retry_at`, and a worker whose
//! task failed sleeps a poll interval before scanning again.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CloudError, Result};
use crate::task::{Task, TaskCollection, TaskType};

/// Executes one kind of task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, data: Value) -> Result<()>;
}

/// Mapping from task type to handler, built once at startup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, handler: impl TaskHandler + 'static) {
        self.handlers.insert(task_type, Arc::new(handler));
    }

    pub fn with(mut self, task_type: TaskType, handler: impl TaskHandler + 'static) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a single worker iteration did
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Handler succeeded and the task was removed
    Completed(String),
    /// Handler failed; the task was re-queued
    Requeued(String),
    /// Handler failed for the last time; the task is frozen at `FAILED`
    Failed(String),
}

/// A single queue consumer
#[derive(Clone)]
pub struct Worker {
    name: String,
    tasks: TaskCollection,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        tasks: TaskCollection,
        registry: Arc<HandlerRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            tasks,
            registry,
            poll_interval,
        }
    }

    /// Claim and execute at most one task.
    ///
    /// Returns `Ok(None)` when nothing was claimable.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>> {
        let now = Utc::now();
        for task in self.tasks.list().await? {
            if !task.is_queued() || !task.is_due(now) {
                continue;
            }
            match self.tasks.claim(&task).await {
                Ok(claimed) => return self.execute(claimed).await.map(Some),
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    tracing::debug!(worker = %self.name, task = %task.id, "Lost claim: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn execute(&self, mut task: Task) -> Result<TaskOutcome> {
        tracing::info!(
            worker = %self.name,
            task = %task.id,
            attempt = task.attempts + 1,
            "Running {} task",
            task.task_type
        );

        let result = match self.registry.get(task.task_type) {
            Some(handler) => {
                let data = task.data.clone();
                // Run on its own task so a panicking handler cannot take the worker down
                match tokio::spawn(async move { handler.handle(data).await }).await {
                    Ok(result) => result,
                    Err(join_err) => Err(CloudError::Provider(format!(
                        "handler panicked: {}",
                        join_err
                    ))),
                }
            }
            None => Err(CloudError::NoHandler(task.type_name())),
        };

        match result {
            Ok(()) => {
                self.tasks.complete(&task).await?;
                Ok(TaskOutcome::Completed(task.id))
            }
            Err(e) => {
                self.tasks.record_error(&mut task, &e.to_string()).await?;
                if task.is_failed() {
                    let exhausted = CloudError::Exhausted {
                        id: task.id.clone(),
                        attempts: task.attempts,
                        error: task.error.clone(),
                    };
                    tracing::warn!(worker = %self.name, "{}", exhausted);
                    Ok(TaskOutcome::Failed(task.id))
                } else {
                    Ok(TaskOutcome::Requeued(task.id))
                }
            }
        }
    }

    /// Poll the queue until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(worker = %self.name, "Worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // only a success goes straight back to the queue
            let idle = match self.run_once().await {
                Ok(Some(TaskOutcome::Completed(_))) => false,
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(worker = %self.name, "Worker iteration failed: {}", e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        tracing::info!(worker = %self.name, "Worker stopped");
    }
}

/// A set of workers sharing one queue and registry
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `count` workers
    pub fn spawn(
        count: usize,
        tasks: TaskCollection,
        registry: Arc<HandlerRegistry>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|i| {
                let worker = Worker::new(
                    format!("worker-{}", i),
                    tasks.clone(),
                    registry.clone(),
                    poll_interval,
                );
                tokio::spawn(worker.run(cancel.child_token()))
            })
            .collect();
        Self { handles, cancel }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop all workers and wait for them to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Worker exited abnormally: {}", e);
            }
        }
    }
}
