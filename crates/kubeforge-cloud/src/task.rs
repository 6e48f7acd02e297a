//! Durable task queue
//!
//! Tasks live under the `/tasks` namespace in insertion order. A worker
//! claims a task by compare-and-swapping its `QUEUED` representation for a
//! `RUNNING` one, so at most one worker executes a task at a time.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CloudError, Result};
use crate::store::{EntityStore, key_id};

const TASKS_NAMESPACE: &str = "/tasks";

/// Default number of attempts before a task is frozen at `FAILED`
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default delay before a failed task becomes claimable again
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Kind of deferred operation, used to pick a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    DeleteApp,
    DeleteComponent,
    DeployComponent,
    StartInstance,
    StopInstance,
    CreateKube,
    DeleteKube,
    CreateNode,
    DeleteNode,
}

impl TaskType {
    pub const ALL: [TaskType; 9] = [
        TaskType::DeleteApp,
        TaskType::DeleteComponent,
        TaskType::DeployComponent,
        TaskType::StartInstance,
        TaskType::StopInstance,
        TaskType::CreateKube,
        TaskType::DeleteKube,
        TaskType::CreateNode,
        TaskType::DeleteNode,
    ];
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::DeleteApp => write!(f, "DeleteApp"),
            TaskType::DeleteComponent => write!(f, "DeleteComponent"),
            TaskType::DeployComponent => write!(f, "DeployComponent"),
            TaskType::StartInstance => write!(f, "StartInstance"),
            TaskType::StopInstance => write!(f, "StopInstance"),
            TaskType::CreateKube => write!(f, "CreateKube"),
            TaskType::DeleteKube => write!(f, "DeleteKube"),
            TaskType::CreateNode => write!(f, "CreateNode"),
            TaskType::DeleteNode => write!(f, "DeleteNode"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| CloudError::InvalidConfig(format!("unknown task type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    /// Terminal after exhausting attempts
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "QUEUED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A unit of deferred, retryable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned id; insertion order is queue order
    #[serde(skip)]
    pub id: String,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Handler payload
    pub data: Value,

    pub status: TaskStatus,

    pub attempts: u32,

    pub max_attempts: u32,

    /// Last failure message, empty while healthy
    #[serde(default)]
    pub error: String,

    /// Earliest time workers pick the task up again after a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_queued(&self) -> bool {
        self.status == TaskStatus::Queued
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    /// Whether a worker scanning at `now` should try the task
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }

    pub fn type_name(&self) -> String {
        self.task_type.to_string()
    }

    pub fn key(&self) -> String {
        format!("{}/{}", TASKS_NAMESPACE, self.id)
    }

    /// Decode the payload into the handler's message type
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Access to the task queue
#[derive(Clone)]
pub struct TaskCollection {
    store: Arc<dyn EntityStore>,
    default_max_attempts: u32,
    retry_delay: Duration,
}

impl TaskCollection {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn decode(key: &str, value: Value) -> Result<Task> {
        let mut task: Task = serde_json::from_value(value)?;
        task.id = key_id(key).to_string();
        Ok(task)
    }

    /// Enqueue a new task at the tail of the queue
    pub async fn start<T: Serialize>(&self, task_type: TaskType, payload: &T) -> Result<Task> {
        let mut task = Task {
            id: String::new(),
            task_type,
            data: serde_json::to_value(payload)?,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: self.default_max_attempts,
            error: String::new(),
            retry_at: None,
        };
        let key = self
            .store
            .create_in_order(TASKS_NAMESPACE, serde_json::to_value(&task)?)
            .await?;
        task.id = key_id(&key).to_string();
        tracing::info!(task = %task.id, "Queued {} task", task_type);
        Ok(task)
    }

    /// All tasks in insertion order
    pub async fn list(&self) -> Result<Vec<Task>> {
        self.store
            .list_in_order(TASKS_NAMESPACE)
            .await?
            .into_iter()
            .map(|(key, value)| Self::decode(&key, value))
            .collect()
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        let key = format!("{}/{}", TASKS_NAMESPACE, id);
        let value = self.store.get(&key).await?;
        Self::decode(&key, value)
    }

    /// Claim `task` for the calling worker.
    ///
    /// `task` must be the representation the worker observed. On success the
    /// returned task is `RUNNING`; if anyone else changed the record first
    /// this fails with `Conflict`.
    pub async fn claim(&self, task: &Task) -> Result<Task> {
        if !task.is_queued() {
            return Err(CloudError::Conflict(format!(
                "task {} is {}, not QUEUED",
                task.id, task.status
            )));
        }

        // Snapshot the expected value before building the candidate
        let prev = serde_json::to_value(task)?;
        let mut next = task.clone();
        next.status = TaskStatus::Running;

        self.store
            .compare_and_swap(&task.key(), &prev, serde_json::to_value(&next)?)
            .await?;
        tracing::debug!(task = %task.id, "Claimed {} task", task.task_type);
        Ok(next)
    }

    /// Record a handler failure on a task this worker holds
    pub async fn record_error(&self, task: &mut Task, error: &str) -> Result<()> {
        tracing::warn!(task = %task.id, "{} task failed: {}", task.task_type, error);

        task.error = error.to_string();
        task.attempts += 1;
        if task.attempts < task.max_attempts {
            task.status = TaskStatus::Queued;
            task.retry_at = if self.retry_delay.is_zero() {
                None
            } else {
                TimeDelta::from_std(self.retry_delay)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
            };
        } else {
            task.status = TaskStatus::Failed;
            task.retry_at = None;
        }

        self.store
            .update(&task.key(), serde_json::to_value(&*task)?)
            .await
    }

    /// Remove a task after its handler succeeded
    pub async fn complete(&self, task: &Task) -> Result<()> {
        self.store.delete(&task.key()).await?;
        tracing::info!(task = %task.id, "Completed {} task", task.task_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn tasks() -> TaskCollection {
        TaskCollection::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_start_defaults() {
        let tasks = tasks();
        let task = tasks
            .start(TaskType::StartInstance, &json!({"nodeID": 7}))
            .await
            .unwrap();

        assert!(task.is_queued());
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(task.error.is_empty());
        assert_eq!(tasks.get(&task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_list_in_insertion_order() {
        let tasks = tasks();
        let a = tasks.start(TaskType::DeleteApp, &json!(1)).await.unwrap();
        let b = tasks.start(TaskType::StopInstance, &json!(2)).await.unwrap();
        let ids: Vec<_> = tasks.list().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_get_missing() {
        assert!(tasks().get("404").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_second_claim_conflicts() {
        let tasks = tasks();
        let task = tasks.start(TaskType::DeployComponent, &json!({})).await.unwrap();

        let claimed = tasks.claim(&task).await.unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(tasks.get(&task.id).await.unwrap().status, TaskStatus::Running);

        // a stale copy of the queued task must lose
        assert!(tasks.claim(&task).await.unwrap_err().is_conflict());
        // and a running task is never claimable
        assert!(tasks.claim(&claimed).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_claim_vanished_task() {
        let tasks = tasks();
        let task = tasks.start(TaskType::DeleteApp, &json!({})).await.unwrap();
        tasks.complete(&task).await.unwrap();
        assert!(tasks.claim(&task).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_record_error_requeues_then_fails() {
        let tasks = tasks().with_max_attempts(2);
        let task = tasks.start(TaskType::StopInstance, &json!({})).await.unwrap();

        let mut running = tasks.claim(&task).await.unwrap();
        tasks.record_error(&mut running, "boom").await.unwrap();
        let stored = tasks.get(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error, "boom");

        let mut running = tasks.claim(&stored).await.unwrap();
        tasks.record_error(&mut running, "boom again").await.unwrap();
        let stored = tasks.get(&task.id).await.unwrap();
        assert!(stored.is_failed());
        assert_eq!(stored.attempts, 2);
        assert!(tasks.claim(&stored).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_record_error_schedules_retry() {
        let tasks = tasks().with_retry_delay(Duration::from_secs(60));
        let task = tasks.start(TaskType::CreateKube, &json!({})).await.unwrap();
        assert!(task.is_due(Utc::now()));

        let mut running = tasks.claim(&task).await.unwrap();
        tasks.record_error(&mut running, "provider unavailable").await.unwrap();

        let stored = tasks.get(&task.id).await.unwrap();
        assert!(stored.is_queued());
        let retry_at = stored.retry_at.unwrap();
        assert!(!stored.is_due(Utc::now()));
        assert!(stored.is_due(retry_at));
        assert!(retry_at - Utc::now() > TimeDelta::seconds(50));
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!(
            "startinstance".parse::<TaskType>().unwrap(),
            TaskType::StartInstance
        );
        assert_eq!("DeleteKube".parse::<TaskType>().unwrap(), TaskType::DeleteKube);
        assert!("Reboot".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_value(TaskStatus::Queued).unwrap(),
            json!("QUEUED")
        );
    }
}
