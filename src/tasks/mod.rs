//! Asynchronous task engine.
//!
//! Tasks are rows in the store. Workers claim them with a conditional update,
//! dispatch by [`TaskKind`] to a registered handler, and record the outcome:
//! done, retry with backoff, dead-letter, or canceled.

pub mod backoff;
pub mod executor;
pub mod handlers;
pub mod pool;
pub mod trigger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::TaskError;

pub use backoff::Backoff;
pub use executor::{Executor, HandlerOutcome, RunOutcome, TaskContext, TaskHandler};
pub use handlers::HandlerRegistry;
pub use pool::{PoolHandle, WorkerPool};

/// Closed set of task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ingest,
    Embed,
    Thumb,
    Phash,
    Caption,
    Face,
    FaceEmbed,
    PersonCluster,
    PersonRecluster,
    VideoScenes,
    VideoEmbed,
}

impl TaskKind {
    pub const ALL: [TaskKind; 11] = [
        TaskKind::Ingest,
        TaskKind::Embed,
        TaskKind::Thumb,
        TaskKind::Phash,
        TaskKind::Caption,
        TaskKind::Face,
        TaskKind::FaceEmbed,
        TaskKind::PersonCluster,
        TaskKind::PersonRecluster,
        TaskKind::VideoScenes,
        TaskKind::VideoEmbed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ingest => "ingest",
            TaskKind::Embed => "embed",
            TaskKind::Thumb => "thumb",
            TaskKind::Phash => "phash",
            TaskKind::Caption => "caption",
            TaskKind::Face => "face",
            TaskKind::FaceEmbed => "face_embed",
            TaskKind::PersonCluster => "person_cluster",
            TaskKind::PersonRecluster => "person_recluster",
            TaskKind::VideoScenes => "video_scenes",
            TaskKind::VideoEmbed => "video_embed",
        }
    }

    /// Default queue priority; lower runs first.
    pub fn default_priority(&self) -> i64 {
        match self {
            TaskKind::Ingest => 10,
            TaskKind::Thumb => 20,
            TaskKind::Embed => 30,
            TaskKind::Face => 40,
            TaskKind::FaceEmbed => 45,
            TaskKind::Phash => 50,
            TaskKind::Caption => 60,
            TaskKind::VideoScenes => 60,
            TaskKind::VideoEmbed => 65,
            TaskKind::PersonCluster => 70,
            TaskKind::PersonRecluster => 90,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TaskError::UnknownKind(s.to_string()))
    }
}

/// Lifecycle state of a task.
///
/// `pending -> running -> {done | pending (retry) | dead | canceled}`. Done,
/// dead and canceled are terminal until an operator requeues the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    Dead,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Dead => "dead",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Dead | TaskState::Canceled
        )
    }

    /// States an operator may requeue from.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Dead | TaskState::Canceled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            "dead" => Ok(TaskState::Dead),
            "canceled" => Ok(TaskState::Canceled),
            other => Err(anyhow::anyhow!("unknown task state '{}'", other)),
        }
    }
}

/// A task row.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub payload: Value,
    pub state: TaskState,
    pub priority: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress_current: Option<i64>,
    pub progress_total: Option<i64>,
    pub cancel_requested: bool,
}

impl Task {
    /// Read a required integer key from the payload.
    pub fn payload_i64(&self, key: &str) -> Result<i64, TaskError> {
        self.payload
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                TaskError::InvalidPayload(format!("{} task {} missing '{}'", self.kind, self.id, key))
            })
    }

    /// Read a required string key from the payload.
    pub fn payload_str(&self, key: &str) -> Result<&str, TaskError> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TaskError::InvalidPayload(format!("{} task {} missing '{}'", self.kind, self.id, key))
            })
    }
}
