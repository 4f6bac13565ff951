use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Kinds of asynchronous jobs the workflow engine runs for a deposit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    DownloadMedia,
    ExtractMetadata,
    ExtractFrames,
    Transcode,
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskKind::DownloadMedia => write!(f, "download_media"),
            TaskKind::ExtractMetadata => write!(f, "extract_metadata"),
            TaskKind::ExtractFrames => write!(f, "extract_frames"),
            TaskKind::Transcode => write!(f, "transcode"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download_media" => Ok(TaskKind::DownloadMedia),
            "extract_metadata" => Ok(TaskKind::ExtractMetadata),
            "extract_frames" => Ok(TaskKind::ExtractFrames),
            "transcode" => Ok(TaskKind::Transcode),
            _ => Err(anyhow::anyhow!("Invalid task kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// One job inside a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTask {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowTask {
    pub fn new(flow_id: Uuid, kind: TaskKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_id,
            kind,
            status: TaskStatus::Pending,
            payload,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Put the task back in the queue, clearing the previous outcome.
    pub fn reset_for_restart(&mut self) {
        self.status = TaskStatus::Pending;
        self.message = None;
        self.updated_at = Utc::now();
    }
}

/// The set of jobs run for one deposit. A deposit may have several flows over
/// time; `is_last` marks the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub deposit_id: String,
    pub is_last: bool,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<FlowTask>,
}

impl Flow {
    pub fn new(deposit_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            deposit_id: deposit_id.into(),
            is_last: true,
            created_at: Utc::now(),
            tasks: Vec::new(),
        }
    }

    pub fn tasks_of_kind(&self, kind: TaskKind) -> impl Iterator<Item = &FlowTask> {
        self.tasks.iter().filter(move |t| t.kind == kind)
    }
}
