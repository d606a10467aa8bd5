//! Durable entities shared across the orchestrator.
//!
//! Workers, tasks, and workspaces live in their own indexed collections
//! keyed by stable string ids; cross-references are ids, never pointers.
//! A worker owns its current [`WorkerTask`] by value; the task references
//! its workspace by task id.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::board::BoardItem;
use crate::review::ReviewComment;

/// Board-side status of a work item. The board is the source of truth;
/// the local [`Task`] record mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::InReview => "in-review",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "in-progress" => Some(Self::InProgress),
            "in-review" => Some(Self::InReview),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of a board item, created lazily on first observation and
/// mutated by the planner only. Never deleted during normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    /// Review-comment ids already forwarded as feedback; reprocessing any of
    /// these is a no-op.
    #[serde(default)]
    pub processed_comment_ids: BTreeSet<String>,
    /// Bookmark for the comment fetch: the next fetch asks for comments
    /// strictly newer than this.
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status,
            processed_comment_ids: BTreeSet::new(),
            last_sync_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle status of a worker.
///
/// State machine:
///   Idle → Waiting → Working → { Waiting | Stopped | Error | Idle }
///
/// `Idle` has no current task; every other status implies one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Waiting,
    Working,
    Stopped,
    Error,
}

impl WorkerStatus {
    /// Whether this status counts toward the active-worker set.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Waiting | Self::Working)
    }

    /// Whether a worker in this status must hold a current task.
    pub fn requires_task(self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Working => "working",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "waiting" => Some(Self::Waiting),
            "working" => Some(Self::Working),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a worker survives releasing its task.
///
/// Pool workers return to `Idle` and stay in the pool (subject to the idle
/// timeout); temporary workers exist to absorb burst load and are evicted
/// immediately on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Pool,
    Temporary,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Temporary => "temporary",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action a worker has been handed for its current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    StartNewTask,
    ResumeTask,
    ProcessFeedback,
    MergeRequest,
    ReleaseWorker,
    CheckStatus,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartNewTask => "start_new_task",
            Self::ResumeTask => "resume_task",
            Self::ProcessFeedback => "process_feedback",
            Self::MergeRequest => "merge_request",
            Self::ReleaseWorker => "release_worker",
            Self::CheckStatus => "check_status",
        }
    }

    /// Whether this action can be handed to a worker at all. `ReleaseWorker`
    /// and `CheckStatus` are router-level operations, not assignments.
    pub fn is_assignable(self) -> bool {
        matches!(
            self,
            Self::StartNewTask | Self::ResumeTask | Self::ProcessFeedback | Self::MergeRequest
        )
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work a worker currently owns. Embedded in the worker record
/// so that identity and assignment survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: String,
    pub action: TaskAction,
    #[serde(default)]
    pub board_item: Option<BoardItem>,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub comments: Option<Vec<ReviewComment>>,
    pub repository_id: String,
    pub assigned_at: DateTime<Utc>,
    /// Per-task comment bookmark carried along for feedback prompts.
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Durable worker record. The in-memory worker holds additional transient
/// state (progress marker, error counters); this is the part that must
/// survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    pub workspace_dir: PathBuf,
    pub developer_kind: String,
    pub worker_kind: WorkerKind,
    #[serde(default)]
    pub current_task: Option<WorkerTask>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Durable record of a task's isolated working tree. One-to-one with a task
/// while the task is active; deleted on merge success or explicit cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub task_id: String,
    pub repository_id: String,
    pub workspace_dir: PathBuf,
    pub branch_name: String,
    pub worktree_created: bool,
    pub instruction_file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Durable record of one shared clone. `active_worktrees` tracks the
/// worktree paths currently checked out off this clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryState {
    pub id: String,
    pub local_path: PathBuf,
    #[serde(default)]
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub is_cloned: bool,
    #[serde(default)]
    pub active_worktrees: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_parse() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn task_status_parse_rejects_unknown() {
        assert_eq!(TaskStatus::parse(""), None);
        assert_eq!(TaskStatus::parse("TODO"), None);
        assert_eq!(TaskStatus::parse("review"), None);
    }

    #[test]
    fn worker_status_round_trips_through_parse() {
        for status in [
            WorkerStatus::Idle,
            WorkerStatus::Waiting,
            WorkerStatus::Working,
            WorkerStatus::Stopped,
            WorkerStatus::Error,
        ] {
            assert_eq!(WorkerStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn only_waiting_and_working_are_active() {
        assert!(WorkerStatus::Waiting.is_active());
        assert!(WorkerStatus::Working.is_active());
        assert!(!WorkerStatus::Idle.is_active());
        assert!(!WorkerStatus::Stopped.is_active());
        assert!(!WorkerStatus::Error.is_active());
    }

    #[test]
    fn every_status_except_idle_requires_a_task() {
        assert!(!WorkerStatus::Idle.requires_task());
        assert!(WorkerStatus::Waiting.requires_task());
        assert!(WorkerStatus::Working.requires_task());
        assert!(WorkerStatus::Stopped.requires_task());
        assert!(WorkerStatus::Error.requires_task());
    }

    #[test]
    fn router_level_actions_are_not_assignable() {
        assert!(!TaskAction::ReleaseWorker.is_assignable());
        assert!(!TaskAction::CheckStatus.is_assignable());
        assert!(TaskAction::StartNewTask.is_assignable());
        assert!(TaskAction::ResumeTask.is_assignable());
        assert!(TaskAction::ProcessFeedback.is_assignable());
        assert!(TaskAction::MergeRequest.is_assignable());
    }

    #[test]
    fn task_serde_round_trip_preserves_timestamps() {
        let now = Utc::now();
        let mut task = Task::new("T-1", TaskStatus::InReview, now);
        task.processed_comment_ids.insert("c-1".to_string());
        task.last_sync_time = Some(now);

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "T-1");
        assert_eq!(back.status, TaskStatus::InReview);
        assert_eq!(back.created_at, task.created_at);
        assert_eq!(back.last_sync_time, task.last_sync_time);
        assert!(back.processed_comment_ids.contains("c-1"));
    }

    #[test]
    fn worker_record_serde_round_trip() {
        let now = Utc::now();
        let record = WorkerRecord {
            id: "w-1".to_string(),
            status: WorkerStatus::Waiting,
            workspace_dir: PathBuf::from("/tmp/ws"),
            developer_kind: "claude-cli".to_string(),
            worker_kind: WorkerKind::Pool,
            current_task: Some(WorkerTask {
                task_id: "T-9".to_string(),
                action: TaskAction::StartNewTask,
                board_item: None,
                pull_request_url: None,
                comments: None,
                repository_id: "acme/svc".to_string(),
                assigned_at: now,
                last_sync_time: None,
            }),
            created_at: now,
            last_active_at: now,
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: WorkerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "w-1");
        assert_eq!(back.status, WorkerStatus::Waiting);
        assert_eq!(back.worker_kind, WorkerKind::Pool);
        assert_eq!(back.current_task.as_ref().unwrap().task_id, "T-9");
        assert_eq!(back.last_active_at, now);
    }

    #[test]
    fn repository_state_defaults_tolerate_missing_fields() {
        // Old records without active_worktrees must still load.
        let json = r#"{"id":"acme/svc","local_path":"/tmp/repo","is_cloned":true}"#;
        let state: RepositoryState = serde_json::from_str(json).unwrap();
        assert!(state.active_worktrees.is_empty());
        assert!(state.last_fetch_at.is_none());
    }
}
