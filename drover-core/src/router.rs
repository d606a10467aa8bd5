//! Task request router: the single entry point between the planner and the
//! worker pool.
//!
//! Requests are a tagged variant per action, each carrying only the fields
//! that action needs. Worker pipelines are spawned as detached threads and
//! their results surface on a later CHECK_STATUS poll — never by calling
//! back into the originating request.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::board::BoardItem;
use crate::errors::OrchestratorError;
use crate::model::{TaskAction, WorkerStatus, WorkerTask};
use crate::pool::WorkerPool;
use crate::review::ReviewComment;
use crate::worker::{PipelineDeps, WorkerHandle};
use crate::workspace::WorkspaceManager;

/// A planner-issued request, dispatched on its tag.
#[derive(Debug, Clone)]
pub enum TaskRequest {
    StartNewTask {
        task_id: String,
        board_item: BoardItem,
    },
    CheckStatus {
        task_id: String,
    },
    ProcessFeedback {
        task_id: String,
        board_item: Option<BoardItem>,
        pull_request_url: Option<String>,
        comments: Vec<ReviewComment>,
        last_sync_time: Option<DateTime<Utc>>,
    },
    RequestMerge {
        task_id: String,
        pull_request_url: String,
    },
    ReleaseWorker {
        task_id: String,
    },
}

impl TaskRequest {
    pub fn task_id(&self) -> &str {
        match self {
            Self::StartNewTask { task_id, .. }
            | Self::CheckStatus { task_id }
            | Self::ProcessFeedback { task_id, .. }
            | Self::RequestMerge { task_id, .. }
            | Self::ReleaseWorker { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Accepted,
    Rejected,
    Error,
    Completed,
    InProgress,
}

#[derive(Debug, Clone)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: RequestStatus,
    pub message: String,
    pub pull_request_url: Option<String>,
    pub worker_status: Option<WorkerStatus>,
}

impl TaskResponse {
    fn new(task_id: &str, status: RequestStatus, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            message: message.into(),
            pull_request_url: None,
            worker_status: None,
        }
    }

    fn with_worker(mut self, status: WorkerStatus) -> Self {
        self.worker_status = Some(status);
        self
    }

    fn with_url(mut self, url: Option<String>) -> Self {
        self.pull_request_url = url;
        self
    }
}

// ── Assignment validator ──────────────────────────────────────────────────────

/// What a prospective reassignment may rely on.
#[derive(Debug, Clone)]
pub enum AssignmentDecision {
    /// No workspace recorded; a new one would have to be created.
    WithoutWorkspace,
    /// A valid workspace exists; the task can be resumed in place.
    WithWorkspace(crate::model::WorkspaceInfo),
    /// A workspace record exists but the tree is unusable; it will be
    /// recreated during the next pipeline run.
    RecreateWorkspace(crate::model::WorkspaceInfo),
}

pub struct AssignmentValidator {
    workspaces: Arc<WorkspaceManager>,
}

impl AssignmentValidator {
    pub fn new(workspaces: Arc<WorkspaceManager>) -> Self {
        Self { workspaces }
    }

    pub fn check_reassignment(&self, task_id: &str) -> AssignmentDecision {
        match self.workspaces.workspace_for(task_id) {
            None => AssignmentDecision::WithoutWorkspace,
            Some(info) if self.workspaces.is_worktree_valid(&info) => {
                AssignmentDecision::WithWorkspace(info)
            }
            Some(info) => AssignmentDecision::RecreateWorkspace(info),
        }
    }

    /// An idle worker has no execution context of its own; it can only pick
    /// a task up when a valid workspace exists on disk.
    pub fn can_assign_to_idle_worker(&self, task_id: &str) -> bool {
        matches!(
            self.check_reassignment(task_id),
            AssignmentDecision::WithWorkspace(_)
        )
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub struct TaskRouter {
    pool: Arc<WorkerPool>,
    validator: AssignmentValidator,
    deps: Arc<PipelineDeps>,
    default_repository: String,
    pipelines: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl TaskRouter {
    pub fn new(
        pool: Arc<WorkerPool>,
        workspaces: Arc<WorkspaceManager>,
        deps: Arc<PipelineDeps>,
        default_repository: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            validator: AssignmentValidator::new(workspaces),
            deps,
            default_repository: default_repository.into(),
            pipelines: Mutex::new(Vec::new()),
        }
    }

    pub fn validator(&self) -> &AssignmentValidator {
        &self.validator
    }

    /// Handle one request. Never panics the caller; anything unexpected
    /// comes back as an ERROR response.
    pub fn handle(&self, request: TaskRequest) -> TaskResponse {
        let task_id = request.task_id().to_string();
        tracing::debug!(task = task_id.as_str(), request = ?request_label(&request), "routing");
        match request {
            TaskRequest::StartNewTask { task_id, board_item } => {
                self.handle_start_new(&task_id, board_item)
            }
            TaskRequest::CheckStatus { task_id } => self.handle_check_status(&task_id),
            TaskRequest::ProcessFeedback {
                task_id,
                board_item,
                pull_request_url,
                comments,
                last_sync_time,
            } => self.handle_feedback(&task_id, board_item, pull_request_url, comments, last_sync_time),
            TaskRequest::RequestMerge {
                task_id,
                pull_request_url,
            } => self.handle_merge(&task_id, pull_request_url),
            TaskRequest::ReleaseWorker { task_id } => self.handle_release(&task_id),
        }
    }

    fn handle_start_new(&self, task_id: &str, board_item: BoardItem) -> TaskResponse {
        if self.pool.get_worker_by_task_id(task_id).is_some() {
            return TaskResponse::new(
                task_id,
                RequestStatus::Rejected,
                "task already assigned to a worker",
            );
        }

        let worker = match self.pool.get_available_worker() {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                return TaskResponse::new(
                    task_id,
                    RequestStatus::Rejected,
                    OrchestratorError::NoWorkerAvailable(task_id.to_string()).to_string(),
                );
            }
            Err(e) => {
                return TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}"));
            }
        };

        let task = WorkerTask {
            task_id: task_id.to_string(),
            action: TaskAction::StartNewTask,
            board_item: Some(board_item),
            pull_request_url: None,
            comments: None,
            repository_id: self.default_repository.clone(),
            assigned_at: Utc::now(),
            last_sync_time: None,
        };
        if let Err(e) = self.pool.assign_worker_task(&worker.id(), task) {
            return TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}"));
        }

        self.spawn_pipeline(worker.clone());
        TaskResponse::new(task_id, RequestStatus::Accepted, "task started")
            .with_worker(worker.status())
    }

    fn handle_check_status(&self, task_id: &str) -> TaskResponse {
        let Some(worker) = self.pool.get_worker_by_task_id(task_id) else {
            return self.reassign(task_id);
        };

        match worker.status() {
            WorkerStatus::Working => {
                TaskResponse::new(task_id, RequestStatus::InProgress, worker.progress())
                    .with_worker(WorkerStatus::Working)
            }
            WorkerStatus::Stopped => {
                if worker.is_quarantined() {
                    // Only the pool's recovery sweep may revive a quarantined
                    // worker; until then the task surfaces as failing.
                    return TaskResponse::new(
                        task_id,
                        RequestStatus::Error,
                        "worker quarantined after repeated failures",
                    )
                    .with_worker(WorkerStatus::Stopped);
                }
                match worker.resume_execution() {
                    Ok(()) => {
                        let _ = self.deps.store.save_worker(&worker.snapshot());
                        TaskResponse::new(task_id, RequestStatus::Accepted, "worker resumed")
                            .with_worker(worker.status())
                    }
                    Err(e) => TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}")),
                }
            }
            WorkerStatus::Error => TaskResponse::new(
                task_id,
                RequestStatus::Error,
                format!("worker in error state: {}", worker.progress()),
            )
            .with_worker(WorkerStatus::Error),
            WorkerStatus::Waiting => {
                if worker.in_backoff() {
                    return TaskResponse::new(
                        task_id,
                        RequestStatus::InProgress,
                        worker.progress(),
                    )
                    .with_worker(WorkerStatus::Waiting);
                }
                match worker.start_execution(&self.deps) {
                    Ok(result) if result.success => {
                        // Keep the worker; the planner releases it once the
                        // overall workflow completes.
                        TaskResponse::new(task_id, RequestStatus::Completed, "execution complete")
                            .with_url(result.pull_request_url)
                            .with_worker(worker.status())
                    }
                    Ok(result) => TaskResponse::new(
                        task_id,
                        RequestStatus::Error,
                        result
                            .error_message
                            .unwrap_or_else(|| "execution failed".to_string()),
                    )
                    .with_worker(worker.status()),
                    Err(e) => TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}")),
                }
            }
            WorkerStatus::Idle => {
                TaskResponse::new(task_id, RequestStatus::Completed, "worker already idle")
                    .with_worker(WorkerStatus::Idle)
            }
        }
    }

    /// CHECK_STATUS found no owning worker: try to hand the task to a new
    /// one based on what survives on disk.
    fn reassign(&self, task_id: &str) -> TaskResponse {
        let info = match self.validator.check_reassignment(task_id) {
            AssignmentDecision::WithoutWorkspace => {
                // Fresh workers are stateless; with no workspace there is
                // nothing to resume from.
                return TaskResponse::new(
                    task_id,
                    RequestStatus::Error,
                    OrchestratorError::NoWorkspaceToResume(task_id.to_string()).to_string(),
                );
            }
            AssignmentDecision::WithWorkspace(info)
            | AssignmentDecision::RecreateWorkspace(info) => info,
        };

        let worker = match self.pool.get_available_worker() {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                return TaskResponse::new(task_id, RequestStatus::Rejected, "no worker available");
            }
            Err(e) => return TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}")),
        };

        let task = WorkerTask {
            task_id: task_id.to_string(),
            action: TaskAction::ResumeTask,
            board_item: None,
            pull_request_url: None,
            comments: None,
            repository_id: info.repository_id.clone(),
            assigned_at: Utc::now(),
            last_sync_time: None,
        };
        if let Err(e) = self.pool.assign_worker_task(&worker.id(), task) {
            return TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}"));
        }
        self.spawn_pipeline(worker.clone());
        TaskResponse::new(task_id, RequestStatus::Accepted, "task reassigned")
            .with_worker(worker.status())
    }

    fn handle_feedback(
        &self,
        task_id: &str,
        board_item: Option<BoardItem>,
        pull_request_url: Option<String>,
        comments: Vec<ReviewComment>,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> TaskResponse {
        let repository_id = self.repository_for(task_id);
        let task = WorkerTask {
            task_id: task_id.to_string(),
            action: TaskAction::ProcessFeedback,
            board_item,
            pull_request_url,
            comments: Some(comments),
            repository_id,
            assigned_at: Utc::now(),
            last_sync_time,
        };

        let worker = match self.find_or_allocate(task_id) {
            Ok(worker) => worker,
            Err(response) => return response,
        };
        if let Err(e) = self.pool.assign_worker_task(&worker.id(), task) {
            return TaskResponse::new(task_id, RequestStatus::Rejected, format!("{e:#}"));
        }
        self.spawn_pipeline(worker.clone());
        TaskResponse::new(task_id, RequestStatus::Accepted, "feedback handed to worker")
            .with_worker(worker.status())
    }

    fn handle_merge(&self, task_id: &str, pull_request_url: String) -> TaskResponse {
        if let Some(worker) = self.pool.get_worker_by_task_id(task_id) {
            if worker.status() == WorkerStatus::Working {
                return TaskResponse::new(
                    task_id,
                    RequestStatus::InProgress,
                    "worker already processing task",
                )
                .with_worker(WorkerStatus::Working);
            }
        }

        let worker = match self.find_or_allocate(task_id) {
            Ok(worker) => worker,
            Err(response) => return response,
        };

        let task = WorkerTask {
            task_id: task_id.to_string(),
            action: TaskAction::MergeRequest,
            board_item: None,
            pull_request_url: Some(pull_request_url),
            comments: None,
            repository_id: self.repository_for(task_id),
            assigned_at: Utc::now(),
            last_sync_time: None,
        };
        if let Err(e) = self.pool.assign_worker_task(&worker.id(), task) {
            return TaskResponse::new(task_id, RequestStatus::Rejected, format!("{e:#}"));
        }

        // Merges run inline: the planner needs the verdict this cycle.
        match worker.start_execution(&self.deps) {
            Ok(result) if result.success => {
                let worker_id = worker.id();
                if let Err(e) = self.pool.release_worker(&worker_id) {
                    tracing::warn!(worker = worker_id.as_str(), error = %e, "release after merge failed");
                }
                TaskResponse::new(task_id, RequestStatus::Completed, "merge complete")
                    .with_url(result.pull_request_url)
            }
            Ok(result) => TaskResponse::new(
                task_id,
                RequestStatus::Error,
                result
                    .error_message
                    .unwrap_or_else(|| "merge failed".to_string()),
            )
            .with_worker(worker.status()),
            Err(e) => TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}")),
        }
    }

    fn handle_release(&self, task_id: &str) -> TaskResponse {
        if let Some(worker) = self.pool.get_worker_by_task_id(task_id) {
            let worker_id = worker.id();
            if let Err(e) = self.pool.release_worker(&worker_id) {
                return TaskResponse::new(task_id, RequestStatus::Error, format!("{e:#}"));
            }
            return TaskResponse::new(task_id, RequestStatus::Accepted, "worker released");
        }
        // Idempotent: releasing an unknown task is still a success.
        TaskResponse::new(task_id, RequestStatus::Accepted, "no worker held the task")
    }

    /// Find the task's worker or allocate one. Idle allocations require a
    /// valid workspace, and the handoff goes through RESUME_TASK first so
    /// the worker's own transition rules stay in force.
    fn find_or_allocate(&self, task_id: &str) -> Result<WorkerHandle, TaskResponse> {
        if let Some(worker) = self.pool.get_worker_by_task_id(task_id) {
            return Ok(worker);
        }

        if !self.validator.can_assign_to_idle_worker(task_id) {
            return Err(TaskResponse::new(
                task_id,
                RequestStatus::Error,
                "no workspace exists for task; cannot hand to a fresh worker",
            ));
        }
        let worker = match self.pool.get_available_worker() {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                return Err(TaskResponse::new(
                    task_id,
                    RequestStatus::Rejected,
                    "no worker available",
                ));
            }
            Err(e) => {
                return Err(TaskResponse::new(
                    task_id,
                    RequestStatus::Error,
                    format!("{e:#}"),
                ));
            }
        };

        // Idle → Waiting bridge; the real action is assigned by the caller.
        let bridge = WorkerTask {
            task_id: task_id.to_string(),
            action: TaskAction::ResumeTask,
            board_item: None,
            pull_request_url: None,
            comments: None,
            repository_id: self.repository_for(task_id),
            assigned_at: Utc::now(),
            last_sync_time: None,
        };
        if let Err(e) = self.pool.assign_worker_task(&worker.id(), bridge) {
            return Err(TaskResponse::new(
                task_id,
                RequestStatus::Error,
                format!("{e:#}"),
            ));
        }
        Ok(worker)
    }

    fn repository_for(&self, task_id: &str) -> String {
        self.validator
            .workspaces
            .workspace_for(task_id)
            .map(|info| info.repository_id)
            .unwrap_or_else(|| self.default_repository.clone())
    }

    fn spawn_pipeline(&self, worker: WorkerHandle) {
        let deps = self.deps.clone();
        let handle = std::thread::spawn(move || {
            let worker_id = worker.id();
            match worker.start_execution(&deps) {
                Ok(result) => {
                    tracing::info!(
                        worker = worker_id.as_str(),
                        task = result.task_id.as_str(),
                        success = result.success,
                        pull_request = result.pull_request_url.as_deref().unwrap_or("-"),
                        "pipeline finished"
                    );
                }
                Err(e) => {
                    tracing::warn!(worker = worker_id.as_str(), error = %e, "pipeline refused to start");
                }
            }
        });

        let mut pipelines = self.pipelines.lock().unwrap();
        pipelines.retain(|h| !h.is_finished());
        pipelines.push(handle);
    }

    /// Wait for every in-flight pipeline thread; used on graceful shutdown.
    pub fn join_in_flight(&self) {
        let handles: Vec<_> = self.pipelines.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn request_label(request: &TaskRequest) -> &'static str {
    match request {
        TaskRequest::StartNewTask { .. } => "start_new_task",
        TaskRequest::CheckStatus { .. } => "check_status",
        TaskRequest::ProcessFeedback { .. } => "process_feedback",
        TaskRequest::RequestMerge { .. } => "request_merge",
        TaskRequest::ReleaseWorker { .. } => "release_worker",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeveloperConfig, PoolConfig};
    use crate::developer::ScriptedDeveloper;
    use crate::git::testutil::{failure, success, FakeGit};
    use crate::git::{Git, GitOutput};
    use crate::git_lock::GitLockRegistry;
    use crate::model::TaskStatus;
    use crate::repo_cache::RepositoryCache;
    use crate::review::InMemoryReviews;
    use crate::store::StateStore;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        router: TaskRouter,
        pool: Arc<WorkerPool>,
        developer: Arc<ScriptedDeveloper>,
        workspaces: Arc<WorkspaceManager>,
    }

    fn git_responder(cmd: &str) -> GitOutput {
        if cmd.starts_with("rev-parse --is-inside-work-tree") {
            success("true\n")
        } else if cmd.starts_with("rev-parse --verify") {
            failure("")
        } else if cmd.starts_with("worktree list") {
            success("worktree /clone\nHEAD abc\nbranch refs/heads/main\n")
        } else {
            success("")
        }
    }

    fn fixture(max_workers: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(&dir.path().join(".state")));
        store.initialize().unwrap();
        let fake = Arc::new(FakeGit::with_responder(git_responder));
        let git = Arc::new(Git::new(fake, Duration::from_secs(60)));
        let locks = Arc::new(GitLockRegistry::new(Duration::from_secs(5)));
        let repos = Arc::new(RepositoryCache::new(
            dir.path().join("repositories"),
            store.clone(),
            git.clone(),
            locks.clone(),
            Duration::from_secs(300),
        ));
        let workspaces = Arc::new(WorkspaceManager::new(
            dir.path().to_path_buf(),
            store.clone(),
            repos,
            git,
            locks,
        ));
        let developer = Arc::new(ScriptedDeveloper::new(
            "PR: https://example.com/acme/svc/pull/42\nDone successfully.",
        ));
        let deps = Arc::new(PipelineDeps {
            store: store.clone(),
            workspaces: workspaces.clone(),
            developer: developer.clone(),
            reviews: Arc::new(InMemoryReviews::new()),
            developer_config: DeveloperConfig {
                timeout: Duration::from_secs(5),
                max_retries: 3,
                retry_delay: Duration::from_millis(1),
                backend_paths: vec![],
            },
        });
        let pool = WorkerPool::new(
            store,
            PoolConfig {
                min_workers: 1,
                max_workers,
                worker_timeout: Duration::from_secs(600),
                idle_timeout_minutes: 60,
                cleanup_interval_minutes: 60,
            },
            "scripted",
            dir.path().to_path_buf(),
        );
        pool.initialize_pool().unwrap();

        let router = TaskRouter::new(pool.clone(), workspaces.clone(), deps, "acme/svc");
        Fixture {
            _dir: dir,
            router,
            pool,
            developer,
            workspaces,
        }
    }

    fn board_item(id: &str) -> BoardItem {
        BoardItem {
            id: id.to_string(),
            title: format!("Task {id}"),
            status: TaskStatus::Todo,
            labels: vec![],
            content_number: None,
            content_type: None,
            pull_request_urls: vec![],
        }
    }

    fn start(f: &Fixture, task_id: &str) -> TaskResponse {
        f.router.handle(TaskRequest::StartNewTask {
            task_id: task_id.to_string(),
            board_item: board_item(task_id),
        })
    }

    // ── START_NEW_TASK ──────────────────────────────────────────────────────

    #[test]
    fn start_new_task_accepted_and_pipeline_runs() {
        let f = fixture(2);
        let response = start(&f, "T-1");
        assert_eq!(response.status, RequestStatus::Accepted);
        assert_eq!(response.worker_status, Some(WorkerStatus::Waiting));

        f.router.join_in_flight();
        // Pipeline ran to completion and the worker holds the result.
        let worker = f.pool.get_worker_by_task_id("T-1").unwrap();
        assert_eq!(worker.status(), WorkerStatus::Waiting);
        assert_eq!(f.developer.prompts().len(), 1);
        f.pool.shutdown();
    }

    #[test]
    fn start_new_task_rejected_when_no_worker_available() {
        let f = fixture(1);
        assert_eq!(start(&f, "T-1").status, RequestStatus::Accepted);
        // Sole worker is taken: next task is rejected, not queued.
        let response = start(&f, "T-2");
        assert_eq!(response.status, RequestStatus::Rejected);
        assert!(response.message.contains("no worker available"));
        f.router.join_in_flight();
        f.pool.shutdown();
    }

    #[test]
    fn start_new_task_rejected_when_task_already_owned() {
        let f = fixture(3);
        start(&f, "T-1");
        let response = start(&f, "T-1");
        assert_eq!(response.status, RequestStatus::Rejected);
        assert!(response.message.contains("already assigned"));
        f.router.join_in_flight();
        f.pool.shutdown();
    }

    // ── CHECK_STATUS ────────────────────────────────────────────────────────

    #[test]
    fn check_status_completed_with_pr_url_keeps_worker() {
        let f = fixture(2);
        // Assign without running the fire-and-forget pipeline.
        let worker = f.pool.get_available_worker().unwrap().unwrap();
        f.pool
            .assign_worker_task(
                &worker.id(),
                WorkerTask {
                    task_id: "T-1".to_string(),
                    action: TaskAction::StartNewTask,
                    board_item: Some(board_item("T-1")),
                    pull_request_url: None,
                    comments: None,
                    repository_id: "acme/svc".to_string(),
                    assigned_at: Utc::now(),
                    last_sync_time: None,
                },
            )
            .unwrap();

        let response = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-1".to_string(),
        });
        assert_eq!(response.status, RequestStatus::Completed);
        assert_eq!(
            response.pull_request_url.as_deref(),
            Some("https://example.com/acme/svc/pull/42")
        );
        // Worker retained for the rest of the workflow.
        assert!(f.pool.get_worker_by_task_id("T-1").is_some());
        f.pool.shutdown();
    }

    #[test]
    fn check_status_maps_retry_backoff_to_in_progress() {
        let f = fixture(2);
        let worker = f.pool.get_available_worker().unwrap().unwrap();
        worker
            .assign_task(WorkerTask {
                task_id: "T-1".to_string(),
                action: TaskAction::StartNewTask,
                board_item: None,
                pull_request_url: None,
                comments: None,
                repository_id: "acme/svc".to_string(),
                assigned_at: Utc::now(),
                last_sync_time: None,
            })
            .unwrap();
        f.developer.push_error("connection refused");
        let response = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-1".to_string(),
        });
        // First check ran inline and failed; worker went into backoff.
        assert_eq!(response.status, RequestStatus::Error);

        let second = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-1".to_string(),
        });
        assert_eq!(second.status, RequestStatus::InProgress);
        assert_eq!(second.worker_status, Some(WorkerStatus::Waiting));
        f.pool.shutdown();
    }

    #[test]
    fn check_status_without_worker_or_workspace_errors() {
        let f = fixture(2);
        let response = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-404".to_string(),
        });
        assert_eq!(response.status, RequestStatus::Error);
        assert!(response.message.contains("no workspace"));
        f.pool.shutdown();
    }

    #[test]
    fn check_status_reassigns_when_workspace_survives() {
        let f = fixture(2);
        // A workspace exists on disk but no worker owns the task (restart).
        f.workspaces
            .create_workspace("T-9", "acme/svc", None)
            .unwrap();

        let response = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-9".to_string(),
        });
        assert_eq!(response.status, RequestStatus::Accepted);
        assert!(response.message.contains("reassigned"));

        f.router.join_in_flight();
        let worker = f.pool.get_worker_by_task_id("T-9").unwrap();
        assert_eq!(worker.current_task().unwrap().action, TaskAction::ResumeTask);
        f.pool.shutdown();
    }

    // ── PROCESS_FEEDBACK ────────────────────────────────────────────────────

    #[test]
    fn feedback_handed_to_existing_worker() {
        let f = fixture(2);
        start(&f, "T-1");
        f.router.join_in_flight();

        let response = f.router.handle(TaskRequest::ProcessFeedback {
            task_id: "T-1".to_string(),
            board_item: None,
            pull_request_url: Some("https://example.com/acme/svc/pull/42".to_string()),
            comments: vec![ReviewComment {
                id: "c1".to_string(),
                author: "alice".to_string(),
                body: "rename please".to_string(),
                created_at: Utc::now(),
                is_bot: false,
            }],
            last_sync_time: None,
        });
        assert_eq!(response.status, RequestStatus::Accepted);

        f.router.join_in_flight();
        let worker = f.pool.get_worker_by_task_id("T-1").unwrap();
        let task = worker.current_task().unwrap();
        assert_eq!(task.action, TaskAction::ProcessFeedback);
        // The feedback prompt actually reached the backend.
        assert!(f.developer.prompts().iter().any(|p| p.contains("rename please")));
        f.pool.shutdown();
    }

    #[test]
    fn feedback_without_worker_or_workspace_errors() {
        let f = fixture(2);
        let response = f.router.handle(TaskRequest::ProcessFeedback {
            task_id: "T-404".to_string(),
            board_item: None,
            pull_request_url: None,
            comments: vec![],
            last_sync_time: None,
        });
        assert_eq!(response.status, RequestStatus::Error);
        f.pool.shutdown();
    }

    #[test]
    fn feedback_allocates_fresh_worker_when_workspace_exists() {
        let f = fixture(2);
        f.workspaces
            .create_workspace("T-9", "acme/svc", None)
            .unwrap();

        let response = f.router.handle(TaskRequest::ProcessFeedback {
            task_id: "T-9".to_string(),
            board_item: None,
            pull_request_url: None,
            comments: vec![],
            last_sync_time: None,
        });
        assert_eq!(response.status, RequestStatus::Accepted);
        f.router.join_in_flight();
        f.pool.shutdown();
    }

    // ── REQUEST_MERGE ───────────────────────────────────────────────────────

    #[test]
    fn merge_runs_inline_and_releases_worker() {
        let f = fixture(2);
        start(&f, "T-1");
        f.router.join_in_flight();
        f.developer
            .push_response("The pull request was merged successfully.");

        let response = f.router.handle(TaskRequest::RequestMerge {
            task_id: "T-1".to_string(),
            pull_request_url: "https://example.com/acme/svc/pull/42".to_string(),
        });
        assert_eq!(response.status, RequestStatus::Completed);
        // Worker released: no owner for the task anymore.
        assert!(f.pool.get_worker_by_task_id("T-1").is_none());
        // Merge success cleaned the workspace.
        assert!(f.workspaces.workspace_for("T-1").is_none());
        f.pool.shutdown();
    }

    #[test]
    fn merge_failure_leaves_worker_for_retry() {
        let f = fixture(2);
        start(&f, "T-1");
        f.router.join_in_flight();
        f.developer.push_error("connection refused");

        let response = f.router.handle(TaskRequest::RequestMerge {
            task_id: "T-1".to_string(),
            pull_request_url: "https://example.com/acme/svc/pull/42".to_string(),
        });
        assert_eq!(response.status, RequestStatus::Error);
        // Worker still owns the task, waiting out its backoff.
        let worker = f.pool.get_worker_by_task_id("T-1").unwrap();
        assert_eq!(worker.status(), WorkerStatus::Waiting);
        assert!(worker.in_backoff());
        f.pool.shutdown();
    }

    #[test]
    fn quarantined_worker_errors_until_recovered() {
        let f = fixture(2);
        start(&f, "T-5");
        f.router.join_in_flight();
        let worker = f.pool.get_worker_by_task_id("T-5").unwrap();

        // Five straight transient failures through the status poll.
        for _ in 0..5 {
            f.developer.push_error("connection refused");
            worker.force_retry_now();
            f.router.handle(TaskRequest::CheckStatus {
                task_id: "T-5".to_string(),
            });
        }
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert!(worker.is_quarantined());

        // Status checks and feedback are refused while quarantined.
        let check = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-5".to_string(),
        });
        assert_eq!(check.status, RequestStatus::Error);
        assert!(check.message.contains("quarantined"));
        let feedback = f.router.handle(TaskRequest::ProcessFeedback {
            task_id: "T-5".to_string(),
            board_item: None,
            pull_request_url: None,
            comments: vec![],
            last_sync_time: None,
        });
        assert_eq!(feedback.status, RequestStatus::Rejected);

        // The recovery sweep transition unblocks the next cycle.
        worker.resume_execution().unwrap();
        let after = f.router.handle(TaskRequest::CheckStatus {
            task_id: "T-5".to_string(),
        });
        assert_eq!(after.status, RequestStatus::Completed);
        f.pool.shutdown();
    }

    // ── RELEASE_WORKER ──────────────────────────────────────────────────────

    #[test]
    fn release_worker_is_idempotent() {
        let f = fixture(2);
        start(&f, "T-1");
        f.router.join_in_flight();

        let first = f.router.handle(TaskRequest::ReleaseWorker {
            task_id: "T-1".to_string(),
        });
        assert_eq!(first.status, RequestStatus::Accepted);
        assert!(f.pool.get_worker_by_task_id("T-1").is_none());

        // Releasing again (or any unknown task) still succeeds.
        let second = f.router.handle(TaskRequest::ReleaseWorker {
            task_id: "T-1".to_string(),
        });
        assert_eq!(second.status, RequestStatus::Accepted);
        f.pool.shutdown();
    }

    // ── Validator ───────────────────────────────────────────────────────────

    #[test]
    fn validator_decisions() {
        let f = fixture(2);
        // No workspace.
        assert!(matches!(
            f.router.validator().check_reassignment("T-none"),
            AssignmentDecision::WithoutWorkspace
        ));
        assert!(!f.router.validator().can_assign_to_idle_worker("T-none"));

        // Valid workspace (directory exists).
        let info = f.workspaces.create_workspace("T-1", "acme/svc", None).unwrap();
        assert!(matches!(
            f.router.validator().check_reassignment("T-1"),
            AssignmentDecision::WithWorkspace(_)
        ));
        assert!(f.router.validator().can_assign_to_idle_worker("T-1"));

        // Record present but directory gone.
        std::fs::remove_dir_all(&info.workspace_dir).unwrap();
        assert!(matches!(
            f.router.validator().check_reassignment("T-1"),
            AssignmentDecision::RecreateWorkspace(_)
        ));
        assert!(!f.router.validator().can_assign_to_idle_worker("T-1"));
        f.pool.shutdown();
    }
}
