//! Worker: owns one task at a time and runs the execute pipeline.
//!
//! The in-memory worker is shared between the router (assignments, status
//! queries) and its own pipeline thread, so it lives behind a mutex inside
//! [`WorkerHandle`]. The inner lock is held only for state mutation —
//! never across git, developer, or provider I/O. A separate execution lock
//! guarantees at most one pipeline per worker at a time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::branch::resolve_base_branch;
use crate::config::DeveloperConfig;
use crate::developer::DeveloperBackend;
use crate::errors::{classify_error, ErrorKind, OrchestratorError};
use crate::model::{TaskAction, WorkerKind, WorkerRecord, WorkerStatus, WorkerTask};
use crate::parser::{parse_developer_output, ExecutionResult};
use crate::prompt::build_prompt;
use crate::review::ReviewProvider;
use crate::store::StateStore;
use crate::workspace::WorkspaceManager;

/// Consecutive pipeline failures before a worker is quarantined.
const QUARANTINE_THRESHOLD: u32 = 5;

/// Retry backoff: `min(30 * 2^(k-1), 300)` seconds for the k-th failure.
fn retry_backoff_secs(consecutive_errors: u32) -> i64 {
    let exp = consecutive_errors.saturating_sub(1).min(10);
    (30i64 << exp).min(300)
}

/// Everything a pipeline run needs besides the worker itself.
pub struct PipelineDeps {
    pub store: Arc<StateStore>,
    pub workspaces: Arc<WorkspaceManager>,
    pub developer: Arc<dyn DeveloperBackend>,
    pub reviews: Arc<dyn ReviewProvider>,
    pub developer_config: DeveloperConfig,
}

#[derive(Debug)]
struct Worker {
    id: String,
    kind: WorkerKind,
    developer_kind: String,
    status: WorkerStatus,
    current_task: Option<WorkerTask>,
    workspace_dir: PathBuf,
    progress: String,
    error_count: u64,
    consecutive_errors: u32,
    last_error_at: Option<DateTime<Utc>>,
    retry_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

/// Thread-safe handle to one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<Mutex<Worker>>,
    exec: Arc<Mutex<()>>,
}

impl WorkerHandle {
    pub fn new(
        id: impl Into<String>,
        kind: WorkerKind,
        developer_kind: impl Into<String>,
        workspace_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(Mutex::new(Worker {
                id: id.into(),
                kind,
                developer_kind: developer_kind.into(),
                status: WorkerStatus::Idle,
                current_task: None,
                workspace_dir,
                progress: String::new(),
                error_count: 0,
                consecutive_errors: 0,
                last_error_at: None,
                retry_after: None,
                created_at: now,
                last_active_at: now,
            })),
            exec: Arc::new(Mutex::new(())),
        }
    }

    /// Reconstruct a worker from its durable record after a restart.
    ///
    /// A record that was WORKING when the process died has no pipeline
    /// anymore; it restores as WAITING so the next CHECK_STATUS restarts
    /// execution. An IDLE record that still carries a task is corrupt.
    pub fn from_record(record: WorkerRecord) -> Result<Self> {
        if record.status == WorkerStatus::Idle && record.current_task.is_some() {
            return Err(OrchestratorError::CorruptState(format!(
                "idle worker {} still carries task {}",
                record.id,
                record.current_task.as_ref().map(|t| t.task_id.as_str()).unwrap_or("?")
            ))
            .into());
        }
        if record.status.requires_task() && record.current_task.is_none() {
            return Err(OrchestratorError::CorruptState(format!(
                "{} worker {} has no task",
                record.status, record.id
            ))
            .into());
        }

        let status = match record.status {
            WorkerStatus::Working => WorkerStatus::Waiting,
            other => other,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(Worker {
                id: record.id,
                kind: record.worker_kind,
                developer_kind: record.developer_kind,
                status,
                current_task: record.current_task,
                workspace_dir: record.workspace_dir,
                progress: "restored from durable state".to_string(),
                error_count: 0,
                consecutive_errors: 0,
                last_error_at: None,
                retry_after: None,
                created_at: record.created_at,
                last_active_at: record.last_active_at,
            })),
            exec: Arc::new(Mutex::new(())),
        })
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn id(&self) -> String {
        self.inner.lock().unwrap().id.clone()
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.lock().unwrap().status
    }

    pub fn kind(&self) -> WorkerKind {
        self.inner.lock().unwrap().kind
    }

    pub fn current_task(&self) -> Option<WorkerTask> {
        self.inner.lock().unwrap().current_task.clone()
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .current_task
            .as_ref()
            .map(|t| t.task_id.clone())
    }

    pub fn progress(&self) -> String {
        self.inner.lock().unwrap().progress.clone()
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().last_active_at
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_errors
    }

    /// Total pipeline failures over this worker's lifetime.
    pub fn error_count(&self) -> u64 {
        self.inner.lock().unwrap().error_count
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().last_error_at
    }

    /// Whether this worker was stopped by the failure-streak quarantine (as
    /// opposed to an operator pause). Quarantined workers stay refused until
    /// the pool's recovery sweep revives them.
    pub fn is_quarantined(&self) -> bool {
        let w = self.inner.lock().unwrap();
        w.status == WorkerStatus::Stopped && w.consecutive_errors >= QUARANTINE_THRESHOLD
    }

    /// Whether a retry backoff is still pending.
    pub fn in_backoff(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .retry_after
            .is_some_and(|t| Utc::now() < t)
    }

    #[cfg(test)]
    pub(crate) fn force_retry_now(&self) {
        self.inner.lock().unwrap().retry_after = None;
    }

    /// Durable view of the current state.
    pub fn snapshot(&self) -> WorkerRecord {
        let w = self.inner.lock().unwrap();
        WorkerRecord {
            id: w.id.clone(),
            status: w.status,
            workspace_dir: w.workspace_dir.clone(),
            developer_kind: w.developer_kind.clone(),
            worker_kind: w.kind,
            current_task: w.current_task.clone(),
            created_at: w.created_at,
            last_active_at: w.last_active_at,
        }
    }

    // ── State machine ───────────────────────────────────────────────────────

    /// Hand a task to this worker.
    ///
    /// Permitted: START_NEW_TASK from IDLE; RESUME_TASK from IDLE, WAITING,
    /// or ERROR; PROCESS_FEEDBACK and MERGE_REQUEST from WAITING or ERROR.
    /// Always rejected while WORKING or STOPPED.
    pub fn assign_task(&self, task: WorkerTask) -> Result<()> {
        let mut w = self.inner.lock().unwrap();

        if !task.action.is_assignable() {
            return Err(invalid_transition(w.status, task.action));
        }
        let permitted = match task.action {
            TaskAction::StartNewTask => w.status == WorkerStatus::Idle,
            TaskAction::ResumeTask => matches!(
                w.status,
                WorkerStatus::Idle | WorkerStatus::Waiting | WorkerStatus::Error
            ),
            TaskAction::ProcessFeedback | TaskAction::MergeRequest => {
                matches!(w.status, WorkerStatus::Waiting | WorkerStatus::Error)
            }
            _ => false,
        };
        if !permitted {
            return Err(invalid_transition(w.status, task.action));
        }

        tracing::info!(
            worker = w.id.as_str(),
            task = task.task_id.as_str(),
            action = %task.action,
            "task assigned"
        );
        w.current_task = Some(task);
        w.status = WorkerStatus::Waiting;
        w.progress = "preparing workspace".to_string();
        w.retry_after = None;
        w.last_active_at = Utc::now();
        Ok(())
    }

    /// WORKING → STOPPED.
    pub fn pause_execution(&self) -> Result<()> {
        let mut w = self.inner.lock().unwrap();
        if w.status != WorkerStatus::Working {
            return Err(invalid_transition(w.status, TaskAction::CheckStatus));
        }
        w.status = WorkerStatus::Stopped;
        w.progress = "paused".to_string();
        w.last_active_at = Utc::now();
        Ok(())
    }

    /// STOPPED | ERROR → WAITING, clearing the failure streak.
    pub fn resume_execution(&self) -> Result<()> {
        let mut w = self.inner.lock().unwrap();
        if !matches!(w.status, WorkerStatus::Stopped | WorkerStatus::Error) {
            return Err(invalid_transition(w.status, TaskAction::ResumeTask));
        }
        if w.current_task.is_none() {
            return Err(OrchestratorError::CorruptState(format!(
                "worker {} cannot resume without a task",
                w.id
            ))
            .into());
        }
        w.status = WorkerStatus::Waiting;
        w.consecutive_errors = 0;
        w.retry_after = None;
        w.progress = "resumed".to_string();
        w.last_active_at = Utc::now();
        Ok(())
    }

    /// Any state → IDLE with no lingering task.
    pub fn cancel_execution(&self) {
        let mut w = self.inner.lock().unwrap();
        w.status = WorkerStatus::Idle;
        w.current_task = None;
        w.progress = String::new();
        w.retry_after = None;
        w.consecutive_errors = 0;
        w.last_active_at = Utc::now();
    }

    /// Release after workflow completion; identical shape to cancel but kept
    /// separate because the pool decides eviction by worker kind afterwards.
    pub fn release(&self) {
        self.cancel_execution();
    }

    // ── Execute pipeline ────────────────────────────────────────────────────

    /// Run the pipeline for the current task.
    ///
    /// Stage failures are converted into a non-success [`ExecutionResult`]
    /// and drive the retry/quarantine policy; `Err` is reserved for
    /// precondition violations (no task, pipeline already running).
    pub fn start_execution(&self, deps: &PipelineDeps) -> Result<ExecutionResult> {
        let _exec = self.exec.try_lock().map_err(|_| {
            anyhow::Error::new(OrchestratorError::InvalidTransition {
                status: self.status().to_string(),
                action: "start_execution (already running)".to_string(),
            })
        })?;

        let task = {
            let mut w = self.inner.lock().unwrap();
            let Some(task) = w.current_task.clone() else {
                return Err(OrchestratorError::InvalidTransition {
                    status: w.status.to_string(),
                    action: "start_execution (no task)".to_string(),
                }
                .into());
            };
            if let Some(after) = w.retry_after {
                if Utc::now() < after {
                    return Ok(backoff_pending_result(&task.task_id, after));
                }
            }
            w.status = WorkerStatus::Working;
            w.progress = "initializing developer backend".to_string();
            w.last_active_at = Utc::now();
            task
        };
        deps.store.save_worker(&self.snapshot())?;

        let outcome = self.run_pipeline(&task, deps);

        let result = match outcome {
            Ok(result) => {
                let mut w = self.inner.lock().unwrap();
                w.consecutive_errors = 0;
                w.retry_after = None;
                w.last_active_at = Utc::now();
                // WAITING, not IDLE: the planner releases the worker when the
                // overall workflow for the task completes.
                w.status = WorkerStatus::Waiting;
                w.progress = if result.success {
                    "execution complete".to_string()
                } else {
                    "execution finished without success".to_string()
                };
                result
            }
            Err(err) => self.record_failure(&task.task_id, err),
        };
        deps.store.save_worker(&self.snapshot())?;
        Ok(result)
    }

    fn record_failure(&self, task_id: &str, err: anyhow::Error) -> ExecutionResult {
        let kind = classify_error(&err);
        let message = format!("{err:#}");
        let mut w = self.inner.lock().unwrap();
        w.error_count += 1;
        w.consecutive_errors += 1;
        w.last_error_at = Some(Utc::now());

        tracing::warn!(
            worker = w.id.as_str(),
            task = task_id,
            kind = %kind,
            consecutive = w.consecutive_errors,
            error = message.as_str(),
            "pipeline stage failed"
        );

        if kind.is_retryable() {
            if w.consecutive_errors >= QUARANTINE_THRESHOLD {
                w.status = WorkerStatus::Stopped;
                w.retry_after = None;
                w.progress = "quarantined after repeated failures".to_string();
            } else {
                let backoff = retry_backoff_secs(w.consecutive_errors);
                w.status = WorkerStatus::Waiting;
                w.retry_after = Some(Utc::now() + ChronoDuration::seconds(backoff));
                w.progress = format!("retrying in {backoff}s");
            }
        } else if kind == ErrorKind::PermanentExternal {
            w.status = WorkerStatus::Idle;
            w.current_task = None;
            w.retry_after = None;
            w.progress = "permanent failure, task cleared".to_string();
        } else {
            w.status = WorkerStatus::Error;
            w.retry_after = None;
            w.progress = "failed, awaiting recovery".to_string();
        }
        w.last_active_at = Utc::now();

        ExecutionResult {
            task_id: task_id.to_string(),
            success: false,
            pull_request_url: None,
            error_message: Some(message),
            completed_at: Utc::now(),
            details: format!("classified as {kind}"),
        }
    }

    fn set_progress(&self, progress: &str) {
        let mut w = self.inner.lock().unwrap();
        w.progress = progress.to_string();
        w.last_active_at = Utc::now();
    }

    fn run_pipeline(&self, task: &WorkerTask, deps: &PipelineDeps) -> Result<ExecutionResult> {
        // Stage 1: developer backend, bounded attempts with linear backoff.
        let max_attempts = deps.developer_config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match deps.developer.initialize() {
                Ok(()) => break,
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(attempt, error = %e, "developer initialization failed, retrying");
                    std::thread::sleep(deps.developer_config.retry_delay * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e.context("developer backend initialization")),
            }
        }

        // Stage 2: workspace.
        self.set_progress("preparing workspace");
        let info = self.prepare_workspace(task, deps)?;

        // Stage 3: prompt.
        self.set_progress("generating prompt");
        let prompt = build_prompt(task, &info.branch_name);

        // Stage 4: developer invocation.
        self.set_progress("invoking developer");
        let raw = deps
            .developer
            .execute_prompt(&prompt, &info.workspace_dir)?;

        // Stage 5: parse.
        self.set_progress("parsing result");
        let result = parse_developer_output(&task.task_id, &raw.raw_output);

        // Stage 6: a merged task no longer needs its workspace.
        if task.action == TaskAction::MergeRequest && result.success {
            self.set_progress("cleaning up workspace");
            deps.workspaces.cleanup_workspace(&task.task_id);
        }

        Ok(result)
    }

    fn prepare_workspace(
        &self,
        task: &WorkerTask,
        deps: &PipelineDeps,
    ) -> Result<crate::model::WorkspaceInfo> {
        let existing = deps.workspaces.workspace_for(&task.task_id);
        let mut info = match existing {
            Some(info) if deps.workspaces.is_worktree_valid(&info) => info,
            Some(info) => {
                tracing::info!(
                    task = task.task_id.as_str(),
                    dir = %info.workspace_dir.display(),
                    "workspace invalid, recreating"
                );
                deps.workspaces.cleanup_workspace(&task.task_id);
                deps.workspaces.create_workspace(
                    &task.task_id,
                    &task.repository_id,
                    task.board_item.as_ref(),
                )?
            }
            None => deps.workspaces.create_workspace(
                &task.task_id,
                &task.repository_id,
                task.board_item.as_ref(),
            )?,
        };

        let labels = task
            .board_item
            .as_ref()
            .map(|i| i.labels.clone())
            .unwrap_or_default();
        let base_branch = resolve_base_branch(&labels, || {
            deps.reviews
                .get_repository_default_branch(&task.repository_id)
                .ok()
        });

        deps.workspaces.setup_worktree(&mut info, &base_branch)?;
        deps.workspaces
            .setup_instruction_file(&info, task.board_item.as_ref())?;

        self.inner.lock().unwrap().workspace_dir = info.workspace_dir.clone();
        Ok(info)
    }
}

fn invalid_transition(status: WorkerStatus, action: TaskAction) -> anyhow::Error {
    OrchestratorError::InvalidTransition {
        status: status.to_string(),
        action: action.to_string(),
    }
    .into()
}

fn backoff_pending_result(task_id: &str, until: DateTime<Utc>) -> ExecutionResult {
    ExecutionResult {
        task_id: task_id.to_string(),
        success: false,
        pull_request_url: None,
        error_message: Some(format!("retry backoff until {until}")),
        completed_at: Utc::now(),
        details: "backoff".to_string(),
    }
}
