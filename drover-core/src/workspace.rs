//! Per-task isolated working trees.
//!
//! Each active task gets `<base>/<sanitized-repo>_<task-id>/`: a git
//! worktree off the shared clone plus a fixed-name instruction file the
//! developer backend reads on startup. Creation is idempotent and
//! validation is deliberately permissive — the system prefers resuming an
//! existing tree over recreating one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::board::BoardItem;
use crate::branch::{branch_name_for_task, unique_branch_name};
use crate::git::Git;
use crate::git_lock::GitLockRegistry;
use crate::model::WorkspaceInfo;
use crate::repo_cache::{sanitize_repository_id, RepositoryCache};
use crate::store::StateStore;

/// Fixed name of the instruction document inside every workspace.
pub const INSTRUCTION_FILE_NAME: &str = "AGENT_TASK.md";

pub struct WorkspaceManager {
    base_dir: PathBuf,
    store: Arc<StateStore>,
    repos: Arc<RepositoryCache>,
    git: Arc<Git>,
    locks: Arc<GitLockRegistry>,
}

impl WorkspaceManager {
    pub fn new(
        base_dir: PathBuf,
        store: Arc<StateStore>,
        repos: Arc<RepositoryCache>,
        git: Arc<Git>,
        locks: Arc<GitLockRegistry>,
    ) -> Self {
        Self {
            base_dir,
            store,
            repos,
            git,
            locks,
        }
    }

    /// Durable workspace record for a task, if one exists.
    pub fn workspace_for(&self, task_id: &str) -> Option<WorkspaceInfo> {
        self.store.get_workspace(task_id)
    }

    /// Create (or re-create) the workspace record and directory for a task.
    pub fn create_workspace(
        &self,
        task_id: &str,
        repository_id: &str,
        item: Option<&BoardItem>,
    ) -> Result<WorkspaceInfo> {
        let dir_name = format!("{}_{}", sanitize_repository_id(repository_id), task_id);
        let workspace_dir = self.base_dir.join(dir_name);
        let branch_name = branch_name_for_task(task_id, item);

        std::fs::create_dir_all(&workspace_dir)
            .with_context(|| format!("creating {}", workspace_dir.display()))?;

        let info = WorkspaceInfo {
            task_id: task_id.to_string(),
            repository_id: repository_id.to_string(),
            workspace_dir: workspace_dir.clone(),
            branch_name,
            worktree_created: false,
            instruction_file_path: workspace_dir.join(INSTRUCTION_FILE_NAME),
            created_at: Utc::now(),
        };
        self.store.save_workspace(&info)?;
        Ok(info)
    }

    /// Ensure a worktree exists at the workspace path, forked from
    /// `base_branch`. Updates `info.branch_name` if a collision forced a
    /// suffixed branch.
    pub fn setup_worktree(&self, info: &mut WorkspaceInfo, base_branch: &str) -> Result<()> {
        // Refresh the clone aggressively on the task's first worktree so new
        // branches fork from a current base.
        let local_path = self
            .repos
            .ensure_repository(&info.repository_id, !info.worktree_created)?;

        let workspace_dir = info.workspace_dir.clone();
        let requested_branch = info.branch_name.clone();
        let repository_id = info.repository_id.clone();

        let final_branch = self.locks.with_lock(&repository_id, "worktree-setup", || {
            self.git.worktree_prune(&local_path)?;

            if is_git_worktree(&workspace_dir) {
                // A previous run already attached this path; keep it.
                self.git.status_ok(&workspace_dir)?;
                return Ok(requested_branch.clone());
            }

            let branch = self.pick_branch(&local_path, &requested_branch)?;
            let branch_exists = self.git.branch_exists(&local_path, &branch)?;
            self.git.worktree_add(
                &local_path,
                &workspace_dir,
                &branch,
                base_branch,
                !branch_exists,
            )?;
            self.git.status_ok(&workspace_dir)?;
            Ok(branch)
        })?;

        if final_branch != info.branch_name {
            tracing::info!(
                task = info.task_id.as_str(),
                requested = info.branch_name.as_str(),
                using = final_branch.as_str(),
                "branch already checked out elsewhere, using suffixed branch"
            );
            info.branch_name = final_branch;
        }
        info.worktree_created = true;
        self.store.save_workspace(info)?;
        self.repos.add_worktree(&info.repository_id, &info.workspace_dir)?;
        Ok(())
    }

    /// Choose a branch name that is not checked out in another worktree,
    /// appending `-1`, `-2`, … when needed.
    fn pick_branch(&self, local_path: &Path, requested: &str) -> Result<String> {
        if !self.git.branch_exists(local_path, requested)?
            || !self.git.branch_checked_out(local_path, requested)?
        {
            return Ok(requested.to_string());
        }
        Ok(unique_branch_name(requested, |candidate| {
            self.git
                .branch_checked_out(local_path, candidate)
                .unwrap_or(false)
                || self.git.branch_exists(local_path, candidate).unwrap_or(false)
        }))
    }

    /// Permissive validation: an existing directory is good enough to try
    /// resuming in. A proper worktree (`.git` file with `gitdir:`) is just
    /// logged at a lower level.
    pub fn is_worktree_valid(&self, info: &WorkspaceInfo) -> bool {
        if !info.workspace_dir.is_dir() {
            return false;
        }
        if is_git_worktree(&info.workspace_dir) {
            tracing::debug!(task = info.task_id.as_str(), "workspace is a git worktree");
        } else {
            tracing::info!(
                task = info.task_id.as_str(),
                dir = %info.workspace_dir.display(),
                "workspace directory exists but is not a worktree; reusing anyway"
            );
        }
        true
    }

    /// Write the fixed instruction document into the workspace.
    pub fn setup_instruction_file(
        &self,
        info: &WorkspaceInfo,
        item: Option<&BoardItem>,
    ) -> Result<()> {
        let mut doc = String::new();
        doc.push_str("# Task Workspace\n\n");
        doc.push_str(&format!("- Task: {}\n", info.task_id));
        doc.push_str(&format!("- Repository: {}\n", info.repository_id));
        doc.push_str(&format!("- Branch: {}\n", info.branch_name));
        doc.push_str(&format!(
            "- Working directory: {}\n",
            info.workspace_dir.display()
        ));
        if let Some(item) = item {
            doc.push_str(&format!("- Board item: {}\n", item.title));
        }
        doc.push_str("\n## Conventions\n\n");
        doc.push_str("- Work only on the branch named above; never commit to the default branch\n");
        doc.push_str("- Commit after each logical unit of work, not just at the end\n");
        doc.push_str("- Push after each commit so the remote reflects progress\n");
        doc.push_str("- Run existing tests before declaring the task complete\n");
        doc.push_str("- Open exactly one pull request for this task and print its URL as `PR: <url>`\n");

        std::fs::write(&info.instruction_file_path, doc)
            .with_context(|| format!("writing {}", info.instruction_file_path.display()))?;
        Ok(())
    }

    /// Tear down a task's workspace: worktree, directory, registration, and
    /// durable record. Best-effort — failures are logged, never raised.
    pub fn cleanup_workspace(&self, task_id: &str) {
        let Some(info) = self.store.get_workspace(task_id) else {
            return;
        };

        if info.worktree_created {
            if let Some(repo) = self.store.get_repository(&info.repository_id) {
                let result = self.locks.with_lock(&info.repository_id, "worktree-remove", || {
                    self.git
                        .worktree_remove(&repo.local_path, &info.workspace_dir, true)
                });
                if let Err(e) = result {
                    tracing::warn!(task = task_id, error = %e, "worktree removal failed");
                }
            }
        }

        if info.workspace_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&info.workspace_dir) {
                tracing::warn!(task = task_id, error = %e, "workspace directory removal failed");
            }
        }

        if let Err(e) = self.repos.remove_worktree(&info.repository_id, &info.workspace_dir) {
            tracing::warn!(task = task_id, error = %e, "worktree deregistration failed");
        }
        if let Err(e) = self.store.delete_workspace(task_id) {
            tracing::warn!(task = task_id, error = %e, "workspace record deletion failed");
        }
    }
}

/// A worktree checkout is marked by a `.git` *file* whose content starts
/// with `gitdir:` (a full clone has a `.git` directory instead).
fn is_git_worktree(path: &Path) -> bool {
    let git_path = path.join(".git");
    if !git_path.is_file() {
        return false;
    }
    std::fs::read_to_string(&git_path)
        .map(|c| c.starts_with("gitdir:"))
        .unwrap_or(false)
}
