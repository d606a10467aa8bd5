//! Repository cache: one shared clone per repository.
//!
//! All workers of a repository share a single physical clone and hang their
//! worktrees off it. The cache clones on first demand, refreshes the clone
//! under a time-based policy, and self-heals when the recorded path stops
//! being a usable repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::git::Git;
use crate::git_lock::GitLockRegistry;
use crate::model::RepositoryState;
use crate::store::StateStore;

/// Flatten `<owner>/<repo>` into a filesystem-safe directory name.
pub fn sanitize_repository_id(repository_id: &str) -> String {
    crate::branch::sanitize(repository_id)
}

/// Canonical https remote for an `<owner>/<repo>` id.
fn remote_url(repository_id: &str) -> Result<String> {
    let mut parts = repository_id.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => {
            Ok(format!("https://github.com/{owner}/{repo}.git"))
        }
        _ => anyhow::bail!("invalid repository id '{repository_id}', expected <owner>/<repo>"),
    }
}

pub struct RepositoryCache {
    repositories_dir: PathBuf,
    store: Arc<StateStore>,
    git: Arc<Git>,
    locks: Arc<GitLockRegistry>,
    cache_timeout: Duration,
    /// In-memory freshness markers; reset on restart so the first `ensure`
    /// after a crash always refetches.
    last_refresh: Mutex<HashMap<String, Instant>>,
}

impl RepositoryCache {
    pub fn new(
        repositories_dir: PathBuf,
        store: Arc<StateStore>,
        git: Arc<Git>,
        locks: Arc<GitLockRegistry>,
        cache_timeout: Duration,
    ) -> Self {
        Self {
            repositories_dir,
            store,
            git,
            locks,
            cache_timeout,
            last_refresh: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_path_for(&self, repository_id: &str) -> PathBuf {
        self.repositories_dir
            .join(sanitize_repository_id(repository_id))
    }

    pub fn is_repository_cloned(&self, repository_id: &str) -> bool {
        self.store
            .get_repository(repository_id)
            .map(|r| r.is_cloned && self.git.is_valid_repo(&r.local_path))
            .unwrap_or(false)
    }

    /// Return the path of a clone guaranteed to exist, cloning or refreshing
    /// as needed. `force_update` bypasses the freshness window.
    pub fn ensure_repository(&self, repository_id: &str, force_update: bool) -> Result<PathBuf> {
        if let Some(record) = self.store.get_repository(repository_id) {
            if record.is_cloned {
                if self.git.is_valid_repo(&record.local_path) {
                    self.refresh_if_stale(repository_id, &record.local_path, force_update)?;
                    return Ok(record.local_path);
                }
                // Recorded path is gone or not a repo: discard and re-clone.
                tracing::warn!(
                    repository = repository_id,
                    path = %record.local_path.display(),
                    "recorded clone is unusable, purging record"
                );
                self.store.delete_repository(repository_id)?;
            }
        }
        self.clone_fresh(repository_id)
    }

    fn clone_fresh(&self, repository_id: &str) -> Result<PathBuf> {
        let url = remote_url(repository_id)?;
        let local_path = self.local_path_for(repository_id);
        std::fs::create_dir_all(&self.repositories_dir)
            .with_context(|| format!("creating {}", self.repositories_dir.display()))?;

        self.locks.with_lock(repository_id, "clone", || {
            // Another thread may have finished the clone while this one
            // waited on the lock.
            if self.git.is_valid_repo(&local_path) {
                return Ok(());
            }
            if local_path.exists() {
                std::fs::remove_dir_all(&local_path)
                    .with_context(|| format!("clearing {}", local_path.display()))?;
            }
            tracing::info!(repository = repository_id, url = url.as_str(), "cloning");
            self.git.clone_repo(&url, &local_path)
        })?;

        self.store.save_repository(&RepositoryState {
            id: repository_id.to_string(),
            local_path: local_path.clone(),
            last_fetch_at: Some(Utc::now()),
            is_cloned: true,
            active_worktrees: vec![],
        })?;
        self.mark_refreshed(repository_id);
        Ok(local_path)
    }

    fn refresh_if_stale(&self, repository_id: &str, local_path: &Path, force: bool) -> Result<()> {
        if !force && !self.is_stale(repository_id) {
            return Ok(());
        }

        self.locks.with_lock(repository_id, "refresh", || {
            // Uncommitted changes in the shared clone would block the
            // fast-forward; park them. Never merge.
            if self.git.is_dirty(local_path)? {
                tracing::warn!(
                    repository = repository_id,
                    "shared clone dirty before refresh, stashing"
                );
                self.git.stash(local_path)?;
            }
            self.git.pull_ff_only(local_path)
        })?;

        if let Some(mut record) = self.store.get_repository(repository_id) {
            record.last_fetch_at = Some(Utc::now());
            self.store.save_repository(&record)?;
        }
        self.mark_refreshed(repository_id);
        Ok(())
    }

    fn is_stale(&self, repository_id: &str) -> bool {
        self.last_refresh
            .lock()
            .unwrap()
            .get(repository_id)
            .map(|t| t.elapsed() >= self.cache_timeout)
            .unwrap_or(true)
    }

    fn mark_refreshed(&self, repository_id: &str) {
        self.last_refresh
            .lock()
            .unwrap()
            .insert(repository_id.to_string(), Instant::now());
    }

    /// Record a worktree as active on this repository.
    pub fn add_worktree(&self, repository_id: &str, path: &Path) -> Result<()> {
        if let Some(mut record) = self.store.get_repository(repository_id) {
            if !record.active_worktrees.iter().any(|p| p == path) {
                record.active_worktrees.push(path.to_path_buf());
                self.store.save_repository(&record)?;
            }
        }
        Ok(())
    }

    /// Deregister a worktree from this repository.
    pub fn remove_worktree(&self, repository_id: &str, path: &Path) -> Result<()> {
        if let Some(mut record) = self.store.get_repository(repository_id) {
            record.active_worktrees.retain(|p| p != path);
            self.store.save_repository(&record)?;
        }
        Ok(())
    }
}
