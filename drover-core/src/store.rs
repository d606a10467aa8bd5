//! Durable, lock-serialized state store.
//!
//! One JSON file per entity kind under `<base>/.state/`, each holding a list
//! of records. Every mutation runs under a process-local mutex plus a
//! disk-level sentinel lock (`.lock`, exclusive create), then rewrites the
//! affected file atomically via temp + rename. Readers snapshot the
//! in-memory maps without touching the lock.
//!
//! Loads are self-healing: a missing file is an empty collection, and a
//! malformed file or record is logged and skipped rather than wedging
//! startup. Any other I/O error on load is fatal to `initialize`.

use std::collections::HashMap;
use std::io::Write as IoWriteExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use std::{fs, io};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::OrchestratorError;
use crate::model::{
    RepositoryState, Task, TaskStatus, WorkerRecord, WorkerStatus, WorkspaceInfo,
};

const TASKS_FILE: &str = "tasks.json";
const WORKERS_FILE: &str = "workers.json";
const WORKSPACES_FILE: &str = "workspaces.json";
const REPOSITORIES_FILE: &str = "repositories.json";
const LOCK_FILE: &str = ".lock";

const DEFAULT_LOCK_RETRIES: u32 = 120;
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Write `content` to `path` atomically using a temp file + rename.
///
/// `rename(2)` within one directory is atomic on POSIX — readers always see
/// either the old complete file or the new complete file.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// RAII guard for the on-disk sentinel lock.
struct DiskLock {
    path: PathBuf,
}

impl DiskLock {
    fn acquire(path: &Path, retries: u32) -> Result<Self> {
        for _ in 0..retries {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e).context("creating state lock file"),
            }
        }
        Err(OrchestratorError::ResourceBusy(path.display().to_string()).into())
    }
}

impl Drop for DiskLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    tasks: HashMap<String, Task>,
    workers: HashMap<String, WorkerRecord>,
    /// Keyed by task id — one workspace per task.
    workspaces: HashMap<String, WorkspaceInfo>,
    repositories: HashMap<String, RepositoryState>,
}

/// Which entity file a mutation dirties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entity {
    Tasks,
    Workers,
    Workspaces,
    Repositories,
}

/// The durable state store.
pub struct StateStore {
    state_dir: PathBuf,
    snapshot: RwLock<Snapshot>,
    mutation: Mutex<()>,
    lock_retries: u32,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            snapshot: RwLock::new(Snapshot::default()),
            mutation: Mutex::new(()),
            lock_retries: DEFAULT_LOCK_RETRIES,
        }
    }

    #[cfg(test)]
    fn with_lock_retries(state_dir: &Path, retries: u32) -> Self {
        let mut store = Self::new(state_dir);
        store.lock_retries = retries;
        store
    }

    /// Load all entity files into memory. Must be called before use.
    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("creating {}", self.state_dir.display()))?;

        let snapshot = Snapshot {
            tasks: load_keyed(&self.state_dir.join(TASKS_FILE), |t: &Task| t.id.clone())?,
            workers: load_keyed(&self.state_dir.join(WORKERS_FILE), |w: &WorkerRecord| {
                w.id.clone()
            })?,
            workspaces: load_keyed(
                &self.state_dir.join(WORKSPACES_FILE),
                |w: &WorkspaceInfo| w.task_id.clone(),
            )?,
            repositories: load_keyed(
                &self.state_dir.join(REPOSITORIES_FILE),
                |r: &RepositoryState| r.id.clone(),
            )?,
        };
        *self.snapshot.write().unwrap() = snapshot;
        Ok(())
    }

    fn mutate<T>(&self, entity: Entity, f: impl FnOnce(&mut Snapshot) -> T) -> Result<T> {
        let _proc = self.mutation.lock().unwrap();
        let _disk = DiskLock::acquire(&self.state_dir.join(LOCK_FILE), self.lock_retries)?;

        let mut snapshot = self.snapshot.write().unwrap();
        let out = f(&mut snapshot);
        self.persist(entity, &snapshot)?;
        Ok(out)
    }

    fn persist(&self, entity: Entity, snapshot: &Snapshot) -> Result<()> {
        match entity {
            Entity::Tasks => persist_values(&self.state_dir.join(TASKS_FILE), &snapshot.tasks),
            Entity::Workers => {
                persist_values(&self.state_dir.join(WORKERS_FILE), &snapshot.workers)
            }
            Entity::Workspaces => {
                persist_values(&self.state_dir.join(WORKSPACES_FILE), &snapshot.workspaces)
            }
            Entity::Repositories => persist_values(
                &self.state_dir.join(REPOSITORIES_FILE),
                &snapshot.repositories,
            ),
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────────────

    pub fn save_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.mutate(Entity::Tasks, |s| {
            s.tasks.insert(task.id.clone(), task);
        })
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.snapshot.read().unwrap().tasks.get(id).cloned()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.snapshot.read().unwrap().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.get_all_tasks()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    pub fn get_task_last_sync_time(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.get_task(task_id).and_then(|t| t.last_sync_time)
    }

    pub fn update_task_last_sync_time(
        &self,
        task_id: &str,
        sync_time: DateTime<Utc>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        self.mutate(Entity::Tasks, |s| {
            if let Some(task) = s.tasks.get_mut(&task_id) {
                task.last_sync_time = Some(sync_time);
                task.updated_at = Utc::now();
            }
        })
    }

    pub fn add_processed_comments_to_task(&self, task_id: &str, ids: &[String]) -> Result<()> {
        let task_id = task_id.to_string();
        let ids: Vec<String> = ids.to_vec();
        self.mutate(Entity::Tasks, |s| {
            if let Some(task) = s.tasks.get_mut(&task_id) {
                task.processed_comment_ids.extend(ids);
                task.updated_at = Utc::now();
            }
        })
    }

    /// Delete DONE task records whose last update predates the cutoff.
    pub fn prune_stale_tasks(&self, max_age_days: u64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        self.mutate(Entity::Tasks, move |s| {
            let stale: Vec<String> = s
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Done && t.updated_at < cutoff)
                .map(|t| t.id.clone())
                .collect();
            for id in &stale {
                s.tasks.remove(id);
            }
            stale.len()
        })
    }

    // ── Workers ─────────────────────────────────────────────────────────────

    pub fn save_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let worker = worker.clone();
        self.mutate(Entity::Workers, |s| {
            s.workers.insert(worker.id.clone(), worker);
        })
    }

    pub fn get_worker(&self, id: &str) -> Option<WorkerRecord> {
        self.snapshot.read().unwrap().workers.get(id).cloned()
    }

    pub fn get_all_workers(&self) -> Vec<WorkerRecord> {
        let mut workers: Vec<WorkerRecord> = self
            .snapshot
            .read()
            .unwrap()
            .workers
            .values()
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn get_active_workers(&self) -> Vec<WorkerRecord> {
        self.get_all_workers()
            .into_iter()
            .filter(|w| w.status.is_active())
            .collect()
    }

    pub fn get_worker_by_task_id(&self, task_id: &str) -> Option<WorkerRecord> {
        self.snapshot
            .read()
            .unwrap()
            .workers
            .values()
            .find(|w| {
                w.current_task
                    .as_ref()
                    .is_some_and(|t| t.task_id == task_id)
            })
            .cloned()
    }

    pub fn delete_worker(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(Entity::Workers, |s| {
            s.workers.remove(&id);
        })
    }

    /// Delete IDLE workers whose `last_active_at` predates the cutoff.
    /// Returns the deleted ids.
    pub fn cleanup_idle_workers(&self, older_than_minutes: u64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(older_than_minutes as i64);
        self.mutate(Entity::Workers, move |s| {
            let stale: Vec<String> = s
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Idle && w.last_active_at < cutoff)
                .map(|w| w.id.clone())
                .collect();
            for id in &stale {
                if let Some(record) = s.workers.remove(id) {
                    if record.current_task.is_some() {
                        tracing::warn!(
                            worker = id.as_str(),
                            "purged idle worker still carried a task; treating record as corrupt"
                        );
                    }
                }
            }
            stale
        })
    }

    // ── Workspaces ──────────────────────────────────────────────────────────

    pub fn save_workspace(&self, workspace: &WorkspaceInfo) -> Result<()> {
        let workspace = workspace.clone();
        self.mutate(Entity::Workspaces, |s| {
            s.workspaces.insert(workspace.task_id.clone(), workspace);
        })
    }

    pub fn get_workspace(&self, task_id: &str) -> Option<WorkspaceInfo> {
        self.snapshot
            .read()
            .unwrap()
            .workspaces
            .get(task_id)
            .cloned()
    }

    pub fn get_all_workspaces(&self) -> Vec<WorkspaceInfo> {
        let mut spaces: Vec<WorkspaceInfo> = self
            .snapshot
            .read()
            .unwrap()
            .workspaces
            .values()
            .cloned()
            .collect();
        spaces.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        spaces
    }

    pub fn delete_workspace(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.mutate(Entity::Workspaces, |s| {
            s.workspaces.remove(&task_id);
        })
    }

    // ── Repositories ────────────────────────────────────────────────────────

    pub fn save_repository(&self, repository: &RepositoryState) -> Result<()> {
        let repository = repository.clone();
        self.mutate(Entity::Repositories, |s| {
            s.repositories.insert(repository.id.clone(), repository);
        })
    }

    pub fn get_repository(&self, id: &str) -> Option<RepositoryState> {
        self.snapshot
            .read()
            .unwrap()
            .repositories
            .get(id)
            .cloned()
    }

    pub fn get_all_repositories(&self) -> Vec<RepositoryState> {
        let mut repos: Vec<RepositoryState> = self
            .snapshot
            .read()
            .unwrap()
            .repositories
            .values()
            .cloned()
            .collect();
        repos.sort_by(|a, b| a.id.cmp(&b.id));
        repos
    }

    pub fn delete_repository(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(Entity::Repositories, |s| {
            s.repositories.remove(&id);
        })
    }
}

/// Load a JSON list file into a keyed map.
///
/// Missing file → empty. Unparseable file or record → logged and skipped.
/// Any other I/O error is fatal.
fn load_keyed<T: DeserializeOwned>(
    path: &Path,
    key: impl Fn(&T) -> String,
) -> Result<HashMap<String, T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let values: Vec<serde_json::Value> = match serde_json::from_str(&content) {
        Ok(values) => values,
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "malformed state file, starting empty");
            return Ok(HashMap::new());
        }
    };

    let mut map = HashMap::new();
    for value in values {
        match serde_json::from_value::<T>(value) {
            Ok(record) => {
                map.insert(key(&record), record);
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping malformed record");
            }
        }
    }
    Ok(map)
}

fn persist_values<T: Serialize>(path: &Path, map: &HashMap<String, T>) -> Result<()> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let values: Vec<&T> = keys.iter().map(|k| &map[*k]).collect();
    let content = serde_json::to_string_pretty(&values)?;
    atomic_write(path, &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskAction, WorkerKind, WorkerTask};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        let store = StateStore::new(dir.path());
        store.initialize().unwrap();
        store
    }

    fn worker(id: &str, status: WorkerStatus, task_id: Option<&str>) -> WorkerRecord {
        WorkerRecord {
            id: id.to_string(),
            status,
            workspace_dir: PathBuf::from("/tmp/ws"),
            developer_kind: "claude-cli".to_string(),
            worker_kind: WorkerKind::Pool,
            current_task: task_id.map(|t| WorkerTask {
                task_id: t.to_string(),
                action: TaskAction::StartNewTask,
                board_item: None,
                pull_request_url: None,
                comments: None,
                repository_id: "acme/svc".to_string(),
                assigned_at: Utc::now(),
                last_sync_time: None,
            }),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        }
    }

    #[test]
    fn initialize_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(s.get_all_tasks().is_empty());
        assert!(s.get_all_workers().is_empty());
    }

    #[test]
    fn task_save_load_round_trips_across_restart() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        {
            let s = store(&dir);
            let mut task = Task::new("T-1", TaskStatus::InProgress, now);
            task.processed_comment_ids.insert("c-1".to_string());
            task.last_sync_time = Some(now);
            s.save_task(&task).unwrap();
        }

        // Fresh store over the same directory.
        let s = store(&dir);
        let task = s.get_task("T-1").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.created_at, now);
        assert_eq!(task.last_sync_time, Some(now));
        assert!(task.processed_comment_ids.contains("c-1"));
    }

    #[test]
    fn worker_read_back_equals_last_write() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let w = worker("w-1", WorkerStatus::Waiting, Some("T-1"));
        s.save_worker(&w).unwrap();

        let loaded = s.get_worker("w-1").unwrap();
        assert_eq!(loaded.status, w.status);
        assert_eq!(loaded.last_active_at, w.last_active_at);
        assert_eq!(
            loaded.current_task.unwrap().task_id,
            w.current_task.unwrap().task_id
        );
    }

    #[test]
    fn tasks_by_status_filters() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_task(&Task::new("T-1", TaskStatus::Todo, Utc::now())).unwrap();
        s.save_task(&Task::new("T-2", TaskStatus::InReview, Utc::now())).unwrap();
        s.save_task(&Task::new("T-3", TaskStatus::Todo, Utc::now())).unwrap();

        assert_eq!(s.get_tasks_by_status(TaskStatus::Todo).len(), 2);
        assert_eq!(s.get_tasks_by_status(TaskStatus::Done).len(), 0);
    }

    #[test]
    fn active_workers_are_waiting_or_working() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_worker(&worker("w-1", WorkerStatus::Idle, None)).unwrap();
        s.save_worker(&worker("w-2", WorkerStatus::Waiting, Some("T-1"))).unwrap();
        s.save_worker(&worker("w-3", WorkerStatus::Working, Some("T-2"))).unwrap();
        s.save_worker(&worker("w-4", WorkerStatus::Stopped, Some("T-3"))).unwrap();

        let active: Vec<String> = s.get_active_workers().into_iter().map(|w| w.id).collect();
        assert_eq!(active, vec!["w-2", "w-3"]);
    }

    #[test]
    fn worker_by_task_id_scans_current_tasks() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_worker(&worker("w-1", WorkerStatus::Working, Some("T-9"))).unwrap();
        s.save_worker(&worker("w-2", WorkerStatus::Idle, None)).unwrap();

        assert_eq!(s.get_worker_by_task_id("T-9").unwrap().id, "w-1");
        assert!(s.get_worker_by_task_id("T-404").is_none());
    }

    #[test]
    fn cleanup_idle_workers_respects_cutoff_and_status() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        let mut old_idle = worker("w-1", WorkerStatus::Idle, None);
        old_idle.last_active_at = Utc::now() - chrono::Duration::minutes(120);
        s.save_worker(&old_idle).unwrap();

        let fresh_idle = worker("w-2", WorkerStatus::Idle, None);
        s.save_worker(&fresh_idle).unwrap();

        let mut old_busy = worker("w-3", WorkerStatus::Working, Some("T-1"));
        old_busy.last_active_at = Utc::now() - chrono::Duration::minutes(120);
        s.save_worker(&old_busy).unwrap();

        let purged = s.cleanup_idle_workers(60).unwrap();
        assert_eq!(purged, vec!["w-1"]);
        assert!(s.get_worker("w-1").is_none());
        assert!(s.get_worker("w-2").is_some());
        assert!(s.get_worker("w-3").is_some());
    }

    #[test]
    fn last_sync_time_round_trip() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_task(&Task::new("T-1", TaskStatus::InReview, Utc::now())).unwrap();
        assert!(s.get_task_last_sync_time("T-1").is_none());

        let t = Utc::now();
        s.update_task_last_sync_time("T-1", t).unwrap();
        assert_eq!(s.get_task_last_sync_time("T-1"), Some(t));
    }

    #[test]
    fn processed_comments_accumulate_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_task(&Task::new("T-1", TaskStatus::InReview, Utc::now())).unwrap();

        s.add_processed_comments_to_task("T-1", &["a".to_string(), "b".to_string()]).unwrap();
        s.add_processed_comments_to_task("T-1", &["b".to_string(), "c".to_string()]).unwrap();

        let task = s.get_task("T-1").unwrap();
        assert_eq!(task.processed_comment_ids.len(), 3);
    }

    #[test]
    fn workspace_and_repository_round_trip() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        s.save_workspace(&WorkspaceInfo {
            task_id: "T-1".to_string(),
            repository_id: "acme/svc".to_string(),
            workspace_dir: PathBuf::from("/tmp/acme-svc_T-1"),
            branch_name: "issue-7".to_string(),
            worktree_created: true,
            instruction_file_path: PathBuf::from("/tmp/acme-svc_T-1/AGENT_TASK.md"),
            created_at: Utc::now(),
        })
        .unwrap();
        s.save_repository(&RepositoryState {
            id: "acme/svc".to_string(),
            local_path: PathBuf::from("/tmp/repos/acme-svc"),
            last_fetch_at: Some(Utc::now()),
            is_cloned: true,
            active_worktrees: vec![PathBuf::from("/tmp/acme-svc_T-1")],
        })
        .unwrap();

        assert_eq!(s.get_workspace("T-1").unwrap().branch_name, "issue-7");
        assert!(s.get_repository("acme/svc").unwrap().is_cloned);

        s.delete_workspace("T-1").unwrap();
        s.delete_repository("acme/svc").unwrap();
        assert!(s.get_workspace("T-1").is_none());
        assert!(s.get_repository("acme/svc").is_none());
    }

    #[test]
    fn malformed_file_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(TASKS_FILE), "not json at all").unwrap();

        let s = StateStore::new(dir.path());
        s.initialize().unwrap();
        assert!(s.get_all_tasks().is_empty());
    }

    #[test]
    fn malformed_record_skipped_others_kept() {
        let dir = TempDir::new().unwrap();
        let good = Task::new("T-1", TaskStatus::Todo, Utc::now());
        let content = format!(
            "[{}, {{\"bogus\": true}}]",
            serde_json::to_string(&good).unwrap()
        );
        fs::write(dir.path().join(TASKS_FILE), content).unwrap();

        let s = StateStore::new(dir.path());
        s.initialize().unwrap();
        assert_eq!(s.get_all_tasks().len(), 1);
    }

    #[test]
    fn empty_file_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(WORKERS_FILE), "").unwrap();
        let s = StateStore::new(dir.path());
        s.initialize().unwrap();
        assert!(s.get_all_workers().is_empty());
    }

    #[test]
    fn prune_stale_tasks_removes_old_done_only() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        let mut old_done = Task::new("T-1", TaskStatus::Done, Utc::now());
        old_done.updated_at = Utc::now() - chrono::Duration::days(30);
        s.save_task(&old_done).unwrap();

        let mut old_active = Task::new("T-2", TaskStatus::InProgress, Utc::now());
        old_active.updated_at = Utc::now() - chrono::Duration::days(30);
        s.save_task(&old_active).unwrap();

        s.save_task(&Task::new("T-3", TaskStatus::Done, Utc::now())).unwrap();

        let pruned = s.prune_stale_tasks(7).unwrap();
        assert_eq!(pruned, 1);
        assert!(s.get_task("T-1").is_none());
        assert!(s.get_task("T-2").is_some());
        assert!(s.get_task("T-3").is_some());
    }

    #[test]
    fn mutation_fails_resource_busy_when_lock_held() {
        use crate::errors::{classify_error, ErrorKind};

        let dir = TempDir::new().unwrap();
        let s = StateStore::with_lock_retries(dir.path(), 3);
        s.initialize().unwrap();

        // Simulate another process holding the sentinel.
        fs::write(dir.path().join(LOCK_FILE), "99999").unwrap();

        let err = s
            .save_task(&Task::new("T-1", TaskStatus::Todo, Utc::now()))
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorKind::TransientExternal);
        assert!(err.to_string().contains("busy"));

        fs::remove_file(dir.path().join(LOCK_FILE)).unwrap();
        s.save_task(&Task::new("T-1", TaskStatus::Todo, Utc::now())).unwrap();
    }

    #[test]
    fn lock_file_removed_after_mutation() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_task(&Task::new("T-1", TaskStatus::Todo, Utc::now())).unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn concurrent_mutations_all_land() {
        let dir = TempDir::new().unwrap();
        let s = Arc::new(store(&dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = s.clone();
                std::thread::spawn(move || {
                    s.save_task(&Task::new(format!("T-{i}"), TaskStatus::Todo, Utc::now()))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(s.get_all_tasks().len(), 8);

        // And the persisted file agrees after a reload.
        let fresh = StateStore::new(dir.path());
        fresh.initialize().unwrap();
        assert_eq!(fresh.get_all_tasks().len(), 8);
    }
}
