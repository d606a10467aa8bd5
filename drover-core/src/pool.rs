//! Worker pool: allocation, restoration, recovery, retirement.
//!
//! The pool owns every in-memory [`WorkerHandle`] and keeps the durable
//! worker records in step with them. Allocation is serialized by a single
//! lock so two concurrent requests can never be handed the same worker, and
//! the housekeeper retires idle workers and revives stuck ones on a timer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::config::PoolConfig;
use crate::model::{WorkerKind, WorkerRecord, WorkerStatus, WorkerTask};
use crate::store::StateStore;
use crate::worker::WorkerHandle;

pub struct WorkerPool {
    store: Arc<StateStore>,
    config: PoolConfig,
    developer_kind: String,
    base_dir: PathBuf,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// Serializes `get_available_worker`; only one allocation at a time.
    alloc: Mutex<()>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    stop: Arc<AtomicBool>,
    housekeeper: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Self-reference handed to the housekeeper thread.
    weak: Weak<WorkerPool>,
}

/// Outcome of pool initialization, for the startup banner.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStartup {
    pub restored: usize,
    pub purged: usize,
    pub created: usize,
}

impl WorkerPool {
    pub fn new(
        store: Arc<StateStore>,
        config: PoolConfig,
        developer_kind: impl Into<String>,
        base_dir: PathBuf,
    ) -> Arc<Self> {
        let developer_kind = developer_kind.into();
        Arc::new_cyclic(|weak| Self {
            store,
            config,
            developer_kind,
            base_dir,
            workers: Mutex::new(HashMap::new()),
            alloc: Mutex::new(()),
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            housekeeper: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn fresh_id(&self) -> String {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("w-{n}");
            if !self.workers.lock().unwrap().contains_key(&id)
                && self.store.get_worker(&id).is_none()
            {
                return id;
            }
        }
    }

    /// Restore durable workers, top up to the minimum, start the housekeeper.
    pub fn initialize_pool(&self) -> Result<PoolStartup> {
        let mut startup = PoolStartup::default();

        for record in self.store.get_all_workers() {
            let id = record.id.clone();
            match WorkerHandle::from_record(record) {
                Ok(handle) => {
                    self.store.save_worker(&handle.snapshot())?;
                    self.workers.lock().unwrap().insert(id, handle);
                    startup.restored += 1;
                }
                Err(e) => {
                    tracing::warn!(worker = id.as_str(), error = %e, "purging unrestorable worker record");
                    self.store.delete_worker(&id)?;
                    startup.purged += 1;
                }
            }
        }

        while self.workers.lock().unwrap().len() < self.config.min_workers {
            self.create_worker(WorkerKind::Pool)?;
            startup.created += 1;
        }

        self.start_housekeeper();
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            restored = startup.restored,
            purged = startup.purged,
            created = startup.created,
            "worker pool initialized"
        );
        Ok(startup)
    }

    fn create_worker(&self, kind: WorkerKind) -> Result<WorkerHandle> {
        let id = self.fresh_id();
        let handle = WorkerHandle::new(
            id.clone(),
            kind,
            self.developer_kind.clone(),
            self.base_dir.clone(),
        );
        self.store.save_worker(&handle.snapshot())?;
        self.workers.lock().unwrap().insert(id, handle.clone());
        Ok(handle)
    }

    /// Hand out an IDLE worker, creating one if the pool is below its
    /// maximum. Returns `None` when every slot is busy — never blocks.
    pub fn get_available_worker(&self) -> Result<Option<WorkerHandle>> {
        let _alloc = self.alloc.lock().unwrap();

        {
            let workers = self.workers.lock().unwrap();
            let mut ids: Vec<&String> = workers.keys().collect();
            ids.sort();
            for id in ids {
                let handle = &workers[id];
                if handle.status() == WorkerStatus::Idle {
                    return Ok(Some(handle.clone()));
                }
            }
            if workers.len() >= self.config.max_workers {
                return Ok(None);
            }
        }

        // Above the configured minimum, extra capacity is temporary and
        // evicted on release.
        let kind = if self.workers.lock().unwrap().len() < self.config.min_workers {
            WorkerKind::Pool
        } else {
            WorkerKind::Temporary
        };
        self.create_worker(kind).map(Some)
    }

    /// Assign `task` to worker `id`, rolling the durable record back if the
    /// in-memory assignment is rejected.
    pub fn assign_worker_task(&self, id: &str, task: WorkerTask) -> Result<()> {
        let handle = self
            .get_worker_instance(id)
            .ok_or_else(|| anyhow::anyhow!("worker {id} not found"))?;

        let backup: Option<WorkerRecord> = self.store.get_worker(id);
        match handle.assign_task(task) {
            Ok(()) => self.store.save_worker(&handle.snapshot()),
            Err(e) => {
                if let Some(backup) = backup {
                    let _ = self.store.save_worker(&backup);
                }
                Err(e)
            }
        }
    }

    pub fn get_worker_instance(&self, id: &str) -> Option<WorkerHandle> {
        self.workers.lock().unwrap().get(id).cloned()
    }

    pub fn get_worker_by_task_id(&self, task_id: &str) -> Option<WorkerHandle> {
        self.workers
            .lock()
            .unwrap()
            .values()
            .find(|w| w.current_task_id().as_deref() == Some(task_id))
            .cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Release a worker after its workflow completed. Pool workers go back
    /// to IDLE; temporary workers are evicted outright.
    pub fn release_worker(&self, id: &str) -> Result<()> {
        let Some(handle) = self.get_worker_instance(id) else {
            return Ok(());
        };
        match handle.kind() {
            WorkerKind::Pool => {
                handle.release();
                self.store.save_worker(&handle.snapshot())?;
            }
            WorkerKind::Temporary => {
                handle.release();
                self.workers.lock().unwrap().remove(id);
                self.store.delete_worker(id)?;
                tracing::info!(worker = id, "temporary worker evicted");
            }
        }
        Ok(())
    }

    /// Revive STOPPED workers whose last activity predates the recovery
    /// timeout.
    pub fn recover_stopped_workers(&self) -> Result<Vec<String>> {
        self.recover_workers(WorkerStatus::Stopped, self.config.worker_timeout)
    }

    /// Revive ERROR workers on half the recovery timeout.
    pub fn recover_error_workers(&self) -> Result<Vec<String>> {
        self.recover_workers(WorkerStatus::Error, self.config.worker_timeout / 2)
    }

    fn recover_workers(&self, from: WorkerStatus, timeout: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let candidates: Vec<WorkerHandle> = self
            .workers
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.status() == from && w.last_active_at() < cutoff)
            .cloned()
            .collect();

        let mut recovered = vec![];
        for handle in candidates {
            match handle.resume_execution() {
                Ok(()) => {
                    self.store.save_worker(&handle.snapshot())?;
                    recovered.push(handle.id());
                }
                Err(e) => {
                    tracing::warn!(worker = handle.id().as_str(), error = %e, "recovery failed");
                }
            }
        }
        if !recovered.is_empty() {
            tracing::info!(from = %from, count = recovered.len(), "recovered workers");
        }
        Ok(recovered)
    }

    /// Retire IDLE workers past the idle timeout. Runs under the allocation
    /// lock so a concurrent allocation loses the race cleanly.
    pub fn cleanup_idle_workers(&self) -> Result<Vec<String>> {
        let _alloc = self.alloc.lock().unwrap();
        let purged = self
            .store
            .cleanup_idle_workers(self.config.idle_timeout_minutes)?;
        let mut workers = self.workers.lock().unwrap();
        for id in &purged {
            // Only drop handles that are still idle in memory.
            if workers
                .get(id)
                .is_some_and(|w| w.status() == WorkerStatus::Idle)
            {
                workers.remove(id);
            }
        }
        Ok(purged)
    }

    // ── Housekeeper ─────────────────────────────────────────────────────────

    fn start_housekeeper(&self) {
        let pool = self.weak.clone();
        let stop = self.stop.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_minutes * 60);

        let handle = std::thread::spawn(move || {
            loop {
                // Sleep in short ticks so shutdown is prompt.
                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let tick = Duration::from_millis(200).min(interval - slept);
                    std::thread::sleep(tick);
                    slept += tick;
                }
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.run_housekeeping();
            }
        });
        *self.housekeeper.lock().unwrap() = Some(handle);
    }

    /// One housekeeping sweep: idle cleanup and both recovery passes, in
    /// parallel, each error-isolated.
    pub fn run_housekeeping(&self) {
        std::thread::scope(|scope| {
            scope.spawn(|| {
                if let Err(e) = self.cleanup_idle_workers() {
                    tracing::warn!(sweep = "cleanup-idle", error = %e, "housekeeping sweep failed");
                }
            });
            scope.spawn(|| {
                if let Err(e) = self.recover_stopped_workers() {
                    tracing::warn!(sweep = "recover-stopped", error = %e, "housekeeping sweep failed");
                }
            });
            scope.spawn(|| {
                if let Err(e) = self.recover_error_workers() {
                    tracing::warn!(sweep = "recover-error", error = %e, "housekeeping sweep failed");
                }
            });
        });
    }

    /// Stop the housekeeper and mark the pool uninitialized. Worker
    /// instances are intentionally left as-is so their durable state is
    /// available to the next run.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.housekeeper.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("worker pool shut down");
    }
}
