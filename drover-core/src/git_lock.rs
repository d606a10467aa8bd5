//! Per-repository mutual exclusion for git operations.
//!
//! Every git subprocess that touches a shared clone goes through
//! [`GitLockRegistry::with_lock`]. Locks on different repositories are
//! independent; operations on the same repository are strictly serialized.
//! Acquisition is bounded so a wedged operation cannot deadlock the fleet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::errors::OrchestratorError;

const ACQUIRE_POLL: Duration = Duration::from_millis(25);

/// Registry of per-repository locks. One instance per process, shared by
/// the repository cache and the workspace manager.
pub struct GitLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl GitLockRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, repository_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(repository_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `repository_id`.
    ///
    /// The lock is released on every exit path, including errors and panics
    /// inside `f`. Fails with a lock-timeout error if the lock cannot be
    /// acquired within the registry deadline.
    pub fn with_lock<T>(
        &self,
        repository_id: &str,
        operation: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let entry = self.entry(repository_id);
        let guard = self.acquire(&entry, repository_id, operation)?;
        tracing::debug!(repository = repository_id, operation, "git lock acquired");
        let result = f();
        drop(guard);
        tracing::debug!(repository = repository_id, operation, "git lock released");
        result
    }

    fn acquire<'a>(
        &self,
        entry: &'a Mutex<()>,
        repository_id: &str,
        operation: &str,
    ) -> Result<MutexGuard<'a, ()>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match entry.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(OrchestratorError::LockTimeout {
                            repository: repository_id.to_string(),
                            operation: operation.to_string(),
                            seconds: self.timeout.as_secs(),
                        }
                        .into());
                    }
                    std::thread::sleep(ACQUIRE_POLL);
                }
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    // A previous holder panicked; the protected state is a git
                    // repo on disk, not the mutex payload, so recover.
                    entry.clear_poison();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn lock_runs_closure_and_returns_value() {
        let registry = GitLockRegistry::new(Duration::from_secs(1));
        let out = registry
            .with_lock("acme/svc", "clone", || Ok(42))
            .unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn lock_released_after_error() {
        let registry = GitLockRegistry::new(Duration::from_secs(1));
        let failed: Result<()> = registry.with_lock("acme/svc", "pull", || {
            anyhow::bail!("network is down")
        });
        assert!(failed.is_err());

        // Must be reacquirable immediately.
        registry.with_lock("acme/svc", "pull", || Ok(())).unwrap();
    }

    #[test]
    fn same_repo_operations_are_serialized() {
        let registry = Arc::new(GitLockRegistry::new(Duration::from_secs(5)));
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let in_section = in_section.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    registry
                        .with_lock("acme/svc", "op", || {
                            let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            in_section.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_repos_proceed_in_parallel() {
        let registry = Arc::new(GitLockRegistry::new(Duration::from_millis(200)));

        // Hold repo-a's lock from another thread; repo-b must be unaffected.
        let blocker = {
            let registry = registry.clone();
            thread::spawn(move || {
                registry
                    .with_lock("acme/a", "slow", || {
                        thread::sleep(Duration::from_millis(100));
                        Ok(())
                    })
                    .unwrap();
            })
        };
        thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        registry.with_lock("acme/b", "fast", || Ok(())).unwrap();
        assert!(started.elapsed() < Duration::from_millis(80));

        blocker.join().unwrap();
    }

    #[test]
    fn acquisition_times_out_with_lock_timeout_kind() {
        use crate::errors::{classify_error, ErrorKind};

        let registry = Arc::new(GitLockRegistry::new(Duration::from_millis(50)));
        let registry2 = registry.clone();

        let holder = thread::spawn(move || {
            registry2
                .with_lock("acme/svc", "long-clone", || {
                    thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
                .unwrap();
        });
        thread::sleep(Duration::from_millis(10));

        let err = registry
            .with_lock("acme/svc", "pull", || Ok(()))
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorKind::LockTimeout);
        assert!(err.to_string().contains("acme/svc"));

        holder.join().unwrap();
    }
}
