//! Orchestrator context: explicit wiring of every component.
//!
//! Nothing in this crate is a module-level singleton; the store, lock
//! registry, cache, pool, router, and planner are constructed here and
//! threaded through by reference. The monitoring loop is a plain thread
//! loop with a shutdown flag — SIGINT/SIGTERM flips the flag from the
//! binary, the drain file flips it from the operator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::board::{BoardProvider, GhBoardGateway};
use crate::config::{Credentials, DroverConfig};
use crate::developer::{ClaudeCliBackend, DeveloperBackend};
use crate::drain::DrainSignal;
use crate::git::{Git, GitCli, GitRunner};
use crate::git_lock::GitLockRegistry;
use crate::planner::Planner;
use crate::pool::{PoolStartup, WorkerPool};
use crate::repo_cache::RepositoryCache;
use crate::review::{CommentFilter, GhReviewGateway, ReviewProvider};
use crate::router::TaskRouter;
use crate::store::StateStore;
use crate::worker::PipelineDeps;
use crate::workspace::WorkspaceManager;

/// Everything the orchestrator runs on, built once at startup.
pub struct Orchestrator {
    config: DroverConfig,
    store: Arc<StateStore>,
    pool: Arc<WorkerPool>,
    router: Arc<TaskRouter>,
    planner: Arc<Planner>,
    drain: DrainSignal,
    shutdown: Arc<AtomicBool>,
}

/// External collaborators, injectable for tests and dry runs.
pub struct Providers {
    pub board: Arc<dyn BoardProvider>,
    pub reviews: Arc<dyn ReviewProvider>,
    pub developer: Arc<dyn DeveloperBackend>,
    pub git_runner: Arc<dyn GitRunner>,
}

impl Providers {
    /// The production set: `gh` CLI gateways, claude CLI backend, host git.
    pub fn host(config: &DroverConfig) -> Result<Self> {
        let credentials = Credentials::load(&config.base_dir)?;
        Ok(Self {
            board: Arc::new(GhBoardGateway::new(config.board_id.clone())),
            reviews: Arc::new(GhReviewGateway),
            developer: Arc::new(ClaudeCliBackend::new(
                config.developer.clone(),
                credentials,
            )),
            git_runner: Arc::new(GitCli),
        })
    }
}

impl Orchestrator {
    pub fn build(config: DroverConfig, providers: Providers) -> Result<Self> {
        if config.board_id.is_empty() {
            anyhow::bail!("board_id is not configured; set it in config or DROVER_BOARD_ID");
        }
        std::fs::create_dir_all(&config.base_dir)
            .with_context(|| format!("creating {}", config.base_dir.display()))?;

        let store = Arc::new(StateStore::new(&config.state_dir()));
        store.initialize()?;

        let git = Arc::new(Git::new(providers.git_runner, config.git.operation_timeout));
        let locks = Arc::new(GitLockRegistry::new(config.git.lock_timeout));
        let repos = Arc::new(RepositoryCache::new(
            config.repositories_dir(),
            store.clone(),
            git.clone(),
            locks.clone(),
            config.repo_cache_timeout,
        ));
        let workspaces = Arc::new(WorkspaceManager::new(
            config.base_dir.clone(),
            store.clone(),
            repos,
            git,
            locks,
        ));

        let deps = Arc::new(PipelineDeps {
            store: store.clone(),
            workspaces: workspaces.clone(),
            developer: providers.developer.clone(),
            reviews: providers.reviews.clone(),
            developer_config: config.developer.clone(),
        });
        let pool = WorkerPool::new(
            store.clone(),
            config.pool.clone(),
            providers.developer.kind().to_string(),
            config.base_dir.clone(),
        );
        let router = Arc::new(TaskRouter::new(
            pool.clone(),
            workspaces,
            deps,
            config.board_id.clone(),
        ));
        let filter = CommentFilter {
            exclude_author: config.review_filter.exclude_author,
            allowed_bots: config.review_filter.allowed_bots.clone(),
        };
        let planner = Arc::new(Planner::new(
            providers.board,
            providers.reviews,
            router.clone(),
            store.clone(),
            config.board_id.clone(),
            filter,
        ));
        let drain = DrainSignal::new(&config.base_dir);

        Ok(Self {
            config,
            store,
            pool,
            router,
            planner,
            drain,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked between cycles; flipped by the signal handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    /// Startup recovery: prune stale records, restore the pool, hydrate the
    /// planner. Returns the pool restoration counts for the banner.
    pub fn start(&self) -> Result<PoolStartup> {
        let pruned = self.store.prune_stale_tasks(self.config.state_max_age_days)?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned stale task records");
        }
        let startup = self.pool.initialize_pool()?;
        self.planner.start_monitoring();
        Ok(startup)
    }

    /// Monitoring loop: one planner cycle per poll interval, until shutdown
    /// or drain. `once` exits after a single cycle.
    pub fn run(&self, once: bool) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("shutdown requested, stopping planner");
                break;
            }
            if self.drain.is_set() {
                tracing::info!("drain signal set; finishing in-flight work and stopping");
                break;
            }

            self.planner.run_cycle();

            if once {
                tracing::info!("single cycle complete, exiting");
                break;
            }
            self.sleep_interruptibly(self.config.poll_interval);
        }

        self.shutdown_components();
        Ok(())
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.shutdown.load(Ordering::SeqCst) || self.drain.is_set() {
                return;
            }
            let tick = Duration::from_millis(200).min(total - slept);
            std::thread::sleep(tick);
            slept += tick;
        }
    }

    /// Graceful teardown: in-flight worker pipelines are allowed to finish,
    /// then the pool stops its housekeeper.
    fn shutdown_components(&self) {
        self.router.join_in_flight();
        self.pool.shutdown();
    }

    /// Base directory this orchestrator operates in.
    pub fn base_dir(&self) -> &PathBuf {
        &self.config.base_dir
    }
}
