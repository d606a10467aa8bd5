//! Runtime configuration for drover.
//!
//! Resolution order: **env var > `<base>/config` file > hardcoded default**.
//!
//! ```text
//! Field                     Env Var                           Config Key                Default
//! ───────────────────────── ───────────────────────────────── ───────────────────────── ────────
//! board_id                  DROVER_BOARD_ID                   board_id                  (required)
//! poll_interval             DROVER_POLL_INTERVAL              poll_interval             120s
//! min_workers               DROVER_MIN_WORKERS                min_workers               1
//! max_workers               DROVER_MAX_WORKERS                max_workers               4 (max 16)
//! worker_timeout            DROVER_WORKER_TIMEOUT             worker_timeout            600s
//! idle_timeout_minutes      DROVER_IDLE_TIMEOUT_MINUTES       idle_timeout_minutes      60
//! cleanup_interval_minutes  DROVER_CLEANUP_INTERVAL_MINUTES   cleanup_interval_minutes  60
//! git_operation_timeout     DROVER_GIT_OPERATION_TIMEOUT      git_operation_timeout     60s
//! git_lock_timeout          DROVER_GIT_LOCK_TIMEOUT           git_lock_timeout          300s
//! repo_cache_timeout        DROVER_REPO_CACHE_TIMEOUT         repo_cache_timeout        300s
//! developer_timeout         DROVER_DEVELOPER_TIMEOUT          developer_timeout         1800s
//! developer_max_retries     DROVER_DEVELOPER_MAX_RETRIES      developer_max_retries     3
//! developer_retry_delay     DROVER_DEVELOPER_RETRY_DELAY      developer_retry_delay     5s
//! developer_path            DROVER_DEVELOPER_PATH             developer_path            "claude"
//! exclude_author            DROVER_EXCLUDE_AUTHOR             exclude_author            true
//! allowed_bots              DROVER_ALLOWED_BOTS               allowed_bots              (known allowlist)
//! state_max_age_days        DROVER_STATE_MAX_AGE_DAYS         state_max_age_days        7
//! base_dir                  DROVER_DIR                        —                         ~/.drover
//! ```
//!
//! Credentials follow the same pattern — see [`Credentials`].

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::Result;

const MAX_WORKERS_CAP: usize = 16;

/// Bots whose review comments are forwarded as feedback even with the
/// default filter. Automation noise (CI bots, release bots) stays out.
pub const DEFAULT_ALLOWED_BOTS: &[&str] = &["coderabbitai[bot]"];

/// Runtime configuration for the orchestrator.
///
/// Value object: all fields are immutable once loaded.
#[derive(Debug, Clone)]
pub struct DroverConfig {
    /// Base directory for all drover state (`~/.drover` by default).
    pub base_dir: PathBuf,
    /// Board identifier in `<owner>/<repo>` form.
    pub board_id: String,
    /// Sleep duration between planner cycles.
    pub poll_interval: Duration,
    /// Pool sizing and housekeeping.
    pub pool: PoolConfig,
    /// Git subprocess and lock deadlines.
    pub git: GitConfig,
    /// How long a cached clone stays fresh before the next `ensure` refetches.
    pub repo_cache_timeout: Duration,
    /// Developer backend invocation settings.
    pub developer: DeveloperConfig,
    /// Review-comment filter defaults.
    pub review_filter: ReviewFilterConfig,
    /// Age in days after which DONE task records are pruned at startup.
    pub state_max_age_days: u64,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Inactivity cutoff for recovering STOPPED workers (ERROR uses half).
    pub worker_timeout: Duration,
    /// IDLE workers older than this are retired by the housekeeper.
    pub idle_timeout_minutes: u64,
    /// Housekeeper wakeup interval.
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone)]
pub struct GitConfig {
    /// Deadline for a single git subprocess (clone gets five times this).
    pub operation_timeout: Duration,
    /// Deadline for acquiring a per-repository lock.
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DeveloperConfig {
    /// Deadline for one developer invocation. These legitimately take minutes.
    pub timeout: Duration,
    /// Attempts for backend initialization.
    pub max_retries: u32,
    /// Base delay between initialization attempts (linear backoff).
    pub retry_delay: Duration,
    /// Candidate binaries, first match wins. Colon-separated in config.
    pub backend_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewFilterConfig {
    pub exclude_author: bool,
    pub allowed_bots: Vec<String>,
}

impl DroverConfig {
    /// Load config from env vars, `<base>/config` file, and defaults.
    pub fn load(base_dir: &Path) -> Result<Self> {
        Self::load_with_env(base_dir, |k| env::var(k).ok())
    }

    fn load_with_env(base_dir: &Path, get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::defaults(base_dir);

        let config_file = base_dir.join("config");
        if config_file.exists() {
            parse_config_file(&config_file, |key, value| {
                cfg.apply_entry(key, value);
            })?;
        }

        cfg.apply_env_overrides(get_env);
        cfg.normalize();
        Ok(cfg)
    }

    fn defaults(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            board_id: String::new(),
            poll_interval: Duration::from_secs(120),
            pool: PoolConfig {
                min_workers: 1,
                max_workers: 4,
                worker_timeout: Duration::from_secs(600),
                idle_timeout_minutes: 60,
                cleanup_interval_minutes: 60,
            },
            git: GitConfig {
                operation_timeout: Duration::from_secs(60),
                lock_timeout: Duration::from_secs(300),
            },
            repo_cache_timeout: Duration::from_secs(300),
            developer: DeveloperConfig {
                timeout: Duration::from_secs(1800),
                max_retries: 3,
                retry_delay: Duration::from_secs(5),
                backend_paths: vec!["claude".to_string()],
            },
            review_filter: ReviewFilterConfig {
                exclude_author: true,
                allowed_bots: DEFAULT_ALLOWED_BOTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            state_max_age_days: 7,
        }
    }

    fn apply_entry(&mut self, key: &str, value: &str) {
        match key {
            "board_id" => self.board_id = value.to_string(),
            "poll_interval" => apply_secs(&mut self.poll_interval, value),
            "min_workers" => apply_usize(&mut self.pool.min_workers, value),
            "max_workers" => apply_usize(&mut self.pool.max_workers, value),
            "worker_timeout" => apply_secs(&mut self.pool.worker_timeout, value),
            "idle_timeout_minutes" => apply_u64(&mut self.pool.idle_timeout_minutes, value),
            "cleanup_interval_minutes" => {
                apply_u64(&mut self.pool.cleanup_interval_minutes, value)
            }
            "git_operation_timeout" => apply_secs(&mut self.git.operation_timeout, value),
            "git_lock_timeout" => apply_secs(&mut self.git.lock_timeout, value),
            "repo_cache_timeout" => apply_secs(&mut self.repo_cache_timeout, value),
            "developer_timeout" => apply_secs(&mut self.developer.timeout, value),
            "developer_max_retries" => {
                if let Ok(n) = value.parse::<u32>() {
                    self.developer.max_retries = n;
                }
            }
            "developer_retry_delay" => apply_secs(&mut self.developer.retry_delay, value),
            "developer_path" => {
                self.developer.backend_paths = split_list(value, ':');
            }
            "exclude_author" => self.review_filter.exclude_author = value == "true",
            "allowed_bots" => self.review_filter.allowed_bots = split_list(value, ','),
            "state_max_age_days" => apply_u64(&mut self.state_max_age_days, value),
            _ => {}
        }
    }

    fn apply_env_overrides(&mut self, get_env: impl Fn(&str) -> Option<String>) {
        let entries: &[(&str, &str)] = &[
            ("DROVER_BOARD_ID", "board_id"),
            ("DROVER_POLL_INTERVAL", "poll_interval"),
            ("DROVER_MIN_WORKERS", "min_workers"),
            ("DROVER_MAX_WORKERS", "max_workers"),
            ("DROVER_WORKER_TIMEOUT", "worker_timeout"),
            ("DROVER_IDLE_TIMEOUT_MINUTES", "idle_timeout_minutes"),
            ("DROVER_CLEANUP_INTERVAL_MINUTES", "cleanup_interval_minutes"),
            ("DROVER_GIT_OPERATION_TIMEOUT", "git_operation_timeout"),
            ("DROVER_GIT_LOCK_TIMEOUT", "git_lock_timeout"),
            ("DROVER_REPO_CACHE_TIMEOUT", "repo_cache_timeout"),
            ("DROVER_DEVELOPER_TIMEOUT", "developer_timeout"),
            ("DROVER_DEVELOPER_MAX_RETRIES", "developer_max_retries"),
            ("DROVER_DEVELOPER_RETRY_DELAY", "developer_retry_delay"),
            ("DROVER_DEVELOPER_PATH", "developer_path"),
            ("DROVER_EXCLUDE_AUTHOR", "exclude_author"),
            ("DROVER_ALLOWED_BOTS", "allowed_bots"),
            ("DROVER_STATE_MAX_AGE_DAYS", "state_max_age_days"),
        ];
        for (env_key, file_key) in entries {
            if let Some(v) = get_env(env_key) {
                if !v.is_empty() {
                    self.apply_entry(file_key, &v);
                }
            }
        }
    }

    fn normalize(&mut self) {
        self.pool.max_workers = self.pool.max_workers.clamp(1, MAX_WORKERS_CAP);
        if self.pool.min_workers > self.pool.max_workers {
            self.pool.min_workers = self.pool.max_workers;
        }
        if self.developer.backend_paths.is_empty() {
            self.developer.backend_paths = vec!["claude".to_string()];
        }
    }

    /// Directory holding the durable state files.
    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(".state")
    }

    /// Directory holding the shared clones.
    pub fn repositories_dir(&self) -> PathBuf {
        self.base_dir.join("repositories")
    }
}

/// Credentials required by the provider gateways and the developer backend.
///
/// Resolution:
/// - `oauth_token`: `CLAUDE_CODE_OAUTH_TOKEN` env > `<base>/token` file
/// - `api_key`: `ANTHROPIC_API_KEY` env
/// - `gh_token`: `GH_TOKEN` env > `gh auth token`
#[derive(Debug, Clone)]
pub struct Credentials {
    pub oauth_token: Option<String>,
    pub api_key: Option<String>,
    pub gh_token: String,
}

impl Credentials {
    pub fn load(base_dir: &Path) -> Result<Self> {
        Self::load_with_env(base_dir, |k| env::var(k).ok())
    }

    fn load_with_env(base_dir: &Path, get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let oauth_token = Self::resolve_oauth_token(base_dir, &get_env);
        let api_key = get_env("ANTHROPIC_API_KEY").filter(|s| !s.is_empty());
        let gh_token = Self::resolve_gh_token(&get_env)?;
        Ok(Self {
            oauth_token,
            api_key,
            gh_token,
        })
    }

    fn resolve_oauth_token(
        base_dir: &Path,
        get_env: &impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        if let Some(token) = get_env("CLAUDE_CODE_OAUTH_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }
        let token_file = base_dir.join("token");
        if token_file.exists() {
            if let Ok(contents) = fs::read_to_string(&token_file) {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
        }
        None
    }

    fn resolve_gh_token(get_env: &impl Fn(&str) -> Option<String>) -> Result<String> {
        if let Some(token) = get_env("GH_TOKEN") {
            if !token.is_empty() {
                return Ok(token);
            }
        }
        let output = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
            .map_err(|e| anyhow::anyhow!("Failed to run `gh auth token`: {e}"))?;
        if !output.status.success() {
            anyhow::bail!("Failed to get GitHub token. Set GH_TOKEN or run `gh auth login`.");
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            anyhow::bail!("GH_TOKEN is empty. Set GH_TOKEN or run `gh auth login`.");
        }
        Ok(token)
    }
}

fn apply_secs(field: &mut Duration, value: &str) {
    if let Ok(n) = value.parse::<u64>() {
        *field = Duration::from_secs(n);
    }
}

fn apply_u64(field: &mut u64, value: &str) {
    if let Ok(n) = value.parse::<u64>() {
        *field = n;
    }
}

fn apply_usize(field: &mut usize, value: &str) {
    if let Ok(n) = value.parse::<usize>() {
        *field = n;
    }
}

fn split_list(value: &str, sep: char) -> Vec<String> {
    value
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a `key=value` config file, calling `f` for each entry.
///
/// Lines starting with `#` and empty lines are skipped.
fn parse_config_file(path: &Path, mut f: impl FnMut(&str, &str)) -> Result<()> {
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            f(k.trim(), v.trim());
        }
    }
    Ok(())
}
