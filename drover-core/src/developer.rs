//! Developer backend: the opaque AI coding subprocess.
//!
//! The orchestrator hands it a prompt and a working directory and gets
//! free-form text back. The CLI adapter resolves the first usable binary
//! from the configured candidates and forwards credentials through the
//! environment, never through arguments.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::config::{Credentials, DeveloperConfig};
use crate::proc::run_with_timeout;

/// Raw result of one developer invocation.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub raw_output: String,
}

/// Capability set consumed from the developer backend.
pub trait DeveloperBackend: Send + Sync {
    /// Verify the backend is usable. Called before the first prompt of each
    /// pipeline run; may be retried.
    fn initialize(&self) -> Result<()>;

    /// Run one prompt inside `workspace_dir`. May legitimately take minutes.
    fn execute_prompt(&self, prompt: &str, workspace_dir: &Path) -> Result<RawOutput>;

    /// Stable identifier recorded on worker records (e.g. `claude-cli`).
    fn kind(&self) -> &str;
}

// ── claude CLI adapter ────────────────────────────────────────────────────────

/// Developer backend that shells out to the `claude` CLI.
pub struct ClaudeCliBackend {
    config: DeveloperConfig,
    credentials: Credentials,
    resolved: Mutex<Option<PathBuf>>,
}

impl ClaudeCliBackend {
    pub fn new(config: DeveloperConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            resolved: Mutex::new(None),
        }
    }

    /// Find the first candidate binary that answers `--version`.
    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(found) = self.resolved.lock().unwrap().clone() {
            return Ok(found);
        }
        for candidate in &self.config.backend_paths {
            let ok = Command::new(candidate)
                .arg("--version")
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if ok {
                let path = PathBuf::from(candidate);
                *self.resolved.lock().unwrap() = Some(path.clone());
                return Ok(path);
            }
        }
        anyhow::bail!(
            "no usable developer binary among: {}",
            self.config.backend_paths.join(", ")
        )
    }

    fn apply_credentials(&self, cmd: &mut Command) {
        if let Some(token) = &self.credentials.oauth_token {
            cmd.env("CLAUDE_CODE_OAUTH_TOKEN", token);
        } else if let Some(key) = &self.credentials.api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }
        cmd.env("GH_TOKEN", &self.credentials.gh_token);
    }
}

impl DeveloperBackend for ClaudeCliBackend {
    fn initialize(&self) -> Result<()> {
        self.resolve_binary().map(|_| ())
    }

    fn execute_prompt(&self, prompt: &str, workspace_dir: &Path) -> Result<RawOutput> {
        let binary = self.resolve_binary()?;
        let mut cmd = Command::new(&binary);
        cmd.args(["--print", "--dangerously-skip-permissions", "-p", prompt])
            .current_dir(workspace_dir);
        self.apply_credentials(&mut cmd);

        tracing::info!(
            binary = %binary.display(),
            workspace = %workspace_dir.display(),
            "invoking developer backend"
        );
        let out = run_with_timeout(&mut cmd, self.config.timeout)
            .with_context(|| format!("developer invocation in {}", workspace_dir.display()))?;

        if !out.success() {
            anyhow::bail!(
                "developer backend exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            );
        }
        Ok(RawOutput {
            raw_output: out.stdout,
        })
    }

    fn kind(&self) -> &str {
        "claude-cli"
    }
}

// ── Deterministic scripted backend ────────────────────────────────────────────

/// Scripted backend for tests: returns queued responses in order, then the
/// fallback. Errors are queued as `Err` strings.
pub struct ScriptedDeveloper {
    responses: Mutex<Vec<Result<String, String>>>,
    fallback: String,
    init_failures: Mutex<u32>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedDeveloper {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: fallback.into(),
            init_failures: Mutex::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, output: impl Into<String>) {
        self.responses.lock().unwrap().push(Ok(output.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.responses.lock().unwrap().push(Err(message.into()));
    }

    /// Make the next `n` initialize calls fail.
    pub fn fail_initialize_times(&self, n: u32) {
        *self.init_failures.lock().unwrap() = n;
    }

    /// Prompts seen so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl DeveloperBackend for ScriptedDeveloper {
    fn initialize(&self) -> Result<()> {
        let mut failures = self.init_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("backend initialization failed (scripted)");
        }
        Ok(())
    }

    fn execute_prompt(&self, prompt: &str, _workspace_dir: &Path) -> Result<RawOutput> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        let next = if responses.is_empty() {
            Ok(self.fallback.clone())
        } else {
            responses.remove(0)
        };
        match next {
            Ok(raw_output) => Ok(RawOutput { raw_output }),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }

    fn kind(&self) -> &str {
        "scripted"
    }
}
