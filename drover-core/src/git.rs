//! Git subprocess port and high-level commands.
//!
//! All git work goes through the [`GitRunner`] port so the workspace layer
//! is testable without a git binary. [`Git`] composes the runner into the
//! operations the repository cache and workspace manager need; it holds no
//! locks itself — callers serialize per repository through the lock
//! registry.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;

use crate::proc::{run_with_timeout, ProcOutput};

/// Deadline for read-only introspection commands (`status`, `rev-parse`).
const INTROSPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Clones move whole histories; give them extra room.
const CLONE_TIMEOUT_MULTIPLIER: u32 = 5;

/// Output of one git invocation.
pub type GitOutput = ProcOutput;

/// Port for running the host `git` binary.
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` in `cwd` (or the process cwd) with a deadline.
    fn run(&self, cwd: Option<&Path>, args: &[&str], timeout: Duration) -> Result<GitOutput>;
}

/// Concrete adapter: spawns the host `git` binary.
pub struct GitCli;

impl GitRunner for GitCli {
    fn run(&self, cwd: Option<&Path>, args: &[&str], timeout: Duration) -> Result<GitOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        run_with_timeout(&mut cmd, timeout)
    }
}

/// High-level git commands over a [`GitRunner`].
pub struct Git {
    runner: std::sync::Arc<dyn GitRunner>,
    operation_timeout: Duration,
}

impl Git {
    pub fn new(runner: std::sync::Arc<dyn GitRunner>, operation_timeout: Duration) -> Self {
        Self {
            runner,
            operation_timeout,
        }
    }

    fn run_checked(&self, cwd: Option<&Path>, args: &[&str], timeout: Duration) -> Result<GitOutput> {
        let out = self.runner.run(cwd, args, timeout)?;
        if !out.success() {
            anyhow::bail!(
                "git {} failed (exit {}): {}",
                args.join(" "),
                out.exit_code,
                out.stderr.trim()
            );
        }
        Ok(out)
    }

    pub fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        let dest_str = dest.display().to_string();
        self.run_checked(
            None,
            &["clone", url, &dest_str],
            self.operation_timeout * CLONE_TIMEOUT_MULTIPLIER,
        )?;
        Ok(())
    }

    /// Fast-forward the current branch; never merges.
    pub fn pull_ff_only(&self, repo: &Path) -> Result<()> {
        self.run_checked(Some(repo), &["pull", "--ff-only"], self.operation_timeout)?;
        Ok(())
    }

    pub fn stash(&self, repo: &Path) -> Result<()> {
        self.run_checked(
            Some(repo),
            &["stash", "push", "--include-untracked"],
            self.operation_timeout,
        )?;
        Ok(())
    }

    pub fn is_dirty(&self, repo: &Path) -> Result<bool> {
        let out = self.run_checked(
            Some(repo),
            &["status", "--porcelain"],
            INTROSPECT_TIMEOUT,
        )?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Whether `path` is inside a usable git work tree.
    pub fn is_valid_repo(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        self.runner
            .run(
                Some(path),
                &["rev-parse", "--is-inside-work-tree"],
                INTROSPECT_TIMEOUT,
            )
            .map(|out| out.success() && out.stdout.trim() == "true")
            .unwrap_or(false)
    }

    /// `git status` as a post-creation sanity check.
    pub fn status_ok(&self, path: &Path) -> Result<()> {
        self.run_checked(Some(path), &["status"], INTROSPECT_TIMEOUT)?;
        Ok(())
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let spec = format!("refs/heads/{branch}");
        let out = self.runner.run(
            Some(repo),
            &["rev-parse", "--verify", "--quiet", &spec],
            INTROSPECT_TIMEOUT,
        )?;
        Ok(out.success())
    }

    /// Whether `branch` is already checked out in some worktree of `repo`.
    pub fn branch_checked_out(&self, repo: &Path, branch: &str) -> Result<bool> {
        let out = self.run_checked(
            Some(repo),
            &["worktree", "list", "--porcelain"],
            INTROSPECT_TIMEOUT,
        )?;
        let needle = format!("branch refs/heads/{branch}");
        Ok(out.stdout.lines().any(|l| l.trim() == needle))
    }

    /// Add a worktree at `path`. With `create_branch`, a new branch is forked
    /// from `base`; otherwise the existing branch is checked out.
    pub fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
        create_branch: bool,
    ) -> Result<()> {
        let path_str = path.display().to_string();
        if create_branch {
            self.run_checked(
                Some(repo),
                &["worktree", "add", "-b", branch, &path_str, base],
                self.operation_timeout,
            )?;
        } else {
            self.run_checked(
                Some(repo),
                &["worktree", "add", &path_str, branch],
                self.operation_timeout,
            )?;
        }
        Ok(())
    }

    pub fn worktree_prune(&self, repo: &Path) -> Result<()> {
        self.run_checked(Some(repo), &["worktree", "prune"], self.operation_timeout)?;
        Ok(())
    }

    pub fn worktree_remove(&self, repo: &Path, path: &Path, force: bool) -> Result<()> {
        let path_str = path.display().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_checked(Some(repo), &args, self.operation_timeout)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::sync::Arc;

    fn git(fake: Arc<FakeGit>) -> Git {
        Git::new(fake, Duration::from_secs(60))
    }

    #[test]
    fn clone_runs_expected_command() {
        let fake = Arc::new(FakeGit::ok());
        git(fake.clone())
            .clone_repo("https://github.com/acme/svc.git", Path::new("/tmp/svc"))
            .unwrap();
        assert!(fake.called_with_prefix("clone https://github.com/acme/svc.git"));
    }

    #[test]
    fn failed_command_surfaces_stderr() {
        let fake = Arc::new(FakeGit::with_responder(|_| failure("fatal: repository not found")));
        let err = git(fake)
            .clone_repo("https://github.com/acme/nope.git", Path::new("/tmp/x"))
            .unwrap_err();
        assert!(err.to_string().contains("repository not found"));
    }

    #[test]
    fn branch_exists_uses_rev_parse_verify() {
        let fake = Arc::new(FakeGit::with_responder(|cmd| {
            if cmd.contains("refs/heads/issue-7") {
                success("abc123")
            } else {
                failure("")
            }
        }));
        let g = git(fake);
        assert!(g.branch_exists(Path::new("/tmp/r"), "issue-7").unwrap());
        assert!(!g.branch_exists(Path::new("/tmp/r"), "issue-8").unwrap());
    }

    #[test]
    fn branch_checked_out_scans_worktree_list() {
        let listing = "\
worktree /tmp/main\nHEAD abc\nbranch refs/heads/main\n\n\
worktree /tmp/w1\nHEAD def\nbranch refs/heads/issue-7\n";
        let fake = Arc::new(FakeGit::with_responder(move |cmd| {
            if cmd.starts_with("worktree list") {
                success(listing)
            } else {
                success("")
            }
        }));
        let g = git(fake);
        assert!(g.branch_checked_out(Path::new("/tmp/r"), "issue-7").unwrap());
        assert!(!g.branch_checked_out(Path::new("/tmp/r"), "issue-9").unwrap());
    }

    #[test]
    fn worktree_add_new_branch_passes_dash_b() {
        let fake = Arc::new(FakeGit::ok());
        git(fake.clone())
            .worktree_add(
                Path::new("/tmp/r"),
                Path::new("/tmp/w"),
                "issue-7",
                "main",
                true,
            )
            .unwrap();
        assert!(fake.called_with_prefix("worktree add -b issue-7"));
    }

    #[test]
    fn worktree_add_existing_branch_checks_out() {
        let fake = Arc::new(FakeGit::ok());
        git(fake.clone())
            .worktree_add(
                Path::new("/tmp/r"),
                Path::new("/tmp/w"),
                "issue-7",
                "main",
                false,
            )
            .unwrap();
        let calls = fake.calls();
        assert!(calls.iter().any(|c| c == "worktree add /tmp/w issue-7"));
    }

    #[test]
    fn worktree_remove_force_flag() {
        let fake = Arc::new(FakeGit::ok());
        git(fake.clone())
            .worktree_remove(Path::new("/tmp/r"), Path::new("/tmp/w"), true)
            .unwrap();
        assert!(fake.called_with_prefix("worktree remove --force"));
    }

    #[test]
    fn is_dirty_reads_porcelain_status() {
        let fake = Arc::new(FakeGit::with_responder(|cmd| {
            if cmd.starts_with("status --porcelain") {
                success(" M src/lib.rs\n")
            } else {
                success("")
            }
        }));
        assert!(git(fake).is_dirty(Path::new("/tmp/r")).unwrap());
    }

    #[test]
    fn is_valid_repo_requires_directory() {
        let fake = Arc::new(FakeGit::with_responder(|_| success("true\n")));
        // Path does not exist, so the runner is never consulted.
        assert!(!git(fake.clone()).is_valid_repo(Path::new("/definitely/missing/path")));
        assert!(fake.calls().is_empty());
    }
}
