//! Board provider: the remote project board the planner polls.
//!
//! The orchestrator never speaks a provider wire protocol itself; this
//! module owns the capability set (read items by status, update status,
//! attach a PR URL) and ships two implementations: a `gh` CLI adapter that
//! maps board statuses onto issue labels, and a deterministic in-memory
//! board for tests.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::TaskStatus;

/// What a board item's content points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Issue,
    PullRequest,
}

/// A unit of work on the external project board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardItem {
    /// Stable item identifier; doubles as the orchestrator's task id.
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Issue/PR number of the linked content, when the item carries one.
    #[serde(default)]
    pub content_number: Option<u64>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    /// Pull-request URLs attached to this item, oldest first.
    #[serde(default)]
    pub pull_request_urls: Vec<String>,
}

impl BoardItem {
    /// The most recently attached PR URL, if any.
    pub fn latest_pull_request_url(&self) -> Option<&str> {
        self.pull_request_urls.last().map(String::as_str)
    }
}

/// Capability set consumed from the board provider.
pub trait BoardProvider: Send + Sync {
    /// Read all items currently in `status`.
    fn get_items(&self, board_id: &str, status: TaskStatus) -> Result<Vec<BoardItem>>;

    /// Move an item to `status` and return its post-update view. Callers
    /// that need a guarantee re-fetch and compare.
    fn update_item_status(&self, item_id: &str, status: TaskStatus) -> Result<BoardItem>;

    /// Attach a pull-request URL to an item.
    fn add_pull_request_to_item(&self, item_id: &str, url: &str) -> Result<BoardItem>;
}

// ── gh CLI adapter ────────────────────────────────────────────────────────────

/// Board adapter backed by GitHub issues via the `gh` CLI.
///
/// Statuses map to labels (`todo`, `in-progress`, `in-review`, `done`); PR
/// URLs are attached as `PR: <url>` comments and read back from the issue
/// timeline. Subprocess calls inherit the user's `gh auth` session, so no
/// GitHub API crate is needed.
pub struct GhBoardGateway {
    /// Board repository in `<owner>/<repo>` form.
    repo: String,
}

impl GhBoardGateway {
    pub fn new(repo: impl Into<String>) -> Self {
        Self { repo: repo.into() }
    }

    /// Run a `gh` command and capture stdout as a String.
    fn gh_output(args: &[&str]) -> Result<String> {
        let out = Command::new("gh")
            .args(args)
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("failed to run: gh {}", args.join(" ")))?;
        if !out.status.success() {
            anyhow::bail!("gh {} exited with {}", args.join(" "), out.status);
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn view_item(&self, item_id: &str) -> Result<BoardItem> {
        let out = Self::gh_output(&[
            "issue",
            "view",
            item_id,
            "--repo",
            &self.repo,
            "--json",
            "number,title,labels,state,comments",
        ])?;
        let v: serde_json::Value =
            serde_json::from_str(&out).context("unparseable gh issue view output")?;
        Ok(item_from_json(&v))
    }
}

/// Extract attached PR URLs from issue comment bodies (`PR: <url>` lines).
fn pr_urls_from_comments(comments: &serde_json::Value) -> Vec<String> {
    let mut urls = vec![];
    if let Some(list) = comments.as_array() {
        for comment in list {
            let body = comment["body"].as_str().unwrap_or("");
            for line in body.lines() {
                if let Some(url) = line.trim().strip_prefix("PR:") {
                    let url = url.trim();
                    if !url.is_empty() {
                        urls.push(url.to_string());
                    }
                }
            }
        }
    }
    urls
}

fn item_from_json(v: &serde_json::Value) -> BoardItem {
    let labels: Vec<String> = v["labels"]
        .as_array()
        .map(|ls| {
            ls.iter()
                .filter_map(|l| l["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let status = labels
        .iter()
        .find_map(|l| TaskStatus::parse(l))
        .unwrap_or(TaskStatus::Todo);

    let number = v["number"].as_u64();
    BoardItem {
        id: number.map(|n| n.to_string()).unwrap_or_default(),
        title: v["title"].as_str().unwrap_or("").to_string(),
        status,
        labels,
        content_number: number,
        content_type: number.map(|_| ContentType::Issue),
        pull_request_urls: pr_urls_from_comments(&v["comments"]),
    }
}

impl BoardProvider for GhBoardGateway {
    fn get_items(&self, _board_id: &str, status: TaskStatus) -> Result<Vec<BoardItem>> {
        // Done items live on closed issues; everything else stays open.
        let state = match status {
            TaskStatus::Done => "all",
            _ => "open",
        };
        let out = Self::gh_output(&[
            "issue",
            "list",
            "--repo",
            &self.repo,
            "--state",
            state,
            "--label",
            status.as_str(),
            "--json",
            "number",
            "-q",
            ".[].number",
        ])?;

        let mut items = vec![];
        for line in out.lines().filter(|l| !l.is_empty()) {
            let number = line.trim();
            match self.view_item(number) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(item = number, error = %e, "skipping unreadable board item");
                }
            }
        }
        Ok(items)
    }

    fn update_item_status(&self, item_id: &str, status: TaskStatus) -> Result<BoardItem> {
        // One status label at a time: remove the other three, add the target.
        for other in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
        ] {
            if other == status {
                continue;
            }
            let _ = Command::new("gh")
                .args([
                    "issue",
                    "edit",
                    item_id,
                    "--repo",
                    &self.repo,
                    "--remove-label",
                    other.as_str(),
                ])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        Self::gh_output(&[
            "issue",
            "edit",
            item_id,
            "--repo",
            &self.repo,
            "--add-label",
            status.as_str(),
        ])?;

        if status == TaskStatus::Done {
            let _ = Command::new("gh")
                .args(["issue", "close", item_id, "--repo", &self.repo])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }

        self.view_item(item_id)
    }

    fn add_pull_request_to_item(&self, item_id: &str, url: &str) -> Result<BoardItem> {
        Self::gh_output(&[
            "issue",
            "comment",
            item_id,
            "--repo",
            &self.repo,
            "--body",
            &format!("PR: {url}"),
        ])?;
        self.view_item(item_id)
    }
}

// ── Deterministic in-memory board ─────────────────────────────────────────────

/// In-memory board used by tests and dry runs. Items frozen via
/// [`InMemoryBoard::freeze`] silently ignore status updates, which is how
/// tests exercise the planner's read-after-write verification.
#[derive(Default)]
pub struct InMemoryBoard {
    items: Mutex<HashMap<String, BoardItem>>,
    frozen: Mutex<Vec<String>>,
}

impl InMemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_item(&self, item: BoardItem) {
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Option<BoardItem> {
        self.items.lock().unwrap().get(id).cloned()
    }

    /// Make an item ignore future status updates.
    pub fn freeze(&self, id: &str) {
        self.frozen.lock().unwrap().push(id.to_string());
    }
}

impl BoardProvider for InMemoryBoard {
    fn get_items(&self, _board_id: &str, status: TaskStatus) -> Result<Vec<BoardItem>> {
        let mut items: Vec<BoardItem> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    fn update_item_status(&self, item_id: &str, status: TaskStatus) -> Result<BoardItem> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(item_id)
            .ok_or_else(|| anyhow::anyhow!("board item {item_id} not found"))?;
        if !self.frozen.lock().unwrap().contains(&item_id.to_string()) {
            item.status = status;
        }
        Ok(item.clone())
    }

    fn add_pull_request_to_item(&self, item_id: &str, url: &str) -> Result<BoardItem> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(item_id)
            .ok_or_else(|| anyhow::anyhow!("board item {item_id} not found"))?;
        item.pull_request_urls.push(url.to_string());
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, status: TaskStatus) -> BoardItem {
        BoardItem {
            id: id.to_string(),
            title: format!("Item {id}"),
            status,
            labels: vec![],
            content_number: None,
            content_type: None,
            pull_request_urls: vec![],
        }
    }

    #[test]
    fn in_memory_board_filters_by_status() {
        let board = InMemoryBoard::new();
        board.put_item(item("1", TaskStatus::Todo));
        board.put_item(item("2", TaskStatus::InProgress));
        board.put_item(item("3", TaskStatus::Todo));

        let todo = board.get_items("board", TaskStatus::Todo).unwrap();
        assert_eq!(todo.len(), 2);
        assert!(todo.iter().all(|i| i.status == TaskStatus::Todo));
    }

    #[test]
    fn update_status_moves_item() {
        let board = InMemoryBoard::new();
        board.put_item(item("1", TaskStatus::Todo));

        let updated = board.update_item_status("1", TaskStatus::InProgress).unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert!(board.get_items("board", TaskStatus::Todo).unwrap().is_empty());
    }

    #[test]
    fn frozen_item_ignores_updates() {
        let board = InMemoryBoard::new();
        board.put_item(item("1", TaskStatus::Todo));
        board.freeze("1");

        let result = board.update_item_status("1", TaskStatus::InProgress).unwrap();
        // The provider "succeeds" but the item never moved.
        assert_eq!(result.status, TaskStatus::Todo);
    }

    #[test]
    fn attach_pr_url_appends() {
        let board = InMemoryBoard::new();
        board.put_item(item("1", TaskStatus::InReview));
        board
            .add_pull_request_to_item("1", "https://example.com/a/b/pull/1")
            .unwrap();
        board
            .add_pull_request_to_item("1", "https://example.com/a/b/pull/2")
            .unwrap();

        let stored = board.item("1").unwrap();
        assert_eq!(stored.pull_request_urls.len(), 2);
        assert_eq!(
            stored.latest_pull_request_url(),
            Some("https://example.com/a/b/pull/2")
        );
    }

    #[test]
    fn update_unknown_item_errors() {
        let board = InMemoryBoard::new();
        assert!(board.update_item_status("nope", TaskStatus::Done).is_err());
    }

    #[test]
    fn item_from_json_maps_labels_and_comments() {
        let v: serde_json::Value = serde_json::from_str(
            r#"{
                "number": 42,
                "title": "Fix the widget",
                "labels": [{"name": "bug"}, {"name": "in-review"}],
                "comments": [
                    {"body": "looking at it"},
                    {"body": "PR: https://github.com/acme/svc/pull/7"}
                ]
            }"#,
        )
        .unwrap();
        let item = item_from_json(&v);
        assert_eq!(item.id, "42");
        assert_eq!(item.status, TaskStatus::InReview);
        assert_eq!(item.content_number, Some(42));
        assert_eq!(item.content_type, Some(ContentType::Issue));
        assert_eq!(
            item.pull_request_urls,
            vec!["https://github.com/acme/svc/pull/7".to_string()]
        );
    }

    #[test]
    fn item_without_status_label_defaults_to_todo() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"number": 1, "title": "t", "labels": [], "comments": []}"#)
                .unwrap();
        assert_eq!(item_from_json(&v).status, TaskStatus::Todo);
    }
}
