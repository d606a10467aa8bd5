//! Review provider: pull-request state, reviews, and comments.
//!
//! Mirrors the board module's shape: a capability trait, a `gh` CLI
//! adapter, and a deterministic in-memory implementation for tests.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_ALLOWED_BOTS;

/// Lifecycle state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
    Draft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub repository_id: String,
    pub number: u64,
    pub state: PullRequestState,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}

/// A submitted review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
    Commented,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    pub verdict: ReviewVerdict,
    pub submitted_at: DateTime<Utc>,
}

/// A review or issue comment on a pull request. Identity is provider-stable,
/// which is what makes the processed-comment bookkeeping idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_bot: bool,
}

/// Filter applied to fetched comments.
#[derive(Debug, Clone)]
pub struct CommentFilter {
    /// Drop comments written by the PR author (the developer's own PRs
    /// comment on themselves constantly).
    pub exclude_author: bool,
    /// Bot accounts whose comments are still forwarded.
    pub allowed_bots: Vec<String>,
}

impl Default for CommentFilter {
    fn default() -> Self {
        Self {
            exclude_author: true,
            allowed_bots: DEFAULT_ALLOWED_BOTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Apply `filter` to comments fetched for a PR authored by `pr_author`,
/// keeping only comments strictly newer than `since`.
pub fn filter_comments(
    comments: Vec<ReviewComment>,
    pr_author: &str,
    since: DateTime<Utc>,
    filter: &CommentFilter,
) -> Vec<ReviewComment> {
    comments
        .into_iter()
        .filter(|c| c.created_at > since)
        .filter(|c| !(filter.exclude_author && c.author == pr_author))
        .filter(|c| !c.is_bot || filter.allowed_bots.iter().any(|b| b == &c.author))
        .collect()
}

/// Capability set consumed from the review provider.
pub trait ReviewProvider: Send + Sync {
    fn get_pull_request(&self, repository_id: &str, number: u64) -> Result<PullRequest>;

    fn is_approved(&self, repository_id: &str, number: u64) -> Result<bool>;

    fn get_reviews(&self, repository_id: &str, number: u64) -> Result<Vec<Review>>;

    /// Comments strictly newer than `since`, post-filter.
    fn get_new_comments(
        &self,
        repository_id: &str,
        number: u64,
        since: DateTime<Utc>,
        filter: &CommentFilter,
    ) -> Result<Vec<ReviewComment>>;

    fn get_repository_default_branch(&self, repository_id: &str) -> Result<String>;

    /// Tell the provider these comments have been handled (reaction, resolve,
    /// or no-op depending on the backend).
    fn mark_comments_as_processed(&self, ids: &[String]) -> Result<()>;
}

// ── gh CLI adapter ────────────────────────────────────────────────────────────

/// Review adapter backed by the `gh` CLI.
pub struct GhReviewGateway;

impl GhReviewGateway {
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
}

fn parse_timestamp(v: &serde_json::Value) -> DateTime<Utc> {
    v.as_str()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now)
}

fn is_bot_login(login: &str) -> bool {
    login.ends_with("[bot]")
}

impl ReviewProvider for GhReviewGateway {
    fn get_pull_request(&self, repository_id: &str, number: u64) -> Result<PullRequest> {
        let num = number.to_string();
        let out = Self::gh_output(&[
            "pr",
            "view",
            &num,
            "--repo",
            repository_id,
            "--json",
            "number,state,isDraft,author,createdAt,updatedAt,url",
        ])?;
        let v: serde_json::Value =
            serde_json::from_str(&out).context("unparseable gh pr view output")?;

        let state = if v["isDraft"].as_bool().unwrap_or(false) {
            PullRequestState::Draft
        } else {
            match v["state"].as_str().unwrap_or("") {
                "MERGED" => PullRequestState::Merged,
                "CLOSED" => PullRequestState::Closed,
                _ => PullRequestState::Open,
            }
        };

        Ok(PullRequest {
            repository_id: repository_id.to_string(),
            number,
            state,
            author: v["author"]["login"].as_str().unwrap_or("").to_string(),
            created_at: parse_timestamp(&v["createdAt"]),
            updated_at: parse_timestamp(&v["updatedAt"]),
            url: v["url"].as_str().unwrap_or("").to_string(),
        })
    }

    fn is_approved(&self, repository_id: &str, number: u64) -> Result<bool> {
        let num = number.to_string();
        let out = Self::gh_output(&[
            "pr",
            "view",
            &num,
            "--repo",
            repository_id,
            "--json",
            "reviewDecision",
            "-q",
            ".reviewDecision",
        ])?;
        Ok(out == "APPROVED")
    }

    fn get_reviews(&self, repository_id: &str, number: u64) -> Result<Vec<Review>> {
        let num = number.to_string();
        let out = Self::gh_output(&[
            "pr",
            "view",
            &num,
            "--repo",
            repository_id,
            "--json",
            "reviews",
            "-q",
            ".reviews",
        ])?;
        let v: serde_json::Value = serde_json::from_str(&out).unwrap_or(serde_json::Value::Null);
        let mut reviews = vec![];
        if let Some(list) = v.as_array() {
            for r in list {
                let verdict = match r["state"].as_str().unwrap_or("") {
                    "APPROVED" => ReviewVerdict::Approved,
                    "CHANGES_REQUESTED" => ReviewVerdict::ChangesRequested,
                    _ => ReviewVerdict::Commented,
                };
                reviews.push(Review {
                    author: r["author"]["login"].as_str().unwrap_or("").to_string(),
                    verdict,
                    submitted_at: parse_timestamp(&r["submittedAt"]),
                });
            }
        }
        Ok(reviews)
    }

    fn get_new_comments(
        &self,
        repository_id: &str,
        number: u64,
        since: DateTime<Utc>,
        filter: &CommentFilter,
    ) -> Result<Vec<ReviewComment>> {
        let num = number.to_string();
        let out = Self::gh_output(&[
            "pr",
            "view",
            &num,
            "--repo",
            repository_id,
            "--json",
            "author,comments,reviews",
        ])?;
        let v: serde_json::Value =
            serde_json::from_str(&out).context("unparseable gh pr view output")?;

        let pr_author = v["author"]["login"].as_str().unwrap_or("").to_string();

        let mut comments = vec![];
        if let Some(list) = v["comments"].as_array() {
            for c in list {
                let login = c["author"]["login"].as_str().unwrap_or("").to_string();
                comments.push(ReviewComment {
                    id: c["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| c["id"].to_string()),
                    is_bot: is_bot_login(&login),
                    author: login,
                    body: c["body"].as_str().unwrap_or("").to_string(),
                    created_at: parse_timestamp(&c["createdAt"]),
                });
            }
        }
        // Review bodies count as feedback too.
        if let Some(list) = v["reviews"].as_array() {
            for r in list {
                let body = r["body"].as_str().unwrap_or("");
                if body.is_empty() {
                    continue;
                }
                let login = r["author"]["login"].as_str().unwrap_or("").to_string();
                comments.push(ReviewComment {
                    id: format!("review-{}", r["id"]),
                    is_bot: is_bot_login(&login),
                    author: login,
                    body: body.to_string(),
                    created_at: parse_timestamp(&r["submittedAt"]),
                });
            }
        }

        comments.sort_by_key(|c| c.created_at);
        Ok(filter_comments(comments, &pr_author, since, filter))
    }

    fn get_repository_default_branch(&self, repository_id: &str) -> Result<String> {
        let out = Self::gh_output(&[
            "repo",
            "view",
            repository_id,
            "--json",
            "defaultBranchRef",
            "-q",
            ".defaultBranchRef.name",
        ])?;
        if out.is_empty() {
            anyhow::bail!("no default branch reported for {repository_id}");
        }
        Ok(out)
    }

    fn mark_comments_as_processed(&self, _ids: &[String]) -> Result<()> {
        // GitHub has no first-class "processed" flag; the durable task record
        // is the authority. Nothing to push back.
        Ok(())
    }
}

// ── Deterministic in-memory provider ──────────────────────────────────────────

#[derive(Default)]
struct InMemoryReviewState {
    pull_requests: HashMap<(String, u64), PullRequest>,
    approvals: HashMap<(String, u64), bool>,
    reviews: HashMap<(String, u64), Vec<Review>>,
    comments: HashMap<(String, u64), Vec<ReviewComment>>,
    default_branches: HashMap<String, String>,
    processed: Vec<String>,
}

/// In-memory review provider for tests.
#[derive(Default)]
pub struct InMemoryReviews {
    state: Mutex<InMemoryReviewState>,
}

impl InMemoryReviews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_pull_request(&self, pr: PullRequest) {
        let key = (pr.repository_id.clone(), pr.number);
        self.state.lock().unwrap().pull_requests.insert(key, pr);
    }

    pub fn set_approved(&self, repository_id: &str, number: u64, approved: bool) {
        self.state
            .lock()
            .unwrap()
            .approvals
            .insert((repository_id.to_string(), number), approved);
    }

    pub fn push_comment(&self, repository_id: &str, number: u64, comment: ReviewComment) {
        self.state
            .lock()
            .unwrap()
            .comments
            .entry((repository_id.to_string(), number))
            .or_default()
            .push(comment);
    }

    pub fn set_default_branch(&self, repository_id: &str, branch: &str) {
        self.state
            .lock()
            .unwrap()
            .default_branches
            .insert(repository_id.to_string(), branch.to_string());
    }

    pub fn processed_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().processed.clone()
    }
}

impl ReviewProvider for InMemoryReviews {
    fn get_pull_request(&self, repository_id: &str, number: u64) -> Result<PullRequest> {
        self.state
            .lock()
            .unwrap()
            .pull_requests
            .get(&(repository_id.to_string(), number))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("pull request {repository_id}#{number} not found"))
    }

    fn is_approved(&self, repository_id: &str, number: u64) -> Result<bool> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .approvals
            .get(&(repository_id.to_string(), number))
            .unwrap_or(&false))
    }

    fn get_reviews(&self, repository_id: &str, number: u64) -> Result<Vec<Review>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .reviews
            .get(&(repository_id.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    fn get_new_comments(
        &self,
        repository_id: &str,
        number: u64,
        since: DateTime<Utc>,
        filter: &CommentFilter,
    ) -> Result<Vec<ReviewComment>> {
        let state = self.state.lock().unwrap();
        let pr_author = state
            .pull_requests
            .get(&(repository_id.to_string(), number))
            .map(|pr| pr.author.clone())
            .unwrap_or_default();
        let comments = state
            .comments
            .get(&(repository_id.to_string(), number))
            .cloned()
            .unwrap_or_default();
        Ok(filter_comments(comments, &pr_author, since, filter))
    }

    fn get_repository_default_branch(&self, repository_id: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .default_branches
            .get(repository_id)
            .cloned()
            .unwrap_or_else(|| "main".to_string()))
    }

    fn mark_comments_as_processed(&self, ids: &[String]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .processed
            .extend(ids.iter().cloned());
        Ok(())
    }
}
