//! Branch naming and base-branch resolution.

use regex::Regex;

use crate::board::{BoardItem, ContentType};

/// Maximum length of a task-id-derived branch name.
const TASK_ID_BRANCH_MAX: usize = 20;

/// Convert text to a branch-safe slug (lowercase alphanumerics and hyphens).
pub fn sanitize(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut slug = String::new();
    let mut prev_hyphen = false;

    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            prev_hyphen = false;
        } else if !prev_hyphen {
            slug.push('-');
            prev_hyphen = true;
        }
    }

    slug.trim_matches('-').to_string()
}

/// Derive the working-branch name for a task.
///
/// Priority: `issue-<n>`/`pr-<n>` when the board item links content with a
/// number and type; else `issue-<n>` from a `#n` reference in the title;
/// else the task id, sanitized and truncated.
pub fn branch_name_for_task(task_id: &str, item: Option<&BoardItem>) -> String {
    if let Some(item) = item {
        if let Some(number) = item.content_number {
            let prefix = match item.content_type {
                Some(ContentType::PullRequest) => "pr",
                _ => "issue",
            };
            return format!("{prefix}-{number}");
        }
        if let Some(number) = number_from_title(&item.title) {
            return format!("issue-{number}");
        }
    }
    sanitize(task_id).chars().take(TASK_ID_BRANCH_MAX).collect()
}

/// Extract the first `#<n>` reference from an item title.
fn number_from_title(title: &str) -> Option<u64> {
    let re = Regex::new(r"#(\d+)").expect("valid regex");
    re.captures(title)?.get(1)?.as_str().parse().ok()
}

/// Find a branch name not rejected by `taken`, appending `-1`, `-2`, … to
/// `base` until one is free.
pub fn unique_branch_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Label prefix selecting an explicit fork point for a task.
const BASE_BRANCH_LABEL_PREFIX: &str = "base:";

/// Choose the branch to fork from.
///
/// A `base:<branch>` label on the board item wins; otherwise the repository
/// default branch reported by the provider; otherwise `main`.
pub fn resolve_base_branch(
    labels: &[String],
    default_branch: impl FnOnce() -> Option<String>,
) -> String {
    for label in labels {
        if let Some(branch) = label.strip_prefix(BASE_BRANCH_LABEL_PREFIX) {
            let branch = branch.trim();
            if !branch.is_empty() {
                return branch.to_string();
            }
        }
    }
    default_branch().unwrap_or_else(|| "main".to_string())
}
