//! Parsing of free-form developer output.
//!
//! The developer backend returns unstructured text; the only contract is
//! that a finished change ends up as a pull request whose URL appears
//! somewhere in the output. Extraction tries the most explicit markers
//! first and degrades to a bare URL scan.

use chrono::{DateTime, Utc};
use regex::Regex;

/// Outcome of one developer invocation, derived from its raw output.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub pull_request_url: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// Trailing excerpt of the raw output, for logs and status displays.
    pub details: String,
}

/// A pull request reference parsed out of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub repository_id: String,
    pub number: u64,
}

/// Parse `<host>/<owner>/<repo>/pull/<num>` out of a URL.
pub fn parse_pr_url(url: &str) -> Option<PullRequestRef> {
    let re = Regex::new(r"[^/\s]+/([^/\s]+/[^/\s]+)/pull/(\d+)").expect("valid regex");
    let caps = re.captures(url)?;
    let repository_id = caps.get(1)?.as_str().to_string();
    let number: u64 = caps.get(2)?.as_str().parse().ok()?;
    Some(PullRequestRef {
        repository_id,
        number,
    })
}

/// Extract a pull-request URL from developer output.
///
/// Patterns are tried in priority order, most specific first:
/// 1. an explicit `PR: <url>` line,
/// 2. provider-hint prefixes (`Pull request:`, `Pull Request URL:`,
///    `Created pull request`),
/// 3. any `/pull/<num>` URL substring.
pub fn extract_pr_url(output: &str) -> Option<String> {
    let url_pattern = r"https?://[^\s/]+/[^\s/]+/[^\s/]+/pull/\d+";

    let prefixed = [
        format!(r"(?mi)^\s*PR:\s*({url_pattern})"),
        format!(r"(?i)pull request(?: url)?:?\s*({url_pattern})"),
        format!(r"(?i)created pull request\s*(?:at\s*)?({url_pattern})"),
    ];
    for pattern in &prefixed {
        let re = Regex::new(pattern).expect("valid regex");
        if let Some(caps) = re.captures(output) {
            return Some(trim_url(caps.get(1)?.as_str()));
        }
    }

    let re = Regex::new(url_pattern).expect("valid regex");
    re.find(output).map(|m| trim_url(m.as_str()))
}

fn trim_url(url: &str) -> String {
    url.trim_end_matches(['.', ',', ')', ']']).to_string()
}

const SUCCESS_INDICATORS: &[&str] = &[
    "pull request created",
    "created pull request",
    "pr created",
    "opened pull request",
    "successfully",
    "task complete",
    "all tests pass",
    "merged",
    "ready for review",
];

/// Scan output for a recognizable failure and describe it.
///
/// Recognized classes: compile failure, test failure with counts, and a
/// generic `Error:` line. Returns the first match.
pub fn detect_error(output: &str) -> Option<String> {
    let lower = output.to_lowercase();

    if lower.contains("compilation failed") || lower.contains("compile error") {
        return Some("compilation failed".to_string());
    }

    let test_re =
        Regex::new(r"(?i)(\d+)\s+failed[,;]?\s*(\d+)\s+passed").expect("valid regex");
    if let Some(caps) = test_re.captures(output) {
        let failed = caps.get(1).map_or("?", |m| m.as_str());
        let passed = caps.get(2).map_or("?", |m| m.as_str());
        if failed != "0" {
            return Some(format!("tests failed ({failed} failed, {passed} passed)"));
        }
    }

    let error_line_re = Regex::new(r"(?m)^\s*Error:\s*(.+)$").expect("valid regex");
    if let Some(caps) = error_line_re.captures(output) {
        let msg = caps.get(1).map_or("", |m| m.as_str()).trim();
        return Some(format!("Error: {msg}"));
    }

    None
}

/// Classify a full developer run.
///
/// `success` holds iff no error classifier matched and at least one success
/// indicator is present. A PR URL counts as a success indicator on its own:
/// the backend proved the work landed somewhere reviewable.
pub fn parse_developer_output(task_id: &str, output: &str) -> ExecutionResult {
    let pull_request_url = extract_pr_url(output);
    let error_message = detect_error(output);

    let lower = output.to_lowercase();
    let has_indicator = pull_request_url.is_some()
        || SUCCESS_INDICATORS.iter().any(|s| lower.contains(s));

    ExecutionResult {
        task_id: task_id.to_string(),
        success: error_message.is_none() && has_indicator,
        pull_request_url,
        error_message,
        completed_at: Utc::now(),
        details: tail(output, 2000),
    }
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
