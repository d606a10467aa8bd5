//! Prompt construction for each worker action.
//!
//! Prompts are plain text assembled line by line. Every prompt names the
//! branch and points the backend at the instruction file, so a resumed or
//! re-prompted run lands in the same place as the original.

use crate::model::{TaskAction, WorkerTask};
use crate::review::ReviewComment;
use crate::workspace::INSTRUCTION_FILE_NAME;

/// Build the prompt for `task`, dispatching on its action.
pub fn build_prompt(task: &WorkerTask, branch_name: &str) -> String {
    match task.action {
        TaskAction::StartNewTask => build_new_task_prompt(task, branch_name),
        TaskAction::ResumeTask => build_resume_prompt(task, branch_name),
        TaskAction::ProcessFeedback => build_feedback_prompt(task, branch_name),
        TaskAction::MergeRequest => build_merge_prompt(task),
        // Router-level actions never reach prompt generation; give the
        // backend something inert rather than panicking mid-pipeline.
        TaskAction::ReleaseWorker | TaskAction::CheckStatus => {
            format!("Report the current state of branch {branch_name} and stop.")
        }
    }
}

fn common_header(task: &WorkerTask, branch_name: &str) -> String {
    let mut s = String::new();
    s.push_str("You are working in an isolated checkout of the repository ");
    s.push_str(&task.repository_id);
    s.push_str(".\n");
    s.push_str(&format!("Branch: {branch_name}\n"));
    s.push_str(&format!(
        "Read {INSTRUCTION_FILE_NAME} in the working directory for task metadata and conventions.\n\n"
    ));
    s
}

fn build_new_task_prompt(task: &WorkerTask, branch_name: &str) -> String {
    let mut s = common_header(task, branch_name);
    s.push_str("Your task:\n");
    if let Some(item) = &task.board_item {
        s.push_str(&item.title);
        s.push('\n');
    } else {
        s.push_str(&format!("Complete board item {}\n", task.task_id));
    }
    s.push_str("\nInstructions:\n");
    s.push_str("- Implement the change on the branch named above\n");
    s.push_str("- Commit after each logical unit of work (not just at the end)\n");
    s.push_str("- Push after each commit so the remote reflects progress\n");
    s.push_str("- Run any existing tests and make sure they pass\n");
    s.push_str("- Open a pull request for the branch when the work is complete\n");
    s.push_str("- On the final line of your output, print exactly: PR: <pull request url>\n");
    s
}

fn build_resume_prompt(task: &WorkerTask, branch_name: &str) -> String {
    let mut s = common_header(task, branch_name);
    s.push_str("This task was interrupted; the working tree may contain partial work.\n");
    s.push_str("\nInstructions:\n");
    s.push_str("- Inspect the branch state and commit log to see what was already done\n");
    s.push_str("- Finish the remaining work; do not start over\n");
    s.push_str("- Run any existing tests and make sure they pass\n");
    s.push_str("- If no pull request exists yet, open one for the branch\n");
    s.push_str("- On the final line of your output, print exactly: PR: <pull request url>\n");
    s
}

fn build_feedback_prompt(task: &WorkerTask, branch_name: &str) -> String {
    let mut s = common_header(task, branch_name);
    if let Some(url) = &task.pull_request_url {
        s.push_str(&format!("Pull request under review: {url}\n"));
    }
    s.push_str("\nReviewers left the following feedback:\n\n");
    for (i, comment) in comments(task).iter().enumerate() {
        s.push_str(&format!("{}. [{}] {}\n", i + 1, comment.author, comment.body));
    }
    s.push_str("\nInstructions:\n");
    s.push_str("- Address every comment above on the existing branch\n");
    s.push_str("- Reply is not needed; the code change is the answer\n");
    s.push_str("- Commit and push your changes to update the pull request\n");
    s.push_str("- When every comment is addressed, state that the feedback was addressed successfully\n");
    s
}

fn build_merge_prompt(task: &WorkerTask) -> String {
    let mut s = String::new();
    s.push_str(&format!(
        "The pull request for task {} has been approved.\n",
        task.task_id
    ));
    if let Some(url) = &task.pull_request_url {
        s.push_str(&format!("Pull request: {url}\n"));
    }
    s.push_str("\nInstructions:\n");
    s.push_str("- Verify the pull request is still approved and mergeable\n");
    s.push_str("- Merge it using the squash strategy and delete the head branch\n");
    s.push_str("- If the merge succeeds, state that the pull request was merged successfully\n");
    s.push_str("- If it cannot be merged, explain why on a line starting with Error:\n");
    s
}

fn comments(task: &WorkerTask) -> &[ReviewComment] {
    task.comments.as_deref().unwrap_or(&[])
}
