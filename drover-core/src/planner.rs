//! Planner: drives each board item through todo → in-progress → in-review →
//! done.
//!
//! One cycle handles the three live statuses in order, issuing typed
//! requests to the router and mirroring board transitions into the durable
//! task records. Review items fan out onto parallel threads and join at the
//! end of the phase. Errors never interrupt a cycle; they land in a bounded
//! ring for inspection.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::board::{BoardItem, BoardProvider};
use crate::model::{Task, TaskStatus};
use crate::parser::parse_pr_url;
use crate::review::{CommentFilter, PullRequestState, ReviewProvider};
use crate::router::{RequestStatus, TaskRequest, TaskRouter};
use crate::store::StateStore;

const ERROR_RING_MAX: usize = 100;
const ERROR_RING_TRIM: usize = 50;

/// First comment fetch for a task looks back this far.
const COMMENT_LOOKBACK_DAYS: i64 = 7;

/// One captured planner failure.
#[derive(Debug, Clone)]
pub struct PlannerError {
    pub at: DateTime<Utc>,
    pub context: String,
    pub message: String,
}

pub struct Planner {
    board: Arc<dyn BoardProvider>,
    reviews: Arc<dyn ReviewProvider>,
    router: Arc<TaskRouter>,
    store: Arc<StateStore>,
    board_id: String,
    filter: CommentFilter,
    /// Items already dispatched (or hydrated as past the TODO phase).
    processed: Mutex<HashSet<String>>,
    /// Items currently being worked or reviewed.
    active: Mutex<HashSet<String>>,
    errors: Mutex<VecDeque<PlannerError>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    cycles: AtomicU64,
}

impl Planner {
    pub fn new(
        board: Arc<dyn BoardProvider>,
        reviews: Arc<dyn ReviewProvider>,
        router: Arc<TaskRouter>,
        store: Arc<StateStore>,
        board_id: impl Into<String>,
        filter: CommentFilter,
    ) -> Self {
        Self {
            board,
            reviews,
            router,
            store,
            board_id: board_id.into(),
            filter,
            processed: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
            errors: Mutex::new(VecDeque::new()),
            last_sync: Mutex::new(None),
            cycles: AtomicU64::new(0),
        }
    }

    /// Hydrate workflow state from the current board: DONE items are
    /// processed history, IN_PROGRESS and IN_REVIEW items are active work.
    pub fn start_monitoring(&self) {
        for status in [TaskStatus::Done, TaskStatus::InProgress, TaskStatus::InReview] {
            let items = match self.board.get_items(&self.board_id, status) {
                Ok(items) => items,
                Err(e) => {
                    self.record_error("hydrate", &format!("{e:#}"));
                    continue;
                }
            };
            for item in items {
                self.processed.lock().unwrap().insert(item.id.clone());
                if status != TaskStatus::Done {
                    self.active.lock().unwrap().insert(item.id.clone());
                    self.ensure_task(&item.id, status);
                }
            }
        }
        tracing::info!(
            processed = self.processed.lock().unwrap().len(),
            active = self.active.lock().unwrap().len(),
            "planner hydrated from board"
        );
    }

    /// One end-to-end pass over the three live board statuses.
    pub fn run_cycle(&self) {
        self.handle_new_tasks();
        self.handle_in_progress_tasks();
        self.handle_review_tasks();
        *self.last_sync.lock().unwrap() = Some(Utc::now());
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap()
    }

    pub fn recent_errors(&self) -> Vec<PlannerError> {
        self.errors.lock().unwrap().iter().cloned().collect()
    }

    // ── Phase 1: new tasks ──────────────────────────────────────────────────

    fn handle_new_tasks(&self) {
        let items = match self.board.get_items(&self.board_id, TaskStatus::Todo) {
            Ok(items) => items,
            Err(e) => {
                self.record_error("fetch-todo", &format!("{e:#}"));
                return;
            }
        };

        for item in items {
            if self.processed.lock().unwrap().contains(&item.id) {
                continue;
            }
            self.ensure_task(&item.id, TaskStatus::Todo);

            let response = self.router.handle(TaskRequest::StartNewTask {
                task_id: item.id.clone(),
                board_item: item.clone(),
            });
            match response.status {
                RequestStatus::Accepted => {
                    self.move_item(&item.id, TaskStatus::InProgress, true);
                    self.processed.lock().unwrap().insert(item.id.clone());
                    self.active.lock().unwrap().insert(item.id.clone());
                }
                RequestStatus::Rejected => {
                    // Pool saturated or item contested; the next cycle
                    // retries from a clean slate.
                    tracing::debug!(item = item.id.as_str(), reason = response.message.as_str(), "start deferred");
                }
                _ => {
                    self.record_error(&format!("start:{}", item.id), &response.message);
                }
            }
        }
    }

    // ── Phase 2: in-progress tasks ──────────────────────────────────────────

    fn handle_in_progress_tasks(&self) {
        let items = match self.board.get_items(&self.board_id, TaskStatus::InProgress) {
            Ok(items) => items,
            Err(e) => {
                self.record_error("fetch-in-progress", &format!("{e:#}"));
                return;
            }
        };

        for item in items {
            let response = self.router.handle(TaskRequest::CheckStatus {
                task_id: item.id.clone(),
            });
            match response.status {
                RequestStatus::Completed => {
                    if let Some(url) = &response.pull_request_url {
                        if let Err(e) = self.board.add_pull_request_to_item(&item.id, url) {
                            self.record_error(&format!("attach-pr:{}", item.id), &format!("{e:#}"));
                            continue;
                        }
                        self.move_item(&item.id, TaskStatus::InReview, false);
                    } else {
                        tracing::debug!(
                            item = item.id.as_str(),
                            "execution finished without a pull request; leaving in progress"
                        );
                    }
                }
                RequestStatus::Error => {
                    self.record_error(&format!("check:{}", item.id), &response.message);
                }
                _ => {}
            }
        }
    }

    // ── Phase 3: review tasks ───────────────────────────────────────────────

    fn handle_review_tasks(&self) {
        let items = match self.board.get_items(&self.board_id, TaskStatus::InReview) {
            Ok(items) => items,
            Err(e) => {
                self.record_error("fetch-in-review", &format!("{e:#}"));
                return;
            }
        };

        std::thread::scope(|scope| {
            for item in items {
                scope.spawn(move || self.handle_review_item(item));
            }
        });
    }

    fn handle_review_item(&self, item: BoardItem) {
        let Some(url) = item.latest_pull_request_url().map(str::to_string) else {
            tracing::debug!(item = item.id.as_str(), "review item has no pull request url");
            return;
        };
        let Some(pr_ref) = parse_pr_url(&url) else {
            self.record_error(
                &format!("review:{}", item.id),
                &format!("unparseable pull request url: {url}"),
            );
            return;
        };

        let pr = match self
            .reviews
            .get_pull_request(&pr_ref.repository_id, pr_ref.number)
        {
            Ok(pr) => pr,
            Err(e) => {
                self.record_error(&format!("review:{}", item.id), &format!("{e:#}"));
                return;
            }
        };

        if pr.state == PullRequestState::Merged {
            self.move_item(&item.id, TaskStatus::Done, false);
            self.router.handle(TaskRequest::ReleaseWorker {
                task_id: item.id.clone(),
            });
            self.active.lock().unwrap().remove(&item.id);
            tracing::info!(item = item.id.as_str(), pr = url.as_str(), "pull request merged");
            return;
        }

        match self.reviews.is_approved(&pr_ref.repository_id, pr_ref.number) {
            Ok(true) => {
                let response = self.router.handle(TaskRequest::RequestMerge {
                    task_id: item.id.clone(),
                    pull_request_url: url.clone(),
                });
                match response.status {
                    RequestStatus::Completed => {
                        self.move_item(&item.id, TaskStatus::Done, false);
                        self.active.lock().unwrap().remove(&item.id);
                    }
                    RequestStatus::InProgress => {}
                    _ => {
                        self.record_error(&format!("merge:{}", item.id), &response.message);
                    }
                }
            }
            Ok(false) => self.forward_new_comments(&item, &pr_ref.repository_id, pr_ref.number, &url),
            Err(e) => {
                self.record_error(&format!("approval:{}", item.id), &format!("{e:#}"));
            }
        }
    }

    fn forward_new_comments(&self, item: &BoardItem, repository_id: &str, number: u64, url: &str) {
        let since = self
            .store
            .get_task_last_sync_time(&item.id)
            .unwrap_or_else(|| Utc::now() - ChronoDuration::days(COMMENT_LOOKBACK_DAYS));

        let comments = match self
            .reviews
            .get_new_comments(repository_id, number, since, &self.filter)
        {
            Ok(comments) => comments,
            Err(e) => {
                self.record_error(&format!("comments:{}", item.id), &format!("{e:#}"));
                return;
            }
        };

        // Idempotence: a comment id seen before is a no-op.
        let seen = self
            .store
            .get_task(&item.id)
            .map(|t| t.processed_comment_ids)
            .unwrap_or_default();
        let fresh: Vec<_> = comments
            .into_iter()
            .filter(|c| !seen.contains(&c.id))
            .collect();
        if fresh.is_empty() {
            return;
        }

        let newest = fresh.iter().map(|c| c.created_at).max().unwrap_or(since);
        let ids: Vec<String> = fresh.iter().map(|c| c.id.clone()).collect();

        let response = self.router.handle(TaskRequest::ProcessFeedback {
            task_id: item.id.clone(),
            board_item: Some(item.clone()),
            pull_request_url: Some(url.to_string()),
            comments: fresh,
            last_sync_time: Some(since),
        });
        if response.status == RequestStatus::Accepted {
            if let Err(e) = self.store.update_task_last_sync_time(&item.id, newest) {
                self.record_error(&format!("sync:{}", item.id), &format!("{e:#}"));
            }
            if let Err(e) = self.store.add_processed_comments_to_task(&item.id, &ids) {
                self.record_error(&format!("sync:{}", item.id), &format!("{e:#}"));
            }
            if let Err(e) = self.reviews.mark_comments_as_processed(&ids) {
                tracing::debug!(item = item.id.as_str(), error = %e, "provider comment ack failed");
            }
            tracing::info!(item = item.id.as_str(), count = ids.len(), "feedback forwarded");
        } else {
            self.record_error(&format!("feedback:{}", item.id), &response.message);
        }
    }

    // ── Shared helpers ──────────────────────────────────────────────────────

    /// Move a board item and its task record to `status`. With `verify`, the
    /// update is read back and a silent provider failure is recorded.
    fn move_item(&self, item_id: &str, status: TaskStatus, verify: bool) {
        match self.board.update_item_status(item_id, status) {
            Ok(updated) => {
                if verify && updated.status != status {
                    self.record_error(
                        &format!("verify:{item_id}"),
                        &format!(
                            "board update did not stick: wanted {status}, item still {}",
                            updated.status
                        ),
                    );
                }
            }
            Err(e) => {
                self.record_error(&format!("update:{item_id}"), &format!("{e:#}"));
                return;
            }
        }
        let mut task = self.ensure_task(item_id, status);
        task.status = status;
        task.updated_at = Utc::now();
        if let Err(e) = self.store.save_task(&task) {
            self.record_error(&format!("save-task:{item_id}"), &format!("{e:#}"));
        }
    }

    /// Get or lazily create the local task record mirroring a board item.
    fn ensure_task(&self, item_id: &str, status: TaskStatus) -> Task {
        if let Some(task) = self.store.get_task(item_id) {
            return task;
        }
        let task = Task::new(item_id, status, Utc::now());
        if let Err(e) = self.store.save_task(&task) {
            self.record_error(&format!("create-task:{item_id}"), &format!("{e:#}"));
        }
        task
    }

    fn record_error(&self, context: &str, message: &str) {
        tracing::warn!(context, message, "planner error");
        let mut errors = self.errors.lock().unwrap();
        if errors.len() >= ERROR_RING_MAX {
            while errors.len() > ERROR_RING_TRIM {
                errors.pop_front();
            }
        }
        errors.push_back(PlannerError {
            at: Utc::now(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }
}
