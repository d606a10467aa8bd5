//! CLI surface: `run`, `status`, `drain`, `resume`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};

use drover_core::drain::DrainSignal;
use drover_core::model::{TaskStatus, WorkerStatus};
use drover_core::store::StateStore;
use drover_core::{DroverConfig, Orchestrator, Providers};

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Autonomous project-board orchestrator for AI coding agents",
    version
)]
pub struct Cli {
    /// Base directory for state and workspaces (default: ~/.drover)
    #[arg(long, global = true, env = "DROVER_DIR")]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start monitoring the board and dispatching workers
    Run {
        /// Run a single planner cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Show durable tasks, workers, and workspaces
    Status,
    /// Signal a graceful drain: finish in-flight work, pick up nothing new
    Drain,
    /// Clear the drain signal so monitoring continues
    Resume,
}

/// Flipped by the SIGINT/SIGTERM handler; polled by a watcher thread that
/// relays it into the orchestrator's shutdown flag.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

fn base_dir(cli_dir: Option<PathBuf>) -> PathBuf {
    cli_dir.unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".drover")
    })
}

pub fn run(cli: Cli) -> Result<()> {
    let base = base_dir(cli.dir);
    match cli.command {
        Command::Run { once } => run_orchestrator(&base, once),
        Command::Status => show_status(&base),
        Command::Drain => {
            DrainSignal::new(&base).set()?;
            println!("Drain signal sent. The orchestrator will finish in-flight work and stop.");
            Ok(())
        }
        Command::Resume => {
            DrainSignal::new(&base).clear()?;
            println!("Drain signal cleared. Monitoring will continue.");
            Ok(())
        }
    }
}

fn run_orchestrator(base: &Path, once: bool) -> Result<()> {
    let config = DroverConfig::load(base)?;

    // A drain file surviving a previous run would stop this one immediately.
    let drain = DrainSignal::new(base);
    if drain.is_set() {
        println!("Warning: stale drain signal found. Clearing it and starting normally.");
        println!("Use 'drover drain' to request a graceful shutdown.");
        drain.clear()?;
    }

    let providers = Providers::host(&config)?;
    let orchestrator = Orchestrator::build(config, providers)?;

    install_signal_handlers();
    let flag = orchestrator.shutdown_flag();
    std::thread::spawn(move || loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            flag.store(true, Ordering::SeqCst);
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    let startup = orchestrator.start()?;
    println!("drover run");
    println!("Base dir: {}", orchestrator.base_dir().display());
    println!(
        "Workers: {} restored, {} purged, {} created",
        startup.restored, startup.purged, startup.created
    );
    println!(
        "Started: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );

    orchestrator.run(once)
}

fn show_status(base: &Path) -> Result<()> {
    let store = StateStore::new(&base.join(".state"));
    store.initialize()?;

    let tasks = store.get_all_tasks();
    println!("TASKS ({})", tasks.len());
    println!("{:<24} {:<12} {:<10} UPDATED", "ID", "STATUS", "COMMENTS");
    for task in &tasks {
        println!(
            "{:<24} {:<12} {:<10} {}",
            task.id,
            task.status,
            task.processed_comment_ids.len(),
            task.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let done = count_by(&tasks, |t| t.status == TaskStatus::Done);
    println!("({done} done)");

    let workers = store.get_all_workers();
    println!();
    println!("WORKERS ({})", workers.len());
    println!("{:<10} {:<10} {:<10} {:<24} LAST ACTIVE", "ID", "STATUS", "KIND", "TASK");
    for worker in &workers {
        println!(
            "{:<10} {:<10} {:<10} {:<24} {}",
            worker.id,
            worker.status,
            worker.worker_kind,
            worker
                .current_task
                .as_ref()
                .map(|t| t.task_id.clone())
                .unwrap_or_else(|| "-".to_string()),
            worker.last_active_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let active = count_by(&workers, |w| w.status.is_active());
    let quarantined = count_by(&workers, |w| w.status == WorkerStatus::Stopped);
    println!("({active} active, {quarantined} stopped)");

    let workspaces = store.get_all_workspaces();
    println!();
    println!("WORKSPACES ({})", workspaces.len());
    println!("{:<24} {:<20} {:<24} WORKTREE", "TASK", "REPOSITORY", "BRANCH");
    for ws in &workspaces {
        println!(
            "{:<24} {:<20} {:<24} {}",
            ws.task_id,
            ws.repository_id,
            ws.branch_name,
            if ws.worktree_created { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn count_by<T>(items: &[T], pred: impl Fn(&T) -> bool) -> usize {
    items.iter().filter(|i| pred(i)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_prefers_explicit_flag() {
        let dir = base_dir(Some(PathBuf::from("/tmp/custom")));
        assert_eq!(dir, PathBuf::from("/tmp/custom"));
    }

    #[test]
    fn base_dir_defaults_under_home() {
        let dir = base_dir(None);
        assert!(dir.ends_with(".drover"));
    }
}
