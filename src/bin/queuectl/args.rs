use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "queuectl", about, long_about = None, version)]
pub(crate) struct Args {
    /// Path to the queue database.
    #[arg(long, default_value = "queue.db")]
    pub(crate) db: PathBuf,
    /// Directory captured job output is written to.
    #[arg(long, default_value = "logs")]
    pub(crate) log_dir: PathBuf,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the queue database and tables if absent.
    Init,
    /// Add a job to the queue.
    Enqueue {
        /// Job spec as JSON, e.g. '{"id":"job1","command":"sleep 2"}'.
        spec: String,
    },
    /// List jobs, most recently touched first.
    List {
        /// Only show jobs in this state.
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of rows to show.
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Inspect and service the dead-letter queue.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Read or change queue configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage the worker fleet.
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Summarise job counts by state and live worker processes.
    Status,
    /// Print a job's captured output.
    Logs {
        id: String,
        /// Print captured stderr instead of stdout.
        #[arg(long)]
        stderr: bool,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum DlqAction {
    /// List dead jobs.
    List,
    /// Return a dead job to the queue with attempts reset.
    Retry { id: String },
    /// Delete every dead job.
    Purge,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Set a configuration value (max_retries, backoff_base).
    Set { key: String, value: String },
    /// Read a configuration value.
    Get { key: String },
}

#[derive(Subcommand, Debug)]
pub(crate) enum WorkerAction {
    /// Start a supervised fleet of worker processes.
    Start {
        /// Number of workers to spawn.
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Stop the running fleet.
    Stop,
    /// Run a single worker in the foreground.
    Run {
        /// Worker identity; defaults to worker-<pid>.
        #[arg(long)]
        worker_id: Option<String>,
    },
}
