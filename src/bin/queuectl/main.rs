mod args;

use std::io;
use std::path::Path;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use queuectl::error::QueueError;
use queuectl::executor;
use queuectl::store::{ListFilter, Store};
use queuectl::supervisor::{self, Supervisor, PID_FILE};
use queuectl::types::job::{Job, JobSpec};
use queuectl::types::states::JobState;
use queuectl::worker::Worker;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Level};

use crate::args::{Args, Command, ConfigAction, DlqAction, WorkerAction};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging goes to stderr so stdout stays clean for command output.
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_writer(io::stderr)
            .init();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        },
    }
}

async fn run(args: Args) -> Result<(), QueueError> {
    match args.command {
        Command::Init => init(&args.db),
        Command::Enqueue { ref spec } => enqueue(&args, spec).await,
        Command::List { ref state, limit } => {
            let state = parse_state_arg(state.as_deref())?;
            let jobs = open_store(&args.db)?
                .list(&ListFilter { state, limit })
                .await?;
            print_jobs(&jobs);
            Ok(())
        },
        Command::Dlq { ref action } => dlq(&args, action).await,
        Command::Config { ref action } => config(&args, action).await,
        Command::Worker { ref action } => worker(&args, action).await,
        Command::Status => status(&args).await,
        Command::Logs { ref id, stderr } => logs(&args, id, stderr),
    }
}

fn init(db: &Path) -> Result<(), QueueError> {
    let existed = db.exists();
    Store::open(db)?;

    if existed {
        println!("Database at {} already initialized.", db.display());
    } else {
        println!("Database initialized at {}.", db.display());
    }
    Ok(())
}

// Every command except `init` requires an initialized store.
fn open_store(db: &Path) -> Result<Store, QueueError> {
    if !db.exists() {
        return Err(QueueError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found; run 'queuectl init' first", db.display()),
        )));
    }
    Store::open(db)
}

async fn enqueue(args: &Args, spec: &str) -> Result<(), QueueError> {
    let spec: JobSpec = serde_json::from_str(spec)
        .map_err(|e| QueueError::InvalidSpec(e.to_string()))?;

    let job = open_store(&args.db)?.insert(&spec, Utc::now()).await?;
    println!("Enqueued job {} ({}).", job.id, job.state);
    Ok(())
}

async fn dlq(args: &Args, action: &DlqAction) -> Result<(), QueueError> {
    let store = open_store(&args.db)?;

    match action {
        DlqAction::List => {
            let jobs = store
                .list(&ListFilter {
                    state: Some(JobState::Dead),
                    limit: 100,
                })
                .await?;
            print_jobs(&jobs);
        },
        DlqAction::Retry { id } => {
            store.retry_dead(id, Utc::now()).await?;
            println!("Job {id} returned to the queue.");
        },
        DlqAction::Purge => {
            let purged = store.purge_dead().await?;
            println!("Purged {purged} dead job(s).");
        },
    }
    Ok(())
}

async fn config(args: &Args, action: &ConfigAction) -> Result<(), QueueError> {
    let store = open_store(&args.db)?;

    match action {
        ConfigAction::Set { key, value } => {
            store.config_set(key, value).await?;
            println!("Config set: {key} = {value}");
        },
        ConfigAction::Get { key } => match store.config_get(key).await? {
            Some(value) => println!("{value}"),
            None => println!("{key} is not set"),
        },
    }
    Ok(())
}

async fn worker(args: &Args, action: &WorkerAction) -> Result<(), QueueError> {
    match action {
        WorkerAction::Start { count } => {
            // Fail fast here rather than in every spawned child.
            open_store(&args.db)?;
            fleet(args).start(*count).await
        },
        WorkerAction::Stop => fleet(args).stop().await,
        WorkerAction::Run { worker_id } => {
            let id = worker_id
                .clone()
                .unwrap_or_else(|| format!("worker-{}", std::process::id()));
            run_worker(args, id).await
        },
    }
}

fn fleet(args: &Args) -> Supervisor {
    let mut worker_args = vec![
        "--db".to_string(),
        args.db.display().to_string(),
        "--log-dir".to_string(),
        args.log_dir.display().to_string(),
    ];
    if args.debug {
        worker_args.push("--debug".to_string());
    }
    worker_args.extend(["worker".to_string(), "run".to_string()]);

    Supervisor::new(PID_FILE.into(), worker_args)
}

async fn run_worker(args: &Args, id: String) -> Result<(), QueueError> {
    let store = open_store(&args.db)?;
    let worker = Worker::new(id, store, args.log_dir.clone());

    // Two-stage shutdown: the first signal drains the current attempt,
    // a second abandons it.
    let cancel = CancellationToken::new();
    let force = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let force = force.clone();
        tokio::spawn(async move {
            if let Err(error) = watch_signals(&cancel, &force).await {
                warn!(%error, "something strange with signal handling!");
            }
        });
    }

    worker.run(&cancel, &force).await.map_err(|e| {
        error!(error = %e, "worker failed");
        e
    })
}

#[cfg(unix)]
async fn watch_signals(
    cancel: &CancellationToken,
    force: &CancellationToken,
) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    loop {
        select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        };
        if cancel.is_cancelled() {
            force.cancel();
            return Ok(());
        }
        cancel.cancel();
    }
}

#[cfg(not(unix))]
async fn watch_signals(
    cancel: &CancellationToken,
    force: &CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        if cancel.is_cancelled() {
            force.cancel();
            return Ok(());
        }
        cancel.cancel();
    }
}

async fn status(args: &Args) -> Result<(), QueueError> {
    let counts = open_store(&args.db)?.counts_by_state().await?;
    let count_of = |state: JobState| {
        counts
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };

    println!("Jobs:");
    for state in JobState::ALL {
        println!("  {:<12} {}", state, count_of(state));
    }

    match supervisor::read_pids(Path::new(PID_FILE))? {
        Some(pids) => {
            let live: Vec<String> = pids
                .iter()
                .filter(|&&pid| supervisor::is_alive(pid))
                .map(|pid| pid.to_string())
                .collect();
            if live.is_empty() {
                println!("Workers: none");
            } else {
                println!("Workers: {}", live.join(" "));
            }
        },
        None => println!("Workers: none"),
    }
    Ok(())
}

fn logs(args: &Args, id: &str, want_stderr: bool) -> Result<(), QueueError> {
    let path = if want_stderr {
        executor::stderr_path(&args.log_dir, id)
    } else {
        executor::stdout_path(&args.log_dir, id)
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            print!("{contents}");
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(QueueError::NotFound(format!(
                "no captured output for job {id}"
            )))
        },
        Err(e) => Err(e.into()),
    }
}

fn parse_state_arg(
    state: Option<&str>,
) -> Result<Option<JobState>, QueueError> {
    state
        .map(|s| s.parse::<JobState>().map_err(QueueError::InvalidSpec))
        .transpose()
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }

    println!(
        "{:<24} {:<11} {:>4} {:>9}  {}",
        "ID", "STATE", "PRIO", "ATTEMPTS", "LAST ERROR",
    );
    for job in jobs {
        println!(
            "{:<24} {:<11} {:>4} {:>9}  {}",
            job.id,
            job.state,
            job.priority,
            format!("{}/{}", job.attempts, job.max_retries + 1),
            job.last_error.as_deref().unwrap_or("-"),
        );
    }
}
