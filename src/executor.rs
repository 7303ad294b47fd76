//! runs one attempt of a job's command as a child of the worker.
//!
//! The command goes to the platform shell verbatim (input is trusted, per
//! the queue's threat model) in its own process group, with stdout and
//! stderr redirected to per-job log files that are truncated on every
//! attempt. Completion is polled rather than awaited so both the timeout
//! and forced cancellation are bounded by the poll cadence.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::types::job::Job;
use crate::types::outcome::Outcome;

/// Cadence at which the child is polled; bounds cancellation latency.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long a timed-out process group gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);
/// How long a cancelled attempt may still finish naturally before its
/// process group is terminated.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Path of the captured stdout for a job.
pub fn stdout_path(log_dir: &Path, id: &str) -> PathBuf {
    log_dir.join(format!("{id}.out.log"))
}

/// Path of the captured stderr for a job.
pub fn stderr_path(log_dir: &Path, id: &str) -> PathBuf {
    log_dir.join(format!("{id}.err.log"))
}

pub struct Executor {
    log_dir: PathBuf,
}

impl Executor {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Runs one attempt of `job`, returning how it went.
    ///
    /// Job-level failures (bad command, non-zero exit, timeout) are
    /// `Ok(outcome)`; only sink I/O failures are errors, and those are
    /// fatal to the worker.
    pub async fn execute(
        &self,
        job: &Job,
        force: &CancellationToken,
    ) -> Result<Outcome, QueueError> {
        std::fs::create_dir_all(&self.log_dir)?;
        // Truncate on every attempt: the logs describe the latest one.
        let out = File::create(stdout_path(&self.log_dir, &job.id))?;
        let err = File::create(stderr_path(&self.log_dir, &job.id))?;

        let mut cmd = shell_command(&job.command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(Outcome::SpawnError(e.to_string())),
        };

        let started = Instant::now();
        let deadline = job
            .timeout_seconds
            .map(|secs| started + Duration::from_secs(secs as u64));

        loop {
            if let Some(status) = child.try_wait()? {
                debug!(job_id = %job.id, ?status, "child exited");
                return Ok(match status.code() {
                    Some(0) => Outcome::Success,
                    Some(code) => Outcome::NonZeroExit(code),
                    // Killed by a signal we didn't send.
                    None => Outcome::NonZeroExit(-1),
                });
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(job_id = %job.id, "attempt timed out, terminating");
                    terminate(&mut child).await;
                    return Ok(Outcome::TimedOut(
                        job.timeout_seconds.unwrap_or(0),
                    ));
                }
            }

            select! {
                _ = sleep(POLL_INTERVAL) => {},
                _ = force.cancelled() => {
                    // Give the child one last grace window, then stop
                    // waiting on it; the row stays in `processing`.
                    sleep(CANCEL_GRACE).await;
                    if child.try_wait()?.is_none() {
                        terminate(&mut child).await;
                    }
                    return Ok(Outcome::Cancelled);
                },
            }
        }
    }
}

/// Terminates the child's whole process group: a polite signal first,
/// then a forced kill once the grace window closes.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            let _ = killpg(pgid, Signal::SIGTERM);

            let grace_ends = Instant::now() + TERM_GRACE;
            while Instant::now() < grace_ends {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                sleep(Duration::from_millis(50)).await;
            }

            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .output()
                .await;
        }
    }

    // Reap so no zombie outlives the attempt.
    let _ = child.wait().await;
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    use crate::types::states::JobState;

    fn job(id: &str, command: &str, timeout: Option<u32>) -> Job {
        Job {
            id: id.into(),
            command: command.into(),
            state: JobState::Processing,
            priority: 0,
            attempts: 1,
            max_retries: 3,
            backoff_base: 2,
            timeout_seconds: timeout,
            run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_error: None,
            worker_id: Some("w".into()),
            leased_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(dir.path().to_path_buf());
        let force = CancellationToken::new();

        let outcome = executor
            .execute(&job("ok", "echo hi", None), &force)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success);

        let out =
            std::fs::read_to_string(stdout_path(dir.path(), "ok")).unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_stderr_capture() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(dir.path().to_path_buf());
        let force = CancellationToken::new();

        let outcome = executor
            .execute(&job("bad", "echo oops >&2; exit 3", None), &force)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NonZeroExit(3));

        let err =
            std::fs::read_to_string(stderr_path(dir.path(), "bad")).unwrap();
        assert_eq!(err.trim(), "oops");
    }

    #[tokio::test]
    async fn test_unresolvable_command_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(dir.path().to_path_buf());
        let force = CancellationToken::new();

        // The shell spawns fine and reports 127 for the bogus command.
        let outcome = executor
            .execute(&job("gone", "definitely-not-a-command-xyz", None), &force)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NonZeroExit(127));
    }

    #[tokio::test]
    async fn test_timeout_terminates_the_child() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(dir.path().to_path_buf());
        let force = CancellationToken::new();

        let started = Instant::now();
        let outcome = executor
            .execute(&job("slow", "sleep 30", Some(1)), &force)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::TimedOut(1));
        // Well under the sleep duration: the child was killed, not waited.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_forced_cancellation_abandons_the_attempt() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(dir.path().to_path_buf());
        let force = CancellationToken::new();

        let cancel = force.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let outcome = executor
            .execute(&job("stuck", "sleep 30", None), &force)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_logs_truncated_between_attempts() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(dir.path().to_path_buf());
        let force = CancellationToken::new();

        executor
            .execute(&job("j", "echo first attempt output", None), &force)
            .await
            .unwrap();
        executor
            .execute(&job("j", "echo second", None), &force)
            .await
            .unwrap();

        let out =
            std::fs::read_to_string(stdout_path(dir.path(), "j")).unwrap();
        assert_eq!(out.trim(), "second");
    }
}
