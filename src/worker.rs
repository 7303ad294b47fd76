//! the per-worker lease/execute/commit loop.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::executor::Executor;
use crate::retry::{self, Disposition};
use crate::store::{OutcomeUpdate, Store};
use crate::types::job::Job;
use crate::types::states::JobState;

/// Idle sleep between lease attempts when the queue has nothing for us.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Pause before re-trying a lease that hit lock contention.
const BUSY_BACKOFF: Duration = Duration::from_millis(100);
/// Outcome commits that hit lock contention retry this many times.
const COMMIT_ATTEMPTS: u32 = 3;

pub struct Worker {
    id: String,
    store: Store,
    executor: Executor,
}

impl Worker {
    pub fn new(id: String, store: Store, log_dir: PathBuf) -> Self {
        Self {
            id,
            store,
            executor: Executor::new(log_dir),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until `cancel` fires: lease, execute, commit, repeat.
    ///
    /// `cancel` is the graceful signal: the current attempt drains and
    /// its outcome is committed before the loop exits. `force` reaches
    /// into the executor and abandons the in-flight attempt, leaving the
    /// row leased in `processing` for operator recovery. Store errors
    /// other than transient contention are fatal and end the loop.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        force: &CancellationToken,
    ) -> Result<(), QueueError> {
        info!(worker_id = %self.id, "worker started");

        loop {
            if cancel.is_cancelled() {
                info!(worker_id = %self.id, "worker stopping");
                return Ok(());
            }

            match self.store.lease(&self.id, Utc::now()).await {
                Ok(Some(job)) => {
                    if self.attempt(job, force).await?.is_none() {
                        // Forced shutdown mid-attempt.
                        return Ok(());
                    }
                },
                Ok(None) => {
                    select! {
                        _ = sleep(IDLE_POLL) => {},
                        _ = cancel.cancelled() => {},
                    }
                },
                Err(QueueError::Busy) => {
                    debug!(worker_id = %self.id, "lease contention, backing off");
                    select! {
                        _ = sleep(BUSY_BACKOFF) => {},
                        _ = cancel.cancelled() => {},
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    // Executes one leased job and commits the disposition. Returns None
    // when the attempt was abandoned by forced shutdown.
    async fn attempt(
        &self,
        job: Job,
        force: &CancellationToken,
    ) -> Result<Option<()>, QueueError> {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            attempt = job.attempts,
            command = %job.command,
            "executing job",
        );

        let outcome = self.executor.execute(&job, force).await?;

        let update = match retry::dispose(
            &outcome,
            job.attempts,
            job.max_retries,
            job.backoff_base,
            Utc::now(),
        ) {
            Disposition::Completed => {
                info!(worker_id = %self.id, job_id = %job.id, "job completed");
                OutcomeUpdate {
                    state: JobState::Completed,
                    run_at: None,
                    last_error: None,
                }
            },
            Disposition::Retry { run_at } => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %outcome,
                    retry_at = %run_at,
                    "attempt failed, will retry",
                );
                OutcomeUpdate {
                    state: JobState::Failed,
                    run_at: Some(run_at),
                    last_error: Some(outcome.to_string()),
                }
            },
            Disposition::Dead => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %outcome,
                    attempts = job.attempts,
                    "retries exhausted, job is dead",
                );
                OutcomeUpdate {
                    state: JobState::Dead,
                    run_at: None,
                    last_error: Some(outcome.to_string()),
                }
            },
            Disposition::Abandoned => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    "attempt cancelled, leaving row leased",
                );
                return Ok(None);
            },
        };

        self.commit(&job.id, &update).await?;
        Ok(Some(()))
    }

    // Commits with a bounded retry on lock contention. A pre-state
    // mismatch means the outcome already landed; that is not an error
    // worth dying over.
    async fn commit(
        &self,
        id: &str,
        update: &OutcomeUpdate,
    ) -> Result<(), QueueError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .update_outcome(id, JobState::Processing, update, Utc::now())
                .await
            {
                Ok(()) => return Ok(()),
                Err(QueueError::StateMismatch { .. }) => {
                    warn!(job_id = %id, "outcome already delivered, skipping");
                    return Ok(());
                },
                Err(QueueError::Busy) if attempt < COMMIT_ATTEMPTS => {
                    sleep(BUSY_BACKOFF).await;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use crate::types::job::JobSpec;

    fn spec(id: &str, command: &str, max_retries: Option<i64>) -> JobSpec {
        JobSpec {
            id: id.into(),
            command: command.into(),
            priority: 0,
            timeout: None,
            run_at: None,
            max_retries,
        }
    }

    // Drives a worker until `pred` holds on the job, then cancels it.
    async fn run_until(
        dir: &TempDir,
        job_id: &str,
        pred: impl Fn(&Job) -> bool,
    ) -> Job {
        let db = dir.path().join("queue.db");
        let worker = Worker::new(
            "w-test".into(),
            Store::open(&db).unwrap(),
            dir.path().join("logs"),
        );
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let loop_force = force.clone();
        let handle = tokio::spawn(async move {
            worker.run(&loop_cancel, &loop_force).await
        });

        let observer = Store::open(&db).unwrap();
        let job = timeout(Duration::from_secs(15), async {
            loop {
                let job = observer.get(job_id).await.unwrap();
                if pred(&job) {
                    return job;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("job should reach the expected state");

        cancel.cancel();
        handle.await.unwrap().unwrap();
        job
    }

    #[tokio::test]
    async fn test_runs_a_job_to_completion() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("queue.db")).unwrap();
        store
            .insert(&spec("ok", "echo hi", None), Utc::now())
            .await
            .unwrap();

        let job =
            run_until(&dir, "ok", |j| j.state == JobState::Completed).await;
        assert_eq!(job.attempts, 1);
        assert!(job.worker_id.is_none());
        assert!(job.last_error.is_none());

        let out = std::fs::read_to_string(
            crate::executor::stdout_path(&dir.path().join("logs"), "ok"),
        )
        .unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn test_failing_job_exhausts_retries_and_dies() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("queue.db")).unwrap();
        store.config_set("backoff_base", "1").await.unwrap();
        store
            .insert(&spec("doomed", "exit 9", Some(2)), Utc::now())
            .await
            .unwrap();

        let job =
            run_until(&dir, "doomed", |j| j.state == JobState::Dead).await;
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("exit status 9"));
    }

    #[tokio::test]
    async fn test_graceful_cancel_drains_current_attempt() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("queue.db");
        let store = Store::open(&db).unwrap();
        store
            .insert(&spec("slowish", "sleep 1", None), Utc::now())
            .await
            .unwrap();

        let worker = Worker::new(
            "w-test".into(),
            Store::open(&db).unwrap(),
            dir.path().join("logs"),
        );
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let loop_force = force.clone();
        let handle = tokio::spawn(async move {
            worker.run(&loop_cancel, &loop_force).await
        });

        // Wait for the lease, then request graceful shutdown mid-attempt.
        let observer = Store::open(&db).unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                if observer.get("slowish").await.unwrap().state
                    == JobState::Processing
                {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();

        timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker should stop after draining")
            .unwrap()
            .unwrap();
        assert_eq!(
            observer.get("slowish").await.unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn test_forced_cancel_leaves_row_leased() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("queue.db");
        let store = Store::open(&db).unwrap();
        store
            .insert(&spec("stuck", "sleep 30", None), Utc::now())
            .await
            .unwrap();

        let worker = Worker::new(
            "w-test".into(),
            Store::open(&db).unwrap(),
            dir.path().join("logs"),
        );
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let loop_force = force.clone();
        let handle = tokio::spawn(async move {
            worker.run(&loop_cancel, &loop_force).await
        });

        let observer = Store::open(&db).unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                if observer.get("stuck").await.unwrap().state
                    == JobState::Processing
                {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        force.cancel();
        timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker should abandon the attempt")
            .unwrap()
            .unwrap();

        let job = observer.get("stuck").await.unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("w-test"));
        assert!(job.leased_at.is_some());
    }
}
