//! maps attempt outcomes to the job's next state and run time.

use chrono::{DateTime, Duration, Utc};

use crate::types::outcome::Outcome;

/// What should happen to a job after an attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// The attempt succeeded; the job is done.
    Completed,
    /// The attempt failed but retries remain; eligible again at `run_at`.
    Retry { run_at: DateTime<Utc> },
    /// Retries are exhausted; the job goes to the dead-letter queue.
    Dead,
    /// The attempt was interrupted by forced shutdown; the row is left
    /// untouched in `processing`.
    Abandoned,
}

/// Decides a job's next state from the outcome of its latest attempt.
///
/// `attempts` is the value after the lease incremented it, so the first
/// attempt arrives here as 1. The backoff delay for a retryable failure
/// is `backoff_base ^ attempts` seconds, computed from the values
/// snapshotted onto the row at enqueue time.
pub fn dispose(
    outcome: &Outcome,
    attempts: u32,
    max_retries: u32,
    backoff_base: u32,
    now: DateTime<Utc>,
) -> Disposition {
    match outcome {
        Outcome::Success => Disposition::Completed,
        Outcome::Cancelled => Disposition::Abandoned,
        Outcome::NonZeroExit(_)
        | Outcome::TimedOut(_)
        | Outcome::SpawnError(_) => {
            if attempts > max_retries {
                Disposition::Dead
            } else {
                Disposition::Retry {
                    run_at: after_backoff(backoff_base, attempts, now),
                }
            }
        },
    }
}

// Saturates rather than overflowing on absurd base/attempt pairs.
fn after_backoff(base: u32, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay_secs = (base as i64).checked_pow(attempts).unwrap_or(i64::MAX);

    now.checked_add_signed(Duration::seconds(delay_secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_success_completes_regardless_of_attempts() {
        assert_eq!(
            dispose(&Outcome::Success, 4, 3, 2, now()),
            Disposition::Completed
        );
    }

    #[test]
    fn test_failure_backs_off_exponentially() {
        // First failure: 2^1 = 2s, second: 2^2 = 4s.
        assert_eq!(
            dispose(&Outcome::NonZeroExit(1), 1, 3, 2, now()),
            Disposition::Retry {
                run_at: now() + Duration::seconds(2),
            }
        );
        assert_eq!(
            dispose(&Outcome::TimedOut(5), 2, 3, 2, now()),
            Disposition::Retry {
                run_at: now() + Duration::seconds(4),
            }
        );
    }

    #[test]
    fn test_exhausted_retries_go_dead() {
        // max_retries = 2 allows attempts 1..=3; the third failure dies.
        assert_eq!(
            dispose(&Outcome::SpawnError("nope".into()), 3, 2, 1, now()),
            Disposition::Dead
        );
        // max_retries = 0 dies on the first failure.
        assert_eq!(
            dispose(&Outcome::NonZeroExit(1), 1, 0, 2, now()),
            Disposition::Dead
        );
    }

    #[test]
    fn test_cancelled_is_abandoned() {
        assert_eq!(
            dispose(&Outcome::Cancelled, 1, 3, 2, now()),
            Disposition::Abandoned
        );
    }

    #[test]
    fn test_backoff_saturates() {
        // A pathological base must not overflow the timestamp.
        let Disposition::Retry { run_at } =
            dispose(&Outcome::NonZeroExit(1), 30, 100, u32::MAX, now())
        else {
            panic!("expected a retry");
        };
        assert_eq!(run_at, DateTime::<Utc>::MAX_UTC);
    }
}
