use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Lifecycle state of a job row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    /// Waiting for `run_at` to pass before becoming eligible.
    Scheduled,
    /// Eligible for leasing by any worker.
    Pending,
    /// Leased by exactly one worker; `worker_id` and `leased_at` are set.
    Processing,
    /// Terminal: the command exited zero.
    Completed,
    /// A failed attempt awaiting its backoff deadline.
    Failed,
    /// Terminal: retries exhausted; parked in the dead-letter queue.
    Dead,
}

impl JobState {
    /// The canonical lowercase name stored in the database.
    pub fn as_str(&self) -> &'static str {
        use JobState::*;

        match self {
            Scheduled => "scheduled",
            Pending => "pending",
            Processing => "processing",
            Completed => "completed",
            Failed => "failed",
            Dead => "dead",
        }
    }

    /// Completed and dead jobs never transition again (short of an
    /// explicit DLQ retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// All states, in lifecycle order. Used by `status` to print zero
    /// counts for absent states.
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use JobState::*;

        match s {
            "scheduled" => Ok(Scheduled),
            "pending" => Ok(Pending),
            "processing" => Ok(Processing),
            "completed" => Ok(Completed),
            "failed" => Ok(Failed),
            "dead" => Ok(Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

// This impl is used to allow job listings to be serialised to JSON.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("running".parse::<JobState>().is_err());
        assert!("".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }
}
