use std::fmt;

/// Result of one executor attempt at a job's command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The child exited with status zero.
    Success,
    /// The child exited with a non-zero status.
    NonZeroExit(i32),
    /// The attempt exceeded the job's timeout and the process tree was
    /// terminated.
    TimedOut(u32),
    /// The child could not be started at all; no process was created.
    SpawnError(String),
    /// Forced shutdown interrupted the attempt; the job row is left in
    /// `processing` for operator recovery.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

// Rendered into the job's `last_error` column on failure.
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::NonZeroExit(code) => write!(f, "exit status {code}"),
            Outcome::TimedOut(secs) => {
                write!(f, "timed out after {secs}s")
            },
            Outcome::SpawnError(msg) => write!(f, "spawn failed: {msg}"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Outcome::NonZeroExit(7).to_string(), "exit status 7");
        assert_eq!(Outcome::TimedOut(2).to_string(), "timed out after 2s");
        assert_eq!(
            Outcome::SpawnError("no such file".into()).to_string(),
            "spawn failed: no such file"
        );
    }
}
