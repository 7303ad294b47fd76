use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

use super::states::JobState;

/// A job row as stored in the queue.
#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    /// Higher runs earlier.
    pub priority: i64,
    /// Incremented by each lease.
    pub attempts: u32,
    /// Snapshot of config at enqueue time.
    pub max_retries: u32,
    /// Snapshot of config at enqueue time.
    pub backoff_base: u32,
    /// Wall-clock limit per attempt, if any.
    pub timeout_seconds: Option<u32>,
    /// Earliest eligible execution time.
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Identity holding the current lease; set iff state is processing.
    pub worker_id: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
}

/// The enqueue input record, as accepted over the admin surface.
///
/// `run_at` is an RFC 3339 timestamp; `max_retries` overrides the
/// configured default for this job only.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub priority: i64,
    pub timeout: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i64>,
}

impl JobSpec {
    /// Checks the record against the engine's input rules. A spec that
    /// passes here can be inserted without further shape errors.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.id.trim().is_empty() {
            return Err(QueueError::InvalidSpec("id must not be blank".into()));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::InvalidSpec(
                "command must not be blank".into(),
            ));
        }
        if let Some(timeout) = self.timeout {
            if timeout <= 0 {
                return Err(QueueError::InvalidSpec(format!(
                    "timeout must be positive, got {timeout}"
                )));
            }
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries < 0 {
                return Err(QueueError::InvalidSpec(format!(
                    "max_retries must not be negative, got {max_retries}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> JobSpec {
        serde_json::from_str(json).expect("spec should deserialise")
    }

    // Asserts the spec passes validation.
    #[track_caller]
    fn ok(json: &str) {
        spec(json).validate().expect("spec should validate");
    }

    // Asserts the spec fails validation with InvalidSpec.
    #[track_caller]
    fn invalid(json: &str) {
        assert!(matches!(
            spec(json).validate(),
            Err(QueueError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_validate() {
        ok(r#"{"id":"job-1","command":"echo hi"}"#);
        ok(r#"{"id":"job-1","command":"echo hi","priority":-3}"#);
        ok(r#"{"id":"j","command":"sleep 1","timeout":30,"max_retries":0}"#);
        ok(r#"{"id":"j","command":"echo x","run_at":"2031-01-01T00:00:00Z"}"#);

        invalid(r#"{"id":"","command":"echo hi"}"#);
        invalid(r#"{"id":"   ","command":"echo hi"}"#);
        invalid(r#"{"id":"job-1","command":""}"#);
        invalid(r#"{"id":"job-1","command":"echo hi","timeout":0}"#);
        invalid(r#"{"id":"job-1","command":"echo hi","timeout":-5}"#);
        invalid(r#"{"id":"job-1","command":"echo hi","max_retries":-1}"#);
    }

    #[test]
    fn test_malformed_records_rejected() {
        // Missing required fields, bad timestamps and unknown keys are
        // rejected at the deserialisation boundary.
        for json in [
            r#"{"command":"echo hi"}"#,
            r#"{"id":"job-1"}"#,
            r#"{"id":"job-1","command":"echo","run_at":"tomorrow"}"#,
            r#"{"id":"job-1","command":"echo","nice":true}"#,
        ] {
            assert!(serde_json::from_str::<JobSpec>(json).is_err());
        }
    }
}
