use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::job::{BuckId, Job};

/// Outcome of one job execution, produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    /// Pid of the worker process that ran the job.
    pub pid: u32,
    pub job: Job,
    pub value: Value,
    /// Everything the target wrote to its execution output.
    pub output: String,
    /// Runtime failure outside the target's control (time or memory limit).
    pub error: Option<String>,
    /// Error raised by the target itself, including panics.
    pub exception: Option<String>,
    pub elapsed: Duration,
    /// Change of the worker's peak resident set, in KiB.
    pub memory_delta: i64,
    /// Identities of child jobs submitted on the job's behalf.
    pub spawned: Vec<BuckId>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(
        pid: u32,
        job: Job,
        value: Value,
        error: Option<String>,
        exception: Option<String>,
    ) -> Self {
        let success = error.is_none() && exception.is_none() && (value.is_null() || is_truthy(&value));
        Self {
            success,
            pid,
            job,
            value,
            output: String::new(),
            error,
            exception,
            elapsed: Duration::ZERO,
            memory_delta: 0,
            spawned: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Failed result for a job whose execution never reported back.
    pub fn failure(pid: u32, job: Job, exception: impl Into<String>) -> Self {
        Self::new(pid, job, Value::Null, None, Some(exception.into()))
    }

    /// A runtime limit cut the execution short. The worker that ran it may
    /// still be busy with the target and is not given more work.
    pub fn interrupted(&self) -> bool {
        self.error.is_some()
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_memory_delta(mut self, delta: i64) -> Self {
        self.memory_delta = delta;
        self
    }

    pub fn with_spawned(mut self, spawned: Vec<BuckId>) -> Self {
        self.spawned = spawned;
        self
    }
}

/// Truthiness of a return value: null, false, zero, empty string, empty
/// array and empty object are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::registry::Registry;
    use serde_json::json;

    fn job() -> Job {
        Job::call("echo").arg(1).build(&Registry::builtin()).unwrap()
    }

    #[test]
    fn truthiness_rules() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(4)));
        assert!(is_truthy(&json!("test")));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn no_return_value_is_success() {
        assert!(JobResult::new(1, job(), Value::Null, None, None).success);
    }

    #[test]
    fn falsy_return_value_is_failure() {
        assert!(!JobResult::new(1, job(), json!(false), None, None).success);
        assert!(JobResult::new(1, job(), json!(true), None, None).success);
    }

    #[test]
    fn captured_error_is_failure() {
        let result = JobResult::new(1, job(), json!(4), Some("timed out".into()), None);
        assert!(!result.success);
        assert!(result.interrupted());
        let result = JobResult::failure(1, job(), "worker exited");
        assert!(!result.success);
        assert_eq!(result.exception.as_deref(), Some("worker exited"));
        assert!(!result.interrupted());
    }
}
