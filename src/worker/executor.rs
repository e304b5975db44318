use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::resource::{getrlimit, getrusage, setrlimit, Resource, UsageWho};
use nix::unistd::alarm;
use serde_json::Value;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::error::{BuckError, Result};
use crate::scheduler::{Job, JobResult};
use crate::worker::registry::{Execution, Registry};

type Finished = (std::thread::Result<Result<Option<Value>>>, Execution);

/// Result of one execution plus the child jobs the target spawned.
#[derive(Debug)]
pub struct Outcome {
    pub result: JobResult,
    pub children: Vec<Job>,
}

/// Runs one job at a time against a [`Registry`].
///
/// With process limits enabled the time limit is an `alarm(2)` aimed at this
/// process and the memory limit is an `RLIMIT_AS` cap. Both are process-wide,
/// so they are only switched on inside a dedicated worker process. Without
/// them the time limit falls back to a timer and memory is not capped.
pub struct JobExecutor {
    registry: Arc<Registry>,
    pid: u32,
    process_limits: bool,
    alarm: Option<Signal>,
    /// Target still running after its time limit fired.
    straggler: Option<JoinHandle<Finished>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .field("pid", &self.pid)
            .field("process_limits", &self.process_limits)
            .finish()
    }
}

impl JobExecutor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            pid: std::process::id(),
            process_limits: false,
            alarm: None,
            straggler: None,
        }
    }

    /// Enforce limits with a process alarm and address-space cap.
    pub fn with_process_limits(mut self) -> Self {
        self.process_limits = true;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute `job` and capture its outcome. Never fails: every error the
    /// target raises, including a panic, ends up in the result.
    pub async fn execute(&mut self, job: Job) -> Outcome {
        self.settle().await;

        let started = Instant::now();
        let rss_before = peak_rss_kib();
        tracing::debug!(job_id = %job.id(), target = job.target(), "Executing job");

        if job.is_control() {
            let result = JobResult::new(self.pid, job, Value::Null, None, None)
                .with_elapsed(started.elapsed());
            return Outcome {
                result,
                children: Vec::new(),
            };
        }

        let limits = job.limits();
        let memory_limit = limits.memory_limit.filter(|_| self.process_limits);
        let registry = Arc::clone(&self.registry);
        let task_job = job.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || run_target(&registry, &task_job, memory_limit));

        let finished = match limits.time_limit {
            None => Some((&mut handle).await),
            Some(limit) => self.await_with_limit(&mut handle, limit).await,
        };

        let mut children = Vec::new();
        let result = match finished {
            None => {
                let limit = limits.time_limit.unwrap_or_default();
                tracing::warn!(job_id = %job.id(), limit = ?limit, "Time limit exceeded");
                self.straggler = Some(handle);
                let error = format!("time limit of {}s exceeded", whole_seconds(limit));
                JobResult::new(self.pid, job, Value::Null, Some(error), None)
            }
            Some(Err(e)) => JobResult::failure(self.pid, job, task_failure(e)),
            Some(Ok((caught, exec))) => {
                let (output, builders) = exec.into_parts();
                for builder in builders {
                    let target = builder.target().to_string();
                    match builder.build(&self.registry) {
                        Ok(child) => children.push(child),
                        Err(e) => {
                            tracing::warn!(job_id = %job.id(), child = %target, error = %e, "Dropping invalid child job");
                        }
                    }
                }
                let (value, exception) = match caught {
                    Ok(Ok(value)) => (value.unwrap_or(Value::Null), None),
                    Ok(Err(e)) => (Value::Null, Some(e.to_string())),
                    Err(payload) => (Value::Null, Some(format!("panicked: {}", panic_message(&*payload)))),
                };
                JobResult::new(self.pid, job, value, None, exception).with_output(output)
            }
        };

        let result = result
            .with_elapsed(started.elapsed())
            .with_memory_delta(peak_rss_kib() - rss_before);

        tracing::debug!(
            job_id = %result.job.id(),
            success = result.success,
            elapsed = ?result.elapsed,
            "Job finished"
        );

        Outcome { result, children }
    }

    /// Whether a target is still running past its time limit.
    pub fn has_straggler(&self) -> bool {
        self.straggler.is_some()
    }

    /// Wait for a target that outlived its time limit. Jobs never overlap.
    pub async fn settle(&mut self) {
        if let Some(straggler) = self.straggler.take() {
            tracing::debug!("Waiting for timed out target to return");
            if let Err(e) = straggler.await {
                tracing::warn!(error = %e, "Timed out target failed");
            }
        }
    }

    async fn await_with_limit(
        &mut self,
        handle: &mut JoinHandle<Finished>,
        limit: Duration,
    ) -> Option<std::result::Result<Finished, JoinError>> {
        if !self.process_limits {
            return tokio::time::timeout(limit, handle).await.ok();
        }

        let signal = match self.alarm_signal() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "SIGALRM unavailable, using a timer");
                return tokio::time::timeout(limit, handle).await.ok();
            }
        };

        // A previous alarm may have fired just as its target finished.
        let _ = tokio::time::timeout(Duration::ZERO, signal.recv()).await;

        alarm::set(whole_seconds(limit));
        let joined = tokio::select! {
            joined = handle => Some(joined),
            _ = signal.recv() => None,
        };
        alarm::cancel();
        joined
    }

    fn alarm_signal(&mut self) -> std::io::Result<&mut Signal> {
        if self.alarm.is_none() {
            self.alarm = Some(signal(SignalKind::alarm())?);
        }
        self.alarm
            .as_mut()
            .ok_or_else(|| std::io::Error::other("alarm handler missing"))
    }
}

fn run_target(registry: &Registry, job: &Job, memory_limit: Option<u64>) -> Finished {
    let _guard = memory_limit.and_then(|bytes| match MemoryGuard::install(bytes) {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(job_id = %job.id(), error = %e, "Memory limit not applied");
            None
        }
    });
    let mut exec = Execution::new(job.context());
    let caught = panic::catch_unwind(AssertUnwindSafe(|| job.invoke(registry, &mut exec)));
    (caught, exec)
}

/// Caps the address space at current usage plus a job's allowance and
/// restores the previous limits on drop.
struct MemoryGuard {
    soft: u64,
    hard: u64,
}

impl MemoryGuard {
    fn install(extra: u64) -> Result<Self> {
        let (soft, hard) = getrlimit(Resource::RLIMIT_AS)
            .map_err(|e| BuckError::Worker(format!("getrlimit: {}", e)))?;
        let limit = address_space_bytes()?.saturating_add(extra).min(hard);
        setrlimit(Resource::RLIMIT_AS, limit, hard)
            .map_err(|e| BuckError::Worker(format!("setrlimit: {}", e)))?;
        Ok(Self { soft, hard })
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        if let Err(e) = setrlimit(Resource::RLIMIT_AS, self.soft, self.hard) {
            tracing::error!(error = %e, "Failed to restore address space limit");
        }
    }
}

/// Current virtual memory size of this process.
fn address_space_bytes() -> Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmSize:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kib| kib * 1024)
        .ok_or_else(|| BuckError::Worker("VmSize missing from /proc/self/status".to_string()))
}

fn peak_rss_kib() -> i64 {
    getrusage(UsageWho::RUSAGE_SELF)
        .map(|usage| usage.max_rss() as i64)
        .unwrap_or(0)
}

fn whole_seconds(limit: Duration) -> u32 {
    limit.as_secs_f64().ceil().clamp(1.0, u32::MAX as f64) as u32
}

fn task_failure(e: JoinError) -> String {
    if e.is_panic() {
        format!("panicked: {}", panic_message(&*e.into_panic()))
    } else {
        format!("target task failed: {}", e)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
