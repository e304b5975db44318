use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::WorkerCommand;
use crate::error::{BuckError, Result};
use crate::scheduler::{Job, Notice};
use crate::transport::{Envelope, EnvelopeCodec};

/// Something read from a worker's output pipes.
#[derive(Debug)]
pub enum PipeEvent {
    /// A frame from stdout.
    Frame(Result<Envelope>),
    /// A line the worker logged to stderr.
    Diagnostic(String),
    /// Stdout reached end of file; the worker is gone or going.
    Closed,
}

pub type PipeStream = Pin<Box<dyn Stream<Item = PipeEvent> + Send>>;

/// Supervisor-side handle to one worker process.
///
/// The child is killed if the handle is dropped.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    codec: EnvelopeCodec,
}

impl WorkerProcess {
    /// Launch a worker and return it together with its merged output pipes.
    pub fn spawn(
        command: &WorkerCommand,
        signature: Option<&str>,
        codec: EnvelopeCodec,
    ) -> Result<(Self, PipeStream)> {
        let mut child = Command::new(&command.program)
            .args(command.argv(signature))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BuckError::Worker(format!("failed to launch {}: {}", command.program.display(), e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| BuckError::Worker("worker exited during launch".to_string()))?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BuckError::Worker("worker stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BuckError::Worker("worker stderr not piped".to_string()))?;

        let frames = FramedRead::new(stdout, codec.clone())
            .map(PipeEvent::Frame)
            .chain(tokio_stream::once(PipeEvent::Closed));
        let diagnostics = FramedRead::new(stderr, LinesCodec::new_with_max_length(codec.max_message_size()))
            .filter_map(|line| line.ok().map(PipeEvent::Diagnostic));
        let pipes: PipeStream = Box::pin(frames.merge(diagnostics));

        tracing::debug!(pid, program = %command.program.display(), "Worker spawned");

        Ok((
            Self {
                child,
                pid,
                stdin,
                codec,
            },
            pipes,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write one job frame to the worker's stdin within `timeout`.
    pub async fn send(&mut self, job: &Job, timeout: Duration) -> Result<()> {
        let frame = self.codec.frame(&Envelope::Job(job.clone()))?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BuckError::Worker(format!("worker {} stdin closed", self.pid)))?;

        let write = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BuckError::Worker(format!("write to worker {} failed: {}", self.pid, e))),
            Err(_) => Err(BuckError::DeliveryFailure {
                target: format!("worker {}", self.pid),
                written: 0,
                expected: frame.len(),
            }),
        }
    }

    /// Exit status if the process has exited.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Could not poll worker");
                None
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Kill the process and collect its exit status.
    pub async fn kill(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.stdin.take();
        if let Some(status) = self.try_wait() {
            return Some(status);
        }
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid = self.pid, error = %e, "Kill failed");
        }
        tokio::time::timeout(grace, self.child.wait()).await.ok()?.ok()
    }

    /// Ask the worker to exit with `exit_code`, killing it if it has not
    /// exited within `grace`.
    pub async fn shutdown(&mut self, exit_code: i32, grace: Duration) -> Option<ExitStatus> {
        let notice = Job::notice(Notice::WorkerShutdown { exit_code });
        if let Err(e) = self.send(&notice, grace).await {
            tracing::debug!(pid = self.pid, error = %e, "Shutdown notice not delivered");
        } else if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            self.stdin.take();
            return Some(status);
        }
        tracing::warn!(pid = self.pid, "Worker ignored shutdown, killing");
        self.kill(grace).await
    }
}

/// Human-readable form of how a worker ended.
pub fn describe_exit(status: Option<ExitStatus>) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status {
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("worker exited with status {}", code),
            (None, Some(signal)) => format!("worker killed by signal {}", signal),
            _ => format!("worker exited: {}", status),
        },
        None => "worker exited".to_string(),
    }
}
