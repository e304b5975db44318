use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Stdin, Stdout};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::{BuckError, Result};
use crate::routing::client::{Client, Signature};
use crate::scheduler::{BuckId, Job, JobResult, Notice};
use crate::transport::{Envelope, EnvelopeCodec};
use crate::worker::executor::{JobExecutor, Outcome};

/// Exit status of a worker whose job was interrupted by its time limit.
/// The target may still be running, so the process is not reused.
pub const INTERRUPTED_EXIT: i32 = 75;

/// Poll loop of a worker process.
///
/// Reads one job frame at a time from its input, executes it and writes
/// exactly one result frame back. Notices are handled in place and never
/// answered.
pub struct WorkerLoop<R, W> {
    reader: FramedRead<R, EnvelopeCodec>,
    writer: W,
    codec: EnvelopeCodec,
    executor: JobExecutor,
    /// Used to submit child jobs.
    client: Option<Client>,
    in_flight: Option<Job>,
    executed: u64,
}

impl WorkerLoop<Stdin, Stdout> {
    /// Loop over the process's own stdin and stdout.
    pub fn stdio(executor: JobExecutor, codec: EnvelopeCodec) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), executor, codec)
    }
}

impl<R, W> WorkerLoop<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, executor: JobExecutor, codec: EnvelopeCodec) -> Self {
        Self {
            reader: FramedRead::new(reader, codec.clone()),
            writer,
            codec,
            executor,
            client: None,
            in_flight: None,
            executed: 0,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Routing table used for child jobs, if any.
    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    /// Number of jobs executed so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Run until a shutdown notice or end of input, returning the exit code.
    /// A job interrupted by its time limit ends the loop with
    /// [`INTERRUPTED_EXIT`] once its result is written. A fatal error is
    /// reported as a failing result for the job in flight.
    pub async fn serve(mut self) -> i32 {
        match self.run().await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(error = %e, "Worker loop failed");
                if let Some(job) = self.in_flight.take() {
                    let result = JobResult::failure(std::process::id(), job, format!("worker failed: {}", e));
                    if let Err(e) = self.write_result(result).await {
                        tracing::error!(error = %e, "Could not report failure");
                    }
                }
                e.exit_code()
            }
        }
    }

    pub async fn run(&mut self) -> Result<i32> {
        tracing::debug!(pid = std::process::id(), "Worker polling");
        loop {
            let job = match self.reader.next().await {
                None => {
                    tracing::debug!("Input closed, exiting");
                    return Ok(0);
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(Envelope::Job(job))) => job,
                Some(Ok(Envelope::Result(result))) => {
                    tracing::warn!(job_id = %result.job.id(), "Ignoring result sent to worker");
                    continue;
                }
            };

            if let Some(notice) = job.notice_ref() {
                if let Some(code) = self.handle_notice(notice) {
                    return Ok(code);
                }
                continue;
            }

            self.in_flight = Some(job.clone());
            let Outcome { result, children } = self.executor.execute(job).await;
            let spawned = self.submit_children(children).await;
            let (pid, job) = (result.pid, result.job.clone());
            match self.write_result(result.with_spawned(spawned)).await {
                Err(BuckError::MessageTooLarge { size, limit }) => {
                    let reason = format!("result of {} bytes exceeds the {} byte limit", size, limit);
                    self.write_result(JobResult::failure(pid, job, reason)).await?;
                }
                other => other?,
            }
            self.in_flight = None;
            self.executed += 1;

            if self.executor.has_straggler() {
                tracing::warn!(exit_code = INTERRUPTED_EXIT, "Target outlived its time limit, exiting");
                return Ok(INTERRUPTED_EXIT);
            }
        }
    }

    fn handle_notice(&mut self, notice: &Notice) -> Option<i32> {
        match notice {
            Notice::WorkerShutdown { exit_code } => {
                tracing::debug!(exit_code, "Shutdown requested");
                Some(*exit_code)
            }
            Notice::TopologyUpdate { signature } => {
                self.adopt_topology(signature);
                None
            }
            other => {
                tracing::debug!(notice = other.kind(), "Ignoring notice");
                None
            }
        }
    }

    fn adopt_topology(&mut self, signature: &str) {
        let incoming: Signature = match signature.parse() {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring bad topology");
                return;
            }
        };
        let stale = self
            .client
            .as_ref()
            .and_then(Client::current_signature)
            .is_some_and(|current| !incoming.is_newer_than(current));
        if stale {
            return;
        }
        match Client::from_signature(signature) {
            Ok(client) => {
                tracing::debug!(timestamp = incoming.timestamp(), "Worker topology updated");
                self.client = Some(client);
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring bad topology"),
        }
    }

    async fn submit_children(&mut self, children: Vec<Job>) -> Vec<BuckId> {
        if children.is_empty() {
            return Vec::new();
        }
        let Some(client) = self.client.as_mut() else {
            tracing::warn!(count = children.len(), "No routing table, child jobs dropped");
            return Vec::new();
        };

        let mut spawned = Vec::with_capacity(children.len());
        for child in children {
            match client.send_buck(&child).await {
                Ok(()) => spawned.push(child.id().clone()),
                Err(e) => {
                    tracing::warn!(job_id = %child.id(), error = %e, "Child job not submitted");
                }
            }
        }
        spawned
    }

    async fn write_result(&mut self, result: JobResult) -> Result<()> {
        let frame = self.codec.frame(&Envelope::Result(Box::new(result)))?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
