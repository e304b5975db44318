use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tokio_stream::{StreamExt, StreamMap};

use crate::config::{ReapPolicy, SupervisorConfig, WorkerCommand};
use crate::error::Result;
use crate::scheduler::assigner::JobAssigner;
use crate::scheduler::{Job, JobResult};
use crate::transport::{Envelope, EnvelopeCodec};
use crate::worker::process::{describe_exit, PipeEvent, PipeStream, WorkerProcess};

/// A worker slot that was reaped.
#[derive(Debug)]
pub struct Reaped {
    pub slot: usize,
    pub pid: u32,
    /// Result for the job the worker was running, if any: the worker's own
    /// when it got one out before exiting, otherwise synthesised from the
    /// exit status.
    pub lost: Option<JobResult>,
}

/// What one poll of the pool produced.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub results: Vec<JobResult>,
    pub reaped: Vec<Reaped>,
}

/// Fixed-size pool of worker processes owned by one supervisor.
///
/// Every slot holds a live process. Slot states live in a [`JobAssigner`];
/// the stdout and stderr of every worker are multiplexed through a single
/// `StreamMap` keyed by slot.
pub struct WorkerPool {
    command: WorkerCommand,
    signature: Option<String>,
    codec: EnvelopeCodec,
    workers: Vec<WorkerProcess>,
    assigner: JobAssigner,
    pipes: StreamMap<usize, PipeStream>,
    /// Busy slots to restart once their current job reports back.
    retiring: HashSet<usize>,
    reap: ReapPolicy,
    send_timeout: Duration,
    grace: Duration,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pids", &self.pids())
            .field("assigner", &self.assigner)
            .field("retiring", &self.retiring)
            .field("reap", &self.reap)
            .finish()
    }
}

impl WorkerPool {
    pub fn spawn(config: &SupervisorConfig, signature: Option<String>) -> Result<Self> {
        let codec = EnvelopeCodec::new(config.max_message_size);
        let mut workers = Vec::with_capacity(config.pool_size);
        let mut pipes = StreamMap::new();
        for slot in 0..config.pool_size {
            let (worker, stream) = WorkerProcess::spawn(&config.worker, signature.as_deref(), codec.clone())?;
            pipes.insert(slot, stream);
            workers.push(worker);
        }

        tracing::info!(size = config.pool_size, "Worker pool started");

        Ok(Self {
            command: config.worker.clone(),
            signature,
            codec,
            workers,
            assigner: JobAssigner::new(config.pool_size),
            pipes,
            retiring: HashSet::new(),
            reap: config.reap,
            send_timeout: config.send_timeout,
            grace: config.shutdown_grace,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn busy_count(&self) -> usize {
        self.assigner.busy_count()
    }

    pub fn has_busy(&self) -> bool {
        self.busy_count() > 0
    }

    pub fn has_ready(&self) -> bool {
        self.assigner.has_ready()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().map(WorkerProcess::pid).collect()
    }

    pub fn in_flight(&self, slot: usize) -> Option<&Job> {
        self.assigner.in_flight(slot)
    }

    /// Signature handed to workers launched from now on.
    pub fn set_signature(&mut self, signature: String) {
        self.signature = Some(signature);
    }

    /// Hand `job` to the first ready worker and return its slot. Gives the
    /// job back when no worker can take it.
    pub async fn delegate(&mut self, job: Job) -> std::result::Result<usize, Job> {
        for slot in self.assigner.ready_slots() {
            if self.reap == ReapPolicy::Lazy && !self.workers[slot].is_alive() {
                self.reap_slot(slot).await;
            }
            match self.workers[slot].send(&job, self.send_timeout).await {
                Ok(()) => {
                    self.assigner.assign(slot, job);
                    return Ok(slot);
                }
                Err(e) => {
                    tracing::warn!(slot, job_id = %job.id(), error = %e, "Delegation failed");
                    self.reap_slot(slot).await;
                }
            }
        }
        Err(job)
    }

    /// Collect results. Waits up to `timeout` for the first event only when
    /// some worker is busy, then drains whatever else is ready.
    pub async fn poll(&mut self, timeout: Duration) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let wait = if self.has_busy() { timeout } else { Duration::ZERO };
        let mut deadline = Instant::now() + wait;

        loop {
            let (slot, event) = match tokio::time::timeout_at(deadline, self.pipes.next()).await {
                Ok(Some(item)) => item,
                Ok(None) | Err(_) => break,
            };
            self.handle_event(slot, event, &mut outcome).await;
            deadline = Instant::now();
        }

        outcome
    }

    async fn handle_event(&mut self, slot: usize, event: PipeEvent, outcome: &mut PollOutcome) {
        match event {
            PipeEvent::Frame(Ok(Envelope::Result(result))) => {
                let Some(job) = self.assigner.release(slot) else {
                    tracing::warn!(slot, job_id = %result.job.id(), "Result from idle worker");
                    return;
                };
                if job.id() != result.job.id() {
                    tracing::warn!(slot, expected = %job.id(), got = %result.job.id(), "Result for unexpected job");
                }
                let interrupted = result.interrupted();
                outcome.results.push(*result);
                if self.retiring.remove(&slot) || interrupted {
                    self.restart(slot).await;
                }
            }
            PipeEvent::Frame(Ok(Envelope::Job(job))) => {
                tracing::warn!(slot, job_id = %job.id(), "Worker wrote a job frame");
            }
            PipeEvent::Frame(Err(e)) => {
                tracing::warn!(slot, error = %e, "Unreadable worker frame");
            }
            PipeEvent::Diagnostic(line) => {
                tracing::debug!(slot, pid = self.workers[slot].pid(), "{}", line);
            }
            PipeEvent::Closed => {
                let reaped = self.reap_slot(slot).await;
                outcome.reaped.push(reaped);
            }
        }
    }

    /// Reap every worker that has exited.
    pub async fn reap_dead(&mut self) -> Vec<Reaped> {
        let mut reaped = Vec::new();
        for slot in 0..self.workers.len() {
            if !self.workers[slot].is_alive() {
                reaped.push(self.reap_slot(slot).await);
            }
        }
        reaped
    }

    /// Reap when the policy checks liveness on every tick.
    pub async fn reap_eagerly(&mut self) -> Vec<Reaped> {
        match self.reap {
            ReapPolicy::Eager => self.reap_dead().await,
            ReapPolicy::Lazy => Vec::new(),
        }
    }

    /// Kill the worker in `slot`, fail its in-flight job and start a
    /// replacement.
    async fn reap_slot(&mut self, slot: usize) -> Reaped {
        let pid = self.workers[slot].pid();
        let status = self.workers[slot].kill(self.grace).await;
        let reported = match self.pipes.remove(&slot) {
            Some(stream) => self.drain(slot, pid, stream).await,
            None => None,
        };
        self.retiring.remove(&slot);

        let lost = self.assigner.release(slot).map(|job| match reported {
            Some(result) if result.job.id() == job.id() => result,
            _ => {
                let reason = describe_exit(status);
                tracing::warn!(slot, pid, job_id = %job.id(), reason = %reason, "Worker died with a job in flight");
                JobResult::failure(pid, job, reason)
            }
        });

        tracing::info!(slot, pid, "Worker reaped");
        self.replace(slot);
        Reaped { slot, pid, lost }
    }

    /// Read whatever a dead worker left in its pipes and return the last
    /// result it wrote.
    async fn drain(&self, slot: usize, pid: u32, mut stream: PipeStream) -> Option<JobResult> {
        let deadline = Instant::now() + self.grace;
        let mut last = None;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, stream.next()).await {
            match event {
                PipeEvent::Frame(Ok(Envelope::Result(result))) => last = Some(*result),
                PipeEvent::Diagnostic(line) => tracing::debug!(slot, pid, "{}", line),
                PipeEvent::Frame(_) | PipeEvent::Closed => {}
            }
        }
        last
    }

    fn replace(&mut self, slot: usize) {
        match WorkerProcess::spawn(&self.command, self.signature.as_deref(), self.codec.clone()) {
            Ok((worker, stream)) => {
                self.workers[slot] = worker;
                self.pipes.insert(slot, stream);
            }
            Err(e) => {
                // The dead handle stays in place and is retried on the next reap.
                tracing::error!(slot, error = %e, "Could not replace worker");
            }
        }
    }

    async fn restart(&mut self, slot: usize) {
        let pid = self.workers[slot].pid();
        self.workers[slot].shutdown(0, self.grace).await;
        self.pipes.remove(&slot);
        self.replace(slot);
        tracing::debug!(slot, old_pid = pid, new_pid = self.workers[slot].pid(), "Worker restarted");
    }

    /// Send a notice to every worker. Returns how many received it.
    pub async fn broadcast(&mut self, notice: &Job) -> usize {
        let mut delivered = 0;
        for (slot, worker) in self.workers.iter_mut().enumerate() {
            match worker.send(notice, self.send_timeout).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(slot, error = %e, "Notice not delivered"),
            }
        }
        delivered
    }

    /// Restart idle workers now and busy ones after their current job.
    /// Returns the number restarted immediately.
    pub async fn refresh(&mut self) -> usize {
        let mut restarted = 0;
        for slot in 0..self.workers.len() {
            if self.assigner.in_flight(slot).is_some() {
                self.retiring.insert(slot);
            } else {
                self.restart(slot).await;
                restarted += 1;
            }
        }
        tracing::info!(restarted, retiring = self.retiring.len(), "Worker pool refreshed");
        restarted
    }

    /// Stop every worker, giving each the grace period to exit on its own.
    pub async fn shutdown(&mut self) {
        for (slot, worker) in self.workers.iter_mut().enumerate() {
            let status = worker.shutdown(0, self.grace).await;
            tracing::debug!(slot, pid = worker.pid(), status = ?status, "Worker stopped");
        }
        self.pipes.clear();
        self.retiring.clear();
        tracing::info!(size = self.workers.len(), "Worker pool stopped");
    }
}
