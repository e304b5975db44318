//! The supervisor ("desk") control loop.
//!
//! One [`Supervisor::tick`] does, in order:
//! 1. receive at most one job from the inbound socket and enqueue it
//! 2. drain the priority queue: handle notices, reroute foreign jobs,
//!    delegate owned jobs to ready workers
//! 3. collect results from worker pipes and reap dead workers
//!
//! Everything runs on the caller's task; parallelism comes only from the
//! worker processes.

pub mod ownership;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{BuckError, Result};
use crate::routing::client::{Client, Signature};
use crate::scheduler::queue::QueuedJob;
use crate::scheduler::{BuckId, Enqueued, Job, JobQueue, JobResult, Notice};
use crate::telemetry::{LogSink, TracingSink};
use crate::transport::{Envelope, Socket, SocketOptions};
use crate::worker::pool::{Reaped, WorkerPool};

pub use ownership::{OwnedBy, Ownership, OwnershipCache};

const COMPONENT: &str = "desk";

/// What [`Supervisor::process_buck`] did with the job it popped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delegated { job: BuckId, slot: usize },
    Rerouted { job: BuckId, desk: String },
    /// A notice handled by the supervisor itself.
    Handled { notice: &'static str },
    /// Put back in the queue; nothing more can be dispatched this tick.
    Deferred { job: BuckId },
}

pub struct Supervisor {
    id: Uuid,
    config: SupervisorConfig,
    socket: Option<Socket>,
    client: Option<Client>,
    queue: JobQueue,
    pool: WorkerPool,
    ownership: OwnershipCache,
    sink: Arc<dyn LogSink>,
    stop: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("client", &self.client)
            .field("queue", &self.queue.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Supervisor {
    /// Listen on the configured address and start the worker pool.
    pub async fn bind(mut config: SupervisorConfig) -> Result<Self> {
        let options = SocketOptions::default().with_max_message_size(config.max_message_size);
        let socket = Socket::listen(&config.host, config.port, options).await?;
        config.port = socket.port();
        Self::build(config, Some(socket))
    }

    /// Supervisor with no inbound socket. Jobs arrive only through
    /// [`Supervisor::enqueue`] and every job is owned.
    pub fn standalone(config: SupervisorConfig) -> Result<Self> {
        Self::build(config, None)
    }

    fn build(config: SupervisorConfig, socket: Option<Socket>) -> Result<Self> {
        let pool = WorkerPool::spawn(&config, None)?;
        let id = Uuid::new_v4();
        tracing::info!(
            desk_id = %id,
            port = ?socket.as_ref().map(Socket::port),
            workers = config.pool_size,
            "Supervisor started"
        );
        Ok(Self {
            id,
            config,
            socket,
            client: None,
            queue: JobQueue::new(),
            pool,
            ownership: OwnershipCache::new(),
            sink: Arc::new(TracingSink),
            stop: CancellationToken::new(),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Bound port, `None` when standalone.
    pub fn local_port(&self) -> Option<u16> {
        self.socket.as_ref().map(Socket::port)
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    /// Signature of the routing table in use.
    pub fn signature(&self) -> Option<String> {
        self.client
            .as_ref()
            .and_then(Client::current_signature)
            .map(Signature::to_string)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Token that ends [`Supervisor::start`] when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn record(&self, event: &str, payload: Value) {
        self.sink.record(COMPONENT, &self.id.to_string(), event, payload);
    }

    /// Use `client` for routing and hand its signature to every worker.
    pub async fn set_client(&mut self, client: Client) {
        let mut client = client
            .with_send_timeout(self.config.send_timeout)
            .with_max_message_size(self.config.max_message_size);
        let signature = client.signature();

        self.pool.set_signature(signature.clone());
        let notice = Job::notice(Notice::TopologyUpdate {
            signature: signature.clone(),
        });
        let delivered = self.pool.broadcast(&notice).await;
        tracing::debug!(desk_id = %self.id, workers = delivered, "Topology forwarded to workers");

        self.record("topology", json!({ "signature": signature }));
        self.client = Some(client);
    }

    /// Queue a job unless one with the same identity is already tracked.
    pub fn enqueue(&mut self, job: Job) -> Enqueued {
        let id = job.id().to_string();
        let priority = job.priority();
        let outcome = self.queue.enqueue(job);
        match outcome {
            Enqueued::Queued => self.record("enqueued", json!({ "job": id, "priority": priority })),
            Enqueued::Duplicate => self.record("duplicate", json!({ "job": id })),
            Enqueued::Full => {
                tracing::warn!(desk_id = %self.id, job_id = %id, "Queue full, job dropped");
                self.record("dropped", json!({ "job": id }));
            }
        }
        outcome
    }

    /// Pop the highest-priority job and dispatch it. Returns `None` when the
    /// queue is empty.
    pub async fn process_buck(&mut self) -> Option<Dispatch> {
        let queued = self.queue.pop()?;

        if let Some(notice) = queued.job.notice_ref().cloned() {
            self.queue.untrack(queued.job.id());
            return Some(self.handle_notice(notice).await);
        }

        let bound = self.socket.as_ref().map(|s| (s.host(), s.port()));
        let ownership = self
            .ownership
            .decide(&queued.job, self.client.as_ref(), bound, self.id)
            .await;

        match ownership {
            Ownership::Owned(_) => Some(self.delegate(queued).await),
            Ownership::Foreign(desk) => Some(self.reroute(queued, desk.endpoint()).await),
        }
    }

    async fn delegate(&mut self, queued: QueuedJob) -> Dispatch {
        let QueuedJob { seq, job } = queued;
        let id = job.id().clone();
        match self.pool.delegate(job).await {
            Ok(slot) => {
                self.queue.mark_delegated(&id);
                self.record("delegated", json!({ "job": id.as_str(), "slot": slot }));
                Dispatch::Delegated { job: id, slot }
            }
            Err(job) => {
                self.queue.requeue(QueuedJob { seq, job });
                Dispatch::Deferred { job: id }
            }
        }
    }

    async fn reroute(&mut self, queued: QueuedJob, desk: String) -> Dispatch {
        let id = queued.job.id().clone();
        let stamped = queued.job.rerouted_by(self.id);
        let sent = match self.client.as_mut() {
            Some(client) => client.send_buck(&stamped).await,
            None => Err(BuckError::UnreachableSupervisor(0)),
        };
        match sent {
            Ok(()) => {
                self.queue.untrack(&id);
                self.record("rerouted", json!({ "job": id.as_str(), "desk": desk }));
                Dispatch::Rerouted { job: id, desk }
            }
            Err(e) => {
                tracing::warn!(desk_id = %self.id, job_id = %id, desk = %desk, error = %e, "Reroute failed, requeueing");
                self.queue.requeue(queued);
                self.record("requeued", json!({ "job": id.as_str(), "error": e.to_string() }));
                Dispatch::Deferred { job: id }
            }
        }
    }

    async fn handle_notice(&mut self, notice: Notice) -> Dispatch {
        let kind = notice.kind();
        match notice {
            Notice::TopologyUpdate { signature } => self.adopt_topology(&signature).await,
            Notice::DrawerRefresh => {
                let restarted = self.pool.refresh().await;
                self.record("drawer_refresh", json!({ "restarted": restarted }));
            }
            Notice::WorkerShutdown { .. } => {
                self.record("notice_ignored", json!({ "notice": kind }));
            }
            other => {
                debug_assert!(other.is_reserved());
                self.record("notice_ignored", json!({ "notice": kind }));
            }
        }
        Dispatch::Handled { notice: kind }
    }

    async fn adopt_topology(&mut self, signature: &str) {
        let incoming: Signature = match signature.parse() {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!(desk_id = %self.id, error = %e, "Bad topology notice");
                return;
            }
        };
        let current = self.client.as_ref().and_then(Client::current_signature);
        if let Some(current) = current {
            if !incoming.is_newer_than(current) {
                self.record(
                    "topology_stale",
                    json!({ "incoming": incoming.timestamp(), "current": current.timestamp() }),
                );
                return;
            }
        }
        match Client::from_signature(signature) {
            Ok(client) => self.set_client(client).await,
            Err(e) => tracing::warn!(desk_id = %self.id, error = %e, "Bad topology notice"),
        }
    }

    async fn receive(&mut self, timeout: Duration) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        match socket.receive(timeout).await {
            Ok(Some(Envelope::Job(job))) => {
                self.enqueue(job);
            }
            Ok(Some(Envelope::Result(result))) => {
                tracing::warn!(desk_id = %self.id, job_id = %result.job.id(), "Result received over the network, ignoring");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(desk_id = %self.id, error = %e, "Receive failed");
            }
        }
    }

    fn account_reaped(&mut self, reaped: Reaped, results: &mut Vec<JobResult>) {
        let lost = reaped.lost.as_ref().map(|r| r.job.id().to_string());
        self.record(
            "reaped",
            json!({ "slot": reaped.slot, "pid": reaped.pid, "lost": lost }),
        );
        if let Some(result) = reaped.lost {
            self.queue.untrack(result.job.id());
            results.push(result);
        }
    }

    /// One pass of receive, dispatch and collect. Waits at most `timeout`
    /// for input when idle and for results when any worker is busy.
    pub async fn tick(&mut self, timeout: Duration) -> Vec<JobResult> {
        let mut results = Vec::new();

        for reaped in self.pool.reap_eagerly().await {
            self.account_reaped(reaped, &mut results);
        }

        let wait = if self.pool.has_busy() { Duration::ZERO } else { timeout };
        self.receive(wait).await;

        while let Some(dispatch) = self.process_buck().await {
            if matches!(dispatch, Dispatch::Deferred { .. }) {
                break;
            }
        }

        let outcome = self.pool.poll(timeout).await;
        for reaped in outcome.reaped {
            self.account_reaped(reaped, &mut results);
        }
        for result in outcome.results {
            self.queue.untrack(result.job.id());
            self.record(
                "result",
                json!({
                    "job": result.job.id().as_str(),
                    "success": result.success,
                    "pid": result.pid,
                    "elapsed_ms": result.elapsed.as_millis() as u64,
                }),
            );
            results.push(result);
        }

        results
    }

    /// Tick until stopped, passing every result to `handler`, then shut the
    /// workers down.
    pub async fn start<F>(&mut self, mut handler: F)
    where
        F: FnMut(JobResult, &CancellationToken),
    {
        let timeout = self.config.tick_timeout;
        while !self.stop.is_cancelled() {
            for result in self.tick(timeout).await {
                handler(result, &self.stop);
            }
        }
        self.shutdown().await;
    }

    /// Tick until `count` results have arrived or `limit` elapses.
    pub async fn run_until(&mut self, count: usize, limit: Duration) -> Vec<JobResult> {
        let deadline = tokio::time::Instant::now() + limit;
        let mut results = Vec::new();
        while results.len() < count && tokio::time::Instant::now() < deadline {
            results.extend(self.tick(self.config.tick_timeout).await);
        }
        results
    }

    pub async fn shutdown(&mut self) {
        tracing::info!(desk_id = %self.id, "Supervisor stopping");
        self.pool.shutdown().await;
    }
}
