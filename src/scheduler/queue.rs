use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::scheduler::job::{BuckId, Job};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting in the priority queue.
    Enqueued,
    /// Handed to a worker, waiting for its result.
    Delegated,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Enqueued => write!(f, "enqueued"),
            JobState::Delegated => write!(f, "delegated"),
        }
    }
}

/// Outcome of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// A job with the same identity is already tracked; the new one was dropped.
    Duplicate,
    /// The queue is at capacity; the job was dropped.
    Full,
}

/// A job popped from the queue, keeping its insertion sequence so a requeue
/// restores its original position among equal priorities.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub seq: u64,
    pub job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then lower sequence (FIFO on ties).
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority()
            .cmp(&other.job.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Stable priority queue plus the identity tracking map that enforces at
/// most one in-flight job per identity.
#[derive(Debug)]
pub struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
    tracked: HashMap<BuckId, JobState>,
    next_seq: u64,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            tracked: HashMap::new(),
            next_seq: 0,
            max_jobs,
        }
    }

    /// Track and queue a job unless its identity is already tracked.
    pub fn enqueue(&mut self, job: Job) -> Enqueued {
        if self.tracked.contains_key(job.id()) {
            return Enqueued::Duplicate;
        }
        if self.tracked.len() >= self.max_jobs {
            return Enqueued::Full;
        }
        self.tracked.insert(job.id().clone(), JobState::Enqueued);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob { seq, job });
        Enqueued::Queued
    }

    /// Pop the most urgent job. It stays tracked as enqueued until it is
    /// delegated, requeued or untracked.
    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.heap.pop()
    }

    /// Put a popped job back at its original position.
    pub fn requeue(&mut self, queued: QueuedJob) {
        self.tracked
            .insert(queued.job.id().clone(), JobState::Enqueued);
        self.heap.push(queued);
    }

    pub fn peek(&self) -> Option<&Job> {
        self.heap.peek().map(|q| &q.job)
    }

    pub fn mark_delegated(&mut self, id: &BuckId) -> bool {
        match self.tracked.get_mut(id) {
            Some(state) => {
                *state = JobState::Delegated;
                true
            }
            None => false,
        }
    }

    /// Forget a job, returning the state it was in.
    pub fn untrack(&mut self, id: &BuckId) -> Option<JobState> {
        self.tracked.remove(id)
    }

    pub fn state(&self, id: &BuckId) -> Option<JobState> {
        self.tracked.get(id).copied()
    }

    pub fn is_tracked(&self, id: &BuckId) -> bool {
        self.tracked.contains_key(id)
    }

    /// Number of jobs waiting in the queue.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of tracked jobs, queued or delegated.
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn delegated_len(&self) -> usize {
        self.tracked
            .values()
            .filter(|s| **s == JobState::Delegated)
            .count()
    }
}
