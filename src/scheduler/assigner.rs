use crate::scheduler::job::{BuckId, Job};

/// Slot state of one worker in a supervisor's pool.
#[derive(Debug, Clone)]
pub enum SlotState {
    Ready,
    Busy(Job),
}

impl SlotState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SlotState::Ready)
    }
}

/// Tracks which worker slots are free and which job each busy slot holds.
/// A slot never holds more than one job.
#[derive(Debug, Default)]
pub struct JobAssigner {
    slots: Vec<SlotState>,
}

impl JobAssigner {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![SlotState::Ready; size],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ready slots in index order.
    pub fn ready_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_ready())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_ready(&self) -> bool {
        self.slots.iter().any(SlotState::is_ready)
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_ready()).count()
    }

    /// Mark `slot` busy with `job`. Fails if the slot is missing or busy.
    pub fn assign(&mut self, slot: usize, job: Job) -> bool {
        match self.slots.get_mut(slot) {
            Some(state) if state.is_ready() => {
                tracing::debug!(slot, job_id = %job.id(), "Slot assigned");
                *state = SlotState::Busy(job);
                true
            }
            _ => false,
        }
    }

    /// Free `slot`, returning the job it held.
    pub fn release(&mut self, slot: usize) -> Option<Job> {
        let state = self.slots.get_mut(slot)?;
        match std::mem::replace(state, SlotState::Ready) {
            SlotState::Busy(job) => Some(job),
            SlotState::Ready => None,
        }
    }

    pub fn in_flight(&self, slot: usize) -> Option<&Job> {
        match self.slots.get(slot)? {
            SlotState::Busy(job) => Some(job),
            SlotState::Ready => None,
        }
    }

    /// Slot currently running the job with identity `id`.
    pub fn slot_of(&self, id: &BuckId) -> Option<usize> {
        self.slots.iter().position(|s| match s {
            SlotState::Busy(job) => job.id() == id,
            SlotState::Ready => false,
        })
    }
}
