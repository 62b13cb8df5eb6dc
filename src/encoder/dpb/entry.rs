//! Per-slot records of the reference slot table.

use crate::encoder::dispatch::JobHandle;
use crate::encoder::resources::BufferId;

/// Reference marking state for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingState {
    /// Unused for reference.
    #[default]
    Unused,
    /// Used for short-term reference.
    ShortTerm,
    /// Used for long-term reference.
    LongTerm,
}

/// Committed contents of a slot, as seen by jobs that read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotState {
    /// Whether a completed job has refreshed this slot.
    pub valid: bool,
    /// Incremented by every completed refresh.
    pub version: u64,
    /// Picture order of the picture the slot holds.
    pub content: Option<u64>,
    /// Reference frame holding the reconstruction.
    pub buffer: Option<BufferId>,
    pub marking: MarkingState,
}

/// A refresh reserved by an in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRefresh {
    pub job: JobHandle,
    pub picture_order: u64,
    /// Reference frame the job writes.
    pub target: BufferId,
    pub marking: MarkingState,
}

/// One reference slot.
#[derive(Debug, Clone, Default)]
pub struct SlotEntry {
    pub committed: SlotState,
    /// Refresh in flight, at most one.
    pub writer: Option<PendingRefresh>,
    /// In-flight jobs reading the committed contents.
    pub readers: u32,
}

impl SlotEntry {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset this slot to empty state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether a job may refresh this slot now.
    pub fn is_writable(&self) -> bool {
        self.writer.is_none() && self.readers == 0
    }

    /// Promote the pending refresh of `job`. Returns the replaced buffer.
    pub fn commit(&mut self, job: JobHandle) -> Option<Option<BufferId>> {
        let pending = self.writer.filter(|w| w.job == job)?;
        self.writer = None;
        let previous = self.committed.buffer;
        self.committed = SlotState {
            valid: true,
            version: self.committed.version + 1,
            content: Some(pending.picture_order),
            buffer: Some(pending.target),
            marking: pending.marking,
        };
        Some(previous)
    }

    /// Drop the pending refresh of `job`, leaving the committed state untouched.
    pub fn rollback(&mut self, job: JobHandle) -> Option<BufferId> {
        let pending = self.writer.filter(|w| w.job == job)?;
        self.writer = None;
        Some(pending.target)
    }
}
