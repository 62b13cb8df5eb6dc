//! Reference slot table.
//!
//! The hardware has a small fixed set of reference-buffer identities. Each
//! slot holds the reference frame a job may read, plus at most one refresh
//! reserved by an in-flight job. A refresh becomes visible only when its job
//! completes; a failed job leaves the committed contents as they were.
//!
//! Rules enforced here:
//! - A slot is readable only once a completed job refreshed it, and not while
//!   a refresh of it is in flight.
//! - A slot has at most one in-flight writer, and is not refreshed while
//!   in-flight jobs still read it.

mod entry;

pub use entry::{MarkingState, PendingRefresh, SlotEntry, SlotState};

use tracing::debug;

use crate::encoder::dispatch::JobHandle;
use crate::encoder::resources::BufferId;
use crate::encoder::{SlotId, SlotSet};
use crate::error::{Result, VpuError};

/// Fixed-size table of reference slots.
#[derive(Debug, Clone)]
pub struct ReferenceSlots {
    entries: Vec<SlotEntry>,
}

impl ReferenceSlots {
    /// Create a table of `count` empty slots.
    pub fn new(count: usize) -> Self {
        Self {
            entries: (0..count).map(|_| SlotEntry::new()).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Committed contents of a slot.
    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.entries.get(slot as usize).map(|e| e.committed)
    }

    /// Pending refresh of a slot.
    pub fn writer(&self, slot: SlotId) -> Option<PendingRefresh> {
        self.entries.get(slot as usize).and_then(|e| e.writer)
    }

    fn entry(&self, slot: SlotId) -> Result<&SlotEntry> {
        self.entries
            .get(slot as usize)
            .ok_or_else(|| VpuError::InvalidInput(format!("no reference slot {slot}")))
    }

    /// Check that every slot in `reads` may be read now.
    pub fn check_reads(&self, reads: SlotSet) -> Result<()> {
        for slot in reads.iter() {
            let entry = self.entry(slot)?;
            if !entry.committed.valid {
                return Err(VpuError::ReferenceNotReady { slot });
            }
            if entry.writer.is_some() {
                return Err(VpuError::SlotBusy { slot });
            }
        }
        Ok(())
    }

    /// Check that every slot in `refresh` may be reserved now.
    pub fn check_refresh(&self, refresh: SlotSet) -> Result<()> {
        for slot in refresh.iter() {
            if !self.entry(slot)?.is_writable() {
                return Err(VpuError::SlotBusy { slot });
            }
        }
        Ok(())
    }

    /// The slots of `slots` that a completed job has refreshed.
    pub fn filled(&self, slots: SlotSet) -> SlotSet {
        let mut filled = SlotSet::EMPTY;
        for slot in slots.iter() {
            if self.entry(slot).is_ok_and(|e| e.committed.valid) {
                filled.insert(slot);
            }
        }
        filled
    }

    /// Register readers already checked with [`ReferenceSlots::check_reads`].
    ///
    /// A job may refresh a slot it reads: it reads the committed frame and
    /// writes a new one, so its own pending refresh does not block the read.
    pub fn track_reads(&mut self, reads: SlotSet) {
        for slot in reads.iter() {
            if let Some(entry) = self.entries.get_mut(slot as usize) {
                entry.readers += 1;
            }
        }
    }

    /// Drop an in-flight reader of `reads`.
    pub fn release_reads(&mut self, reads: SlotSet) {
        for slot in reads.iter() {
            if let Some(entry) = self.entries.get_mut(slot as usize) {
                entry.readers = entry.readers.saturating_sub(1);
            }
        }
    }

    /// Reserve `refresh` for `job`, all slots or none.
    ///
    /// Slots in `long_term` are marked long-term once committed.
    pub fn reserve(
        &mut self,
        refresh: SlotSet,
        long_term: SlotSet,
        job: JobHandle,
        picture_order: u64,
        target: BufferId,
    ) -> Result<()> {
        self.check_refresh(refresh)?;
        for slot in refresh.iter() {
            let marking = if long_term.contains(slot) {
                MarkingState::LongTerm
            } else {
                MarkingState::ShortTerm
            };
            self.entries[slot as usize].writer = Some(PendingRefresh {
                job,
                picture_order,
                target,
                marking,
            });
        }
        Ok(())
    }

    /// Commit every refresh reserved by `job`.
    ///
    /// Returns the refreshed slots and the reference frames no longer held by
    /// any slot or pending refresh.
    pub fn commit(&mut self, job: JobHandle) -> (SlotSet, Vec<BufferId>) {
        let mut refreshed = SlotSet::EMPTY;
        let mut replaced = Vec::new();
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            if let Some(previous) = entry.commit(job) {
                refreshed.insert(slot as SlotId);
                if let Some(buffer) = previous {
                    if !replaced.contains(&buffer) {
                        replaced.push(buffer);
                    }
                }
            }
        }
        if !refreshed.is_empty() {
            debug!("Committed refresh of slots {:?} by job {}", refreshed, job.0);
        }
        let freed = replaced
            .into_iter()
            .filter(|b| !self.is_referenced(*b))
            .collect();
        (refreshed, freed)
    }

    /// Drop every refresh reserved by `job`.
    ///
    /// Returns the slots that were reserved and the target frame if nothing
    /// else holds it.
    pub fn rollback(&mut self, job: JobHandle) -> (SlotSet, Option<BufferId>) {
        let mut reserved = SlotSet::EMPTY;
        let mut target = None;
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            if let Some(buffer) = entry.rollback(job) {
                reserved.insert(slot as SlotId);
                target = Some(buffer);
            }
        }
        if !reserved.is_empty() {
            debug!("Rolled back refresh of slots {:?} by job {}", reserved, job.0);
        }
        (reserved, target.filter(|b| !self.is_referenced(*b)))
    }

    fn is_referenced(&self, buffer: BufferId) -> bool {
        self.entries.iter().any(|e| {
            e.committed.buffer == Some(buffer) || e.writer.map(|w| w.target) == Some(buffer)
        })
    }

    /// Empty every slot, returning the reference frames they held.
    pub fn clear(&mut self) -> Vec<BufferId> {
        let mut buffers = Vec::new();
        for entry in &mut self.entries {
            let held = entry
                .committed
                .buffer
                .into_iter()
                .chain(entry.writer.map(|w| w.target));
            for buffer in held {
                if !buffers.contains(&buffer) {
                    buffers.push(buffer);
                }
            }
            entry.reset();
        }
        buffers
    }
}
