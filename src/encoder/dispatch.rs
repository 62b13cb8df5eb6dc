//! Job dispatcher.
//!
//! Turns a planned picture into one job per tile partition, issues the jobs
//! to idle cores in the configured issue order and joins their completions.
//!
//! Invariants kept here:
//! - A core runs at most one encode job at a time.
//! - A reference slot has at most one in-flight writer (enforced by
//!   [`ReferenceSlots::reserve`](crate::encoder::dpb::ReferenceSlots::reserve)).
//! - A failed job leaves every slot it was about to refresh as it was before
//!   submission, and the picture is reported not-coded.
//!
//! Completed partitions and picture results are sent as
//! [`CompletionEvent`]s to the output assembler.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::encoder::rate::QpDecision;
use crate::encoder::regs::{JobDescriptor, JobKind, JobRegisters, SlotAddress};
use crate::encoder::resources::{output_buffer_size, BufferId, BufferKind, SharedResources};
use crate::encoder::{
    ColorFormat, Dimensions, JobStatus, LtrTag, Partition, PartitionKind, Picture,
    PictureCodingPlan, SlotId, SlotSet, MAX_REFERENCE_SLOTS,
};
use crate::error::{Result, VpuError};
use crate::hal::{ActivityStats, BusAddress, CoreId, Hal, HalError, HalJobHandle};

/// Handle of a submitted picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

/// Event sent to the output assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// One coded partition of a picture.
    Partition {
        encode_order: u64,
        index: usize,
        count: usize,
        partition: Partition,
    },
    /// Every partition of a picture has completed.
    Finished {
        encode_order: u64,
        status: JobStatus,
        refreshed: SlotSet,
        qp: u8,
    },
}

/// An admitted picture and its registered planes.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub picture: Picture,
    pub planes: Vec<BufferId>,
}

/// Joined result of a picture's jobs.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub plan: PictureCodingPlan,
    pub status: JobStatus,
    /// Coded size in bits, 0 when the picture failed.
    pub bits: u64,
    pub activity: ActivityStats,
    pub qp: u8,
    /// Slots whose refresh became visible.
    pub refreshed: SlotSet,
}

#[derive(Debug)]
struct PartitionJob {
    core: CoreId,
    hal: HalJobHandle,
    output: BufferId,
}

#[derive(Debug)]
struct InFlight {
    plan: PictureCodingPlan,
    qp: u8,
    reads: SlotSet,
    planes: Vec<BufferId>,
    partitions: Vec<PartitionJob>,
}

/// Block rows `(first, count)` of each of `partitions` tiles.
pub fn split_rows(rows: u32, partitions: usize) -> Vec<(u32, u32)> {
    let partitions = (partitions as u32).clamp(1, rows.max(1));
    let base = rows / partitions;
    let extra = rows % partitions;
    let mut first = 0;
    (0..partitions)
        .map(|i| {
            let count = base + u32::from(i < extra);
            let tile = (first, count);
            first += count;
            tile
        })
        .collect()
}

/// Submits picture jobs and joins their completions.
pub struct JobDispatcher {
    hal: Arc<dyn Hal>,
    resources: Arc<Mutex<SharedResources>>,
    issue_order: Vec<CoreId>,
    partitions: usize,
    timeout: Duration,
    dimensions: Dimensions,
    format: ColorFormat,
    ltr_slot: Option<SlotId>,
    events: Sender<CompletionEvent>,
    busy: HashSet<CoreId>,
    in_flight: BTreeMap<JobHandle, InFlight>,
    next_handle: u64,
}

impl JobDispatcher {
    /// Create a dispatcher issuing to `issue_order`, `partitions` tiles per
    /// picture.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hal: Arc<dyn Hal>,
        resources: Arc<Mutex<SharedResources>>,
        issue_order: Vec<CoreId>,
        partitions: usize,
        timeout: Duration,
        dimensions: Dimensions,
        format: ColorFormat,
        events: Sender<CompletionEvent>,
    ) -> Self {
        Self {
            hal,
            resources,
            partitions: partitions.clamp(1, issue_order.len().max(1)),
            issue_order,
            timeout,
            dimensions,
            format,
            ltr_slot: None,
            events,
            busy: HashSet::new(),
            in_flight: BTreeMap::new(),
            next_handle: 1,
        }
    }

    /// Slot marked long-term when a picture tagged [`LtrTag::Update`]
    /// refreshes it.
    #[must_use]
    pub fn with_ltr_slot(mut self, slot: Option<SlotId>) -> Self {
        self.set_ltr_slot(slot);
        self
    }

    pub fn set_ltr_slot(&mut self, slot: Option<SlotId>) {
        self.ltr_slot = slot;
    }

    /// Pictures submitted and not yet waited.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Oldest in-flight picture.
    pub fn oldest(&self) -> Option<JobHandle> {
        self.in_flight.keys().next().copied()
    }

    /// Cores not running a job.
    pub fn idle_cores(&self) -> usize {
        self.issue_order
            .iter()
            .filter(|c| !self.busy.contains(c))
            .count()
    }

    /// Whether a picture can be submitted without waiting for a core.
    pub fn has_capacity(&self) -> bool {
        self.idle_cores() >= self.tiles_per_picture()
    }

    fn tiles_per_picture(&self) -> usize {
        self.partitions
            .min(self.dimensions.height.div_ceil(16).max(1) as usize)
    }

    /// In-flight pictures that must complete before `plan` may be submitted:
    /// writers of any slot it reads or refreshes, and readers of any slot it
    /// refreshes.
    pub fn blockers(&self, plan: &PictureCodingPlan) -> Vec<JobHandle> {
        let reads = plan.read_slots();
        let touched = SlotSet::from_bits(reads.bits() | plan.refresh.bits());
        self.in_flight
            .iter()
            .filter(|(_, job)| {
                job.plan.refresh.bits() & touched.bits() != 0
                    || job.reads.bits() & plan.refresh.bits() != 0
            })
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Submit the jobs of one picture.
    ///
    /// On failure nothing stays reserved and the planes of `admitted` are
    /// released, except when partitions already issued may still be running:
    /// the picture then stays in flight and `DeviceUnusable` is returned.
    pub fn submit(
        &mut self,
        plan: &PictureCodingPlan,
        decision: &QpDecision,
        admitted: Admitted,
    ) -> Result<JobHandle> {
        let tiles = split_rows(self.dimensions.height.div_ceil(16), self.tiles_per_picture());
        let cores: Vec<CoreId> = self
            .issue_order
            .iter()
            .copied()
            .filter(|c| !self.busy.contains(c))
            .take(tiles.len())
            .collect();
        if cores.len() < tiles.len() {
            self.release_planes(&admitted.planes);
            return Err(VpuError::InvalidState(format!(
                "{} idle cores for {} partitions",
                cores.len(),
                tiles.len()
            )));
        }

        let handle = JobHandle(self.next_handle);
        self.next_handle += 1;
        let reads = plan.read_slots();

        let (descriptors, outputs) = {
            let mut resources = self.resources.lock();
            match self.prepare(&mut resources, handle, plan, decision, &admitted, &tiles, &cores) {
                Ok(prepared) => prepared,
                Err(err) => {
                    drop(resources);
                    self.release_planes(&admitted.planes);
                    return Err(err);
                }
            }
        };

        let mut partitions = Vec::with_capacity(descriptors.len());
        for (descriptor, output) in descriptors.iter().zip(&outputs) {
            match self.hal.submit(descriptor.core, descriptor) {
                Ok(hal) => partitions.push(PartitionJob {
                    core: descriptor.core,
                    hal,
                    output: *output,
                }),
                Err(err) => {
                    warn!(
                        "Submit of picture {} to core {} failed: {}",
                        plan.picture_order, descriptor.core, err
                    );
                    return Err(self.abort_partial(
                        handle, plan, decision, reads, admitted, partitions, &outputs, err,
                    ));
                }
            }
        }

        for job in &partitions {
            self.busy.insert(job.core);
        }
        debug!(
            "Submitted picture {} (coding {}) as job {} on cores {:?}",
            plan.picture_order, plan.encode_order, handle.0, cores
        );
        self.in_flight.insert(
            handle,
            InFlight {
                plan: plan.clone(),
                qp: decision.qp,
                reads,
                planes: admitted.planes,
                partitions,
            },
        );
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        resources: &mut SharedResources,
        handle: JobHandle,
        plan: &PictureCodingPlan,
        decision: &QpDecision,
        admitted: &Admitted,
        tiles: &[(u32, u32)],
        cores: &[CoreId],
    ) -> Result<(Vec<JobDescriptor>, Vec<BufferId>)> {
        let reads = plan.read_slots();
        resources.slots.check_reads(reads)?;
        resources.slots.check_refresh(plan.refresh)?;

        let size = output_buffer_size(self.dimensions, self.format, tiles.len());
        let mut outputs = Vec::with_capacity(tiles.len());
        for _ in tiles {
            match resources.pool.acquire(BufferKind::Output, size) {
                Ok(id) => outputs.push(id),
                Err(err) => {
                    release_all(resources, &outputs);
                    return Err(err);
                }
            }
        }

        let mut recon = SlotAddress::default();
        if !plan.refresh.is_empty() {
            let target = match resources.take_reference(self.dimensions, self.format) {
                Ok(target) => target,
                Err(err) => {
                    release_all(resources, &outputs);
                    return Err(err);
                }
            };
            let long_term = match (plan.ltr, self.ltr_slot) {
                (Some(LtrTag::Update), Some(slot)) => SlotSet::single(slot),
                _ => SlotSet::EMPTY,
            };
            if let Err(err) =
                resources
                    .slots
                    .reserve(plan.refresh, long_term, handle, plan.picture_order, target)
            {
                resources.recycle_reference(target);
                release_all(resources, &outputs);
                return Err(err);
            }
            recon = slot_address(resources, Some(target));
        }
        resources.slots.track_reads(reads);

        let mut sync = admitted
            .planes
            .iter()
            .try_for_each(|plane| resources.pool.sync_for_device(*plane));
        for output in &outputs {
            if sync.is_ok() {
                sync = resources.pool.mark(*output, crate::hal::Direction::DeviceToHost);
            }
        }
        if let Err(err) = sync {
            resources.slots.release_reads(reads);
            if let (_, Some(target)) = resources.slots.rollback(handle) {
                resources.recycle_reference(target);
            }
            release_all(resources, &outputs);
            return Err(err);
        }

        let mut slots = [SlotAddress::default(); MAX_REFERENCE_SLOTS];
        for (slot, address) in slots.iter_mut().enumerate().take(resources.slots.len()) {
            let buffer = resources
                .slots
                .state(slot as SlotId)
                .and_then(|s| s.buffer);
            *address = slot_address(resources, buffer);
        }

        let picture = &admitted.picture;
        let mut input = [BusAddress::default(); 3];
        input[0] = picture.luma;
        input[1..].copy_from_slice(&picture.chroma);

        let count = tiles.len();
        let mut descriptors = Vec::with_capacity(count);
        for (index, ((first_row, row_count), core)) in tiles.iter().zip(cores).enumerate() {
            let output = resources
                .pool
                .get(outputs[index])
                .map(|b| b.memory.bus)
                .unwrap_or_default();
            let registers = JobRegisters {
                kind: JobKind::Encode,
                picture_order: plan.picture_order,
                coding_type: plan.coding_type,
                qp: decision.qp,
                block_qp_delta: decision.block_qp_delta,
                width: self.dimensions.width as u16,
                height: self.dimensions.height as u16,
                partition_index: index as u8,
                partition_count: count as u8,
                first_row: *first_row as u16,
                row_count: *row_count as u16,
                input,
                output,
                output_size: size as u32,
                list0: plan.list0.iter().copied().collect(),
                list1: plan.list1.iter().copied().collect(),
                refresh: plan.refresh,
                write_header: index == 0,
                downscale: false,
                target_bits: (decision.target_bits / count as u64) as u32,
                recon,
                slots,
            };
            descriptors.push(JobDescriptor::new(*core, &registers));
        }
        Ok((descriptors, outputs))
    }

    /// Wait for every partition of `handle` and publish the result.
    ///
    /// A hardware error is returned as a [`JobOutcome`] with a failed status.
    /// Only device loss is returned as an error.
    pub fn wait(&mut self, handle: JobHandle) -> Result<JobOutcome> {
        let job = self
            .in_flight
            .remove(&handle)
            .ok_or(VpuError::UnknownJob(handle.0))?;
        for partition in &job.partitions {
            self.busy.remove(&partition.core);
        }

        let mut status = JobStatus::Ok;
        let mut lost = None;
        let mut feedback = Vec::with_capacity(job.partitions.len());
        for partition in &job.partitions {
            match self.hal.wait(partition.hal, self.timeout) {
                Ok(result) => {
                    if !result.status.is_ok() && status.is_ok() {
                        status = result.status;
                    }
                    feedback.push(Some(result));
                }
                Err(HalError::DeviceUnusable(reason)) => {
                    lost = Some(reason);
                    break;
                }
                Err(err) => {
                    warn!("Wait for job {} failed: {}", handle.0, err);
                    if status.is_ok() {
                        status = JobStatus::BusError;
                    }
                    feedback.push(None);
                }
            }
        }
        if lost.is_some() {
            status = JobStatus::BusError;
        }

        let plan = job.plan.clone();
        let mut bits = 0;
        let mut activity = ActivityStats::default();
        let mut refreshed = SlotSet::EMPTY;
        {
            let mut resources = self.resources.lock();
            if status.is_ok() {
                let count = job.partitions.len();
                for (index, (partition, result)) in job.partitions.iter().zip(&feedback).enumerate()
                {
                    let Some(result) = result else { continue };
                    let data = match resources.pool.read(partition.output, result.output_bytes()) {
                        Ok(data) => data,
                        Err(err) => {
                            warn!("Reading output of job {} failed: {}", handle.0, err);
                            status = JobStatus::BusError;
                            break;
                        }
                    };
                    bits += data.len() as u64 * 8;
                    activity.merge(&result.activity);
                    let kind = if index == 0 && result.header_bytes > 0 {
                        PartitionKind::Header
                    } else {
                        PartitionKind::Data
                    };
                    self.send(CompletionEvent::Partition {
                        encode_order: plan.encode_order,
                        index,
                        count,
                        partition: Partition {
                            kind,
                            core: partition.core,
                            data,
                        },
                    });
                }
            }

            if status.is_ok() {
                let (slots, freed) = resources.slots.commit(handle);
                refreshed = slots;
                for buffer in freed {
                    resources.recycle_reference(buffer);
                }
            } else {
                bits = 0;
                let (slots, target) = resources.slots.rollback(handle);
                if let Some(target) = target {
                    resources.recycle_reference(target);
                }
                warn!(
                    "Picture {} failed with {:?}, slots {:#04b} rolled back",
                    plan.picture_order,
                    status,
                    slots.bits()
                );
            }
            resources.slots.release_reads(job.reads);
            let outputs: Vec<BufferId> = job.partitions.iter().map(|p| p.output).collect();
            release_all(&mut resources, &outputs);
            release_all(&mut resources, &job.planes);
        }

        self.send(CompletionEvent::Finished {
            encode_order: plan.encode_order,
            status,
            refreshed,
            qp: job.qp,
        });

        if let Some(reason) = lost {
            error!("Device lost while waiting for job {}: {}", handle.0, reason);
            return Err(VpuError::DeviceUnusable(reason));
        }
        debug!(
            "Job {} for picture {} completed: {:?}, {} bits",
            handle.0, plan.picture_order, status, bits
        );
        Ok(JobOutcome {
            plan,
            status,
            bits,
            activity,
            qp: job.qp,
            refreshed,
        })
    }

    /// Fail every in-flight picture without waiting. Used once the device is
    /// unusable.
    pub fn abandon_all(&mut self) -> Vec<PictureCodingPlan> {
        let jobs = std::mem::take(&mut self.in_flight);
        self.busy.clear();
        let mut abandoned = Vec::with_capacity(jobs.len());
        for (handle, job) in jobs {
            {
                let mut resources = self.resources.lock();
                if let (_, Some(target)) = resources.slots.rollback(handle) {
                    resources.recycle_reference(target);
                }
                resources.slots.release_reads(job.reads);
                let outputs: Vec<BufferId> = job.partitions.iter().map(|p| p.output).collect();
                release_all(&mut resources, &outputs);
                release_all(&mut resources, &job.planes);
            }
            self.send(CompletionEvent::Finished {
                encode_order: job.plan.encode_order,
                status: JobStatus::BusError,
                refreshed: SlotSet::EMPTY,
                qp: job.qp,
            });
            abandoned.push(job.plan);
        }
        abandoned
    }

    /// Undo a picture whose submission failed after `partitions` were
    /// issued.
    ///
    /// Issued partitions are waited out first. If any of them cannot be
    /// confirmed finished, its core and buffers stay reserved under `handle`
    /// and the device is reported unusable; they are released by
    /// [`abandon_all`](Self::abandon_all).
    #[allow(clippy::too_many_arguments)]
    fn abort_partial(
        &mut self,
        handle: JobHandle,
        plan: &PictureCodingPlan,
        decision: &QpDecision,
        reads: SlotSet,
        admitted: Admitted,
        partitions: Vec<PartitionJob>,
        outputs: &[BufferId],
        err: HalError,
    ) -> VpuError {
        let lost = matches!(err, HalError::DeviceUnusable(_));
        let mut running = Vec::new();
        for job in partitions {
            if lost {
                running.push(job);
                continue;
            }
            match self.hal.wait(job.hal, self.timeout) {
                Ok(_) => {}
                Err(wait_err) => {
                    warn!(
                        "Partition of picture {} on core {} not confirmed finished: {}",
                        plan.picture_order, job.core, wait_err
                    );
                    running.push(job);
                }
            }
        }

        if running.is_empty() {
            self.unwind(handle, reads, outputs, &admitted.planes);
            return err.into();
        }

        let kept: HashSet<BufferId> = running.iter().map(|job| job.output).collect();
        let released: Vec<BufferId> = outputs
            .iter()
            .copied()
            .filter(|output| !kept.contains(output))
            .collect();
        release_all(&mut self.resources.lock(), &released);
        for job in &running {
            self.busy.insert(job.core);
        }
        let reason = format!(
            "picture {} left {} partition(s) running after a failed submit: {}",
            plan.picture_order,
            running.len(),
            err
        );
        error!("{}", reason);
        self.in_flight.insert(
            handle,
            InFlight {
                plan: plan.clone(),
                qp: decision.qp,
                reads,
                planes: admitted.planes,
                partitions: running,
            },
        );
        VpuError::DeviceUnusable(reason)
    }

    /// Whether the picture with coding order `encode_order` is in flight.
    pub fn is_in_flight(&self, encode_order: u64) -> bool {
        self.in_flight
            .values()
            .any(|job| job.plan.encode_order == encode_order)
    }

    fn unwind(&self, handle: JobHandle, reads: SlotSet, outputs: &[BufferId], planes: &[BufferId]) {
        let mut resources = self.resources.lock();
        if let (_, Some(target)) = resources.slots.rollback(handle) {
            resources.recycle_reference(target);
        }
        resources.slots.release_reads(reads);
        release_all(&mut resources, outputs);
        release_all(&mut resources, planes);
    }

    fn release_planes(&self, planes: &[BufferId]) {
        release_all(&mut self.resources.lock(), planes);
    }

    fn send(&self, event: CompletionEvent) {
        if self.events.send(event).is_err() {
            debug!("Output assembler gone, dropping completion event");
        }
    }
}

fn release_all(resources: &mut SharedResources, buffers: &[BufferId]) {
    for buffer in buffers {
        if let Err(err) = resources.pool.release(*buffer) {
            warn!("Failed to release buffer {}: {}", buffer.0, err);
        }
    }
}

fn slot_address(resources: &SharedResources, buffer: Option<BufferId>) -> SlotAddress {
    buffer
        .and_then(|id| resources.pool.get(id))
        .map(|b| SlotAddress {
            frame: b.memory.bus,
            table: b
                .side_table
                .as_ref()
                .map(|t| t.bus)
                .unwrap_or_default(),
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::resources::BufferPool;
    use crate::encoder::CodingType;
    use crate::hal::sim::SimulatedHal;
    use crossbeam_channel::Receiver;

    const DIMS: Dimensions = Dimensions {
        width: 64,
        height: 64,
    };

    struct Rig {
        hal: Arc<SimulatedHal>,
        resources: Arc<Mutex<SharedResources>>,
        dispatcher: JobDispatcher,
        events: Receiver<CompletionEvent>,
        next_base: u64,
    }

    fn rig(cores: usize, partitions: usize) -> Rig {
        let hal = Arc::new(SimulatedHal::new(cores));
        let pool = BufferPool::new(hal.clone(), 0);
        let resources = Arc::new(Mutex::new(SharedResources::new(pool, 4)));
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatcher = JobDispatcher::new(
            hal.clone(),
            resources.clone(),
            (0..cores as CoreId).collect(),
            partitions,
            Duration::from_millis(100),
            DIMS,
            ColorFormat::Yuv420Planar,
            tx,
        );
        Rig {
            hal,
            resources,
            dispatcher,
            events: rx,
            next_base: 0x4000_0000,
        }
    }

    impl Rig {
        fn admit(&mut self) -> Admitted {
            let picture = Picture::contiguous(
                BusAddress(self.next_base),
                DIMS,
                ColorFormat::Yuv420Planar,
                0,
                0,
            );
            self.next_base += 0x10_0000;
            let planes = self.resources.lock().pool.admit_picture(&picture).unwrap();
            Admitted { picture, planes }
        }
    }

    fn plan(order: u64, coding_type: CodingType, reads: &[SlotId], refresh: SlotSet) -> PictureCodingPlan {
        PictureCodingPlan {
            picture_order: order,
            encode_order: order,
            coding_type,
            temporal_layer: 0,
            list0: reads.to_vec(),
            list1: Vec::new(),
            refresh,
            ltr: None,
            gop_position: 0,
        }
    }

    fn decision() -> QpDecision {
        QpDecision {
            qp: 26,
            target_bits: 10_000,
            block_qp_delta: 0,
            skip: false,
        }
    }

    #[test]
    fn test_split_rows() {
        assert_eq!(split_rows(4, 1), vec![(0, 4)]);
        assert_eq!(split_rows(5, 2), vec![(0, 3), (3, 2)]);
        assert_eq!(split_rows(2, 4), vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn test_partitions_issued_in_core_order() {
        let mut rig = rig(2, 2);
        let admitted = rig.admit();
        let intra = plan(0, CodingType::Intra, &[], SlotSet::single(0));
        let handle = rig.dispatcher.submit(&intra, &decision(), admitted).unwrap();
        assert_eq!(rig.dispatcher.idle_cores(), 0);
        assert!(!rig.dispatcher.has_capacity());

        let outcome = rig.dispatcher.wait(handle).unwrap();
        assert_eq!(outcome.status, JobStatus::Ok);
        assert_eq!(outcome.refreshed, SlotSet::single(0));
        assert!(outcome.bits > 0);

        let cores: Vec<CoreId> = rig.hal.submissions().iter().map(|s| s.core).collect();
        assert_eq!(cores, vec![0, 1]);
        let events: Vec<CompletionEvent> = rig.events.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            CompletionEvent::Partition { index: 0, count: 2, partition, .. }
                if partition.kind == PartitionKind::Header
        ));
        assert!(matches!(events[2], CompletionEvent::Finished { status: JobStatus::Ok, .. }));

        let resources = rig.resources.lock();
        assert_eq!(resources.pool.live_count_of(BufferKind::Output), 0);
        assert_eq!(resources.pool.live_count_of(BufferKind::Picture), 0);
        assert_eq!(resources.pool.live_count_of(BufferKind::Reference), 1);
    }

    #[test]
    fn test_blockers() {
        let mut rig = rig(2, 1);
        let admitted = rig.admit();
        let intra = plan(0, CodingType::Intra, &[], SlotSet::single(0));
        let first = rig.dispatcher.submit(&intra, &decision(), admitted).unwrap();

        let reader = plan(1, CodingType::Predicted, &[0], SlotSet::EMPTY);
        assert_eq!(rig.dispatcher.blockers(&reader), vec![first]);
        // Submitting anyway is rejected while the slot is being written.
        let admitted = rig.admit();
        let err = rig.dispatcher.submit(&reader, &decision(), admitted).unwrap_err();
        assert!(matches!(err, VpuError::ReferenceNotReady { slot: 0 }));
        assert_eq!(rig.resources.lock().pool.live_count_of(BufferKind::Picture), 3);

        rig.dispatcher.wait(first).unwrap();
        assert!(rig.dispatcher.blockers(&reader).is_empty());
        let admitted = rig.admit();
        let second = rig.dispatcher.submit(&reader, &decision(), admitted).unwrap();
        let writer = plan(2, CodingType::Predicted, &[], SlotSet::single(0));
        assert_eq!(rig.dispatcher.blockers(&writer), vec![second]);
    }

    #[test]
    fn test_failed_job_rolls_back_refresh() {
        let mut rig = rig(1, 1);
        let admitted = rig.admit();
        let intra = plan(0, CodingType::Intra, &[], SlotSet::single(0));
        let handle = rig.dispatcher.submit(&intra, &decision(), admitted).unwrap();
        rig.dispatcher.wait(handle).unwrap();
        let before = rig.resources.lock().slots.state(0).unwrap();

        rig.hal.fail_picture(1, JobStatus::Timeout);
        let admitted = rig.admit();
        let p = plan(1, CodingType::Predicted, &[0], SlotSet::single(0));
        let handle = rig.dispatcher.submit(&p, &decision(), admitted).unwrap();
        let outcome = rig.dispatcher.wait(handle).unwrap();
        assert_eq!(outcome.status, JobStatus::Timeout);
        assert_eq!(outcome.bits, 0);
        assert!(outcome.refreshed.is_empty());

        let resources = rig.resources.lock();
        assert_eq!(resources.slots.state(0).unwrap(), before);
        assert!(resources.slots.writer(0).is_none());
        assert_eq!(resources.spare_references(), 1);
        let events: Vec<CompletionEvent> = rig.events.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(CompletionEvent::Finished { status: JobStatus::Timeout, .. })
        ));
    }

    #[test]
    fn test_device_loss_is_fatal() {
        let mut rig = rig(1, 1);
        rig.hal.lose_device_after(0);
        let admitted = rig.admit();
        let intra = plan(0, CodingType::Intra, &[], SlotSet::single(0));
        let handle = rig.dispatcher.submit(&intra, &decision(), admitted).unwrap();
        let err = rig.dispatcher.wait(handle).unwrap_err();
        assert!(err.is_fatal());
        let resources = rig.resources.lock();
        assert!(resources.slots.writer(0).is_none());
        assert_eq!(resources.pool.live_count_of(BufferKind::Output), 0);
    }

    #[test]
    fn test_abandon_all() {
        let mut rig = rig(2, 1);
        let first = rig.admit();
        let second = rig.admit();
        rig.dispatcher
            .submit(&plan(0, CodingType::Intra, &[], SlotSet::single(0)), &decision(), first)
            .unwrap();
        rig.dispatcher
            .submit(&plan(1, CodingType::Intra, &[], SlotSet::single(1)), &decision(), second)
            .unwrap();
        let abandoned = rig.dispatcher.abandon_all();
        assert_eq!(abandoned.len(), 2);
        assert_eq!(rig.dispatcher.in_flight(), 0);
        assert_eq!(rig.dispatcher.idle_cores(), 2);
        assert_eq!(rig.resources.lock().pool.live_count_of(BufferKind::Picture), 0);
    }

    /// Rejects submits to one core, and optionally loses track of the jobs it
    /// accepted.
    struct RejectingHal {
        inner: SimulatedHal,
        reject: CoreId,
        lose_jobs: bool,
    }

    impl Hal for RejectingHal {
        fn read_id(&self) -> crate::hal::HwId {
            self.inner.read_id()
        }

        fn read_config(&self) -> crate::hal::HwConfig {
            self.inner.read_config()
        }

        fn alloc(
            &self,
            size: usize,
            direction: crate::hal::Direction,
        ) -> crate::hal::HalResult<crate::hal::DeviceMemory> {
            self.inner.alloc(size, direction)
        }

        fn free(&self, memory: &crate::hal::DeviceMemory) -> crate::hal::HalResult<()> {
            self.inner.free(memory)
        }

        fn sync(
            &self,
            memory: &crate::hal::DeviceMemory,
            direction: crate::hal::Direction,
        ) -> crate::hal::HalResult<()> {
            self.inner.sync(memory, direction)
        }

        fn read(
            &self,
            memory: &crate::hal::DeviceMemory,
            offset: usize,
            len: usize,
        ) -> crate::hal::HalResult<Vec<u8>> {
            self.inner.read(memory, offset, len)
        }

        fn submit(&self, core: CoreId, job: &JobDescriptor) -> crate::hal::HalResult<HalJobHandle> {
            if core == self.reject {
                return Err(HalError::InvalidCore(core));
            }
            self.inner.submit(core, job)
        }

        fn wait(
            &self,
            handle: HalJobHandle,
            timeout: Duration,
        ) -> crate::hal::HalResult<crate::hal::JobFeedback> {
            if self.lose_jobs {
                return Err(HalError::UnknownHandle(handle.0));
            }
            self.inner.wait(handle, timeout)
        }
    }

    fn rejecting_dispatcher(
        lose_jobs: bool,
    ) -> (JobDispatcher, Arc<Mutex<SharedResources>>, Receiver<CompletionEvent>) {
        let hal: Arc<dyn Hal> = Arc::new(RejectingHal {
            inner: SimulatedHal::new(2),
            reject: 1,
            lose_jobs,
        });
        let pool = BufferPool::new(hal.clone(), 0);
        let resources = Arc::new(Mutex::new(SharedResources::new(pool, 4)));
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatcher = JobDispatcher::new(
            hal,
            resources.clone(),
            vec![0, 1],
            2,
            Duration::from_millis(100),
            DIMS,
            ColorFormat::Yuv420Planar,
            tx,
        );
        (dispatcher, resources, rx)
    }

    fn admit_into(resources: &Mutex<SharedResources>) -> Admitted {
        let picture = Picture::contiguous(
            BusAddress(0x4000_0000),
            DIMS,
            ColorFormat::Yuv420Planar,
            0,
            0,
        );
        let planes = resources.lock().pool.admit_picture(&picture).unwrap();
        Admitted { picture, planes }
    }

    #[test]
    fn test_partial_submit_unwinds_finished_partitions() {
        let (mut dispatcher, resources, _events) = rejecting_dispatcher(false);
        let admitted = admit_into(&resources);
        let intra = plan(0, CodingType::Intra, &[], SlotSet::single(0));
        let err = dispatcher.submit(&intra, &decision(), admitted).unwrap_err();
        assert!(matches!(err, VpuError::Hal(HalError::InvalidCore(1))));
        assert!(!err.is_fatal());

        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.idle_cores(), 2);
        let resources = resources.lock();
        assert_eq!(resources.pool.live_count_of(BufferKind::Output), 0);
        assert_eq!(resources.pool.live_count_of(BufferKind::Picture), 0);
        assert!(resources.slots.writer(0).is_none());
    }

    #[test]
    fn test_partial_submit_keeps_running_partition_reserved() {
        let (mut dispatcher, resources, events) = rejecting_dispatcher(true);
        let admitted = admit_into(&resources);
        let intra = plan(0, CodingType::Intra, &[], SlotSet::single(0));
        let err = dispatcher.submit(&intra, &decision(), admitted).unwrap_err();
        assert!(err.is_fatal());

        // Core 0 may still be writing: its core, output and refresh stay held.
        assert!(dispatcher.is_in_flight(0));
        assert_eq!(dispatcher.idle_cores(), 1);
        {
            let resources = resources.lock();
            assert_eq!(resources.pool.live_count_of(BufferKind::Output), 1);
            assert_eq!(resources.pool.live_count_of(BufferKind::Picture), 3);
            assert!(resources.slots.writer(0).is_some());
        }

        let abandoned = dispatcher.abandon_all();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(dispatcher.idle_cores(), 2);
        let resources = resources.lock();
        assert_eq!(resources.pool.live_count_of(BufferKind::Output), 0);
        assert_eq!(resources.pool.live_count_of(BufferKind::Picture), 0);
        assert!(resources.slots.writer(0).is_none());
        assert!(matches!(
            events.try_iter().last(),
            Some(CompletionEvent::Finished { status: JobStatus::BusError, .. })
        ));
    }
}
