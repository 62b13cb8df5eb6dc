//! Deterministic software device.
//!
//! `SimulatedHal` behaves like a multi-core encoder from the orchestration
//! layer's point of view: memory has stable bus addresses, jobs queue per core
//! and run in submission order, and each finished job reports sizes and
//! activity derived from a content model. Jobs execute lazily when waited, so
//! the order in which the caller waits decides cross-core completion order.
//!
//! Faults can be injected per picture, and the device can be made to fail
//! permanently after a number of jobs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    ActivityStats, AnalysisFeedback, CoreId, DeviceMemory, Direction, Hal, HalError, HalJobHandle,
    HalResult, HwConfig, HwId, JobFeedback,
};
use crate::encoder::regs::{JobDescriptor, JobKind, JobRegisters, SlotAddress};
use crate::encoder::{CodingType, JobStatus, SlotSet, MAX_REFERENCE_SLOTS};

/// First bus address handed out.
const BUS_BASE: u64 = 0x1000_0000;

/// Allocation granularity.
const BUS_ALIGN: u64 = 4096;

/// Coded bits of one 16x16 block of unit complexity at `REFERENCE_QP`.
const BITS_PER_BLOCK: f64 = 48.0;

/// QP at which `BITS_PER_BLOCK` applies.
const REFERENCE_QP: f64 = 26.0;

/// Intra pictures cost this many times an inter picture.
const INTRA_FACTOR: f64 = 4.0;

/// Bytes written for a header partition.
const HEADER_BYTES: usize = 24;

/// Product id reported by `read_id`.
pub const SIM_PRODUCT_ID: u32 = 0x5650_0001;

/// Content of one picture as seen by the simulated device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Content {
    /// Relative coding cost, 1.0 is average.
    pub complexity: f64,
    /// Whether this picture starts a new scene.
    pub scene_cut: bool,
}

impl Default for Content {
    fn default() -> Self {
        Self {
            complexity: 1.0,
            scene_cut: false,
        }
    }
}

type ContentFn = Box<dyn Fn(u64) -> Content + Send + Sync>;

/// A submitted job as recorded by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub core: CoreId,
    pub handle: HalJobHandle,
    pub kind: JobKind,
    pub picture_order: u64,
    pub partition_index: u8,
}

struct PendingJob {
    handle: HalJobHandle,
    descriptor: JobDescriptor,
}

struct SimState {
    next_bus: u64,
    memory_limit: usize,
    used: usize,
    allocations: BTreeMap<u64, Vec<u8>>,
    next_handle: u64,
    queues: Vec<VecDeque<PendingJob>>,
    handle_core: HashMap<HalJobHandle, CoreId>,
    completed: HashMap<HalJobHandle, JobFeedback>,
    encode_faults: HashMap<u64, JobStatus>,
    analysis_faults: HashMap<u64, JobStatus>,
    device_loss_after: Option<u64>,
    lost: bool,
    jobs_run: u64,
    syncs: u64,
    submissions: Vec<Submission>,
}

/// Software implementation of [`Hal`].
pub struct SimulatedHal {
    config: HwConfig,
    content: ContentFn,
    state: Mutex<SimState>,
}

impl SimulatedHal {
    /// Create a device with `cores` cores and default capabilities.
    pub fn new(cores: usize) -> Self {
        let config = HwConfig {
            cores,
            max_width: 4096,
            max_height: 4096,
            max_reference_slots: MAX_REFERENCE_SLOTS,
            lookahead: true,
            block_rate_control: true,
        };
        Self {
            state: Mutex::new(SimState {
                next_bus: BUS_BASE,
                memory_limit: usize::MAX,
                used: 0,
                allocations: BTreeMap::new(),
                next_handle: 1,
                queues: (0..cores).map(|_| VecDeque::new()).collect(),
                handle_core: HashMap::new(),
                completed: HashMap::new(),
                encode_faults: HashMap::new(),
                analysis_faults: HashMap::new(),
                device_loss_after: None,
                lost: false,
                jobs_run: 0,
                syncs: 0,
                submissions: Vec::new(),
            }),
            config,
            content: Box::new(|_| Content::default()),
        }
    }

    /// Replace the reported capabilities. The core count is kept.
    pub fn with_config(mut self, config: HwConfig) -> Self {
        let cores = self.config.cores;
        self.config = HwConfig { cores, ..config };
        self
    }

    /// Limit device memory to `bytes`.
    pub fn with_memory_limit(self, bytes: usize) -> Self {
        self.state.lock().memory_limit = bytes;
        self
    }

    /// Set the per-picture content model.
    pub fn with_content<F>(mut self, content: F) -> Self
    where
        F: Fn(u64) -> Content + Send + Sync + 'static,
    {
        self.content = Box::new(content);
        self
    }

    /// Make the next encode job of `picture_order` finish with `status`.
    pub fn fail_picture(&self, picture_order: u64, status: JobStatus) {
        self.state.lock().encode_faults.insert(picture_order, status);
    }

    /// Make the analysis job of `picture_order` finish with `status`.
    pub fn fail_analysis(&self, picture_order: u64, status: JobStatus) {
        self.state
            .lock()
            .analysis_faults
            .insert(picture_order, status);
    }

    /// Report the device unusable once `jobs` more jobs have run.
    pub fn lose_device_after(&self, jobs: u64) {
        let mut state = self.state.lock();
        state.device_loss_after = Some(state.jobs_run + jobs);
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of cache maintenance operations performed.
    pub fn sync_count(&self) -> u64 {
        self.state.lock().syncs
    }

    /// Number of jobs executed.
    pub fn jobs_run(&self) -> u64 {
        self.state.lock().jobs_run
    }

    /// Every submission so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    fn run(&self, state: &mut SimState, descriptor: &JobDescriptor) -> HalResult<JobFeedback> {
        if let Some(limit) = state.device_loss_after {
            if state.jobs_run >= limit {
                state.lost = true;
            }
        }
        if state.lost {
            return Err(HalError::DeviceUnusable(
                "simulated device stopped responding".to_string(),
            ));
        }
        state.jobs_run += 1;

        let Some(regs) = descriptor.decode() else {
            return Ok(JobFeedback::failed(JobStatus::DataError));
        };

        let faults = match regs.kind {
            JobKind::Encode => &mut state.encode_faults,
            JobKind::Analysis => &mut state.analysis_faults,
        };
        if let Some(status) = faults.remove(&regs.picture_order) {
            debug!(
                "Injected {:?} on {:?} job for picture {}",
                status, regs.kind, regs.picture_order
            );
            return Ok(JobFeedback::failed(status));
        }

        if !references_mapped(state, &regs) {
            return Ok(JobFeedback::failed(JobStatus::BusError));
        }

        let content = (self.content)(regs.picture_order);
        match regs.kind {
            JobKind::Encode => Ok(encode(state, &regs, content)),
            JobKind::Analysis => Ok(analyse(&regs, content)),
        }
    }
}

fn allocation_at(state: &SimState, bus: u64) -> Option<(u64, usize)> {
    state
        .allocations
        .range(..=bus)
        .next_back()
        .filter(|(start, data)| bus < **start + data.len() as u64)
        .map(|(start, data)| (*start, data.len()))
}

fn mapped(state: &SimState, address: &SlotAddress) -> bool {
    allocation_at(state, address.frame.0).is_some() && allocation_at(state, address.table.0).is_some()
}

fn references_mapped(state: &SimState, regs: &JobRegisters) -> bool {
    let read = SlotSet::from_bits(regs.list0.bits() | regs.list1.bits());
    let reads_ok = read
        .iter()
        .all(|slot| mapped(state, &regs.slots[slot as usize]));
    reads_ok && (regs.refresh.is_empty() || mapped(state, &regs.recon))
}

fn partition_blocks(regs: &JobRegisters) -> u32 {
    let columns = u32::from(regs.width).div_ceil(16);
    let rows = if regs.downscale {
        u32::from(regs.row_count).div_ceil(2)
    } else {
        u32::from(regs.row_count)
    };
    let columns = if regs.downscale {
        columns.div_ceil(2)
    } else {
        columns
    };
    columns * rows
}

fn encode(state: &mut SimState, regs: &JobRegisters, content: Content) -> JobFeedback {
    let blocks = partition_blocks(regs);
    let intra = regs.coding_type == CodingType::Intra;
    let mut bits = f64::from(blocks)
        * BITS_PER_BLOCK
        * content.complexity
        * 2f64.powf((REFERENCE_QP - f64::from(regs.qp)) / 6.0);
    if intra {
        bits *= INTRA_FACTOR;
    }
    let data_bytes = ((bits / 8.0).round() as usize).max(1);
    let header_bytes = if regs.write_header { HEADER_BYTES } else { 0 };

    if header_bytes + data_bytes > regs.output_size as usize {
        return JobFeedback::failed(JobStatus::DataError);
    }
    let Some((start, len)) = allocation_at(state, regs.output.0) else {
        return JobFeedback::failed(JobStatus::BusError);
    };
    let offset = (regs.output.0 - start) as usize;
    if offset + header_bytes + data_bytes > len {
        return JobFeedback::failed(JobStatus::BusError);
    }
    if let Some(memory) = state.allocations.get_mut(&start) {
        let out = &mut memory[offset..offset + header_bytes + data_bytes];
        let (header, data) = out.split_at_mut(header_bytes);
        if !header.is_empty() {
            header[..4].copy_from_slice(&[0, 0, 0, 1]);
            header[4..12].copy_from_slice(&regs.picture_order.to_be_bytes());
        }
        let fill = (regs.picture_order as u8) ^ (regs.partition_index << 4);
        data.fill(fill);
    }

    let skip_ratio = if intra {
        0.0
    } else {
        (1.0 - content.complexity / 2.0).clamp(0.0, 0.95)
    };
    let intra_ratio = if intra {
        1.0
    } else if content.scene_cut {
        0.8
    } else {
        0.05
    };
    JobFeedback {
        status: JobStatus::Ok,
        header_bytes,
        data_bytes,
        activity: ActivityStats {
            intra_blocks: (f64::from(blocks) * intra_ratio) as u32,
            skip_blocks: (f64::from(blocks) * skip_ratio) as u32,
            total_blocks: blocks,
            average_qp: f32::from(regs.qp),
        },
        analysis: None,
    }
}

fn analyse(regs: &JobRegisters, content: Content) -> JobFeedback {
    let blocks = partition_blocks(regs);
    let intra_cost = (f64::from(blocks) * 1000.0 * content.complexity) as u64;
    let inter_ratio = if content.scene_cut || regs.picture_order == 0 {
        1.05
    } else {
        (0.25 * content.complexity).min(0.9)
    };
    JobFeedback {
        status: JobStatus::Ok,
        header_bytes: 0,
        data_bytes: 0,
        activity: ActivityStats::default(),
        analysis: Some(AnalysisFeedback {
            intra_cost,
            inter_cost: (intra_cost as f64 * inter_ratio) as u64,
            skip_blocks: (f64::from(blocks) * (1.0 - content.complexity / 2.0).clamp(0.0, 0.95))
                as u32,
            total_blocks: blocks,
            motion: (content.complexity * 8.0) as u32,
        }),
    }
}

impl Hal for SimulatedHal {
    fn read_id(&self) -> HwId {
        HwId {
            product: SIM_PRODUCT_ID,
            major: 1,
            minor: 0,
        }
    }

    fn read_config(&self) -> HwConfig {
        self.config.clone()
    }

    fn alloc(&self, size: usize, _direction: Direction) -> HalResult<DeviceMemory> {
        let mut state = self.state.lock();
        let available = state.memory_limit.saturating_sub(state.used);
        if size > available {
            return Err(HalError::OutOfMemory {
                requested: size,
                available,
            });
        }
        let bus = state.next_bus;
        state.next_bus += (size.max(1) as u64).next_multiple_of(BUS_ALIGN);
        state.used += size;
        state.allocations.insert(bus, vec![0; size]);
        Ok(DeviceMemory {
            bus: super::BusAddress(bus),
            virt: bus as usize,
            size,
        })
    }

    fn free(&self, memory: &DeviceMemory) -> HalResult<()> {
        let mut state = self.state.lock();
        match state.allocations.remove(&memory.bus.0) {
            Some(data) => {
                state.used -= data.len();
                Ok(())
            }
            None => Err(HalError::InvalidAddress(memory.bus.0)),
        }
    }

    fn sync(&self, _memory: &DeviceMemory, _direction: Direction) -> HalResult<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }

    fn read(&self, memory: &DeviceMemory, offset: usize, len: usize) -> HalResult<Vec<u8>> {
        let state = self.state.lock();
        let data = state
            .allocations
            .get(&memory.bus.0)
            .ok_or(HalError::InvalidAddress(memory.bus.0))?;
        if offset + len > data.len() {
            return Err(HalError::InvalidAddress(memory.bus.0 + offset as u64));
        }
        Ok(data[offset..offset + len].to_vec())
    }

    fn submit(&self, core: CoreId, job: &JobDescriptor) -> HalResult<HalJobHandle> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(HalError::DeviceUnusable(
                "simulated device stopped responding".to_string(),
            ));
        }
        if core as usize >= state.queues.len() {
            return Err(HalError::InvalidCore(core));
        }
        let handle = HalJobHandle(state.next_handle);
        state.next_handle += 1;
        let (kind, picture_order, partition_index) = match job.decode() {
            Some(regs) => (regs.kind, regs.picture_order, regs.partition_index),
            None => (JobKind::Encode, u64::MAX, 0),
        };
        state.submissions.push(Submission {
            core,
            handle,
            kind,
            picture_order,
            partition_index,
        });
        state.handle_core.insert(handle, core);
        state.queues[core as usize].push_back(PendingJob {
            handle,
            descriptor: job.clone(),
        });
        Ok(handle)
    }

    fn wait(&self, handle: HalJobHandle, _timeout: Duration) -> HalResult<JobFeedback> {
        let mut state = self.state.lock();
        if let Some(feedback) = state.completed.remove(&handle) {
            state.handle_core.remove(&handle);
            return Ok(feedback);
        }
        let core = *state
            .handle_core
            .get(&handle)
            .ok_or(HalError::UnknownHandle(handle.0))?;

        // Run this core's queue in order up to the requested job.
        while let Some(job) = state.queues[core as usize].pop_front() {
            let feedback = self.run(&mut state, &job.descriptor)?;
            if job.handle == handle {
                state.handle_core.remove(&handle);
                return Ok(feedback);
            }
            state.completed.insert(job.handle, feedback);
        }
        Err(HalError::UnknownHandle(handle.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::BusAddress;

    fn regs(hal: &SimulatedHal, picture_order: u64, coding_type: CodingType) -> JobRegisters {
        let output = hal.alloc(1 << 16, Direction::None).unwrap();
        JobRegisters {
            kind: JobKind::Encode,
            picture_order,
            coding_type,
            qp: 26,
            block_qp_delta: 0,
            width: 64,
            height: 64,
            partition_index: 0,
            partition_count: 1,
            first_row: 0,
            row_count: 4,
            input: [BusAddress(0x100), BusAddress(0x200), BusAddress(0x300)],
            output: output.bus,
            output_size: output.size as u32,
            list0: SlotSet::EMPTY,
            list1: SlotSet::EMPTY,
            refresh: SlotSet::EMPTY,
            write_header: true,
            downscale: false,
            target_bits: 0,
            recon: SlotAddress::default(),
            slots: [SlotAddress::default(); MAX_REFERENCE_SLOTS],
        }
    }

    #[test]
    fn test_alloc_addresses_are_stable_and_disjoint() {
        let hal = SimulatedHal::new(1);
        let a = hal.alloc(100, Direction::None).unwrap();
        let b = hal.alloc(5000, Direction::None).unwrap();
        assert!(a.end() <= b.bus.0);
        assert_eq!(b.bus.0 % BUS_ALIGN, 0);
        hal.free(&a).unwrap();
        let c = hal.alloc(100, Direction::None).unwrap();
        assert_ne!(c.bus, a.bus);
        assert!(hal.free(&a).is_err());
    }

    #[test]
    fn test_memory_limit() {
        let hal = SimulatedHal::new(1).with_memory_limit(1000);
        assert!(hal.alloc(800, Direction::None).is_ok());
        assert!(matches!(
            hal.alloc(300, Direction::None),
            Err(HalError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_intra_costs_more_than_inter() {
        let hal = SimulatedHal::new(1);
        let intra = hal
            .submit(0, &JobDescriptor::new(0, &regs(&hal, 0, CodingType::Intra)))
            .unwrap();
        let inter = hal
            .submit(
                0,
                &JobDescriptor::new(0, &regs(&hal, 1, CodingType::Predicted)),
            )
            .unwrap();
        let inter = hal.wait(inter, Duration::from_millis(10)).unwrap();
        let intra = hal.wait(intra, Duration::from_millis(10)).unwrap();
        assert!(intra.status.is_ok());
        assert_eq!(intra.header_bytes, HEADER_BYTES);
        assert!(intra.data_bytes > inter.data_bytes * 3);
    }

    #[test]
    fn test_per_core_fifo() {
        let hal = SimulatedHal::new(2);
        let first = hal
            .submit(1, &JobDescriptor::new(1, &regs(&hal, 0, CodingType::Intra)))
            .unwrap();
        let second = hal
            .submit(
                1,
                &JobDescriptor::new(1, &regs(&hal, 1, CodingType::Predicted)),
            )
            .unwrap();
        // Waiting on the second job runs the first one too.
        hal.wait(second, Duration::from_millis(10)).unwrap();
        assert_eq!(hal.jobs_run(), 2);
        assert!(hal.wait(first, Duration::from_millis(10)).is_ok());
        assert!(matches!(
            hal.wait(first, Duration::from_millis(10)),
            Err(HalError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_injected_fault_is_one_shot() {
        let hal = SimulatedHal::new(1);
        hal.fail_picture(3, JobStatus::Timeout);
        let job = JobDescriptor::new(0, &regs(&hal, 3, CodingType::Predicted));
        let handle = hal.submit(0, &job).unwrap();
        let feedback = hal.wait(handle, Duration::from_millis(10)).unwrap();
        assert_eq!(feedback.status, JobStatus::Timeout);
        let handle = hal.submit(0, &job).unwrap();
        assert!(hal
            .wait(handle, Duration::from_millis(10))
            .unwrap()
            .status
            .is_ok());
    }

    #[test]
    fn test_unmapped_reference_is_bus_error() {
        let hal = SimulatedHal::new(1);
        let mut r = regs(&hal, 1, CodingType::Predicted);
        r.list0 = SlotSet::single(0);
        let handle = hal.submit(0, &JobDescriptor::new(0, &r)).unwrap();
        let feedback = hal.wait(handle, Duration::from_millis(10)).unwrap();
        assert_eq!(feedback.status, JobStatus::BusError);
    }

    #[test]
    fn test_device_loss() {
        let hal = SimulatedHal::new(1);
        hal.lose_device_after(1);
        let job = JobDescriptor::new(0, &regs(&hal, 0, CodingType::Intra));
        let first = hal.submit(0, &job).unwrap();
        let second = hal.submit(0, &job).unwrap();
        assert!(hal.wait(first, Duration::from_millis(10)).is_ok());
        assert!(matches!(
            hal.wait(second, Duration::from_millis(10)),
            Err(HalError::DeviceUnusable(_))
        ));
        assert!(hal.submit(0, &job).is_err());
    }

    #[test]
    fn test_analysis_detects_scene_cut() {
        let hal = SimulatedHal::new(1).with_content(|order| Content {
            complexity: 1.0,
            scene_cut: order == 5,
        });
        let mut r = regs(&hal, 4, CodingType::Predicted);
        r.kind = JobKind::Analysis;
        let calm = hal.submit(0, &JobDescriptor::new(0, &r)).unwrap();
        r.picture_order = 5;
        let cut = hal.submit(0, &JobDescriptor::new(0, &r)).unwrap();
        let calm = hal.wait(calm, Duration::ZERO).unwrap().analysis.unwrap();
        let cut = hal.wait(cut, Duration::ZERO).unwrap().analysis.unwrap();
        assert!(calm.inter_cost < calm.intra_cost / 2);
        assert!(cut.inter_cost > cut.intra_cost);
    }
}
