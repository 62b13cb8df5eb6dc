//! Hardware abstraction layer seam.
//!
//! The orchestration core never touches device registers, memory mappings or
//! interrupt lines. Everything it needs from the device goes through the
//! [`Hal`] trait: memory allocation, cache maintenance, job submission and
//! completion wait, and capability discovery.
//!
//! [`sim::SimulatedHal`] is a deterministic software implementation used by the
//! tests and demos.

pub mod sim;

use std::time::Duration;

use thiserror::Error;

use crate::encoder::regs::JobDescriptor;
use crate::encoder::JobStatus;

/// Hardware core index.
pub type CoreId = u8;

/// Address of a memory block as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BusAddress(pub u64);

impl BusAddress {
    /// Address `offset` bytes past this one.
    pub fn offset(self, offset: usize) -> BusAddress {
        BusAddress(self.0 + offset as u64)
    }
}

impl std::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Pending copy direction of a buffer shared between host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Nothing pending.
    #[default]
    None,
    /// Host wrote, device has not seen it yet.
    HostToDevice,
    /// Device wrote, host has not seen it yet.
    DeviceToHost,
    /// Pending in both directions.
    Both,
}

impl Direction {
    /// Whether `other` is part of this direction.
    pub fn includes(self, other: Direction) -> bool {
        match (self, other) {
            (_, Direction::None) => true,
            (Direction::Both, _) => true,
            (a, b) => a == b,
        }
    }

    /// Combine two pending directions.
    pub fn union(self, other: Direction) -> Direction {
        match (self, other) {
            (Direction::None, d) | (d, Direction::None) => d,
            (a, b) if a == b => a,
            _ => Direction::Both,
        }
    }

    /// Clear `other` from this direction.
    pub fn without(self, other: Direction) -> Direction {
        match (self, other) {
            (d, Direction::None) => d,
            (Direction::Both, Direction::HostToDevice) => Direction::DeviceToHost,
            (Direction::Both, Direction::DeviceToHost) => Direction::HostToDevice,
            (_, Direction::Both) => Direction::None,
            (a, b) if a == b => Direction::None,
            (a, _) => a,
        }
    }
}

/// A block of device-addressable memory handed out by the HAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMemory {
    /// Bus address used in job descriptors.
    pub bus: BusAddress,
    /// Host-side mapping cookie. Opaque to the core.
    pub virt: usize,
    /// Size in bytes.
    pub size: usize,
}

impl DeviceMemory {
    /// One past the last bus address of this block.
    pub fn end(&self) -> u64 {
        self.bus.0 + self.size as u64
    }
}

/// Product identification read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwId {
    pub product: u32,
    pub major: u8,
    pub minor: u8,
}

/// Capabilities read from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwConfig {
    /// Number of parallel encoder cores.
    pub cores: usize,
    /// Largest supported picture width.
    pub max_width: u32,
    /// Largest supported picture height.
    pub max_height: u32,
    /// Number of hardware reference-buffer identities.
    pub max_reference_slots: usize,
    /// Whether analysis (first-pass) jobs are supported.
    pub lookahead: bool,
    /// Whether block-level rate control is supported.
    pub block_rate_control: bool,
}

/// Handle of a job accepted by the HAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HalJobHandle(pub u64);

/// Per-picture activity counters reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActivityStats {
    /// Blocks coded intra.
    pub intra_blocks: u32,
    /// Blocks coded as skip.
    pub skip_blocks: u32,
    /// Total blocks in the partition.
    pub total_blocks: u32,
    /// Average quantizer actually used.
    pub average_qp: f32,
}

impl ActivityStats {
    /// Merge counters from another partition of the same picture.
    pub fn merge(&mut self, other: &ActivityStats) {
        let total = self.total_blocks + other.total_blocks;
        if total > 0 {
            self.average_qp = (self.average_qp * self.total_blocks as f32
                + other.average_qp * other.total_blocks as f32)
                / total as f32;
        }
        self.intra_blocks += other.intra_blocks;
        self.skip_blocks += other.skip_blocks;
        self.total_blocks = total;
    }

    /// Fraction of blocks coded as skip.
    pub fn skip_ratio(&self) -> f64 {
        if self.total_blocks == 0 {
            0.0
        } else {
            f64::from(self.skip_blocks) / f64::from(self.total_blocks)
        }
    }
}

/// Costs measured by an analysis (first-pass) job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnalysisFeedback {
    /// Sum of intra prediction cost.
    pub intra_cost: u64,
    /// Sum of inter prediction cost against the previous picture.
    pub inter_cost: u64,
    /// Blocks whose best mode was skip.
    pub skip_blocks: u32,
    /// Blocks analysed.
    pub total_blocks: u32,
    /// Mean motion vector length in quarter pixels.
    pub motion: u32,
}

/// Status record the HAL fills when a job finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFeedback {
    pub status: JobStatus,
    /// Bytes of header partition written by this job.
    pub header_bytes: usize,
    /// Bytes of coded data written by this job.
    pub data_bytes: usize,
    pub activity: ActivityStats,
    /// Present for analysis jobs only.
    pub analysis: Option<AnalysisFeedback>,
}

impl JobFeedback {
    /// Feedback for a job that produced nothing.
    pub fn failed(status: JobStatus) -> Self {
        Self {
            status,
            header_bytes: 0,
            data_bytes: 0,
            activity: ActivityStats::default(),
            analysis: None,
        }
    }

    /// Total bytes written.
    pub fn output_bytes(&self) -> usize {
        self.header_bytes + self.data_bytes
    }
}

/// HAL errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// Device memory exhausted.
    #[error("device memory exhausted: requested {requested}, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    /// Core index out of range.
    #[error("no such core: {0}")]
    InvalidCore(CoreId),

    /// Job handle unknown or already waited.
    #[error("unknown job handle {0}")]
    UnknownHandle(u64),

    /// Address does not belong to a live allocation.
    #[error("invalid bus address {0:#x}")]
    InvalidAddress(u64),

    /// The device needs a reset.
    #[error("device unusable: {0}")]
    DeviceUnusable(String),
}

/// Result type for HAL calls.
pub type HalResult<T> = std::result::Result<T, HalError>;

/// Operations the orchestration core consumes from the OS/device layer.
///
/// Implementations must be callable from the main encode thread and the
/// look-ahead worker thread at the same time.
pub trait Hal: Send + Sync {
    /// Read the product identification.
    fn read_id(&self) -> HwId;

    /// Read the device capabilities.
    fn read_config(&self) -> HwConfig;

    /// Allocate device memory with an initial pending direction.
    fn alloc(&self, size: usize, direction: Direction) -> HalResult<DeviceMemory>;

    /// Free device memory.
    fn free(&self, memory: &DeviceMemory) -> HalResult<()>;

    /// Perform the cache maintenance implied by `direction`.
    fn sync(&self, memory: &DeviceMemory, direction: Direction) -> HalResult<()>;

    /// Copy bytes out of device memory.
    fn read(&self, memory: &DeviceMemory, offset: usize, len: usize) -> HalResult<Vec<u8>>;

    /// Queue a job on a core. Jobs on one core run in submission order.
    fn submit(&self, core: CoreId, job: &JobDescriptor) -> HalResult<HalJobHandle>;

    /// Block until the job finishes or `timeout` elapses.
    fn wait(&self, handle: HalJobHandle, timeout: Duration) -> HalResult<JobFeedback>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_algebra() {
        assert_eq!(
            Direction::HostToDevice.union(Direction::DeviceToHost),
            Direction::Both
        );
        assert_eq!(
            Direction::Both.without(Direction::DeviceToHost),
            Direction::HostToDevice
        );
        assert_eq!(
            Direction::HostToDevice.without(Direction::HostToDevice),
            Direction::None
        );
        assert_eq!(
            Direction::HostToDevice.without(Direction::DeviceToHost),
            Direction::HostToDevice
        );
        assert!(Direction::Both.includes(Direction::DeviceToHost));
        assert!(!Direction::HostToDevice.includes(Direction::DeviceToHost));
    }

    #[test]
    fn test_activity_merge() {
        let mut a = ActivityStats {
            intra_blocks: 2,
            skip_blocks: 4,
            total_blocks: 10,
            average_qp: 20.0,
        };
        a.merge(&ActivityStats {
            intra_blocks: 0,
            skip_blocks: 6,
            total_blocks: 10,
            average_qp: 30.0,
        });
        assert_eq!(a.total_blocks, 20);
        assert_eq!(a.skip_blocks, 10);
        assert!((a.average_qp - 25.0).abs() < 1e-6);
        assert!((a.skip_ratio() - 0.5).abs() < 1e-9);
    }
}
