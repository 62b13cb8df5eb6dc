//! Error types for vpuflow.

use thiserror::Error;

use crate::encoder::{JobStatus, SlotId};
use crate::hal::HalError;

/// Broad class of a [`VpuError`], used to decide how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A buffer or job slot is unavailable. Back off and retry.
    ResourceExhaustion,
    /// A single job failed on the hardware. The session continues.
    HardwareTransient,
    /// Invalid option combination, rejected before streaming.
    Configuration,
    /// The device is unusable. Only `close` is valid afterwards.
    Fatal,
    /// The API was called out of sequence or with bad arguments.
    Usage,
}

/// Main error type for vpuflow operations.
#[derive(Error, Debug)]
pub enum VpuError {
    /// Invalid configuration option or combination of options.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The buffer pool cannot satisfy an allocation.
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Too many pictures admitted without being drained.
    #[error("Buffer full: {held} pictures held, limit is {limit}")]
    BufferFull { held: usize, limit: usize },

    /// A reference slot is being refreshed by an in-flight job.
    #[error("Reference slot {slot} is busy with an in-flight job")]
    SlotBusy { slot: SlotId },

    /// A reference slot was read before any completed job refreshed it.
    #[error("Reference slot {slot} holds no completed reference")]
    ReferenceNotReady { slot: SlotId },

    /// A job for a picture completed with a hardware error.
    #[error("Picture {picture} failed on hardware: {status:?}")]
    Hardware { picture: u64, status: JobStatus },

    /// The device reported itself unusable (reset required).
    #[error("Device unusable: {0}")]
    DeviceUnusable(String),

    /// Invalid input (dimensions, buffer sizes, addresses, etc.).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not valid in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A buffer handle does not name a live buffer.
    #[error("Unknown buffer {0}")]
    UnknownBuffer(u64),

    /// A job handle does not name an in-flight job.
    #[error("Unknown job {0}")]
    UnknownJob(u64),

    /// The first-pass worker stopped unexpectedly.
    #[error("Look-ahead error: {0}")]
    Lookahead(String),

    /// HAL failure that does not map to a more specific variant.
    #[error("HAL error: {0}")]
    Hal(HalError),
}

impl VpuError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            VpuError::OutOfMemory { .. }
            | VpuError::BufferFull { .. }
            | VpuError::SlotBusy { .. }
            | VpuError::ReferenceNotReady { .. } => ErrorCategory::ResourceExhaustion,
            VpuError::Hardware { .. } => ErrorCategory::HardwareTransient,
            VpuError::InvalidConfig(_) => ErrorCategory::Configuration,
            VpuError::DeviceUnusable(_) => ErrorCategory::Fatal,
            VpuError::Hal(HalError::DeviceUnusable(_)) => ErrorCategory::Fatal,
            VpuError::Hal(HalError::OutOfMemory { .. }) => ErrorCategory::ResourceExhaustion,
            VpuError::InvalidInput(_)
            | VpuError::InvalidState(_)
            | VpuError::UnknownBuffer(_)
            | VpuError::UnknownJob(_)
            | VpuError::Lookahead(_)
            | VpuError::Hal(_) => ErrorCategory::Usage,
        }
    }

    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::Fatal | ErrorCategory::Configuration
        )
    }

    /// Whether this error moves the session into its permanent error state.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

impl From<HalError> for VpuError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::DeviceUnusable(reason) => VpuError::DeviceUnusable(reason),
            HalError::OutOfMemory {
                requested,
                available,
            } => VpuError::OutOfMemory {
                requested,
                available,
            },
            other => VpuError::Hal(other),
        }
    }
}

/// Result type for vpuflow operations.
pub type Result<T> = std::result::Result<T, VpuError>;
