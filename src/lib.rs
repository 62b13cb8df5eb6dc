//! # vpuflow
//!
//! Control plane for multi-core fixed-function video encoders.
//!
//! vpuflow sits between a caller producing raw pictures and a hardware
//! encoder reached through a small [`Hal`] trait. It decides how every
//! picture is coded (GOP structure, reference slots, QP), dispatches one job
//! per tile partition to the encoder cores, and hands back coded packets in
//! output order.
//!
//! ## Features
//!
//! - Fixed and adaptive GOP structures, B-pictures, hierarchical-P temporal
//!   layers and a long-term reference.
//! - Windowed rate control with per-class complexity models and picture skip.
//! - Optional two-pass look-ahead running on a worker thread.
//! - Per-picture tile partitions issued to cores in a configurable order.
//! - Rollback of reference state when a job fails.
//! - [`SimulatedHal`](hal::sim::SimulatedHal), a deterministic software device
//!   for tests and demos.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpuflow::hal::sim::SimulatedHal;
//! use vpuflow::hal::BusAddress;
//! use vpuflow::{ColorFormat, Dimensions, EncodeConfig, Picture, Session};
//!
//! let hal = Arc::new(SimulatedHal::new(2));
//! let config = EncodeConfig::new(320, 240)
//!     .with_gop_size(30)
//!     .with_target_bitrate(1_000_000)
//!     .with_cores(2);
//! let mut session = Session::open(config, hal)?;
//!
//! let dims = Dimensions { width: 320, height: 240 };
//! let frame_size = ColorFormat::Yuv420Planar.frame_size(320, 240) as u64;
//! for i in 0..10u64 {
//!     let picture = Picture::contiguous(
//!         BusAddress(0x0100_0000 + i * frame_size),
//!         dims,
//!         ColorFormat::Yuv420Planar,
//!         i as i64,
//!         i,
//!     );
//!     session.encode(picture)?;
//! }
//! session.flush()?;
//! for packet in session.take_packets() {
//!     println!("picture {}: {} bytes", packet.picture_order, packet.size());
//! }
//! session.close()?;
//! # Ok::<(), vpuflow::VpuError>(())
//! ```

pub mod encoder;
pub mod error;
pub mod hal;

pub use encoder::dispatch::{JobDispatcher, JobHandle};
pub use encoder::lookahead::{LookaheadCoordinator, StatisticsRecord};
pub use encoder::output::{OutputAssembler, Progress, SegmentInfo};
pub use encoder::rate::{QpDecision, RateController, RcState};
pub use encoder::resources::{BufferId, BufferKind, BufferPool};
pub use encoder::scheduler::{CostRatioPolicy, GopScheduler, GopSizePolicy};
pub use encoder::session::{CloseReport, EncodeStatus, Session, SessionState};
pub use encoder::{
    CodingType, ColorFormat, Dimensions, EncodeConfig, GopConfig, JobStatus, OutputPacket,
    Partition, PartitionKind, Picture, PictureCodingPlan, PictureStatistics, RateControlConfig,
    RcGranularity, SlotId, SlotSet,
};
pub use error::{ErrorCategory, Result, VpuError};
pub use hal::{Hal, HalError, HwConfig, HwId};
