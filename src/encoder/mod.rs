//! Encoder pipeline types, configuration, and the orchestration stages.
//!
//! This module provides:
//! - Core data model (`Picture`, `PictureCodingPlan`, `OutputPacket`, etc.)
//! - The options record (`EncodeConfig`) with its rate-control and GOP sub-records.
//! - The pipeline stages, leaves first: buffer pool (`resources`), reference
//!   slots (`dpb`), GOP pattern and scheduler (`gop`, `reorder`, `scheduler`),
//!   rate control (`rate`), look-ahead (`lookahead`), job dispatch (`regs`,
//!   `dispatch`), output assembly (`output`) and the caller-facing `session`.

pub mod dispatch;
pub mod dpb;
pub mod gop;
pub mod lookahead;
pub mod output;
pub mod rate;
pub mod regs;
pub mod reorder;
pub mod resources;
pub mod scheduler;
pub mod session;

use std::time::Duration;

use crate::error::{Result, VpuError};
use crate::hal::{CoreId, HwConfig};

// Default encoder configuration constants.

/// Default target bitrate in bits per second (4 Mbps).
pub const DEFAULT_TARGET_BITRATE: u32 = 4_000_000;

/// Default frame rate (frames per second).
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Default GOP (intra period) size.
pub const DEFAULT_GOP_SIZE: u32 = 30;

/// Default initial quantization parameter.
pub const DEFAULT_QP: u8 = 26;

/// Largest quantization parameter the hardware accepts.
pub const MAX_QP: u8 = 51;

/// Default bound on the per-picture QP change for intra pictures.
pub const DEFAULT_INTRA_QP_DELTA_RANGE: u8 = 8;

/// Default bound on the per-picture QP change for inter pictures.
pub const DEFAULT_INTER_QP_DELTA_RANGE: u8 = 4;

/// Default buffer fullness (fraction of the window budget) that triggers picture skip.
pub const DEFAULT_SKIP_THRESHOLD: f64 = 0.8;

/// Default per-job completion timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_millis(500);

/// Number of hardware reference-buffer identities.
pub const MAX_REFERENCE_SLOTS: usize = 8;

/// Minimum look-ahead window when look-ahead is enabled.
pub const MIN_LOOKAHEAD_DEPTH: u32 = 2;

/// Maximum look-ahead window.
pub const MAX_LOOKAHEAD_DEPTH: u32 = 40;

/// Maximum consecutive bi-predicted pictures.
pub const MAX_B_FRAMES: u32 = 7;

/// Maximum temporal layers in the hierarchical pattern.
pub const MAX_TEMPORAL_LAYERS: u32 = 4;

/// Largest group chosen by the adaptive GOP policy.
pub const DEFAULT_MAX_ADAPTIVE_GOP: u32 = 32;

/// Reference slot identity.
pub type SlotId = u8;

/// Raw picture layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    /// YUV 4:2:0, three planes.
    #[default]
    Yuv420Planar,
    /// YUV 4:2:0, luma plane and interleaved chroma plane (NV12).
    Yuv420SemiPlanar,
    /// YUV 4:2:2, three planes.
    Yuv422Planar,
    /// YUV 4:4:4, three planes.
    Yuv444Planar,
}

impl ColorFormat {
    /// Calculate frame size in bytes for given dimensions.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let luma = (width * height) as usize;
        luma + self.chroma_plane_size(width, height) * self.chroma_planes()
    }

    /// Number of chroma planes.
    pub fn chroma_planes(&self) -> usize {
        match self {
            ColorFormat::Yuv420SemiPlanar => 1,
            _ => 2,
        }
    }

    /// Size in bytes of one chroma plane.
    pub fn chroma_plane_size(&self, width: u32, height: u32) -> usize {
        let luma = (width * height) as usize;
        match self {
            ColorFormat::Yuv420Planar => luma / 4,
            ColorFormat::Yuv420SemiPlanar => luma / 2,
            ColorFormat::Yuv422Planar => luma / 2,
            ColorFormat::Yuv444Planar => luma,
        }
    }
}

/// Video dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Number of 16x16 blocks covering the picture.
    pub fn blocks(&self) -> u32 {
        self.width.div_ceil(16) * self.height.div_ceil(16)
    }
}

/// Raw input picture descriptor.
///
/// The planes live in caller memory that is already device-addressable. The
/// descriptor is handed to the session on `encode` and the planes are released
/// once every job that reads them has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    pub dimensions: Dimensions,
    pub format: ColorFormat,
    /// Luma plane bus address.
    pub luma: crate::hal::BusAddress,
    /// Chroma plane bus addresses (second entry unused for semi-planar).
    pub chroma: [crate::hal::BusAddress; 2],
    /// Presentation timestamp.
    pub pts: i64,
    /// Caller-supplied correlation id, echoed on the output packet.
    pub correlation_id: u64,
    /// Caller hint that this picture starts a new scene.
    pub scene_change: bool,
}

impl Picture {
    /// Describe a picture whose planes are laid out contiguously from `base`.
    pub fn contiguous(
        base: crate::hal::BusAddress,
        dimensions: Dimensions,
        format: ColorFormat,
        pts: i64,
        correlation_id: u64,
    ) -> Self {
        let luma_size = (dimensions.width * dimensions.height) as usize;
        let chroma_size = format.chroma_plane_size(dimensions.width, dimensions.height);
        let cb = base.offset(luma_size);
        let cr = if format.chroma_planes() == 2 {
            cb.offset(chroma_size)
        } else {
            cb
        };
        Self {
            dimensions,
            format,
            luma: base,
            chroma: [cb, cr],
            pts,
            correlation_id,
            scene_change: false,
        }
    }

    /// Mark this picture as the first of a new scene.
    #[must_use]
    pub fn with_scene_change(mut self, scene_change: bool) -> Self {
        self.scene_change = scene_change;
        self
    }

    /// Bus ranges `(start, len)` of every plane.
    pub fn plane_ranges(&self) -> Vec<(crate::hal::BusAddress, usize)> {
        let Dimensions { width, height } = self.dimensions;
        let chroma_size = self.format.chroma_plane_size(width, height);
        let mut ranges = vec![(self.luma, (width * height) as usize)];
        ranges.push((self.chroma[0], chroma_size));
        if self.format.chroma_planes() == 2 {
            ranges.push((self.chroma[1], chroma_size));
        }
        ranges
    }
}

/// How a picture is coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodingType {
    /// Intra-coded, no references.
    Intra,
    /// Predicted from list0 references.
    Predicted,
    /// Bi-predicted from list0 and list1 references.
    BiPredicted,
    /// Not coded: a repeat of the previous decoded reference.
    NotCoded,
}

impl CodingType {
    /// Whether this picture is intra.
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::Intra)
    }

    /// Whether this picture uses inter prediction.
    pub fn is_inter(&self) -> bool {
        matches!(self, Self::Predicted | Self::BiPredicted)
    }

    /// Whether the hardware runs a job for this picture.
    pub fn is_coded(&self) -> bool {
        !matches!(self, Self::NotCoded)
    }
}

/// Small set of reference slot ids, stored as a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SlotSet(u8);

impl SlotSet {
    /// Empty set.
    pub const EMPTY: SlotSet = SlotSet(0);

    /// Set from raw bitmap.
    pub fn from_bits(bits: u8) -> Self {
        SlotSet(bits)
    }

    /// Raw bitmap.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Set containing one slot.
    pub fn single(slot: SlotId) -> Self {
        SlotSet(1 << slot)
    }

    pub fn insert(&mut self, slot: SlotId) {
        self.0 |= 1 << slot;
    }

    pub fn remove(&mut self, slot: SlotId) {
        self.0 &= !(1 << slot);
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.0 & (1 << slot) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate slot ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = SlotId> + '_ {
        (0..MAX_REFERENCE_SLOTS as SlotId).filter(move |s| self.contains(*s))
    }
}

impl FromIterator<SlotId> for SlotSet {
    fn from_iter<I: IntoIterator<Item = SlotId>>(iter: I) -> Self {
        let mut set = SlotSet::EMPTY;
        for slot in iter {
            set.insert(slot);
        }
        set
    }
}

/// Long-term reference role of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtrTag {
    /// This picture refreshes the long-term slot.
    Update,
    /// This picture reads the long-term slot.
    Use,
}

/// Per-picture decision record produced by the GOP scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct PictureCodingPlan {
    /// Presentation (picture-order) index.
    pub picture_order: u64,
    /// Coding/output order index.
    pub encode_order: u64,
    pub coding_type: CodingType,
    pub temporal_layer: u8,
    /// Forward references.
    pub list0: Vec<SlotId>,
    /// Backward references.
    pub list1: Vec<SlotId>,
    /// Slots overwritten by this picture once it completes.
    pub refresh: SlotSet,
    pub ltr: Option<LtrTag>,
    /// Position within the current group, 0 for the group's intra picture.
    pub gop_position: u32,
}

impl PictureCodingPlan {
    /// Every slot this picture reads.
    pub fn read_slots(&self) -> SlotSet {
        self.list0.iter().chain(self.list1.iter()).copied().collect()
    }

    /// Downgrade to a not-coded repeat of the previous reference.
    pub fn downgrade_to_not_coded(&mut self) {
        self.coding_type = CodingType::NotCoded;
        self.list0.clear();
        self.list1.clear();
        self.refresh = SlotSet::EMPTY;
        self.ltr = None;
    }
}

/// Completion status of a hardware job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Ok,
    Timeout,
    BusError,
    DataError,
}

impl JobStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Granularity of rate control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RcGranularity {
    /// One QP per picture.
    #[default]
    Picture,
    /// Hardware adjusts QP per block around the picture QP.
    Block,
}

/// Rate-control options.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct RateControlConfig {
    /// Target bitrate in bits per second.
    pub target_bitrate: u32,
    /// Moving-average window in pictures (0 = one second of pictures).
    pub window: u32,
    /// QP bounds for intra pictures.
    pub intra_qp: (u8, u8),
    /// QP bounds for inter pictures.
    pub inter_qp: (u8, u8),
    /// QP of the first picture.
    pub initial_qp: u8,
    /// Largest QP change between consecutive intra decisions.
    pub intra_qp_delta_range: u8,
    /// Largest QP change between consecutive inter decisions.
    pub inter_qp_delta_range: u8,
    /// Whether the controller may skip pictures.
    pub picture_skip: bool,
    /// Buffer fullness fraction above which the next inter picture is skipped.
    pub skip_threshold: f64,
    pub granularity: RcGranularity,
    /// Largest per-block QP deviation at block granularity.
    pub block_qp_delta_range: u8,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            target_bitrate: DEFAULT_TARGET_BITRATE,
            window: 0,
            intra_qp: (0, MAX_QP),
            inter_qp: (0, MAX_QP),
            initial_qp: DEFAULT_QP,
            intra_qp_delta_range: DEFAULT_INTRA_QP_DELTA_RANGE,
            inter_qp_delta_range: DEFAULT_INTER_QP_DELTA_RANGE,
            picture_skip: false,
            skip_threshold: DEFAULT_SKIP_THRESHOLD,
            granularity: RcGranularity::Picture,
            block_qp_delta_range: 3,
        }
    }
}

impl RateControlConfig {
    /// Set the target bitrate.
    pub fn with_target_bitrate(mut self, bitrate: u32) -> Self {
        self.target_bitrate = bitrate;
        self
    }

    /// Set the moving-average window length in pictures.
    pub fn with_window(mut self, pictures: u32) -> Self {
        self.window = pictures;
        self
    }

    /// Set the intra QP bounds.
    pub fn with_intra_qp(mut self, min: u8, max: u8) -> Self {
        self.intra_qp = (min, max);
        self
    }

    /// Set the inter QP bounds.
    pub fn with_inter_qp(mut self, min: u8, max: u8) -> Self {
        self.inter_qp = (min, max);
        self
    }

    /// Set the initial QP.
    pub fn with_initial_qp(mut self, qp: u8) -> Self {
        self.initial_qp = qp;
        self
    }

    /// Set the intra and inter QP delta ranges.
    pub fn with_qp_delta_ranges(mut self, intra: u8, inter: u8) -> Self {
        self.intra_qp_delta_range = intra;
        self.inter_qp_delta_range = inter;
        self
    }

    /// Enable picture skip above `threshold` buffer fullness.
    pub fn with_picture_skip(mut self, threshold: f64) -> Self {
        self.picture_skip = true;
        self.skip_threshold = threshold;
        self
    }

    /// Set the rate-control granularity.
    pub fn with_granularity(mut self, granularity: RcGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Window length resolved against the frame rate.
    pub fn effective_window(&self, frame_rate: f64) -> u32 {
        if self.window == 0 {
            (frame_rate.round() as u32).max(1)
        } else {
            self.window
        }
    }

    fn validate(&self) -> Result<()> {
        if self.target_bitrate == 0 {
            return Err(VpuError::InvalidConfig(
                "target bitrate must be non-zero".to_string(),
            ));
        }
        for (name, (min, max)) in [("intra", self.intra_qp), ("inter", self.inter_qp)] {
            if min > max || max > MAX_QP {
                return Err(VpuError::InvalidConfig(format!(
                    "{name} QP bounds [{min}, {max}] outside [0, {MAX_QP}]"
                )));
            }
        }
        if self.initial_qp > MAX_QP {
            return Err(VpuError::InvalidConfig(format!(
                "initial QP {} above {MAX_QP}",
                self.initial_qp
            )));
        }
        if !(0.0..=1.0).contains(&self.skip_threshold) || self.skip_threshold == 0.0 {
            return Err(VpuError::InvalidConfig(format!(
                "skip threshold {} outside (0, 1]",
                self.skip_threshold
            )));
        }
        Ok(())
    }
}

/// GOP and reference-structure options.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct GopConfig {
    /// Pictures per group (0 = adaptive, requires look-ahead).
    pub gop_size: u32,
    /// Distance between periodic intra pictures (0 = same as `gop_size`).
    pub intra_period: u32,
    /// Consecutive bi-predicted pictures between anchors.
    pub b_frames: u32,
    /// Temporal layers of the hierarchical-P pattern.
    pub temporal_layers: u32,
    /// Long-term reference refresh interval in pictures (0 = disabled).
    pub ltr_interval: u32,
    /// Largest group the adaptive policy may choose.
    pub max_adaptive_gop: u32,
}

impl Default for GopConfig {
    fn default() -> Self {
        Self {
            gop_size: DEFAULT_GOP_SIZE,
            intra_period: 0,
            b_frames: 0,
            temporal_layers: 1,
            ltr_interval: 0,
            max_adaptive_gop: DEFAULT_MAX_ADAPTIVE_GOP,
        }
    }
}

impl GopConfig {
    /// Set the GOP size (0 = adaptive).
    pub fn with_gop_size(mut self, size: u32) -> Self {
        self.gop_size = size;
        self
    }

    /// Set the intra period.
    pub fn with_intra_period(mut self, period: u32) -> Self {
        self.intra_period = period;
        self
    }

    /// Set the number of B-frames.
    pub fn with_b_frames(mut self, count: u32) -> Self {
        self.b_frames = count;
        self
    }

    /// Set the number of temporal layers.
    pub fn with_temporal_layers(mut self, layers: u32) -> Self {
        self.temporal_layers = layers;
        self
    }

    /// Set the long-term reference interval.
    pub fn with_ltr_interval(mut self, interval: u32) -> Self {
        self.ltr_interval = interval;
        self
    }

    /// Whether the group length is chosen from look-ahead statistics.
    pub fn is_adaptive(&self) -> bool {
        self.gop_size == 0
    }

    /// Distance between periodic intra pictures in fixed mode.
    pub fn effective_intra_period(&self) -> u32 {
        if self.intra_period == 0 {
            self.gop_size
        } else {
            self.intra_period
        }
    }

    /// Number of reference slots the pattern needs.
    pub fn slots_needed(&self) -> usize {
        let short_term = if self.b_frames > 0 {
            2
        } else {
            (self.temporal_layers.saturating_sub(1) as usize).max(1)
        };
        short_term + usize::from(self.ltr_interval > 0)
    }

    fn validate(&self, lookahead_depth: u32, slots: usize) -> Result<()> {
        if self.b_frames > MAX_B_FRAMES {
            return Err(VpuError::InvalidConfig(format!(
                "{} B-frames exceeds maximum {MAX_B_FRAMES}",
                self.b_frames
            )));
        }
        if self.temporal_layers == 0 || self.temporal_layers > MAX_TEMPORAL_LAYERS {
            return Err(VpuError::InvalidConfig(format!(
                "temporal layers {} outside [1, {MAX_TEMPORAL_LAYERS}]",
                self.temporal_layers
            )));
        }
        if self.b_frames > 0 && self.temporal_layers > 1 {
            return Err(VpuError::InvalidConfig(
                "B-frames and hierarchical temporal layers are exclusive".to_string(),
            ));
        }
        if self.is_adaptive() {
            if lookahead_depth < MIN_LOOKAHEAD_DEPTH {
                return Err(VpuError::InvalidConfig(
                    "adaptive GOP requires look-ahead depth of at least 2".to_string(),
                ));
            }
            if self.max_adaptive_gop == 0 {
                return Err(VpuError::InvalidConfig(
                    "adaptive GOP maximum must be non-zero".to_string(),
                ));
            }
        } else {
            let mini_gop = self.b_frames + 1;
            let layer_period = 1 << (self.temporal_layers - 1);
            if self.gop_size < mini_gop.max(layer_period) {
                return Err(VpuError::InvalidConfig(format!(
                    "GOP size {} smaller than its reference pattern",
                    self.gop_size
                )));
            }
            if self.gop_size % layer_period != 0 {
                return Err(VpuError::InvalidConfig(format!(
                    "GOP size {} not a multiple of the temporal pattern length {layer_period}",
                    self.gop_size
                )));
            }
        }
        if self.slots_needed() > slots {
            return Err(VpuError::InvalidConfig(format!(
                "pattern needs {} reference slots, hardware has {slots}",
                self.slots_needed()
            )));
        }
        Ok(())
    }
}

/// Encode session options.
#[derive(Debug, Clone)]
#[must_use]
pub struct EncodeConfig {
    /// Video dimensions.
    pub dimensions: Dimensions,
    /// Raw picture layout.
    pub format: ColorFormat,
    /// Frame rate numerator.
    pub frame_rate_numerator: u32,
    /// Frame rate denominator.
    pub frame_rate_denominator: u32,
    pub rate_control: RateControlConfig,
    pub gop: GopConfig,
    /// Look-ahead window in pictures (0 = single pass).
    pub lookahead_depth: u32,
    /// Run the first pass on a half-resolution copy.
    pub lookahead_downscale: bool,
    /// Parallel cores used by the session.
    pub cores: usize,
    /// Tile partitions per picture, each coded on its own core.
    pub partitions: usize,
    /// Issue order of cores (default ascending).
    pub core_order: Option<Vec<CoreId>>,
    /// Force intra after a failed reference refresh.
    pub error_resilience: bool,
    /// Completion timeout per job.
    pub job_timeout: Duration,
    /// Device memory budget for this session in bytes (0 = unlimited).
    pub memory_budget: usize,
}

impl EncodeConfig {
    /// Create a configuration with default settings.
    pub fn new(width: u32, height: u32) -> Self {
        assert!(width > 0, "width must be non-zero");
        assert!(height > 0, "height must be non-zero");

        Self {
            dimensions: Dimensions { width, height },
            format: ColorFormat::Yuv420Planar,
            frame_rate_numerator: DEFAULT_FRAME_RATE,
            frame_rate_denominator: 1,
            rate_control: RateControlConfig::default(),
            gop: GopConfig::default(),
            lookahead_depth: 0,
            lookahead_downscale: false,
            cores: 1,
            partitions: 1,
            core_order: None,
            error_resilience: false,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            memory_budget: 0,
        }
    }

    /// Set the raw picture layout.
    pub fn with_format(mut self, format: ColorFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the frame rate.
    pub fn with_frame_rate(mut self, numerator: u32, denominator: u32) -> Self {
        self.frame_rate_numerator = numerator;
        self.frame_rate_denominator = denominator;
        self
    }

    /// Replace the rate-control options.
    pub fn with_rate_control(mut self, rate_control: RateControlConfig) -> Self {
        self.rate_control = rate_control;
        self
    }

    /// Replace the GOP options.
    pub fn with_gop(mut self, gop: GopConfig) -> Self {
        self.gop = gop;
        self
    }

    /// Set the GOP size (0 = adaptive).
    pub fn with_gop_size(mut self, size: u32) -> Self {
        self.gop.gop_size = size;
        self
    }

    /// Set the target bitrate.
    pub fn with_target_bitrate(mut self, bitrate: u32) -> Self {
        self.rate_control.target_bitrate = bitrate;
        self
    }

    /// Set the look-ahead depth (0 disables the first pass).
    pub fn with_lookahead(mut self, depth: u32) -> Self {
        self.lookahead_depth = depth;
        self
    }

    /// Run the first pass on a downscaled copy.
    pub fn with_lookahead_downscale(mut self, downscale: bool) -> Self {
        self.lookahead_downscale = downscale;
        self
    }

    /// Set the number of parallel cores.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Set the number of tile partitions per picture.
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set an explicit core issue order.
    pub fn with_core_order(mut self, order: Vec<CoreId>) -> Self {
        self.cores = order.len();
        self.core_order = Some(order);
        self
    }

    /// Set the long-term reference interval.
    pub fn with_ltr_interval(mut self, interval: u32) -> Self {
        self.gop.ltr_interval = interval;
        self
    }

    /// Enable or disable error resilience.
    pub fn with_error_resilience(mut self, enable: bool) -> Self {
        self.error_resilience = enable;
        self
    }

    /// Set the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set the device memory budget in bytes.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Frame rate as a floating point value.
    pub fn frame_rate(&self) -> f64 {
        f64::from(self.frame_rate_numerator) / f64::from(self.frame_rate_denominator.max(1))
    }

    /// Core issue order.
    pub fn issue_order(&self) -> Vec<CoreId> {
        match &self.core_order {
            Some(order) => order.clone(),
            None => (0..self.cores as CoreId).collect(),
        }
    }

    /// Pictures the look-ahead may hold admitted but undecided.
    pub fn admission_limit(&self) -> usize {
        self.lookahead_depth as usize + self.cores
    }

    /// Check the options against each other and against the device.
    pub fn validate(&self, hw: &HwConfig) -> Result<()> {
        let Dimensions { width, height } = self.dimensions;
        if width > hw.max_width || height > hw.max_height {
            return Err(VpuError::InvalidConfig(format!(
                "{width}x{height} exceeds device maximum {}x{}",
                hw.max_width, hw.max_height
            )));
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(VpuError::InvalidConfig(format!(
                "{width}x{height} must be even in both dimensions"
            )));
        }
        if self.frame_rate_numerator == 0 || self.frame_rate_denominator == 0 {
            return Err(VpuError::InvalidConfig(
                "frame rate must be non-zero".to_string(),
            ));
        }
        if self.cores == 0 || self.cores > hw.cores {
            return Err(VpuError::InvalidConfig(format!(
                "{} cores requested, device has {}",
                self.cores, hw.cores
            )));
        }
        if self.partitions == 0 || self.partitions > self.cores {
            return Err(VpuError::InvalidConfig(format!(
                "{} partitions per picture with {} cores",
                self.partitions, self.cores
            )));
        }
        if let Some(order) = &self.core_order {
            let mut seen = [false; 256];
            for &core in order {
                if core as usize >= hw.cores || seen[core as usize] {
                    return Err(VpuError::InvalidConfig(format!(
                        "core order {order:?} is not a permutation of device cores"
                    )));
                }
                seen[core as usize] = true;
            }
        }
        if self.lookahead_depth != 0 {
            if !(MIN_LOOKAHEAD_DEPTH..=MAX_LOOKAHEAD_DEPTH).contains(&self.lookahead_depth) {
                return Err(VpuError::InvalidConfig(format!(
                    "look-ahead depth {} outside [{MIN_LOOKAHEAD_DEPTH}, {MAX_LOOKAHEAD_DEPTH}]",
                    self.lookahead_depth
                )));
            }
            if !hw.lookahead {
                return Err(VpuError::InvalidConfig(
                    "device does not support analysis jobs".to_string(),
                ));
            }
        }
        if self.rate_control.granularity == RcGranularity::Block && !hw.block_rate_control {
            return Err(VpuError::InvalidConfig(
                "device does not support block-level rate control".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(VpuError::InvalidConfig(
                "job timeout must be non-zero".to_string(),
            ));
        }
        self.rate_control.validate()?;
        self.gop.validate(
            self.lookahead_depth,
            hw.max_reference_slots.min(MAX_REFERENCE_SLOTS),
        )
    }
}

/// Kind of coded partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Picture/sequence headers.
    Header,
    /// Coded picture data of one tile.
    Data,
}

/// One coded partition of a picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub kind: PartitionKind,
    /// Core that produced this partition.
    pub core: CoreId,
    pub data: Vec<u8>,
}

/// Coded picture delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPacket {
    pub picture_order: u64,
    /// Output order index. Packets are delivered in increasing order.
    pub encode_order: u64,
    pub correlation_id: u64,
    pub pts: i64,
    /// Coding type as realized (`NotCoded` after a skip or a hardware error).
    pub coding_type: CodingType,
    pub partitions: Vec<Partition>,
    /// Reference slots actually refreshed.
    pub refreshed: SlotSet,
    pub qp: u8,
}

impl OutputPacket {
    /// Total coded size in bytes.
    pub fn size(&self) -> usize {
        self.partitions.iter().map(|p| p.data.len()).sum()
    }

    /// Whether this is an intra picture.
    pub fn is_key_frame(&self) -> bool {
        self.coding_type.is_intra()
    }
}

/// Per-picture telemetry handed to the statistics callback.
#[derive(Debug, Clone, PartialEq)]
pub struct PictureStatistics {
    pub picture_order: u64,
    pub encode_order: u64,
    pub coding_type: CodingType,
    pub qp: u8,
    pub bits: u64,
    pub activity: crate::hal::ActivityStats,
    /// Moving-average bitrate after this picture.
    pub average_bitrate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw() -> HwConfig {
        HwConfig {
            cores: 4,
            max_width: 4096,
            max_height: 2304,
            max_reference_slots: MAX_REFERENCE_SLOTS,
            lookahead: true,
            block_rate_control: true,
        }
    }

    // ColorFormat tests.
    mod color_format_tests {
        use super::*;

        #[test]
        fn test_yuv420_frame_size() {
            let size = ColorFormat::Yuv420Planar.frame_size(1920, 1080);
            assert_eq!(size, 1920 * 1080 * 3 / 2);
            let size = ColorFormat::Yuv420SemiPlanar.frame_size(1920, 1080);
            assert_eq!(size, 1920 * 1080 * 3 / 2);
        }

        #[test]
        fn test_yuv444_frame_size() {
            let size = ColorFormat::Yuv444Planar.frame_size(320, 240);
            assert_eq!(size, 320 * 240 * 3);
        }

        #[test]
        fn test_contiguous_picture_planes() {
            let pic = Picture::contiguous(
                crate::hal::BusAddress(0x1000),
                Dimensions {
                    width: 64,
                    height: 32,
                },
                ColorFormat::Yuv420Planar,
                0,
                7,
            );
            let ranges = pic.plane_ranges();
            assert_eq!(ranges.len(), 3);
            assert_eq!(ranges[0], (crate::hal::BusAddress(0x1000), 2048));
            assert_eq!(ranges[1].0, crate::hal::BusAddress(0x1000 + 2048));
            assert_eq!(ranges[2].0, crate::hal::BusAddress(0x1000 + 2048 + 512));
        }
    }

    // SlotSet tests.
    mod slot_set_tests {
        use super::*;

        #[test]
        fn test_insert_remove() {
            let mut set = SlotSet::EMPTY;
            set.insert(0);
            set.insert(7);
            assert_eq!(set.len(), 2);
            assert!(set.contains(7));
            assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 7]);
            set.remove(0);
            assert_eq!(set.bits(), 0x80);
        }

        #[test]
        fn test_plan_read_slots() {
            let plan = PictureCodingPlan {
                picture_order: 3,
                encode_order: 2,
                coding_type: CodingType::BiPredicted,
                temporal_layer: 1,
                list0: vec![0],
                list1: vec![1],
                refresh: SlotSet::EMPTY,
                ltr: None,
                gop_position: 3,
            };
            assert_eq!(plan.read_slots(), SlotSet::from_bits(0b11));
        }
    }

    // EncodeConfig tests.
    mod encode_config_tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = EncodeConfig::new(1920, 1080);
            assert_eq!(config.gop.gop_size, 30);
            assert_eq!(config.rate_control.initial_qp, 26);
            assert_eq!(config.cores, 1);
            assert_eq!(config.rate_control.effective_window(config.frame_rate()), 30);
            assert!(config.validate(&hw()).is_ok());
        }

        #[test]
        fn test_builder_chaining() {
            let config = EncodeConfig::new(1280, 720)
                .with_gop_size(60)
                .with_target_bitrate(2_000_000)
                .with_lookahead(8)
                .with_core_order(vec![1, 0])
                .with_ltr_interval(15);
            assert_eq!(config.gop.gop_size, 60);
            assert_eq!(config.cores, 2);
            assert_eq!(config.issue_order(), vec![1, 0]);
            assert_eq!(config.admission_limit(), 10);
            assert!(config.validate(&hw()).is_ok());
        }

        #[test]
        fn test_rejects_bad_qp_bounds() {
            let config = EncodeConfig::new(640, 480).with_rate_control(
                RateControlConfig::default().with_inter_qp(40, 30),
            );
            assert!(matches!(
                config.validate(&hw()),
                Err(VpuError::InvalidConfig(_))
            ));
            let config = EncodeConfig::new(640, 480)
                .with_rate_control(RateControlConfig::default().with_intra_qp(0, 60));
            assert!(config.validate(&hw()).is_err());
        }

        #[test]
        fn test_rejects_adaptive_without_lookahead() {
            let config = EncodeConfig::new(640, 480).with_gop_size(0);
            assert!(config.validate(&hw()).is_err());
            let config = config.with_lookahead(4);
            assert!(config.validate(&hw()).is_ok());
        }

        #[test]
        fn test_rejects_too_many_cores() {
            let config = EncodeConfig::new(640, 480).with_cores(8);
            assert!(config.validate(&hw()).is_err());
            let config = EncodeConfig::new(640, 480).with_core_order(vec![0, 0]);
            assert!(config.validate(&hw()).is_err());
        }

        #[test]
        fn test_rejects_pattern_conflicts() {
            let gop = GopConfig::default().with_b_frames(2).with_temporal_layers(2);
            let config = EncodeConfig::new(640, 480).with_gop(gop);
            assert!(config.validate(&hw()).is_err());

            let gop = GopConfig::default()
                .with_gop_size(6)
                .with_temporal_layers(3);
            let config = EncodeConfig::new(640, 480).with_gop(gop);
            assert!(config.validate(&hw()).is_err());
        }

        #[test]
        fn test_slots_needed() {
            assert_eq!(GopConfig::default().slots_needed(), 1);
            assert_eq!(GopConfig::default().with_b_frames(2).slots_needed(), 2);
            assert_eq!(
                GopConfig::default()
                    .with_temporal_layers(3)
                    .with_ltr_interval(10)
                    .slots_needed(),
                3
            );
        }
    }
}
