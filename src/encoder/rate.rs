//! Rate control.
//!
//! Picks a QP and a bit target per picture so the moving average over the
//! window converges on the target bitrate. A first-order complexity model is
//! kept per coding class (`bits * 2^(qp/6)` is roughly constant for a given
//! content), and the target follows a deadbeat rule: the next picture is
//! given whatever brings the window back on budget, counting the targets of
//! pictures still in flight.
//!
//! A leaky bucket tracks overspend. With picture skip enabled, inter pictures
//! are skipped while the bucket is above its threshold.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::encoder::lookahead::StatisticsRecord;
use crate::encoder::{CodingType, PictureCodingPlan, RateControlConfig, RcGranularity};
use crate::hal::ActivityStats;

/// Weight of an intra picture's target relative to the deadbeat share.
const INTRA_TARGET_WEIGHT: f64 = 2.0;

/// Weight of a bi-predicted picture's target.
const BI_TARGET_WEIGHT: f64 = 0.75;

/// Complexity ratio between intra and predicted pictures, used while one of
/// the two has not been measured.
const INTRA_COMPLEXITY_RATIO: f64 = 4.0;

/// Smoothing factor of the complexity estimate.
const COMPLEXITY_SMOOTHING: f64 = 0.5;

/// Smoothing factor of the look-ahead cost average.
const COST_SMOOTHING: f64 = 0.1;

/// Number of QPs kept in [`RcState::qp_history`].
const QP_HISTORY: usize = 64;

/// QP and bit target chosen for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpDecision {
    pub qp: u8,
    pub target_bits: u64,
    /// Per-block QP deviation bound, 0 for picture-level control.
    pub block_qp_delta: u8,
    /// Code this picture as not-coded.
    pub skip: bool,
}

/// Snapshot of the controller for telemetry and tests.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RcState {
    pub total_bits: u64,
    /// Pictures accounted, including skipped ones.
    pub pictures: u64,
    /// Moving-average bitrate over the window, bits per second.
    pub average_bitrate: f64,
    /// Most recent QPs, oldest first.
    pub qp_history: Vec<u8>,
    pub fullness: u64,
    pub buffer_size: u64,
    pub intra_pictures: u64,
    pub skipped: u64,
    pub pictures_since_intra: u64,
    pub last_activity: ActivityStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PictureClass {
    Intra,
    Predicted,
    BiPredicted,
}

impl PictureClass {
    fn of(coding_type: CodingType) -> Self {
        match coding_type {
            CodingType::Intra => PictureClass::Intra,
            CodingType::BiPredicted => PictureClass::BiPredicted,
            CodingType::Predicted | CodingType::NotCoded => PictureClass::Predicted,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Planned {
    class: PictureClass,
    qp: u8,
    target: u64,
    scale: f64,
}

/// Per-picture QP controller.
#[derive(Debug)]
pub struct RateController {
    config: RateControlConfig,
    frame_rate: f64,
    window: usize,
    bits_per_picture: f64,
    /// Normalized complexity per class.
    complexity: [Option<f64>; 3],
    last_qp: [Option<u8>; 3],
    /// Average look-ahead cost per class.
    average_cost: [Option<f64>; 3],
    pending: BTreeMap<u64, Planned>,
    history: VecDeque<u64>,
    qp_history: VecDeque<u8>,
    fullness: u64,
    total_bits: u64,
    pictures: u64,
    intra_pictures: u64,
    skipped: u64,
    pictures_since_intra: u64,
    last_activity: ActivityStats,
}

impl RateController {
    /// Create a controller for a stream at `frame_rate` pictures per second.
    pub fn new(config: &RateControlConfig, frame_rate: f64) -> Self {
        let frame_rate = if frame_rate > 0.0 { frame_rate } else { 1.0 };
        let window = config.effective_window(frame_rate) as usize;
        Self {
            config: config.clone(),
            frame_rate,
            window,
            bits_per_picture: f64::from(config.target_bitrate) / frame_rate,
            complexity: [None; 3],
            last_qp: [None; 3],
            average_cost: [None; 3],
            pending: BTreeMap::new(),
            history: VecDeque::with_capacity(window),
            qp_history: VecDeque::with_capacity(QP_HISTORY),
            fullness: 0,
            total_bits: 0,
            pictures: 0,
            intra_pictures: 0,
            skipped: 0,
            pictures_since_intra: 0,
            last_activity: ActivityStats::default(),
        }
    }

    /// Average bits available per picture.
    pub fn bits_per_picture(&self) -> f64 {
        self.bits_per_picture
    }

    /// Window length in pictures.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Pictures planned but not yet accounted.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn buffer_size(&self) -> u64 {
        (self.window as f64 * self.bits_per_picture) as u64
    }

    fn qp_bounds(&self, class: PictureClass) -> (u8, u8) {
        match class {
            PictureClass::Intra => self.config.intra_qp,
            PictureClass::Predicted | PictureClass::BiPredicted => self.config.inter_qp,
        }
    }

    fn delta_range(&self, class: PictureClass) -> u8 {
        match class {
            PictureClass::Intra => self.config.intra_qp_delta_range,
            PictureClass::Predicted | PictureClass::BiPredicted => {
                self.config.inter_qp_delta_range
            }
        }
    }

    fn deadbeat_target(&self) -> f64 {
        let keep = self.window.saturating_sub(1).saturating_sub(self.pending.len());
        let recent: u64 = self.history.iter().rev().take(keep).sum();
        let counted = self.history.len().min(keep) + self.pending.len();
        let in_flight: u64 = self.pending.values().map(|p| p.target).sum();
        (counted + 1) as f64 * self.bits_per_picture - (recent + in_flight) as f64
    }

    fn estimate(&self, class: PictureClass) -> Option<f64> {
        let intra = self.complexity[PictureClass::Intra.index()];
        let predicted = self.complexity[PictureClass::Predicted.index()];
        match class {
            PictureClass::Intra => intra.or(predicted.map(|x| x * INTRA_COMPLEXITY_RATIO)),
            PictureClass::Predicted => predicted.or(intra.map(|x| x / INTRA_COMPLEXITY_RATIO)),
            PictureClass::BiPredicted => self.complexity[class.index()]
                .or(predicted.map(|x| x * BI_TARGET_WEIGHT))
                .or(intra.map(|x| x / INTRA_COMPLEXITY_RATIO * BI_TARGET_WEIGHT)),
        }
    }

    fn lookahead_scale(&self, class: PictureClass, stats: Option<&StatisticsRecord>) -> f64 {
        let Some(stats) = stats else {
            return 1.0;
        };
        let cost = match class {
            PictureClass::Intra => stats.intra_cost,
            PictureClass::Predicted | PictureClass::BiPredicted => stats.inter_cost,
        } as f64;
        match self.average_cost[class.index()] {
            Some(average) if average > 0.0 => (cost / average).clamp(0.5, 2.0),
            _ => 1.0,
        }
    }

    fn observe_cost(&mut self, class: PictureClass, stats: Option<&StatisticsRecord>) {
        let Some(stats) = stats else {
            return;
        };
        let cost = match class {
            PictureClass::Intra => stats.intra_cost,
            PictureClass::Predicted | PictureClass::BiPredicted => stats.inter_cost,
        } as f64;
        let slot = &mut self.average_cost[class.index()];
        *slot = Some(match *slot {
            Some(average) => average + COST_SMOOTHING * (cost - average),
            None => cost,
        });
    }

    /// Choose QP and target for a picture about to be dispatched.
    pub fn plan(
        &mut self,
        plan: &PictureCodingPlan,
        stats: Option<&StatisticsRecord>,
    ) -> QpDecision {
        let class = PictureClass::of(plan.coding_type);
        let reference_qp = self.last_qp[class.index()].unwrap_or(self.config.initial_qp);

        if plan.coding_type == CodingType::NotCoded {
            return QpDecision {
                qp: reference_qp,
                target_bits: 0,
                block_qp_delta: 0,
                skip: false,
            };
        }

        if self.config.picture_skip
            && class != PictureClass::Intra
            && self.fullness as f64 > self.config.skip_threshold * self.buffer_size() as f64
        {
            debug!(
                "Skipping picture {}: buffer {} of {} bits",
                plan.picture_order,
                self.fullness,
                self.buffer_size()
            );
            return QpDecision {
                qp: reference_qp,
                target_bits: 0,
                block_qp_delta: 0,
                skip: true,
            };
        }

        let weight = match class {
            PictureClass::Intra => INTRA_TARGET_WEIGHT,
            PictureClass::Predicted => 1.0,
            PictureClass::BiPredicted => BI_TARGET_WEIGHT,
        };
        let bpf = self.bits_per_picture;
        let target = (self.deadbeat_target() * weight).clamp(bpf / 4.0, bpf * 4.0);

        let scale = self.lookahead_scale(class, stats);
        self.observe_cost(class, stats);

        let (min_qp, max_qp) = self.qp_bounds(class);
        let qp = match self.estimate(class) {
            Some(complexity) => {
                let modelled = 6.0 * (complexity * scale / target).log2();
                let range = f64::from(self.delta_range(class));
                let reference = f64::from(reference_qp);
                modelled.round().clamp(reference - range, reference + range)
            }
            None => f64::from(self.config.initial_qp),
        };
        let qp = qp.clamp(f64::from(min_qp), f64::from(max_qp)) as u8;

        let block_qp_delta = match self.config.granularity {
            RcGranularity::Picture => 0,
            RcGranularity::Block => self.config.block_qp_delta_range,
        };

        self.last_qp[class.index()] = Some(qp);
        self.pending.insert(
            plan.picture_order,
            Planned {
                class,
                qp,
                target: target as u64,
                scale,
            },
        );
        debug!(
            "RC picture {} {:?}: qp {} target {} bits (scale {:.2})",
            plan.picture_order, plan.coding_type, qp, target as u64, scale
        );
        QpDecision {
            qp,
            target_bits: target as u64,
            block_qp_delta,
            skip: false,
        }
    }

    /// Account the bits actually produced by a picture.
    ///
    /// A failed or not-coded picture is accounted with zero bits.
    pub fn update(&mut self, picture_order: u64, bits: u64, activity: &ActivityStats) {
        let planned = self.pending.remove(&picture_order);
        match planned {
            Some(planned) if bits > 0 => {
                let measured = bits as f64 * 2f64.powf(f64::from(planned.qp) / 6.0) / planned.scale;
                let slot = &mut self.complexity[planned.class.index()];
                *slot = Some(match *slot {
                    Some(x) => x + COMPLEXITY_SMOOTHING * (measured - x),
                    None => measured,
                });
                if self.qp_history.len() == QP_HISTORY {
                    self.qp_history.pop_front();
                }
                self.qp_history.push_back(planned.qp);
                if planned.class == PictureClass::Intra {
                    self.intra_pictures += 1;
                    self.pictures_since_intra = 0;
                } else {
                    self.pictures_since_intra += 1;
                }
            }
            Some(_) => self.pictures_since_intra += 1,
            None if bits > 0 => {
                warn!("Bits reported for unplanned picture {}", picture_order);
                self.pictures_since_intra += 1;
            }
            None => self.pictures_since_intra += 1,
        }

        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(bits);
        self.total_bits += bits;
        self.pictures += 1;
        self.last_activity = *activity;

        let drained = self.bits_per_picture as u64;
        self.fullness = (self.fullness + bits).saturating_sub(drained);
        self.fullness = self.fullness.min(self.buffer_size() * 2);
    }

    /// Account a picture skipped by [`QpDecision::skip`].
    pub fn skipped(&mut self, picture_order: u64) {
        self.skipped += 1;
        self.update(picture_order, 0, &ActivityStats::default());
    }

    /// Moving-average bitrate over the window.
    pub fn average_bitrate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let bits: u64 = self.history.iter().sum();
        bits as f64 / self.history.len() as f64 * self.frame_rate
    }

    pub fn state(&self) -> RcState {
        RcState {
            total_bits: self.total_bits,
            pictures: self.pictures,
            average_bitrate: self.average_bitrate(),
            qp_history: self.qp_history.iter().copied().collect(),
            fullness: self.fullness,
            buffer_size: self.buffer_size(),
            intra_pictures: self.intra_pictures,
            skipped: self.skipped,
            pictures_since_intra: self.pictures_since_intra,
            last_activity: self.last_activity,
        }
    }
}
