//! GOP/reference scheduler.
//!
//! Decides, picture by picture in presentation order, the coding type,
//! temporal layer and reference slots of every picture, and emits
//! [`PictureCodingPlan`]s in coding order.
//!
//! States: `AwaitingFirst` until the first picture, `Steady` while streaming,
//! `Draining` once end-of-input is signalled and `Ended` after the last held
//! picture was released.
//!
//! A group normally opens with an intra picture at every multiple of the
//! intra period. That picture is held until the next picture arrives: if the
//! stream ends first it is coded as a continuation of the running group. A
//! scene-change hint, a requested refresh or (with error resilience) a failed
//! reference refresh opens a new group immediately.
//!
//! In adaptive mode the group length comes from a [`GopSizePolicy`] fed with
//! look-ahead statistics; the policy is swappable without touching the state
//! machine.

use tracing::debug;

use crate::encoder::gop::{GopPattern, PatternEntry, PatternKind};
use crate::encoder::lookahead::StatisticsRecord;
use crate::encoder::reorder::ReorderBuffer;
use crate::encoder::{CodingType, GopConfig, LtrTag, PictureCodingPlan, SlotId, SlotSet};
use crate::error::{Result, VpuError};

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    AwaitingFirst,
    Steady,
    Draining,
    Ended,
}

/// One admitted picture handed to the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerInput<T> {
    /// Presentation order.
    pub picture_order: u64,
    pub item: T,
    /// Caller hint that this picture starts a new scene.
    pub scene_change: bool,
    /// First-pass statistics of this picture, if any.
    pub stats: Option<StatisticsRecord>,
    /// Statistics of this picture and the ones after it.
    pub window: Vec<StatisticsRecord>,
}

impl<T> SchedulerInput<T> {
    /// Input without look-ahead statistics.
    pub fn new(picture_order: u64, item: T) -> Self {
        Self {
            picture_order,
            item,
            scene_change: false,
            stats: None,
            window: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_scene_change(mut self, scene_change: bool) -> Self {
        self.scene_change = scene_change;
        self
    }
}

/// Chooses group lengths from look-ahead statistics.
pub trait GopSizePolicy: Send {
    /// Length of the group opening at `window[0]`, at most `max_length`.
    fn group_length(&mut self, window: &[StatisticsRecord], max_length: u32) -> u32;

    /// Whether `record` shows a scene cut against the previous picture.
    fn is_scene_cut(&self, record: &StatisticsRecord) -> bool;
}

/// Group lengths the default policy picks from.
pub const CANDIDATE_LENGTHS: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Default adaptive policy: compares inter against intra cost.
///
/// Cheap prediction (low inter/intra ratio, many skip blocks) favours long
/// groups, expensive prediction favours frequent intra refresh.
#[derive(Debug, Clone)]
pub struct CostRatioPolicy {
    /// Inter/intra ratio at or above which a picture is a scene cut.
    pub scene_cut_ratio: f64,
    /// Weight of the skip-block ratio in the cost score.
    pub skip_weight: f64,
    /// `(score upper bound, length)` in increasing score order.
    pub thresholds: Vec<(f64, u32)>,
    /// Length used when the window carries no usable statistics.
    pub fallback_length: u32,
}

impl Default for CostRatioPolicy {
    fn default() -> Self {
        Self {
            scene_cut_ratio: 0.9,
            skip_weight: 0.5,
            thresholds: vec![(0.15, 32), (0.25, 16), (0.4, 8), (0.6, 4), (0.8, 2)],
            fallback_length: 8,
        }
    }
}

impl CostRatioPolicy {
    fn score(&self, record: &StatisticsRecord) -> f64 {
        record.inter_ratio() * (1.0 - self.skip_weight * record.skip_ratio)
    }
}

fn largest_candidate_within(length: u32, max_length: u32) -> u32 {
    CANDIDATE_LENGTHS
        .iter()
        .copied()
        .filter(|c| *c <= length.min(max_length))
        .max()
        .unwrap_or(1)
}

impl GopSizePolicy for CostRatioPolicy {
    fn group_length(&mut self, window: &[StatisticsRecord], max_length: u32) -> u32 {
        let span: Vec<&StatisticsRecord> = window
            .iter()
            .skip(1)
            .take_while(|r| !self.is_scene_cut(r))
            .collect();
        if span.is_empty() {
            let cut_ahead = window.len() > 1;
            let length = if cut_ahead { 1 } else { self.fallback_length };
            return largest_candidate_within(length, max_length);
        }
        let score = span.iter().map(|r| self.score(r)).sum::<f64>() / span.len() as f64;
        let length = self
            .thresholds
            .iter()
            .find(|(bound, _)| score < *bound)
            .map(|(_, length)| *length)
            .unwrap_or(1);
        largest_candidate_within(length, max_length)
    }

    fn is_scene_cut(&self, record: &StatisticsRecord) -> bool {
        record.inter_ratio() >= self.scene_cut_ratio
    }
}

/// Long-term reference bookkeeping for the dedicated slot.
#[derive(Debug, Clone)]
struct LtrState {
    slot: SlotId,
    interval: u64,
    /// Set while the latest refresh of the slot has not completed.
    needs_update: bool,
    /// The latest refresh failed or was skipped.
    retry: bool,
    last_update: u64,
}

/// Picture decided but not yet released in coding order.
#[derive(Debug)]
struct Decided<T> {
    plan: PictureCodingPlan,
    item: T,
}

/// Periodic intra picture waiting for the stream to continue.
#[derive(Debug)]
struct Opener<T> {
    picture_order: u64,
    item: T,
    window: Vec<StatisticsRecord>,
}

/// GOP/reference scheduler state machine.
pub struct GopScheduler<T> {
    config: GopConfig,
    state: SchedulerState,
    pattern: GopPattern,
    policy: Option<Box<dyn GopSizePolicy>>,
    group_start: u64,
    force_intra: bool,
    error_resilience: bool,
    reorder: ReorderBuffer<Decided<T>>,
    opener: Option<Opener<T>>,
    ltr: Option<LtrState>,
}

impl<T> GopScheduler<T> {
    /// Create a scheduler. Adaptive configurations use `policy`, or
    /// [`CostRatioPolicy`] when none is given.
    pub fn new(
        config: &GopConfig,
        error_resilience: bool,
        policy: Option<Box<dyn GopSizePolicy>>,
    ) -> Self {
        let policy = if config.is_adaptive() {
            Some(policy.unwrap_or_else(|| Box::new(CostRatioPolicy::default())))
        } else {
            None
        };
        let kind = PatternKind::for_config(config);
        let ltr = (config.ltr_interval > 0).then(|| LtrState {
            slot: kind.short_term_slots(),
            interval: u64::from(config.ltr_interval),
            needs_update: true,
            retry: false,
            last_update: 0,
        });
        Self {
            pattern: GopPattern::new(config, config.effective_intra_period().max(1)),
            config: config.clone(),
            state: SchedulerState::AwaitingFirst,
            policy,
            group_start: 0,
            force_intra: false,
            error_resilience,
            reorder: ReorderBuffer::new(config.b_frames as usize),
            opener: None,
            ltr,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Slot used for the long-term reference, when enabled.
    pub fn ltr_slot(&self) -> Option<SlotId> {
        self.ltr.as_ref().map(|l| l.slot)
    }

    /// Pictures held for reordering or waiting to open a group.
    pub fn held(&self) -> usize {
        self.reorder.len() + usize::from(self.opener.is_some())
    }

    /// Length of the group currently running.
    pub fn group_length(&self) -> u32 {
        self.pattern.length()
    }

    /// Force the next decided picture to intra.
    pub fn request_intra(&mut self) {
        self.force_intra = true;
    }

    /// Decide `input`. Returns the plans released by this picture, in coding
    /// order.
    pub fn push(&mut self, input: SchedulerInput<T>) -> Result<Vec<(PictureCodingPlan, T)>> {
        match self.state {
            SchedulerState::Draining | SchedulerState::Ended => {
                return Err(VpuError::InvalidState(format!(
                    "scheduler is {:?}, no more pictures accepted",
                    self.state
                )));
            }
            SchedulerState::AwaitingFirst | SchedulerState::Steady => {}
        }

        let mut released = Vec::new();
        if let Some(opener) = self.opener.take() {
            // The stream continues past the group boundary.
            self.open_group(opener.picture_order, &opener.window);
            let plan = self.intra_plan(opener.picture_order);
            released.push(self.reorder.release(Decided {
                plan,
                item: opener.item,
            }));
        }

        let order = input.picture_order;
        let scene_cut = match (&self.policy, &input.stats) {
            (Some(policy), Some(stats)) => order > 0 && policy.is_scene_cut(stats),
            _ => false,
        };
        let intra = self.state == SchedulerState::AwaitingFirst
            || self.force_intra
            || input.scene_change
            || scene_cut;
        self.state = SchedulerState::Steady;

        if intra {
            debug!(
                "Picture {} opens a group (requested {}, scene change {}, scene cut {})",
                order, self.force_intra, input.scene_change, scene_cut
            );
            self.release_held_as_predicted(&mut released);
            self.open_group(order, &input.window);
            let plan = self.intra_plan(order);
            released.push(self.reorder.release(Decided {
                plan,
                item: input.item,
            }));
            return Ok(self.finish_release(released));
        }

        let position = (order - self.group_start) as u32;
        if position >= self.pattern.length() {
            debug!("Picture {} holds the next group opening", order);
            self.opener = Some(Opener {
                picture_order: order,
                item: input.item,
                window: input.window,
            });
            return Ok(self.finish_release(released));
        }

        let entry = self.pattern.entry(position).clone();
        let mut plan = self.plan_from(&entry, order, position);
        if entry.is_held() {
            match self.reorder.hold(order, Decided { plan, item: input.item }) {
                Ok(()) => return Ok(self.finish_release(released)),
                Err(decided) => {
                    // Hold buffer full; code it without the later anchor.
                    let mut plan = decided.plan;
                    self.to_predicted(&mut plan, entry.anchor_slot);
                    released.push(self.reorder.release(Decided {
                        plan,
                        item: decided.item,
                    }));
                    return Ok(self.finish_release(released));
                }
            }
        }

        self.apply_ltr(&mut plan);
        let decided = Decided {
            plan,
            item: input.item,
        };
        if self.reorder.is_empty() {
            released.push(self.reorder.release(decided));
        } else {
            released.extend(self.reorder.release_with_anchor(decided));
        }
        Ok(self.finish_release(released))
    }

    /// Signal end-of-input. Every held picture is released as a predicted
    /// picture.
    pub fn drain(&mut self) -> Vec<(PictureCodingPlan, T)> {
        if self.state == SchedulerState::Ended {
            return Vec::new();
        }
        self.state = SchedulerState::Draining;
        let mut released = Vec::new();
        self.release_held_as_predicted(&mut released);
        if let Some(opener) = self.opener.take() {
            let position = (opener.picture_order - self.group_start) as u32;
            let entry = self.pattern.entry(position).clone();
            let mut plan = self.plan_from(&entry, opener.picture_order, position);
            self.apply_ltr(&mut plan);
            released.push(self.reorder.release(Decided {
                plan,
                item: opener.item,
            }));
        }
        self.finish_release(released)
    }

    /// Move from `Draining` to `Ended`.
    pub fn finish(&mut self) {
        self.state = SchedulerState::Ended;
    }

    /// The job of `plan` completed and its refresh is visible.
    pub fn on_refresh_complete(&mut self, plan: &PictureCodingPlan) {
        if let Some(ltr) = &mut self.ltr {
            if plan.refresh.contains(ltr.slot) {
                ltr.needs_update = false;
            }
        }
    }

    /// The job of `plan` failed and its refresh was rolled back.
    pub fn on_refresh_failed(&mut self, plan: &PictureCodingPlan) {
        if plan.ltr == Some(LtrTag::Update) {
            if let Some(ltr) = &mut self.ltr {
                ltr.retry = true;
            }
        }
        if plan.coding_type.is_intra() || (self.error_resilience && !plan.refresh.is_empty()) {
            debug!(
                "Refresh by picture {} failed, next picture is intra",
                plan.picture_order
            );
            self.force_intra = true;
        }
    }

    /// Re-plan an already released `plan` as an intra picture, for a picture
    /// whose references were never filled. A picture at or past the running
    /// group start opens a new group.
    pub fn promote_to_intra(&mut self, plan: &mut PictureCodingPlan) {
        let entry = self.pattern.entry(0);
        plan.coding_type = CodingType::Intra;
        plan.temporal_layer = 0;
        plan.list0.clear();
        plan.list1.clear();
        plan.refresh = entry.refresh;
        plan.ltr = None;
        plan.gop_position = 0;
        if let Some(ltr) = &mut self.ltr {
            plan.refresh.insert(ltr.slot);
            plan.ltr = Some(LtrTag::Update);
            ltr.needs_update = true;
            ltr.retry = false;
            ltr.last_update = ltr.last_update.max(plan.picture_order);
        }
        if plan.picture_order >= self.group_start {
            self.group_start = plan.picture_order;
            self.force_intra = false;
        }
        debug!("Picture {} promoted to intra", plan.picture_order);
    }

    /// `plan` was downgraded to not-coded before dispatch.
    pub fn on_skipped(&mut self, plan: &PictureCodingPlan) {
        if plan.ltr == Some(LtrTag::Update) {
            if let Some(ltr) = &mut self.ltr {
                ltr.retry = true;
            }
        }
    }

    fn open_group(&mut self, order: u64, window: &[StatisticsRecord]) {
        let length = match &mut self.policy {
            Some(policy) => {
                let max = self.config.max_adaptive_gop;
                policy.group_length(window, max).clamp(1, max.max(1))
            }
            None => self.config.effective_intra_period().max(1),
        };
        if length != self.pattern.length() {
            self.pattern = GopPattern::new(&self.config, length);
        }
        self.group_start = order;
        self.force_intra = false;
        debug!("Group of {} pictures opens at picture {}", length, order);
    }

    fn intra_plan(&mut self, order: u64) -> PictureCodingPlan {
        let entry = self.pattern.entry(0).clone();
        let mut plan = self.plan_from(&entry, order, 0);
        self.apply_ltr(&mut plan);
        plan
    }

    fn plan_from(&self, entry: &PatternEntry, order: u64, position: u32) -> PictureCodingPlan {
        PictureCodingPlan {
            picture_order: order,
            encode_order: 0,
            coding_type: entry.coding_type,
            temporal_layer: entry.temporal_layer,
            list0: entry.list0.clone(),
            list1: entry.list1.clone(),
            refresh: entry.refresh,
            ltr: None,
            gop_position: position,
        }
    }

    fn to_predicted(&mut self, plan: &mut PictureCodingPlan, anchor_slot: SlotId) {
        plan.coding_type = CodingType::Predicted;
        plan.temporal_layer = 0;
        plan.list0 = vec![anchor_slot];
        plan.list1.clear();
        plan.refresh = SlotSet::single(anchor_slot);
        self.apply_ltr(plan);
    }

    fn release_held_as_predicted(&mut self, released: &mut Vec<(u64, Decided<T>)>) {
        for held in self.reorder.take_held() {
            let mut decided = held.item;
            let anchor_slot = decided.plan.list0.first().copied().unwrap_or(0);
            self.to_predicted(&mut decided.plan, anchor_slot);
            released.push((self.reorder.assign(), decided));
        }
    }

    fn apply_ltr(&mut self, plan: &mut PictureCodingPlan) {
        let Some(ltr) = &mut self.ltr else {
            return;
        };
        let update = match plan.coding_type {
            CodingType::Intra => true,
            CodingType::Predicted if plan.temporal_layer == 0 => {
                ltr.retry || plan.picture_order - ltr.last_update >= ltr.interval
            }
            _ => return,
        };
        if update {
            plan.refresh.insert(ltr.slot);
            plan.ltr = Some(LtrTag::Update);
            ltr.needs_update = true;
            ltr.retry = false;
            ltr.last_update = plan.picture_order;
        } else if !ltr.needs_update {
            plan.list0.push(ltr.slot);
            plan.ltr = Some(LtrTag::Use);
        }
    }

    fn finish_release(&self, released: Vec<(u64, Decided<T>)>) -> Vec<(PictureCodingPlan, T)> {
        released
            .into_iter()
            .map(|(encode_order, decided)| {
                let mut plan = decided.plan;
                plan.encode_order = encode_order;
                debug!(
                    "Picture {} (coding {}): {:?} layer {} list0 {:?} list1 {:?} refresh {:#04b}",
                    plan.picture_order,
                    plan.encode_order,
                    plan.coding_type,
                    plan.temporal_layer,
                    plan.list0,
                    plan.list1,
                    plan.refresh.bits()
                );
                (plan, decided.item)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scheduler: &mut GopScheduler<u64>, count: u64) -> Vec<PictureCodingPlan> {
        let mut plans = Vec::new();
        for order in 0..count {
            for (plan, item) in scheduler.push(SchedulerInput::new(order, order)).unwrap() {
                assert_eq!(plan.picture_order, item);
                plans.push(plan);
            }
        }
        plans.extend(scheduler.drain().into_iter().map(|(plan, _)| plan));
        scheduler.finish();
        plans
    }

    fn record(order: u64, ratio: f64, skip: f64) -> StatisticsRecord {
        StatisticsRecord {
            picture_order: order,
            intra_cost: 1000,
            inter_cost: (1000.0 * ratio) as u64,
            skip_ratio: skip,
            motion: 0,
        }
    }

    fn types(plans: &[PictureCodingPlan]) -> Vec<char> {
        plans
            .iter()
            .map(|p| match p.coding_type {
                CodingType::Intra => 'I',
                CodingType::Predicted => 'P',
                CodingType::BiPredicted => 'B',
                CodingType::NotCoded => 'N',
            })
            .collect()
    }

    #[test]
    fn test_fixed_gop_holds_group_opening() {
        let mut scheduler = GopScheduler::new(&GopConfig::default().with_gop_size(4), false, None);
        assert_eq!(scheduler.state(), SchedulerState::AwaitingFirst);
        for order in 0..4 {
            assert_eq!(scheduler.push(SchedulerInput::new(order, order)).unwrap().len(), 1);
        }
        // Picture 4 waits for the stream to continue.
        assert!(scheduler.push(SchedulerInput::new(4, 4)).unwrap().is_empty());
        assert_eq!(scheduler.held(), 1);
        let released = scheduler.push(SchedulerInput::new(5, 5)).unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].0.coding_type, CodingType::Intra);
        assert_eq!(released[0].0.picture_order, 4);
        assert_eq!(released[1].0.gop_position, 1);
    }

    #[test]
    fn test_fixed_gop_sequence() {
        let mut scheduler = GopScheduler::new(&GopConfig::default().with_gop_size(4), false, None);
        let plans = feed(&mut scheduler, 9);
        assert_eq!(types(&plans).iter().collect::<String>(), "IPPPIPPPP");
        let orders: Vec<u64> = plans.iter().map(|p| p.encode_order).collect();
        assert_eq!(orders, (0..9).collect::<Vec<_>>());
        assert_eq!(scheduler.state(), SchedulerState::Ended);
    }

    #[test]
    fn test_scene_change_and_request_intra() {
        let mut scheduler = GopScheduler::new(&GopConfig::default().with_gop_size(30), false, None);
        scheduler.push(SchedulerInput::new(0, 0)).unwrap();
        scheduler.push(SchedulerInput::new(1, 1)).unwrap();
        let plans = scheduler
            .push(SchedulerInput::new(2, 2).with_scene_change(true))
            .unwrap();
        assert_eq!(plans[0].0.coding_type, CodingType::Intra);
        let plans = scheduler.push(SchedulerInput::new(3, 3)).unwrap();
        assert_eq!(plans[0].0.gop_position, 1);

        scheduler.request_intra();
        let plans = scheduler.push(SchedulerInput::new(4, 4)).unwrap();
        assert_eq!(plans[0].0.coding_type, CodingType::Intra);
        let plans = scheduler.push(SchedulerInput::new(5, 5)).unwrap();
        assert_eq!(plans[0].0.coding_type, CodingType::Predicted);
    }

    #[test]
    fn test_bi_predicted_coding_order() {
        let config = GopConfig::default().with_gop_size(30).with_b_frames(2);
        let mut scheduler = GopScheduler::new(&config, false, None);
        let plans = feed(&mut scheduler, 8);
        let coded: Vec<(u64, char)> = plans
            .iter()
            .map(|p| p.picture_order)
            .zip(types(&plans))
            .collect();
        // 7 has no anchor after it and is drained as a predicted picture.
        assert_eq!(
            coded,
            vec![
                (0, 'I'),
                (3, 'P'),
                (1, 'B'),
                (2, 'B'),
                (6, 'P'),
                (4, 'B'),
                (5, 'B'),
                (7, 'P'),
            ]
        );
        for (i, plan) in plans.iter().enumerate() {
            assert_eq!(plan.encode_order, i as u64);
        }
        let drained = &plans[7];
        assert_eq!(drained.list0, vec![0]);
        assert_eq!(drained.refresh, SlotSet::single(0));
    }

    #[test]
    fn test_scene_change_flushes_held_pictures() {
        let config = GopConfig::default().with_gop_size(30).with_b_frames(2);
        let mut scheduler = GopScheduler::new(&config, false, None);
        scheduler.push(SchedulerInput::new(0, 0)).unwrap();
        assert!(scheduler.push(SchedulerInput::new(1, 1)).unwrap().is_empty());
        let plans = scheduler
            .push(SchedulerInput::new(2, 2).with_scene_change(true))
            .unwrap();
        assert_eq!(types(&plans.iter().map(|p| p.0.clone()).collect::<Vec<_>>()), vec!['P', 'I']);
        assert_eq!(plans[0].0.picture_order, 1);
    }

    #[test]
    fn test_drain_rejects_more_input() {
        let mut scheduler = GopScheduler::new(&GopConfig::default(), false, None);
        scheduler.push(SchedulerInput::new(0, 0)).unwrap();
        scheduler.drain();
        assert_eq!(scheduler.state(), SchedulerState::Draining);
        assert!(matches!(
            scheduler.push(SchedulerInput::new(1, 1)),
            Err(VpuError::InvalidState(_))
        ));
        scheduler.finish();
        assert_eq!(scheduler.state(), SchedulerState::Ended);
    }

    #[test]
    fn test_ltr_schedule() {
        let config = GopConfig::default().with_gop_size(30).with_ltr_interval(3);
        let mut scheduler = GopScheduler::new(&config, false, None);
        assert_eq!(scheduler.ltr_slot(), Some(1));

        let (intra, _) = scheduler.push(SchedulerInput::new(0, 0)).unwrap().remove(0);
        assert_eq!(intra.ltr, Some(LtrTag::Update));
        assert_eq!(intra.refresh, SlotSet::from_bits(0b11));

        // Not usable until the refresh completes.
        let (p1, _) = scheduler.push(SchedulerInput::new(1, 1)).unwrap().remove(0);
        assert_eq!(p1.ltr, None);
        scheduler.on_refresh_complete(&intra);
        let (p2, _) = scheduler.push(SchedulerInput::new(2, 2)).unwrap().remove(0);
        assert_eq!(p2.ltr, Some(LtrTag::Use));
        assert_eq!(p2.list0, vec![0, 1]);

        let (p3, _) = scheduler.push(SchedulerInput::new(3, 3)).unwrap().remove(0);
        assert_eq!(p3.ltr, Some(LtrTag::Update));
        assert!(p3.refresh.contains(1));

        // A failed update is retried on the next predicted picture.
        scheduler.on_refresh_failed(&p3);
        let (p4, _) = scheduler.push(SchedulerInput::new(4, 4)).unwrap().remove(0);
        assert_eq!(p4.ltr, Some(LtrTag::Update));
        scheduler.on_refresh_complete(&p4);
        let (p5, _) = scheduler.push(SchedulerInput::new(5, 5)).unwrap().remove(0);
        assert_eq!(p5.ltr, Some(LtrTag::Use));
    }

    #[test]
    fn test_error_resilience_forces_intra() {
        let config = GopConfig::default().with_gop_size(30);
        let mut scheduler = GopScheduler::new(&config, true, None);
        scheduler.push(SchedulerInput::new(0, 0)).unwrap();
        let (p1, _) = scheduler.push(SchedulerInput::new(1, 1)).unwrap().remove(0);
        scheduler.on_refresh_failed(&p1);
        let (p2, _) = scheduler.push(SchedulerInput::new(2, 2)).unwrap().remove(0);
        assert_eq!(p2.coding_type, CodingType::Intra);

        let mut lenient = GopScheduler::new(&config, false, None);
        lenient.push(SchedulerInput::new(0, 0)).unwrap();
        let (p1, _) = lenient.push(SchedulerInput::new(1, 1)).unwrap().remove(0);
        lenient.on_refresh_failed(&p1);
        let (p2, _) = lenient.push(SchedulerInput::new(2, 2)).unwrap().remove(0);
        assert_eq!(p2.coding_type, CodingType::Predicted);
    }

    #[test]
    fn test_promote_to_intra_restarts_group() {
        let config = GopConfig::default().with_gop_size(4).with_ltr_interval(8);
        let mut scheduler = GopScheduler::new(&config, false, None);
        let (p0, _) = scheduler.push(SchedulerInput::new(0, 0)).unwrap().remove(0);
        scheduler.on_refresh_failed(&p0);
        let (mut p1, _) = scheduler.push(SchedulerInput::new(1, 1)).unwrap().remove(0);
        assert_eq!(p1.coding_type, CodingType::Intra);
        let (mut p2, _) = scheduler.push(SchedulerInput::new(2, 2)).unwrap().remove(0);
        assert_eq!(p2.coding_type, CodingType::Predicted);

        scheduler.promote_to_intra(&mut p2);
        assert_eq!(p2.coding_type, CodingType::Intra);
        assert!(p2.list0.is_empty() && p2.list1.is_empty());
        assert_eq!(p2.gop_position, 0);
        assert_eq!(p2.ltr, Some(LtrTag::Update));
        let ltr = scheduler.ltr_slot().unwrap();
        assert!(p2.refresh.contains(0) && p2.refresh.contains(ltr));

        // The group now runs from picture 2: pictures 3 to 5 continue it and
        // picture 6 opens the next one.
        let plans: Vec<PictureCodingPlan> = (3..6)
            .flat_map(|order| scheduler.push(SchedulerInput::new(order, order)).unwrap())
            .map(|(plan, _)| plan)
            .collect();
        assert_eq!(types(&plans), vec!['P', 'P', 'P']);
        assert_eq!(plans[0].gop_position, 1);

        // An older picture does not move the group start.
        scheduler.promote_to_intra(&mut p1);
        assert!(scheduler.push(SchedulerInput::new(6, 6)).unwrap().is_empty());
        let plans: Vec<PictureCodingPlan> = scheduler
            .push(SchedulerInput::new(7, 7))
            .unwrap()
            .into_iter()
            .map(|(plan, _)| plan)
            .collect();
        assert_eq!(types(&plans), vec!['I', 'P']);
        assert_eq!(plans[0].picture_order, 6);
    }

    #[test]
    fn test_cost_ratio_policy() {
        let mut policy = CostRatioPolicy::default();
        let calm: Vec<_> = (0..8).map(|i| record(i, 0.1, 0.5)).collect();
        let busy: Vec<_> = (0..8).map(|i| record(i, 0.7, 0.0)).collect();
        assert_eq!(policy.group_length(&calm, 32), 32);
        assert_eq!(policy.group_length(&calm, 10), 8);
        assert_eq!(policy.group_length(&busy, 32), 2);
        assert!(policy.is_scene_cut(&record(3, 1.1, 0.0)));
        // A cut right after the opening picture leaves a group of one.
        let cut = vec![record(0, 0.1, 0.0), record(1, 1.2, 0.0)];
        assert_eq!(policy.group_length(&cut, 32), 1);
        assert_eq!(policy.group_length(&[], 32), 8);
    }

    #[test]
    fn test_adaptive_scene_cut_opens_group() {
        let config = GopConfig::default().with_gop_size(0);
        let mut scheduler = GopScheduler::new(&config, false, None);
        let window: Vec<_> = (0..4).map(|i| record(i, 0.1, 0.5)).collect();
        let input = SchedulerInput {
            picture_order: 0,
            item: 0,
            scene_change: false,
            stats: Some(window[0]),
            window: window.clone(),
        };
        scheduler.push(input).unwrap();
        assert_eq!(scheduler.group_length(), 32);

        let input = SchedulerInput {
            picture_order: 1,
            item: 1,
            scene_change: false,
            stats: Some(record(1, 1.5, 0.0)),
            window: vec![record(1, 1.5, 0.0)],
        };
        let (plan, _) = scheduler.push(input).unwrap().remove(0);
        assert_eq!(plan.coding_type, CodingType::Intra);
    }
}
