//! Caller-facing encode session.
//!
//! A [`Session`] owns every stage of the pipeline for one stream:
//!
//! ```text
//! encode(picture) -> buffer pool -> look-ahead -> GOP scheduler
//!                 -> rate controller -> job dispatcher -> output assembler
//! ```
//!
//! All stages run on the calling thread except pass 1 of the look-ahead,
//! which runs on its own worker. Hardware completion is awaited only when a
//! core or a reference slot is needed by the next picture, or on flush.
//!
//! Errors are reported by the call that discovers them. A hardware fault on
//! one picture is returned as [`VpuError::Hardware`] after the call finished
//! its work; that picture is delivered not-coded and the session continues.
//! Device loss moves the session to [`SessionState::Error`], after which only
//! [`Session::close`] succeeds.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::encoder::dispatch::{Admitted, JobDispatcher, JobHandle, JobOutcome};
use crate::encoder::dpb::SlotState;
use crate::encoder::lookahead::{
    AnalysisRequest, HalFirstPass, LookaheadCoordinator, ReleasedPicture, StatisticsRecord,
};
use crate::encoder::output::{OutputAssembler, PacketCallback, PacketMeta, SegmentCallback};
use crate::encoder::rate::{RateController, RcState};
use crate::encoder::resources::{BufferId, BufferPool, SharedResources};
use crate::encoder::scheduler::{GopScheduler, GopSizePolicy, SchedulerInput};
use crate::encoder::{
    CodingType, EncodeConfig, GopConfig, LtrTag, OutputPacket, Picture, PictureCodingPlan,
    PictureStatistics, RateControlConfig, SlotId, MAX_REFERENCE_SLOTS,
};
use crate::error::{Result, VpuError};
use crate::hal::{ActivityStats, Hal, HwConfig, HwId};

/// Callback receiving per-picture telemetry.
pub type StatisticsCallback = Box<dyn FnMut(&PictureStatistics) + Send>;

/// Result of a successful `encode` or `flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// Nothing left to deliver.
    Ok,
    /// The picture was admitted, no packet is ready yet.
    Enqueued,
    /// This many packets were delivered by the call.
    FrameReady(usize),
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    /// Flushed. Only `close` is meaningful.
    Ended,
    /// The device is unusable. Only `close` succeeds.
    Error,
}

/// Summary returned by [`Session::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseReport {
    pub pictures_admitted: u64,
    pub packets_delivered: u64,
    pub not_coded: u64,
    /// Statistics records produced by pass 1.
    pub records_produced: u64,
    /// Statistics records still held.
    pub records_outstanding: usize,
    /// Buffers still live in the pool after teardown.
    pub live_buffers: usize,
}

/// A picture travelling from the look-ahead through the scheduler.
#[derive(Debug)]
struct Staged {
    admitted: Admitted,
    stats: Option<StatisticsRecord>,
}

/// A decided picture waiting for its slots or a core.
#[derive(Debug)]
struct Ready {
    plan: PictureCodingPlan,
    staged: Staged,
}

/// Encode session over one device.
pub struct Session {
    config: EncodeConfig,
    hw: HwConfig,
    hw_id: HwId,
    resources: Arc<Mutex<SharedResources>>,
    lookahead: Option<LookaheadCoordinator<Admitted>>,
    scheduler: GopScheduler<Staged>,
    rate: RateController,
    dispatcher: JobDispatcher,
    assembler: OutputAssembler,
    statistics_callback: Option<StatisticsCallback>,
    ready: VecDeque<Ready>,
    state: SessionState,
    failure: Option<String>,
    fault: Option<VpuError>,
    next_picture: u64,
    shut_down: bool,
}

impl Session {
    /// Discover the device, validate `config` against it and start the
    /// pipeline.
    pub fn open(config: EncodeConfig, hal: Arc<dyn Hal>) -> Result<Self> {
        let hw_id = hal.read_id();
        let hw = hal.read_config();
        info!(
            "Device {:#010x} v{}.{}: {} cores, max {}x{}, {} reference slots",
            hw_id.product,
            hw_id.major,
            hw_id.minor,
            hw.cores,
            hw.max_width,
            hw.max_height,
            hw.max_reference_slots
        );
        config.validate(&hw)?;

        let slot_count = hw.max_reference_slots.min(MAX_REFERENCE_SLOTS);
        let pool = BufferPool::new(hal.clone(), config.memory_budget);
        let resources = Arc::new(Mutex::new(SharedResources::new(pool, slot_count)));
        let issue_order = config.issue_order();

        let scheduler = GopScheduler::new(&config.gop, config.error_resilience, None);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let dispatcher = JobDispatcher::new(
            hal.clone(),
            resources.clone(),
            issue_order.clone(),
            config.partitions,
            config.job_timeout,
            config.dimensions,
            config.format,
            events_tx,
        )
        .with_ltr_slot(scheduler.ltr_slot());

        let lookahead = if config.lookahead_depth > 0 {
            let core = issue_order.first().copied().unwrap_or_default();
            let pass = HalFirstPass::new(
                hal.clone(),
                resources.clone(),
                core,
                config.lookahead_downscale,
                config.job_timeout,
            );
            Some(LookaheadCoordinator::new(
                config.lookahead_depth as usize,
                config.cores,
                pass,
                config.job_timeout,
            )?)
        } else {
            None
        };

        let rate = RateController::new(&config.rate_control, config.frame_rate());
        info!(
            "Session opened: {}x{} {:?}, {} kbps, GOP {}, look-ahead {}, cores {:?}",
            config.dimensions.width,
            config.dimensions.height,
            config.format,
            config.rate_control.target_bitrate / 1000,
            config.gop.gop_size,
            config.lookahead_depth,
            issue_order
        );

        Ok(Self {
            config,
            hw,
            hw_id,
            resources,
            lookahead,
            scheduler,
            rate,
            dispatcher,
            assembler: OutputAssembler::new(events_rx),
            statistics_callback: None,
            ready: VecDeque::new(),
            state: SessionState::Streaming,
            failure: None,
            fault: None,
            next_picture: 0,
            shut_down: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    /// Capabilities read at open.
    pub fn hw_config(&self) -> &HwConfig {
        &self.hw
    }

    pub fn hw_id(&self) -> HwId {
        self.hw_id
    }

    /// Pictures admitted so far.
    pub fn pictures_admitted(&self) -> u64 {
        self.next_picture
    }

    /// Snapshot of the rate controller.
    pub fn rate_state(&self) -> RcState {
        self.rate.state()
    }

    /// Committed state of a reference slot.
    pub fn slot_state(&self, slot: SlotId) -> Option<SlotState> {
        self.resources.lock().slots.state(slot)
    }

    /// Pictures submitted to the hardware and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Replace the rate-control options. Only valid before the first picture.
    pub fn configure_rate_control(&mut self, rate_control: RateControlConfig) -> Result<()> {
        self.ensure_unstarted("rate control")?;
        let candidate = self.config.clone().with_rate_control(rate_control);
        candidate.validate(&self.hw)?;
        self.rate = RateController::new(&candidate.rate_control, candidate.frame_rate());
        self.config = candidate;
        debug!("Rate control reconfigured");
        Ok(())
    }

    /// Replace the GOP options. Only valid before the first picture.
    pub fn configure_gop(&mut self, gop: GopConfig) -> Result<()> {
        self.ensure_unstarted("GOP structure")?;
        let candidate = self.config.clone().with_gop(gop);
        candidate.validate(&self.hw)?;
        self.scheduler = GopScheduler::new(&candidate.gop, candidate.error_resilience, None);
        self.dispatcher.set_ltr_slot(self.scheduler.ltr_slot());
        self.config = candidate;
        debug!("GOP structure reconfigured");
        Ok(())
    }

    /// Use `policy` to choose adaptive group lengths. Only valid before the
    /// first picture.
    pub fn set_gop_policy(&mut self, policy: Box<dyn GopSizePolicy>) -> Result<()> {
        self.ensure_unstarted("GOP policy")?;
        self.scheduler = GopScheduler::new(
            &self.config.gop,
            self.config.error_resilience,
            Some(policy),
        );
        Ok(())
    }

    /// Deliver packets to `callback` instead of queueing them for
    /// [`take_packets`](Self::take_packets).
    ///
    /// The callback runs on the thread calling `encode`/`flush`, before the
    /// call returns.
    pub fn set_packet_callback<F>(&mut self, callback: F)
    where
        F: FnMut(OutputPacket, crate::encoder::output::Progress) + Send + 'static,
    {
        let callback: PacketCallback = Box::new(callback);
        self.assembler.set_packet_callback(callback);
    }

    /// Report every coded partition as soon as it completes.
    pub fn set_segment_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&crate::encoder::output::SegmentInfo, &crate::encoder::Partition) + Send + 'static,
    {
        let callback: SegmentCallback = Box::new(callback);
        self.assembler.set_segment_callback(callback);
    }

    /// Receive per-picture telemetry.
    pub fn set_statistics_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&PictureStatistics) + Send + 'static,
    {
        self.statistics_callback = Some(Box::new(callback));
    }

    /// Take the packets delivered while no packet callback was set.
    pub fn take_packets(&mut self) -> Vec<OutputPacket> {
        self.assembler.take_packets()
    }

    /// Code the next decided picture as intra.
    pub fn request_intra(&mut self) {
        self.scheduler.request_intra();
    }

    /// Admit one picture.
    ///
    /// `BufferFull` and `OutOfMemory` leave the picture unadmitted; the caller
    /// may retry it, after [`wait_for_capacity`](Self::wait_for_capacity) for
    /// `BufferFull`. A `Hardware` error reports a fault on an earlier or the
    /// current picture; the current picture was admitted and must not be
    /// retried.
    pub fn encode(&mut self, picture: Picture) -> Result<EncodeStatus> {
        self.ensure_streaming()?;
        if picture.dimensions != self.config.dimensions || picture.format != self.config.format {
            return Err(VpuError::InvalidInput(format!(
                "picture {}x{} {:?} does not match session {}x{} {:?}",
                picture.dimensions.width,
                picture.dimensions.height,
                picture.format,
                self.config.dimensions.width,
                self.config.dimensions.height,
                self.config.format
            )));
        }
        if let Err(err) = self.advance_lookahead(false) {
            return Err(self.fail_call(err));
        }
        if let Some(lookahead) = &self.lookahead {
            if !lookahead.has_capacity() {
                let err = VpuError::BufferFull {
                    held: lookahead.held(),
                    limit: lookahead.limit(),
                };
                self.assembler.drain();
                return Err(err);
            }
        }

        let planes = self.resources.lock().pool.admit_picture(&picture)?;
        let picture_order = self.next_picture;
        self.next_picture += 1;
        debug!(
            "Admitted picture {} (correlation {})",
            picture_order, picture.correlation_id
        );

        let released = self.admit(picture_order, Admitted { picture, planes });
        let inputs = match released {
            Ok(inputs) => inputs,
            Err(err) => return Err(self.fail_call(err)),
        };
        for input in inputs {
            match self.scheduler.push(input) {
                Ok(plans) => self.stage(plans),
                Err(err) => return Err(self.fail_call(err)),
            }
        }
        if let Err(err) = self.pump(false) {
            return Err(self.fail_call(err));
        }

        let delivered = self.assembler.drain();
        self.finish_call()?;
        Ok(if delivered > 0 {
            EncodeStatus::FrameReady(delivered)
        } else {
            EncodeStatus::Enqueued
        })
    }

    /// Block until the look-ahead can admit another picture.
    ///
    /// This is the back-off for an `encode` that returned `BufferFull`: it
    /// waits for pass-1 records, deciding without them once they are later
    /// than the job timeout, and pushes the released pictures on to the
    /// hardware.
    pub fn wait_for_capacity(&mut self) -> Result<EncodeStatus> {
        self.ensure_streaming()?;
        if let Err(err) = self.advance_lookahead(true) {
            return Err(self.fail_call(err));
        }
        let delivered = self.assembler.drain();
        self.finish_call()?;
        Ok(if delivered > 0 {
            EncodeStatus::FrameReady(delivered)
        } else {
            EncodeStatus::Ok
        })
    }

    /// Signal end-of-input and drain every admitted picture.
    ///
    /// In-flight jobs are waited to completion. The session is `Ended`
    /// afterwards.
    pub fn flush(&mut self) -> Result<EncodeStatus> {
        match self.state {
            SessionState::Error => return Err(self.unusable()),
            SessionState::Ended => {
                let delivered = self.assembler.drain();
                return Ok(if delivered > 0 {
                    EncodeStatus::FrameReady(delivered)
                } else {
                    EncodeStatus::Ok
                });
            }
            SessionState::Streaming => {}
        }

        debug!("Flushing after {} pictures", self.next_picture);
        let drained = match self.lookahead.as_mut().map(|l| l.finish()) {
            Some(Ok(released)) => released,
            Some(Err(err)) => return Err(self.fail_call(err)),
            None => Vec::new(),
        };
        for picture in drained {
            let input = scheduler_input(picture);
            match self.scheduler.push(input) {
                Ok(plans) => self.stage(plans),
                Err(err) => return Err(self.fail_call(err)),
            }
        }
        let plans = self.scheduler.drain();
        self.stage(plans);
        self.scheduler.finish();

        if let Err(err) = self.pump(true) {
            return Err(self.fail_call(err));
        }
        self.state = SessionState::Ended;

        let delivered = self.assembler.drain();
        info!(
            "Stream ended: {} pictures, {} packets, {} not coded",
            self.next_picture,
            self.assembler.delivered(),
            self.assembler.not_coded()
        );
        self.finish_call()?;
        Ok(if delivered > 0 {
            EncodeStatus::FrameReady(delivered)
        } else {
            EncodeStatus::Ok
        })
    }

    /// Flush if still streaming, then release every device resource.
    pub fn close(mut self) -> Result<CloseReport> {
        if self.state == SessionState::Streaming {
            if let Err(err) = self.flush() {
                warn!("Flush on close reported: {}", err);
            }
        }
        let counters = self.lookahead.as_ref().map(|l| l.counters());
        self.shutdown();
        self.assembler.drain();

        let report = CloseReport {
            pictures_admitted: self.next_picture,
            packets_delivered: self.assembler.delivered(),
            not_coded: self.assembler.not_coded(),
            records_produced: counters.map(|c| c.produced).unwrap_or(0),
            records_outstanding: counters.map(|c| c.outstanding).unwrap_or(0),
            live_buffers: self.resources.lock().pool.live_count(),
        };
        info!("Session closed: {:?}", report);
        Ok(report)
    }

    fn admit(&mut self, picture_order: u64, admitted: Admitted) -> Result<Vec<SchedulerInput<Staged>>> {
        let Some(lookahead) = self.lookahead.as_mut() else {
            let scene_change = admitted.picture.scene_change;
            let staged = Staged {
                admitted,
                stats: None,
            };
            return Ok(vec![
                SchedulerInput::new(picture_order, staged).with_scene_change(scene_change)
            ]);
        };

        let request = AnalysisRequest {
            picture_order,
            picture: admitted.picture.clone(),
            planes: admitted.planes.clone(),
        };
        let planes = admitted.planes.clone();
        if let Err(err) = lookahead.admit(admitted, request) {
            release_buffers(&self.resources, &planes);
            return Err(err);
        }
        Ok(lookahead
            .release()?
            .into_iter()
            .map(scheduler_input)
            .collect())
    }

    /// Hand pictures whose look-ahead window resolved to the scheduler and
    /// dispatch what became ready. With `wait`, block while the look-ahead is
    /// full.
    fn advance_lookahead(&mut self, wait: bool) -> Result<()> {
        let Some(lookahead) = self.lookahead.as_mut() else {
            return Ok(());
        };
        let released = if wait {
            lookahead.wait_release()?
        } else {
            lookahead.release()?
        };
        if released.is_empty() {
            return Ok(());
        }
        for picture in released {
            let plans = self.scheduler.push(scheduler_input(picture))?;
            self.stage(plans);
        }
        self.pump(false)
    }

    fn stage(&mut self, plans: Vec<(PictureCodingPlan, Staged)>) {
        self.ready
            .extend(plans.into_iter().map(|(plan, staged)| Ready { plan, staged }));
    }

    /// Submit decided pictures in coding order, waiting for blocking jobs.
    /// With `drain_all`, wait for every in-flight job afterwards.
    fn pump(&mut self, drain_all: bool) -> Result<()> {
        while let Some(front) = self.ready.front() {
            let coded = front.plan.coding_type.is_coded();
            let blocker = if coded {
                self.dispatcher.blockers(&front.plan).first().copied()
            } else {
                None
            };
            if let Some(handle) = blocker {
                self.complete(handle)?;
                continue;
            }
            if let Some(front) = self.ready.front_mut() {
                if repair_references(&self.resources, &mut self.scheduler, &mut front.plan) {
                    // The refresh set may have grown.
                    continue;
                }
            }
            if coded && !self.dispatcher.has_capacity() {
                match self.dispatcher.oldest() {
                    Some(handle) => {
                        self.complete(handle)?;
                        continue;
                    }
                    None => {
                        return Err(VpuError::InvalidState(
                            "no idle core and nothing in flight".to_string(),
                        ))
                    }
                }
            }
            if let Some(ready) = self.ready.pop_front() {
                self.dispatch(ready)?;
            }
        }
        if drain_all {
            while let Some(handle) = self.dispatcher.oldest() {
                self.complete(handle)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, ready: Ready) -> Result<()> {
        let Ready { mut plan, staged } = ready;
        let Staged { admitted, stats } = staged;
        let decision = self.rate.plan(&plan, stats.as_ref());
        let meta = PacketMeta {
            picture_order: plan.picture_order,
            encode_order: plan.encode_order,
            correlation_id: admitted.picture.correlation_id,
            pts: admitted.picture.pts,
            coding_type: plan.coding_type,
        };

        if decision.skip || !plan.coding_type.is_coded() {
            self.scheduler.on_skipped(&plan);
            plan.downgrade_to_not_coded();
            self.rate.skipped(plan.picture_order);
            release_buffers(&self.resources, &admitted.planes);
            self.assembler.expect_not_coded(meta, decision.qp);
            self.report(&plan, CodingType::NotCoded, decision.qp, 0, ActivityStats::default());
            return Ok(());
        }

        debug!(
            "Dispatching picture {} (coding {}) as {:?}, qp {}",
            plan.picture_order, plan.encode_order, plan.coding_type, decision.qp
        );
        self.assembler.expect(meta);
        match self.dispatcher.submit(&plan, &decision, admitted) {
            Ok(_) => Ok(()),
            Err(err) => {
                if self.dispatcher.is_in_flight(plan.encode_order) {
                    // Failed along with the other in-flight pictures.
                    return Err(err);
                }
                self.assembler.fail(plan.encode_order, decision.qp);
                self.rate.update(plan.picture_order, 0, &ActivityStats::default());
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(
                    "Picture {} not submitted, coded as not-coded: {}",
                    plan.picture_order, err
                );
                self.scheduler.on_refresh_failed(&plan);
                self.report(&plan, CodingType::NotCoded, decision.qp, 0, ActivityStats::default());
                self.record_fault(err);
                Ok(())
            }
        }
    }

    fn complete(&mut self, handle: JobHandle) -> Result<()> {
        let outcome = self.dispatcher.wait(handle)?;
        self.account(outcome);
        Ok(())
    }

    fn account(&mut self, outcome: JobOutcome) {
        let JobOutcome {
            plan,
            status,
            bits,
            activity,
            qp,
            ..
        } = outcome;
        self.rate.update(plan.picture_order, bits, &activity);
        if status.is_ok() {
            self.scheduler.on_refresh_complete(&plan);
            self.report(&plan, plan.coding_type, qp, bits, activity);
        } else {
            self.scheduler.on_refresh_failed(&plan);
            self.report(&plan, CodingType::NotCoded, qp, 0, activity);
            self.record_fault(VpuError::Hardware {
                picture: plan.picture_order,
                status,
            });
        }
    }

    fn report(
        &mut self,
        plan: &PictureCodingPlan,
        coding_type: CodingType,
        qp: u8,
        bits: u64,
        activity: ActivityStats,
    ) {
        let Some(callback) = &mut self.statistics_callback else {
            return;
        };
        callback(&PictureStatistics {
            picture_order: plan.picture_order,
            encode_order: plan.encode_order,
            coding_type,
            qp,
            bits,
            activity,
            average_bitrate: self.rate.average_bitrate(),
        });
    }

    fn record_fault(&mut self, err: VpuError) {
        if self.fault.is_none() {
            self.fault = Some(err);
        }
    }

    /// Return the first picture-level fault of this call, if any.
    fn finish_call(&mut self) -> Result<()> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Turn an error that aborted a call into the value returned by it.
    fn fail_call(&mut self, err: VpuError) -> VpuError {
        self.fault = None;
        if err.is_fatal() {
            self.enter_error(&err);
        }
        err
    }

    /// Fail everything pending after the device became unusable. Every
    /// admitted picture still gets exactly one not-coded packet.
    fn enter_error(&mut self, err: &VpuError) {
        error!("Session entering error state: {}", err);
        self.state = SessionState::Error;
        self.failure = Some(err.to_string());

        let abandoned = self.dispatcher.abandon_all();
        for plan in &abandoned {
            self.scheduler.on_refresh_failed(plan);
        }

        let mut held = Vec::new();
        if let Some(lookahead) = self.lookahead.as_mut() {
            match lookahead.finish() {
                Ok(released) => held = released,
                Err(err) => warn!("Look-ahead drain failed: {}", err),
            }
        }
        for picture in held {
            match self.scheduler.push(scheduler_input(picture)) {
                Ok(plans) => self.stage(plans),
                Err(err) => warn!("Dropping held picture: {}", err),
            }
        }
        let plans = self.scheduler.drain();
        self.stage(plans);
        self.scheduler.finish();

        while let Some(Ready { plan, staged }) = self.ready.pop_front() {
            release_buffers(&self.resources, &staged.admitted.planes);
            let qp = self.rate.plan(&plan, None).qp;
            self.rate.update(plan.picture_order, 0, &ActivityStats::default());
            self.assembler.expect(PacketMeta {
                picture_order: plan.picture_order,
                encode_order: plan.encode_order,
                correlation_id: staged.admitted.picture.correlation_id,
                pts: staged.admitted.picture.pts,
                coding_type: plan.coding_type,
            });
            self.assembler.fail(plan.encode_order, qp);
        }
        self.assembler.drain();
    }

    fn unusable(&self) -> VpuError {
        VpuError::DeviceUnusable(
            self.failure
                .clone()
                .unwrap_or_else(|| "device lost".to_string()),
        )
    }

    fn ensure_streaming(&self) -> Result<()> {
        match self.state {
            SessionState::Streaming => Ok(()),
            SessionState::Ended => Err(VpuError::InvalidState(
                "session has been flushed".to_string(),
            )),
            SessionState::Error => Err(self.unusable()),
        }
    }

    fn ensure_unstarted(&self, what: &str) -> Result<()> {
        self.ensure_streaming()?;
        if self.next_picture > 0 {
            return Err(VpuError::InvalidState(format!(
                "{what} can only be configured before the first picture"
            )));
        }
        Ok(())
    }

    /// Wait out every in-flight job and free reference frames. Idempotent.
    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        while let Some(handle) = self.dispatcher.oldest() {
            match self.dispatcher.wait(handle) {
                Ok(outcome) => self.account(outcome),
                Err(err) => {
                    warn!("Job {} lost during shutdown: {}", handle.0, err);
                    self.dispatcher.abandon_all();
                }
            }
        }
        self.fault = None;
        // Joins the pass-1 worker.
        self.lookahead = None;
        for Ready { staged, .. } in self.ready.drain(..) {
            release_buffers(&self.resources, &staged.admitted.planes);
        }
        self.resources.lock().release_references();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_input(picture: ReleasedPicture<Admitted>) -> SchedulerInput<Staged> {
    let scene_change = picture.item.picture.scene_change;
    SchedulerInput {
        picture_order: picture.picture_order,
        item: Staged {
            admitted: picture.item,
            stats: picture.stats,
        },
        scene_change,
        stats: picture.stats,
        window: picture.window,
    }
}

/// Drop references of an inter `plan` that no completed job ever filled,
/// promoting it to intra when none is left. Returns whether `plan` changed.
fn repair_references(
    resources: &Mutex<SharedResources>,
    scheduler: &mut GopScheduler<Staged>,
    plan: &mut PictureCodingPlan,
) -> bool {
    if !plan.coding_type.is_inter() {
        return false;
    }
    let reads = plan.read_slots();
    let filled = resources.lock().slots.filled(reads);
    if filled == reads {
        return false;
    }
    if filled.is_empty() {
        warn!(
            "Picture {} has no filled reference, coding it as intra",
            plan.picture_order
        );
        scheduler.promote_to_intra(plan);
        return true;
    }
    warn!(
        "Picture {} drops unfilled references {:#04b}",
        plan.picture_order,
        reads.bits() & !filled.bits()
    );
    plan.list0.retain(|slot| filled.contains(*slot));
    plan.list1.retain(|slot| filled.contains(*slot));
    if plan.list0.is_empty() {
        plan.list0 = std::mem::take(&mut plan.list1);
    }
    if plan.list1.is_empty() {
        plan.coding_type = CodingType::Predicted;
    }
    if plan.ltr == Some(LtrTag::Use)
        && scheduler.ltr_slot().is_some_and(|slot| !filled.contains(slot))
    {
        plan.ltr = None;
    }
    true
}

fn release_buffers(resources: &Mutex<SharedResources>, buffers: &[BufferId]) {
    let mut resources = resources.lock();
    for buffer in buffers {
        if let Err(err) = resources.pool.release(*buffer) {
            warn!("Failed to release buffer {}: {}", buffer.0, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{ColorFormat, Dimensions, JobStatus};
    use crate::hal::sim::SimulatedHal;
    use crate::hal::BusAddress;

    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 64;

    fn picture(order: u64) -> Picture {
        let size = ColorFormat::Yuv420Planar.frame_size(WIDTH, HEIGHT);
        Picture::contiguous(
            BusAddress(0x0100_0000 + order * size as u64),
            Dimensions {
                width: WIDTH,
                height: HEIGHT,
            },
            ColorFormat::Yuv420Planar,
            order as i64,
            order,
        )
    }

    fn open(config: EncodeConfig, cores: usize) -> (Arc<SimulatedHal>, Session) {
        let hal = Arc::new(SimulatedHal::new(cores));
        let session = Session::open(config, hal.clone()).unwrap();
        (hal, session)
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let hal = Arc::new(SimulatedHal::new(1));
        let config = EncodeConfig::new(WIDTH, HEIGHT).with_cores(2);
        assert!(matches!(
            Session::open(config, hal),
            Err(VpuError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_encode_flush_close() {
        let (hal, mut session) = open(EncodeConfig::new(WIDTH, HEIGHT).with_gop_size(4), 1);
        for order in 0..6 {
            session.encode(picture(order)).unwrap();
        }
        assert!(matches!(
            session.flush().unwrap(),
            EncodeStatus::FrameReady(_)
        ));
        assert_eq!(session.state(), SessionState::Ended);
        let packets = session.take_packets();
        assert_eq!(packets.len(), 6);
        assert!(packets.windows(2).all(|w| w[0].encode_order < w[1].encode_order));

        assert!(matches!(
            session.encode(picture(6)),
            Err(VpuError::InvalidState(_))
        ));
        let report = session.close().unwrap();
        assert_eq!(report.pictures_admitted, 6);
        assert_eq!(report.packets_delivered, 6);
        assert_eq!(report.live_buffers, 0);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn test_rejects_mismatched_picture() {
        let (_hal, mut session) = open(EncodeConfig::new(WIDTH, HEIGHT), 1);
        let mut pic = picture(0);
        pic.format = ColorFormat::Yuv444Planar;
        assert!(matches!(
            session.encode(pic),
            Err(VpuError::InvalidInput(_))
        ));
        assert_eq!(session.pictures_admitted(), 0);
    }

    #[test]
    fn test_configure_only_before_first_picture() {
        let (_hal, mut session) = open(EncodeConfig::new(WIDTH, HEIGHT), 1);
        session
            .configure_rate_control(RateControlConfig::default().with_target_bitrate(500_000))
            .unwrap();
        assert!(session
            .configure_rate_control(RateControlConfig::default().with_inter_qp(40, 10))
            .is_err());
        session
            .configure_gop(GopConfig::default().with_gop_size(8))
            .unwrap();
        assert_eq!(session.config().gop.gop_size, 8);

        session.encode(picture(0)).unwrap();
        assert!(matches!(
            session.configure_gop(GopConfig::default()),
            Err(VpuError::InvalidState(_))
        ));
    }

    #[test]
    fn test_request_intra() {
        let (_hal, mut session) = open(EncodeConfig::new(WIDTH, HEIGHT).with_gop_size(30), 1);
        session.encode(picture(0)).unwrap();
        session.encode(picture(1)).unwrap();
        session.request_intra();
        session.encode(picture(2)).unwrap();
        session.flush().unwrap();
        let types: Vec<CodingType> = session.take_packets().iter().map(|p| p.coding_type).collect();
        assert_eq!(
            types,
            vec![CodingType::Intra, CodingType::Predicted, CodingType::Intra]
        );
    }

    #[test]
    fn test_hardware_fault_is_reported_once() {
        let (hal, mut session) = open(EncodeConfig::new(WIDTH, HEIGHT).with_gop_size(30), 1);
        hal.fail_picture(1, JobStatus::DataError);
        let mut faults = Vec::new();
        for order in 0..4 {
            if let Err(err) = session.encode(picture(order)) {
                faults.push(err);
            }
        }
        if let Err(err) = session.flush() {
            faults.push(err);
        }
        assert_eq!(faults.len(), 1);
        assert!(matches!(
            faults[0],
            VpuError::Hardware {
                picture: 1,
                status: JobStatus::DataError
            }
        ));
        let packets = session.take_packets();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[1].coding_type, CodingType::NotCoded);
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn test_repair_references() {
        use crate::encoder::dispatch::JobHandle;
        use crate::encoder::SlotSet;

        let hal = Arc::new(SimulatedHal::new(1));
        let pool = BufferPool::new(hal, 0);
        let resources = Mutex::new(SharedResources::new(pool, 3));
        {
            let mut shared = resources.lock();
            shared
                .slots
                .reserve(SlotSet::single(0), SlotSet::EMPTY, JobHandle(1), 0, BufferId(7))
                .unwrap();
            shared.slots.commit(JobHandle(1));
        }
        let mut scheduler: GopScheduler<Staged> =
            GopScheduler::new(&GopConfig::default(), false, None);
        let plan = |coding_type: CodingType, list0: Vec<SlotId>, list1: Vec<SlotId>| PictureCodingPlan {
            picture_order: 4,
            encode_order: 4,
            coding_type,
            temporal_layer: 0,
            list0,
            list1,
            refresh: SlotSet::single(1),
            ltr: None,
            gop_position: 4,
        };

        let mut intact = plan(CodingType::Predicted, vec![0], Vec::new());
        assert!(!repair_references(&resources, &mut scheduler, &mut intact));
        assert_eq!(intact, plan(CodingType::Predicted, vec![0], Vec::new()));

        let mut partial = plan(CodingType::BiPredicted, vec![2], vec![0]);
        assert!(repair_references(&resources, &mut scheduler, &mut partial));
        assert_eq!(partial.coding_type, CodingType::Predicted);
        assert_eq!(partial.list0, vec![0]);
        assert!(partial.list1.is_empty());

        let mut orphan = plan(CodingType::Predicted, vec![1, 2], Vec::new());
        assert!(repair_references(&resources, &mut scheduler, &mut orphan));
        assert_eq!(orphan.coding_type, CodingType::Intra);
        assert!(orphan.read_slots().is_empty());
        assert_eq!(orphan.gop_position, 0);
        assert!(!repair_references(&resources, &mut scheduler, &mut orphan));
    }
}
