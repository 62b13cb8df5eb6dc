//! Two-pass look-ahead.
//!
//! Pass 1 runs a reduced-cost analysis of every admitted picture on a worker
//! thread and produces one [`StatisticsRecord`] per picture. Pass 2 (the
//! scheduler and rate controller) may only decide the oldest held picture
//! once records for a window of `depth` pictures starting at it are resolved.
//!
//! The coordinator holds at most `depth + cores` admitted-but-undecided
//! pictures. Admission past that limit is rejected with
//! [`VpuError::BufferFull`]. On end-of-input pass 1 is drained first, then
//! every held picture is released with whatever statistics exist.
//!
//! The worker exchanges only immutable requests and records with the
//! admission path, over a pair of channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::encoder::regs::{JobDescriptor, JobKind, JobRegisters, SlotAddress};
use crate::encoder::resources::{BufferId, BufferKind, SharedResources};
use crate::encoder::{CodingType, Picture, SlotSet, MAX_REFERENCE_SLOTS};
use crate::error::{Result, VpuError};
use crate::hal::{AnalysisFeedback, BusAddress, CoreId, Hal};

/// Scratch bytes per block for an analysis job.
const ANALYSIS_BYTES_PER_BLOCK: usize = 16;

/// First-pass statistics of one picture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticsRecord {
    pub picture_order: u64,
    /// Estimated cost of intra coding.
    pub intra_cost: u64,
    /// Estimated cost of predicting from the previous picture.
    pub inter_cost: u64,
    /// Fraction of blocks expected to be skipped.
    pub skip_ratio: f64,
    /// Average motion vector magnitude.
    pub motion: u32,
}

impl StatisticsRecord {
    pub fn from_feedback(picture_order: u64, feedback: &AnalysisFeedback) -> Self {
        let skip_ratio = if feedback.total_blocks == 0 {
            0.0
        } else {
            f64::from(feedback.skip_blocks) / f64::from(feedback.total_blocks)
        };
        Self {
            picture_order,
            intra_cost: feedback.intra_cost,
            inter_cost: feedback.inter_cost,
            skip_ratio,
            motion: feedback.motion,
        }
    }

    /// Inter cost relative to intra cost.
    pub fn inter_ratio(&self) -> f64 {
        if self.intra_cost == 0 {
            1.0
        } else {
            self.inter_cost as f64 / self.intra_cost as f64
        }
    }
}

/// One picture handed to pass 1.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub picture_order: u64,
    pub picture: Picture,
    /// Registered planes of the picture.
    pub planes: Vec<BufferId>,
}

/// Pass-1 analysis backend.
pub trait FirstPass: Send + 'static {
    /// Analyse one picture. `Ok(None)` means no statistics are available for
    /// it; the picture is then decided with single-pass heuristics.
    fn analyse(&mut self, request: &AnalysisRequest) -> Result<Option<AnalysisFeedback>>;
}

/// Pass 1 on the device: one analysis job per picture.
pub struct HalFirstPass {
    hal: Arc<dyn Hal>,
    resources: Arc<Mutex<SharedResources>>,
    core: CoreId,
    downscale: bool,
    timeout: Duration,
}

impl HalFirstPass {
    pub fn new(
        hal: Arc<dyn Hal>,
        resources: Arc<Mutex<SharedResources>>,
        core: CoreId,
        downscale: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            hal,
            resources,
            core,
            downscale,
            timeout,
        }
    }

    fn registers(&self, request: &AnalysisRequest, scratch: BusAddress, size: usize) -> JobRegisters {
        let picture = &request.picture;
        let mut input = [BusAddress::default(); 3];
        input[0] = picture.luma;
        input[1..].copy_from_slice(&picture.chroma);
        JobRegisters {
            kind: JobKind::Analysis,
            picture_order: request.picture_order,
            coding_type: if request.picture_order == 0 {
                CodingType::Intra
            } else {
                CodingType::Predicted
            },
            qp: 0,
            block_qp_delta: 0,
            width: picture.dimensions.width as u16,
            height: picture.dimensions.height as u16,
            partition_index: 0,
            partition_count: 1,
            first_row: 0,
            row_count: picture.dimensions.height.div_ceil(16) as u16,
            input,
            output: scratch,
            output_size: size as u32,
            list0: SlotSet::EMPTY,
            list1: SlotSet::EMPTY,
            refresh: SlotSet::EMPTY,
            write_header: false,
            downscale: self.downscale,
            target_bits: 0,
            recon: SlotAddress::default(),
            slots: [SlotAddress::default(); MAX_REFERENCE_SLOTS],
        }
    }
}

impl FirstPass for HalFirstPass {
    fn analyse(&mut self, request: &AnalysisRequest) -> Result<Option<AnalysisFeedback>> {
        let size = request.picture.dimensions.blocks() as usize * ANALYSIS_BYTES_PER_BLOCK;
        let (scratch, bus) = {
            let mut resources = self.resources.lock();
            for plane in &request.planes {
                resources.pool.sync_for_device(*plane)?;
            }
            let scratch = resources.pool.acquire(BufferKind::Analysis, size)?;
            let bus = resources
                .pool
                .get(scratch)
                .map(|b| b.memory.bus)
                .ok_or(VpuError::UnknownBuffer(scratch.0))?;
            (scratch, bus)
        };

        let descriptor = JobDescriptor::new(self.core, &self.registers(request, bus, size));
        let outcome = self
            .hal
            .submit(self.core, &descriptor)
            .and_then(|handle| self.hal.wait(handle, self.timeout));

        self.resources.lock().pool.release(scratch)?;
        let feedback = outcome?;
        if !feedback.status.is_ok() {
            warn!(
                "Analysis of picture {} failed: {:?}",
                request.picture_order, feedback.status
            );
            return Ok(None);
        }
        Ok(feedback.analysis)
    }
}

enum WorkerResult {
    Record(StatisticsRecord),
    Missing(u64),
    /// The worker stopped after a fatal error.
    Failed(u64, String),
}

fn spawn_worker<F: FirstPass>(
    mut pass: F,
    requests: Receiver<AnalysisRequest>,
    results: Sender<WorkerResult>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("vpuflow-lookahead".to_string())
        .spawn(move || {
            for request in requests.iter() {
                let order = request.picture_order;
                let result = match pass.analyse(&request) {
                    Ok(Some(feedback)) => {
                        WorkerResult::Record(StatisticsRecord::from_feedback(order, &feedback))
                    }
                    Ok(None) => WorkerResult::Missing(order),
                    Err(err) if err.is_fatal() => WorkerResult::Failed(order, err.to_string()),
                    Err(err) => {
                        warn!("Analysis of picture {} failed: {}", order, err);
                        WorkerResult::Missing(order)
                    }
                };
                let fatal = matches!(result, WorkerResult::Failed(..));
                if results.send(result).is_err() || fatal {
                    break;
                }
            }
            debug!("Look-ahead worker exiting");
        })
}

/// Statistics records waiting to be consumed, indexed by picture order.
#[derive(Debug)]
pub struct StatsRing {
    slots: Vec<Option<StatisticsRecord>>,
}

impl StatsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    fn index(&self, picture_order: u64) -> usize {
        (picture_order % self.slots.len() as u64) as usize
    }

    /// Store a record. Returns false if its slot is still occupied.
    pub fn insert(&mut self, record: StatisticsRecord) -> bool {
        let index = self.index(record.picture_order);
        if self.slots[index].is_some() {
            return false;
        }
        self.slots[index] = Some(record);
        true
    }

    pub fn peek(&self, picture_order: u64) -> Option<&StatisticsRecord> {
        self.slots[self.index(picture_order)]
            .as_ref()
            .filter(|r| r.picture_order == picture_order)
    }

    /// Remove a record for consumption.
    pub fn take(&mut self, picture_order: u64) -> Option<StatisticsRecord> {
        let index = self.index(picture_order);
        match &self.slots[index] {
            Some(r) if r.picture_order == picture_order => self.slots[index].take(),
            _ => None,
        }
    }

    /// Records currently stored.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Waiting,
    Ready,
    Missing,
}

#[derive(Debug)]
struct Held<T> {
    picture_order: u64,
    item: T,
    record: RecordState,
}

/// Picture released to pass 2.
#[derive(Debug)]
pub struct ReleasedPicture<T> {
    pub picture_order: u64,
    pub item: T,
    /// Statistics of this picture, if pass 1 produced them.
    pub stats: Option<StatisticsRecord>,
    /// Statistics of this picture and the held pictures after it, up to the
    /// first picture without a record.
    pub window: Vec<StatisticsRecord>,
}

/// Look-ahead counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookaheadCounters {
    /// Records produced by pass 1.
    pub produced: u64,
    /// Records consumed by pass 2.
    pub consumed: u64,
    /// Pictures released without a record.
    pub missing: u64,
    /// Records produced but not yet consumed.
    pub outstanding: usize,
}

/// Pipeline stage between admission and the scheduler.
pub struct LookaheadCoordinator<T> {
    depth: usize,
    limit: usize,
    timeout: Duration,
    held: VecDeque<Held<T>>,
    ring: StatsRing,
    requests: Option<Sender<AnalysisRequest>>,
    results: Receiver<WorkerResult>,
    worker: Option<JoinHandle<()>>,
    failure: Option<String>,
    produced: u64,
    consumed: u64,
    missing: u64,
}

impl<T> LookaheadCoordinator<T> {
    /// Start the pass-1 worker.
    ///
    /// `timeout` bounds how long [`wait_release`](Self::wait_release) waits
    /// for a record before the picture is decided without it.
    pub fn new<F: FirstPass>(depth: usize, cores: usize, pass: F, timeout: Duration) -> Result<Self> {
        let limit = depth + cores;
        let (request_tx, request_rx) = crossbeam_channel::bounded(limit);
        let (result_tx, result_rx) = crossbeam_channel::bounded(limit);
        let worker = spawn_worker(pass, request_rx, result_tx)
            .map_err(|e| VpuError::Lookahead(format!("failed to start worker: {e}")))?;
        debug!("Look-ahead started: depth {}, limit {}", depth, limit);
        Ok(Self {
            depth: depth.max(1),
            limit,
            timeout,
            held: VecDeque::with_capacity(limit),
            ring: StatsRing::new(limit),
            requests: Some(request_tx),
            results: result_rx,
            worker: Some(worker),
            failure: None,
            produced: 0,
            consumed: 0,
            missing: 0,
        })
    }

    /// Admitted pictures not yet released.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Most pictures held at once.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether another picture can be admitted.
    pub fn has_capacity(&self) -> bool {
        self.held.len() < self.limit
    }

    pub fn counters(&self) -> LookaheadCounters {
        LookaheadCounters {
            produced: self.produced,
            consumed: self.consumed,
            missing: self.missing,
            outstanding: self.ring.live(),
        }
    }

    /// Admit a picture and queue its analysis.
    pub fn admit(&mut self, item: T, request: AnalysisRequest) -> Result<()> {
        if !self.has_capacity() {
            return Err(VpuError::BufferFull {
                held: self.held.len(),
                limit: self.limit,
            });
        }
        let picture_order = request.picture_order;
        let record = match &self.requests {
            Some(requests) if requests.send(request).is_ok() => RecordState::Waiting,
            _ => RecordState::Missing,
        };
        self.held.push_back(Held {
            picture_order,
            item,
            record,
        });
        Ok(())
    }

    /// Release every held picture whose window is resolved, oldest first.
    ///
    /// Never blocks. At the limit with nothing resolved, admission keeps
    /// failing with `BufferFull` until records arrive or
    /// [`wait_release`](Self::wait_release) gives up on them.
    pub fn release(&mut self) -> Result<Vec<ReleasedPicture<T>>> {
        self.collect();
        if let Some(reason) = &self.failure {
            return Err(VpuError::DeviceUnusable(reason.clone()));
        }
        let mut released = Vec::new();
        while self.front_resolved() {
            match self.pop_front() {
                Some(picture) => released.push(picture),
                None => break,
            }
        }
        Ok(released)
    }

    /// Like [`release`](Self::release), but while the coordinator is at its
    /// limit, wait for records until at least one picture is released.
    ///
    /// Records that do not arrive within the timeout are given up and the
    /// window is decided without them.
    pub fn wait_release(&mut self) -> Result<Vec<ReleasedPicture<T>>> {
        loop {
            let released = self.release()?;
            if !released.is_empty() || self.has_capacity() {
                return Ok(released);
            }
            match self.results.recv_timeout(self.timeout) {
                Ok(result) => self.apply(result),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Look-ahead records late, deciding without them");
                    self.give_up_window();
                }
                Err(RecvTimeoutError::Disconnected) => self.give_up_all(),
            }
        }
    }

    /// Drain pass 1, then release every held picture.
    pub fn finish(&mut self) -> Result<Vec<ReleasedPicture<T>>> {
        self.requests = None;
        while self.held.iter().any(|h| h.record == RecordState::Waiting) {
            match self.results.recv_timeout(self.timeout) {
                Ok(result) => self.apply(result),
                Err(_) => break,
            }
        }
        self.give_up_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Look-ahead worker panicked");
            }
        }
        if let Some(reason) = self.failure.take() {
            warn!("Look-ahead stopped early: {}", reason);
        }
        let mut released = Vec::with_capacity(self.held.len());
        while let Some(picture) = self.pop_front() {
            released.push(picture);
        }
        debug!(
            "Look-ahead drained: {} records produced, {} missing",
            self.produced, self.missing
        );
        Ok(released)
    }

    fn collect(&mut self) {
        loop {
            match self.results.try_recv() {
                Ok(result) => self.apply(result),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.give_up_all();
                    return;
                }
            }
        }
    }

    fn apply(&mut self, result: WorkerResult) {
        let (order, record) = match result {
            WorkerResult::Record(record) => (record.picture_order, Some(record)),
            WorkerResult::Missing(order) => (order, None),
            WorkerResult::Failed(order, reason) => {
                self.failure = Some(reason);
                (order, None)
            }
        };
        let Some(held) = self
            .held
            .iter_mut()
            .find(|h| h.picture_order == order && h.record == RecordState::Waiting)
        else {
            // Late result for a picture already decided.
            return;
        };
        match record {
            Some(record) if self.ring.insert(record) => {
                held.record = RecordState::Ready;
                self.produced += 1;
            }
            _ => held.record = RecordState::Missing,
        }
    }

    fn front_resolved(&self) -> bool {
        !self.held.is_empty()
            && self
                .held
                .iter()
                .take(self.depth)
                .all(|h| h.record != RecordState::Waiting)
            && (self.held.len() >= self.depth || self.requests.is_none())
    }

    fn give_up_window(&mut self) {
        let depth = self.depth;
        for held in self.held.iter_mut().take(depth) {
            if held.record == RecordState::Waiting {
                held.record = RecordState::Missing;
            }
        }
    }

    fn give_up_all(&mut self) {
        for held in self.held.iter_mut() {
            if held.record == RecordState::Waiting {
                held.record = RecordState::Missing;
            }
        }
    }

    fn pop_front(&mut self) -> Option<ReleasedPicture<T>> {
        let front = self.held.pop_front()?;
        let stats = match front.record {
            RecordState::Ready => self.ring.take(front.picture_order),
            RecordState::Waiting | RecordState::Missing => None,
        };
        match stats {
            Some(_) => self.consumed += 1,
            None => self.missing += 1,
        }
        let mut window: Vec<StatisticsRecord> = stats.into_iter().collect();
        if stats.is_some() {
            window.extend(
                self.held
                    .iter()
                    .take(self.depth.saturating_sub(1))
                    .map_while(|h| self.ring.peek(h.picture_order).copied()),
            );
        }
        Some(ReleasedPicture {
            picture_order: front.picture_order,
            item: front.item,
            stats,
            window,
        })
    }
}

impl<T> Drop for LookaheadCoordinator<T> {
    fn drop(&mut self) {
        self.requests = None;
        // Unblock a worker waiting to send.
        while self.results.try_recv().is_ok() {}
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Look-ahead worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{ColorFormat, Dimensions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Synthetic pass 1: cost grows with picture order.
    struct Synthetic {
        calls: Arc<AtomicUsize>,
        missing: Option<u64>,
    }

    impl FirstPass for Synthetic {
        fn analyse(&mut self, request: &AnalysisRequest) -> Result<Option<AnalysisFeedback>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.missing == Some(request.picture_order) {
                return Ok(None);
            }
            Ok(Some(AnalysisFeedback {
                intra_cost: 1000,
                inter_cost: 100 + request.picture_order,
                skip_blocks: 10,
                total_blocks: 20,
                motion: 1,
            }))
        }
    }

    fn request(order: u64) -> AnalysisRequest {
        AnalysisRequest {
            picture_order: order,
            picture: Picture::contiguous(
                BusAddress(0x1000 + order * 0x10000),
                Dimensions {
                    width: 64,
                    height: 64,
                },
                ColorFormat::default(),
                order as i64,
                order,
            ),
            planes: Vec::new(),
        }
    }

    fn coordinator(depth: usize, cores: usize, missing: Option<u64>) -> LookaheadCoordinator<u64> {
        let pass = Synthetic {
            calls: Arc::new(AtomicUsize::new(0)),
            missing,
        };
        LookaheadCoordinator::new(depth, cores, pass, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_record_from_feedback() {
        let record = StatisticsRecord::from_feedback(
            3,
            &AnalysisFeedback {
                intra_cost: 200,
                inter_cost: 50,
                skip_blocks: 5,
                total_blocks: 10,
                motion: 2,
            },
        );
        assert_eq!(record.picture_order, 3);
        assert_eq!(record.skip_ratio, 0.5);
        assert_eq!(record.inter_ratio(), 0.25);
    }

    #[test]
    fn test_stats_ring() {
        let mut ring = StatsRing::new(4);
        let record = |order| StatisticsRecord {
            picture_order: order,
            intra_cost: 1,
            inter_cost: 1,
            skip_ratio: 0.0,
            motion: 0,
        };
        assert!(ring.insert(record(1)));
        assert!(!ring.insert(record(5)));
        assert!(ring.peek(5).is_none());
        assert_eq!(ring.take(1).map(|r| r.picture_order), Some(1));
        assert_eq!(ring.live(), 0);
    }

    #[test]
    fn test_back_pressure() {
        let mut lookahead = coordinator(2, 1, None);
        for order in 0..3 {
            lookahead.admit(order, request(order)).unwrap();
        }
        let err = lookahead.admit(3, request(3)).unwrap_err();
        assert!(matches!(err, VpuError::BufferFull { held: 3, limit: 3 }));
        // Releasing makes room again.
        assert!(!lookahead.wait_release().unwrap().is_empty());
        assert!(lookahead.has_capacity());
    }

    /// Pass 1 that analyses a picture only once the gate lets it.
    struct Gated {
        gate: crossbeam_channel::Receiver<()>,
    }

    impl FirstPass for Gated {
        fn analyse(&mut self, _request: &AnalysisRequest) -> Result<Option<AnalysisFeedback>> {
            if self.gate.recv().is_err() {
                return Ok(None);
            }
            Ok(Some(AnalysisFeedback {
                intra_cost: 1000,
                inter_cost: 400,
                skip_blocks: 0,
                total_blocks: 20,
                motion: 0,
            }))
        }
    }

    #[test]
    fn test_release_does_not_wait_for_analysis() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let mut lookahead: LookaheadCoordinator<u64> =
            LookaheadCoordinator::new(1, 1, Gated { gate: gate_rx }, Duration::from_secs(5))
                .unwrap();
        lookahead.admit(0, request(0)).unwrap();
        lookahead.admit(1, request(1)).unwrap();
        assert!(!lookahead.has_capacity());

        let started = std::time::Instant::now();
        assert!(lookahead.release().unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            lookahead.admit(2, request(2)),
            Err(VpuError::BufferFull { held: 2, limit: 2 })
        ));

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        let released = lookahead.wait_release().unwrap();
        assert_eq!(released.first().map(|r| r.item), Some(0));
        assert!(lookahead.has_capacity());
        drop(gate_tx);
        lookahead.finish().unwrap();
    }

    #[test]
    fn test_every_picture_released_once_with_window() {
        let mut lookahead = coordinator(4, 2, None);
        let mut released = Vec::new();
        for order in 0..12u64 {
            lookahead.admit(order, request(order)).unwrap();
            released.extend(lookahead.wait_release().unwrap());
        }
        released.extend(lookahead.finish().unwrap());

        let orders: Vec<u64> = released.iter().map(|r| r.item).collect();
        assert_eq!(orders, (0..12).collect::<Vec<_>>());
        for picture in &released {
            let stats = picture.stats.expect("record for every picture");
            assert_eq!(stats.picture_order, picture.picture_order);
            assert_eq!(picture.window[0], stats);
            assert!(picture.window.len() <= 4);
        }
        // Early pictures saw a full window.
        assert_eq!(released[0].window.len(), 4);
        let counters = lookahead.counters();
        assert_eq!(counters.produced, 12);
        assert_eq!(counters.consumed, 12);
        assert_eq!(counters.outstanding, 0);
    }

    #[test]
    fn test_missing_record_falls_back() {
        let mut lookahead = coordinator(2, 1, Some(1));
        let mut released = Vec::new();
        for order in 0..4u64 {
            lookahead.admit(order, request(order)).unwrap();
            released.extend(lookahead.wait_release().unwrap());
        }
        released.extend(lookahead.finish().unwrap());
        assert_eq!(released.len(), 4);
        assert!(released[1].stats.is_none());
        assert!(released[1].window.is_empty());
        // The window of picture 0 stops at the picture without a record.
        assert_eq!(released[0].window.len(), 1);
        assert_eq!(lookahead.counters().missing, 1);
    }
}
