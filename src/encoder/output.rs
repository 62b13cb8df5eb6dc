//! Output assembler.
//!
//! Collects the partitions of every picture from [`CompletionEvent`]s and
//! delivers one [`OutputPacket`] per picture, in increasing coding order,
//! exactly once. Completion order across cores and pictures does not matter:
//! a picture that completes early waits here until every picture before it
//! has been delivered.
//!
//! Events are only queued by the dispatcher. They are drained and callbacks
//! run on the thread calling [`OutputAssembler::drain`].

use std::collections::{BTreeMap, VecDeque};

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::encoder::dispatch::CompletionEvent;
use crate::encoder::{CodingType, JobStatus, OutputPacket, Partition, SlotSet};

/// Delivery progress passed with every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Bytes of all partitions of this picture.
    pub cumulative_size: usize,
    /// Partitions completed since the previous packet callback.
    pub count_since_last: usize,
}

/// A partition that has completed, ahead of its picture's packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub picture_order: u64,
    pub encode_order: u64,
    pub index: usize,
    pub count: usize,
}

pub type PacketCallback = Box<dyn FnMut(OutputPacket, Progress) + Send>;
pub type SegmentCallback = Box<dyn FnMut(&SegmentInfo, &Partition) + Send>;

/// Per-picture fields of the packet known at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketMeta {
    pub picture_order: u64,
    pub encode_order: u64,
    pub correlation_id: u64,
    pub pts: i64,
    pub coding_type: CodingType,
}

#[derive(Debug)]
struct Assembly {
    meta: PacketMeta,
    partitions: Vec<Option<Partition>>,
    finished: Option<Finished>,
}

#[derive(Debug, Clone, Copy)]
struct Finished {
    status: JobStatus,
    refreshed: SlotSet,
    qp: u8,
}

/// Joins partitions into packets and delivers them in order.
pub struct OutputAssembler {
    events: Receiver<CompletionEvent>,
    pending: BTreeMap<u64, Assembly>,
    next_output: u64,
    packet_callback: Option<PacketCallback>,
    segment_callback: Option<SegmentCallback>,
    queue: VecDeque<OutputPacket>,
    segments_since_last: usize,
    delivered: u64,
    not_coded: u64,
}

impl OutputAssembler {
    pub fn new(events: Receiver<CompletionEvent>) -> Self {
        Self {
            events,
            pending: BTreeMap::new(),
            next_output: 0,
            packet_callback: None,
            segment_callback: None,
            queue: VecDeque::new(),
            segments_since_last: 0,
            delivered: 0,
            not_coded: 0,
        }
    }

    /// Deliver packets to `callback` instead of the internal queue.
    pub fn set_packet_callback(&mut self, callback: PacketCallback) {
        self.packet_callback = Some(callback);
    }

    /// Report every partition as soon as it completes.
    pub fn set_segment_callback(&mut self, callback: SegmentCallback) {
        self.segment_callback = Some(callback);
    }

    /// Packets delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Not-coded packets delivered so far.
    pub fn not_coded(&self) -> u64 {
        self.not_coded
    }

    /// Pictures expected but not yet delivered.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Register a picture about to be dispatched.
    pub fn expect(&mut self, meta: PacketMeta) {
        let encode_order = meta.encode_order;
        if encode_order < self.next_output || self.pending.contains_key(&encode_order) {
            warn!("Picture with coding order {} expected twice", encode_order);
            return;
        }
        self.pending.insert(
            encode_order,
            Assembly {
                meta,
                partitions: Vec::new(),
                finished: None,
            },
        );
    }

    /// Register a picture that is not dispatched at all.
    pub fn expect_not_coded(&mut self, mut meta: PacketMeta, qp: u8) {
        let encode_order = meta.encode_order;
        meta.coding_type = CodingType::NotCoded;
        self.expect(meta);
        self.finish(encode_order, JobStatus::Ok, SlotSet::EMPTY, qp);
    }

    /// Mark an expected picture as failed before any job ran.
    pub fn fail(&mut self, encode_order: u64, qp: u8) {
        self.finish(encode_order, JobStatus::BusError, SlotSet::EMPTY, qp);
    }

    fn finish(&mut self, encode_order: u64, status: JobStatus, refreshed: SlotSet, qp: u8) {
        match self.pending.get_mut(&encode_order) {
            Some(assembly) if assembly.finished.is_none() => {
                assembly.finished = Some(Finished {
                    status,
                    refreshed,
                    qp,
                });
            }
            _ => warn!("Unexpected completion for coding order {}", encode_order),
        }
    }

    fn apply(&mut self, event: CompletionEvent) {
        match event {
            CompletionEvent::Partition {
                encode_order,
                index,
                count,
                partition,
            } => {
                let Some(assembly) = self.pending.get_mut(&encode_order) else {
                    warn!("Partition for unknown coding order {}", encode_order);
                    return;
                };
                if assembly.partitions.len() < count {
                    assembly.partitions.resize(count, None);
                }
                self.segments_since_last += 1;
                if let Some(callback) = &mut self.segment_callback {
                    let info = SegmentInfo {
                        picture_order: assembly.meta.picture_order,
                        encode_order,
                        index,
                        count,
                    };
                    callback(&info, &partition);
                }
                if let Some(slot) = assembly.partitions.get_mut(index) {
                    *slot = Some(partition);
                }
            }
            CompletionEvent::Finished {
                encode_order,
                status,
                refreshed,
                qp,
            } => self.finish(encode_order, status, refreshed, qp),
        }
    }

    /// Process queued events and deliver every packet that is ready.
    ///
    /// Returns the number of packets delivered by this call.
    pub fn drain(&mut self) -> usize {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }

        let mut delivered = 0;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_output || entry.get().finished.is_none() {
                break;
            }
            let assembly = entry.remove();
            self.deliver(assembly);
            self.next_output += 1;
            delivered += 1;
        }
        delivered
    }

    fn deliver(&mut self, assembly: Assembly) {
        let Some(finished) = assembly.finished else {
            return;
        };
        let meta = assembly.meta;
        let coded = finished.status.is_ok() && meta.coding_type.is_coded();
        let partitions: Vec<Partition> = if coded {
            assembly.partitions.into_iter().flatten().collect()
        } else {
            Vec::new()
        };
        let packet = OutputPacket {
            picture_order: meta.picture_order,
            encode_order: meta.encode_order,
            correlation_id: meta.correlation_id,
            pts: meta.pts,
            coding_type: if coded {
                meta.coding_type
            } else {
                CodingType::NotCoded
            },
            partitions,
            refreshed: finished.refreshed,
            qp: finished.qp,
        };
        if !coded {
            self.not_coded += 1;
        }
        self.delivered += 1;

        let progress = Progress {
            cumulative_size: packet.size(),
            count_since_last: self.segments_since_last,
        };
        self.segments_since_last = 0;
        debug!(
            "Packet for picture {} (coding {}): {:?}, {} bytes",
            packet.picture_order,
            packet.encode_order,
            packet.coding_type,
            progress.cumulative_size
        );
        match &mut self.packet_callback {
            Some(callback) => callback(packet, progress),
            None => self.queue.push_back(packet),
        }
    }

    /// Take the packets queued while no packet callback was registered.
    pub fn take_packets(&mut self) -> Vec<OutputPacket> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::PartitionKind;
    use crossbeam_channel::Sender;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn meta(order: u64, coding_type: CodingType) -> PacketMeta {
        PacketMeta {
            picture_order: order,
            encode_order: order,
            correlation_id: 100 + order,
            pts: order as i64,
            coding_type,
        }
    }

    fn partition(events: &Sender<CompletionEvent>, order: u64, index: usize, count: usize, len: usize) {
        events
            .send(CompletionEvent::Partition {
                encode_order: order,
                index,
                count,
                partition: Partition {
                    kind: if index == 0 {
                        PartitionKind::Header
                    } else {
                        PartitionKind::Data
                    },
                    core: index as u8,
                    data: vec![0; len],
                },
            })
            .unwrap();
    }

    fn finished(events: &Sender<CompletionEvent>, order: u64, status: JobStatus) {
        events
            .send(CompletionEvent::Finished {
                encode_order: order,
                status,
                refreshed: SlotSet::single(0),
                qp: 26,
            })
            .unwrap();
    }

    #[test]
    fn test_delivers_in_coding_order() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut assembler = OutputAssembler::new(rx);
        assembler.expect(meta(0, CodingType::Intra));
        assembler.expect(meta(1, CodingType::Predicted));

        // Picture 1 completes first and waits for picture 0.
        partition(&tx, 1, 0, 1, 10);
        finished(&tx, 1, JobStatus::Ok);
        assert_eq!(assembler.drain(), 0);

        partition(&tx, 0, 1, 2, 5);
        partition(&tx, 0, 0, 2, 7);
        finished(&tx, 0, JobStatus::Ok);
        assert_eq!(assembler.drain(), 2);

        let packets = assembler.take_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].encode_order, 0);
        assert_eq!(packets[0].correlation_id, 100);
        // Partitions are joined in index order.
        assert_eq!(packets[0].partitions[0].kind, PartitionKind::Header);
        assert_eq!(packets[0].size(), 12);
        assert_eq!(packets[1].encode_order, 1);
        assert_eq!(assembler.outstanding(), 0);
    }

    #[test]
    fn test_failed_picture_is_not_coded() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut assembler = OutputAssembler::new(rx);
        assembler.expect(meta(0, CodingType::Predicted));
        finished(&tx, 0, JobStatus::Timeout);
        assembler.expect_not_coded(meta(1, CodingType::Predicted), 30);
        assembler.expect(meta(2, CodingType::Predicted));
        assembler.fail(2, 30);
        assert_eq!(assembler.drain(), 3);

        let packets = assembler.take_packets();
        assert!(packets.iter().all(|p| p.coding_type == CodingType::NotCoded));
        assert!(packets.iter().all(|p| p.partitions.is_empty()));
        assert_eq!(assembler.not_coded(), 3);
        assert_eq!(assembler.delivered(), 3);
    }

    #[test]
    fn test_callbacks_and_progress() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut assembler = OutputAssembler::new(rx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let segments = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            assembler.set_packet_callback(Box::new(move |packet, progress| {
                seen.lock().push((packet.encode_order, progress));
            }));
            let segments = segments.clone();
            assembler.set_segment_callback(Box::new(move |info, partition| {
                segments.lock().push((info.encode_order, info.index, partition.data.len()));
            }));
        }
        assembler.expect(meta(0, CodingType::Intra));
        partition(&tx, 0, 0, 2, 4);
        partition(&tx, 0, 1, 2, 6);
        finished(&tx, 0, JobStatus::Ok);
        assembler.drain();

        assert_eq!(*segments.lock(), vec![(0, 0, 4), (0, 1, 6)]);
        assert_eq!(
            *seen.lock(),
            vec![(
                0,
                Progress {
                    cumulative_size: 10,
                    count_since_last: 2
                }
            )]
        );
        assert!(assembler.take_packets().is_empty());
    }
}
