//! GOP (Group of Pictures) pattern table.
//!
//! A pattern maps every position within a group to a coding type, temporal
//! layer and the reference slots read and refreshed. Three shapes exist:
//!
//! - Flat: `I P P P ...`, every picture reads and refreshes slot 0.
//! - Hierarchical-P: dyadic temporal layers. Layer `k` below the top refreshes
//!   slot `k`, the top layer is non-reference.
//! - Bi-predicted: anchors alternate between slots 0 and 1, the B pictures in
//!   between read both.
//!
//! The table holds one entry past the end of the group: the continuation
//! picture used when a group is extended instead of closed with an intra.

use crate::encoder::{CodingType, GopConfig, SlotId, SlotSet};

/// Shape of a GOP pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Intra followed by predicted pictures.
    Flat,
    /// Hierarchical-P with `layers` temporal layers.
    Hierarchical { layers: u32 },
    /// `b_frames` bi-predicted pictures between anchors.
    BiPredicted { b_frames: u32 },
}

impl PatternKind {
    /// Pattern shape for a GOP configuration.
    pub fn for_config(config: &GopConfig) -> Self {
        if config.b_frames > 0 {
            PatternKind::BiPredicted {
                b_frames: config.b_frames,
            }
        } else if config.temporal_layers > 1 {
            PatternKind::Hierarchical {
                layers: config.temporal_layers,
            }
        } else {
            PatternKind::Flat
        }
    }

    /// Number of short-term slots the pattern cycles through.
    pub fn short_term_slots(&self) -> u8 {
        match self {
            PatternKind::Flat => 1,
            PatternKind::Hierarchical { layers } => (*layers - 1) as u8,
            PatternKind::BiPredicted { .. } => 2,
        }
    }
}

/// Coding decision for one position in the group.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternEntry {
    pub coding_type: CodingType,
    pub temporal_layer: u8,
    pub list0: Vec<SlotId>,
    pub list1: Vec<SlotId>,
    pub refresh: SlotSet,
    /// Slot of the most recent anchor, read when this picture is coded as a
    /// plain predicted picture instead.
    pub anchor_slot: SlotId,
}

impl PatternEntry {
    fn intra(short_term_slots: u8) -> Self {
        Self {
            coding_type: CodingType::Intra,
            temporal_layer: 0,
            list0: Vec::new(),
            list1: Vec::new(),
            refresh: (0..short_term_slots).collect(),
            anchor_slot: 0,
        }
    }

    fn predicted(read: SlotId, refresh: SlotSet, temporal_layer: u8) -> Self {
        Self {
            coding_type: CodingType::Predicted,
            temporal_layer,
            list0: vec![read],
            list1: Vec::new(),
            refresh,
            anchor_slot: read,
        }
    }

    /// Whether the picture waits for a later anchor before it can be coded.
    pub fn is_held(&self) -> bool {
        self.coding_type == CodingType::BiPredicted
    }
}

/// Precomputed pattern for a group of `length` pictures.
#[derive(Debug, Clone)]
pub struct GopPattern {
    kind: PatternKind,
    length: u32,
    entries: Vec<PatternEntry>,
}

/// Layer of a position in a dyadic pattern with period `period`.
fn layer_of(position: u32, period: u32, layers: u32) -> u32 {
    let r = position % period;
    if r == 0 {
        0
    } else {
        layers - 1 - r.trailing_zeros()
    }
}

impl GopPattern {
    /// Build the pattern of `config` for a group of `length` pictures.
    pub fn new(config: &GopConfig, length: u32) -> Self {
        let kind = PatternKind::for_config(config);
        let length = length.max(1);
        let short_term = kind.short_term_slots();
        let mut entries = Vec::with_capacity(length as usize + 1);
        entries.push(PatternEntry::intra(short_term));

        match kind {
            PatternKind::Flat => {
                for _ in 1..=length {
                    entries.push(PatternEntry::predicted(0, SlotSet::single(0), 0));
                }
            }
            PatternKind::Hierarchical { layers } => {
                let period = 1u32 << (layers - 1);
                for position in 1..=length {
                    let layer = layer_of(position, period, layers);
                    let r = position % period;
                    let reference = if r == 0 {
                        position - period
                    } else {
                        position - (1 << r.trailing_zeros())
                    };
                    let read = layer_of(reference, period, layers) as SlotId;
                    let refresh = if layer < layers - 1 {
                        SlotSet::single(layer as SlotId)
                    } else {
                        SlotSet::EMPTY
                    };
                    entries.push(PatternEntry::predicted(read, refresh, layer as u8));
                }
            }
            PatternKind::BiPredicted { b_frames } => {
                let mini = b_frames + 1;
                let last_anchor = ((length - 1) / mini) * mini;
                let mut anchor = 0u32;
                for position in 1..=length {
                    if position % mini == 0 || position > last_anchor {
                        anchor += 1;
                        entries.push(PatternEntry::predicted(
                            ((anchor - 1) % 2) as SlotId,
                            SlotSet::single((anchor % 2) as SlotId),
                            0,
                        ));
                    } else {
                        let previous = (anchor % 2) as SlotId;
                        entries.push(PatternEntry {
                            coding_type: CodingType::BiPredicted,
                            temporal_layer: 1,
                            list0: vec![previous],
                            list1: vec![((anchor + 1) % 2) as SlotId],
                            refresh: SlotSet::EMPTY,
                            anchor_slot: previous,
                        });
                    }
                }
            }
        }

        Self {
            kind,
            length,
            entries,
        }
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Pictures in the group.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Entry for `position`. Positions at or past the end map to the
    /// continuation entry.
    pub fn entry(&self, position: u32) -> &PatternEntry {
        let index = position.min(self.length) as usize;
        &self.entries[index]
    }
}
