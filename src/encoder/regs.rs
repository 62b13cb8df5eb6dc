//! Job descriptors and their register image.
//!
//! The register image is a flat array of 32-bit words laid out by
//! [`JobRegisters`]. The layout is logical (one field per word or word pair),
//! the HAL translates it for the hardware generation it drives.

use crate::encoder::{CodingType, SlotSet, MAX_REFERENCE_SLOTS};
use crate::hal::{BusAddress, CoreId, JobFeedback};

const REG_KIND: usize = 0;
const REG_PICTURE_ORDER: usize = 1; // 2 words
const REG_CODING_TYPE: usize = 3;
const REG_QP: usize = 4;
const REG_GEOMETRY: usize = 5; // width << 16 | height
const REG_PARTITION: usize = 6; // index << 8 | count
const REG_ROWS: usize = 7; // first block row << 16 | row count
const REG_INPUT: usize = 8; // 3 x 2 words
const REG_OUTPUT: usize = 14; // 2 words
const REG_OUTPUT_SIZE: usize = 16;
const REG_SLOT_MASKS: usize = 17; // list0 | list1 << 8 | refresh << 16
const REG_FLAGS: usize = 18;
const REG_TARGET_BITS: usize = 19;
const REG_RECON: usize = 20; // (frame, table) x 2 words
const REG_SLOT_BASE: usize = 24; // 8 slots x (frame, table) x 2 words

/// Number of words in a register image.
pub const REGISTER_COUNT: usize = REG_SLOT_BASE + MAX_REFERENCE_SLOTS * 4;

const FLAG_WRITE_HEADER: u32 = 1 << 0;
const FLAG_DOWNSCALE: u32 = 1 << 1;

/// What the hardware is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Full encode of a picture partition.
    Encode,
    /// Reduced-cost first-pass analysis.
    Analysis,
}

/// Frame and side-table addresses of one reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotAddress {
    pub frame: BusAddress,
    pub table: BusAddress,
}

/// Logical contents of a job's register image.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRegisters {
    pub kind: JobKind,
    pub picture_order: u64,
    pub coding_type: CodingType,
    pub qp: u8,
    /// Per-block QP deviation bound, 0 for picture-level rate control.
    pub block_qp_delta: u8,
    pub width: u16,
    pub height: u16,
    pub partition_index: u8,
    pub partition_count: u8,
    /// First 16-line block row of this partition.
    pub first_row: u16,
    pub row_count: u16,
    pub input: [BusAddress; 3],
    pub output: BusAddress,
    pub output_size: u32,
    pub list0: SlotSet,
    pub list1: SlotSet,
    pub refresh: SlotSet,
    pub write_header: bool,
    pub downscale: bool,
    pub target_bits: u32,
    /// Reconstruction target, written when `refresh` is non-empty.
    pub recon: SlotAddress,
    /// Current contents of every reference slot.
    pub slots: [SlotAddress; MAX_REFERENCE_SLOTS],
}

fn coding_type_code(coding_type: CodingType) -> u32 {
    match coding_type {
        CodingType::Intra => 0,
        CodingType::Predicted => 1,
        CodingType::BiPredicted => 2,
        CodingType::NotCoded => 3,
    }
}

fn coding_type_from_code(code: u32) -> Option<CodingType> {
    match code {
        0 => Some(CodingType::Intra),
        1 => Some(CodingType::Predicted),
        2 => Some(CodingType::BiPredicted),
        3 => Some(CodingType::NotCoded),
        _ => None,
    }
}

fn put_u64(image: &mut [u32], at: usize, value: u64) {
    image[at] = value as u32;
    image[at + 1] = (value >> 32) as u32;
}

fn get_u64(image: &[u32], at: usize) -> u64 {
    u64::from(image[at]) | (u64::from(image[at + 1]) << 32)
}

impl JobRegisters {
    /// Serialize into a register image.
    pub fn to_image(&self) -> Vec<u32> {
        let mut image = vec![0u32; REGISTER_COUNT];
        image[REG_KIND] = match self.kind {
            JobKind::Encode => 1,
            JobKind::Analysis => 2,
        };
        put_u64(&mut image, REG_PICTURE_ORDER, self.picture_order);
        image[REG_CODING_TYPE] = coding_type_code(self.coding_type);
        image[REG_QP] = u32::from(self.qp) | (u32::from(self.block_qp_delta) << 8);
        image[REG_GEOMETRY] = (u32::from(self.width) << 16) | u32::from(self.height);
        image[REG_PARTITION] =
            (u32::from(self.partition_index) << 8) | u32::from(self.partition_count);
        image[REG_ROWS] = (u32::from(self.first_row) << 16) | u32::from(self.row_count);
        for (i, address) in self.input.iter().enumerate() {
            put_u64(&mut image, REG_INPUT + i * 2, address.0);
        }
        put_u64(&mut image, REG_OUTPUT, self.output.0);
        image[REG_OUTPUT_SIZE] = self.output_size;
        image[REG_SLOT_MASKS] = u32::from(self.list0.bits())
            | (u32::from(self.list1.bits()) << 8)
            | (u32::from(self.refresh.bits()) << 16);
        let mut flags = 0;
        if self.write_header {
            flags |= FLAG_WRITE_HEADER;
        }
        if self.downscale {
            flags |= FLAG_DOWNSCALE;
        }
        image[REG_FLAGS] = flags;
        image[REG_TARGET_BITS] = self.target_bits;
        put_u64(&mut image, REG_RECON, self.recon.frame.0);
        put_u64(&mut image, REG_RECON + 2, self.recon.table.0);
        for (i, slot) in self.slots.iter().enumerate() {
            put_u64(&mut image, REG_SLOT_BASE + i * 4, slot.frame.0);
            put_u64(&mut image, REG_SLOT_BASE + i * 4 + 2, slot.table.0);
        }
        image
    }

    /// Parse a register image. Returns `None` for a malformed image.
    pub fn from_image(image: &[u32]) -> Option<Self> {
        if image.len() != REGISTER_COUNT {
            return None;
        }
        let kind = match image[REG_KIND] {
            1 => JobKind::Encode,
            2 => JobKind::Analysis,
            _ => return None,
        };
        let masks = image[REG_SLOT_MASKS];
        let mut slots = [SlotAddress::default(); MAX_REFERENCE_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            slot.frame = BusAddress(get_u64(image, REG_SLOT_BASE + i * 4));
            slot.table = BusAddress(get_u64(image, REG_SLOT_BASE + i * 4 + 2));
        }
        Some(Self {
            kind,
            picture_order: get_u64(image, REG_PICTURE_ORDER),
            coding_type: coding_type_from_code(image[REG_CODING_TYPE])?,
            qp: (image[REG_QP] & 0xff) as u8,
            block_qp_delta: ((image[REG_QP] >> 8) & 0xff) as u8,
            width: (image[REG_GEOMETRY] >> 16) as u16,
            height: (image[REG_GEOMETRY] & 0xffff) as u16,
            partition_index: ((image[REG_PARTITION] >> 8) & 0xff) as u8,
            partition_count: (image[REG_PARTITION] & 0xff) as u8,
            first_row: (image[REG_ROWS] >> 16) as u16,
            row_count: (image[REG_ROWS] & 0xffff) as u16,
            input: [
                BusAddress(get_u64(image, REG_INPUT)),
                BusAddress(get_u64(image, REG_INPUT + 2)),
                BusAddress(get_u64(image, REG_INPUT + 4)),
            ],
            output: BusAddress(get_u64(image, REG_OUTPUT)),
            output_size: image[REG_OUTPUT_SIZE],
            list0: SlotSet::from_bits((masks & 0xff) as u8),
            list1: SlotSet::from_bits(((masks >> 8) & 0xff) as u8),
            refresh: SlotSet::from_bits(((masks >> 16) & 0xff) as u8),
            write_header: image[REG_FLAGS] & FLAG_WRITE_HEADER != 0,
            downscale: image[REG_FLAGS] & FLAG_DOWNSCALE != 0,
            target_bits: image[REG_TARGET_BITS],
            recon: SlotAddress {
                frame: BusAddress(get_u64(image, REG_RECON)),
                table: BusAddress(get_u64(image, REG_RECON + 2)),
            },
            slots,
        })
    }
}

/// One unit of work handed to a core.
///
/// Built fresh for every dispatch and never reused across pictures.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub registers: Vec<u32>,
    /// Size of the register image in bytes.
    pub job_size: usize,
    /// Destination core.
    pub core: CoreId,
    /// Filled from the HAL on completion.
    pub status: Option<JobFeedback>,
}

impl JobDescriptor {
    /// Build a descriptor for `core` from logical registers.
    pub fn new(core: CoreId, registers: &JobRegisters) -> Self {
        let registers = registers.to_image();
        Self {
            job_size: registers.len() * std::mem::size_of::<u32>(),
            registers,
            core,
            status: None,
        }
    }

    /// Decode the register image.
    pub fn decode(&self) -> Option<JobRegisters> {
        JobRegisters::from_image(&self.registers)
    }
}
