//! Buffer pool for memory shared between software and hardware.
//!
//! Every block the hardware reads or writes is tracked here: admitted picture
//! planes (caller memory, registered but never freed), reference frames with
//! their compression side-tables, coded output buffers and first-pass scratch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::encoder::dpb::ReferenceSlots;
use crate::encoder::{ColorFormat, Dimensions, Picture};
use crate::error::{Result, VpuError};
use crate::hal::{DeviceMemory, Direction, Hal};

/// Minimum coded output buffer size.
pub const MIN_OUTPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Handle of a live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// What a buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Caller-owned picture plane registered on admission.
    Picture,
    /// Reconstructed reference frame.
    Reference,
    /// Coded bitstream output.
    Output,
    /// First-pass scratch.
    Analysis,
}

/// A tracked block of device-addressable memory.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub id: BufferId,
    pub kind: BufferKind,
    pub memory: DeviceMemory,
    /// Copy still owed between host and device.
    pub pending: Direction,
    /// Reference-frame compression table, allocated and freed with the buffer.
    pub side_table: Option<DeviceMemory>,
}

impl Buffer {
    fn is_external(&self) -> bool {
        self.kind == BufferKind::Picture
    }
}

/// Size of the reference compression side-table for a picture geometry.
///
/// Luma stores 8 bytes per 64x4 block, chroma half of that.
pub fn compression_table_size(dimensions: Dimensions) -> usize {
    let luma = dimensions.width.div_ceil(64) as usize * dimensions.height.div_ceil(4) as usize * 8;
    let size = luma + luma / 2;
    size.next_multiple_of(16)
}

/// Size of a coded output buffer for one partition of a picture.
pub fn output_buffer_size(dimensions: Dimensions, format: ColorFormat, partitions: usize) -> usize {
    let raw = format.frame_size(dimensions.width, dimensions.height);
    (raw / partitions.max(1)).max(MIN_OUTPUT_BUFFER_SIZE)
}

/// Tracks buffer lifetimes, bus ranges and pending copies.
pub struct BufferPool {
    hal: Arc<dyn Hal>,
    /// Byte limit for HAL allocations (0 = unlimited).
    budget: usize,
    used: usize,
    next_id: u64,
    live: HashMap<BufferId, Buffer>,
    /// Bus start -> (bus end, owner) for every live range.
    ranges: BTreeMap<u64, (u64, BufferId)>,
}

impl BufferPool {
    /// Create a pool drawing from `hal`, limited to `budget` bytes (0 = unlimited).
    pub fn new(hal: Arc<dyn Hal>, budget: usize) -> Self {
        Self {
            hal,
            budget,
            used: 0,
            next_id: 0,
            live: HashMap::new(),
            ranges: BTreeMap::new(),
        }
    }

    /// Bytes still available under the budget.
    pub fn available(&self) -> usize {
        if self.budget == 0 {
            usize::MAX
        } else {
            self.budget.saturating_sub(self.used)
        }
    }

    /// Bytes currently allocated from the HAL.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Number of live buffers of any kind.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of live buffers of one kind.
    pub fn live_count_of(&self, kind: BufferKind) -> usize {
        self.live.values().filter(|b| b.kind == kind).count()
    }

    /// Look up a live buffer.
    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.live.get(&id)
    }

    fn buffer(&self, id: BufferId) -> Result<&Buffer> {
        self.live.get(&id).ok_or(VpuError::UnknownBuffer(id.0))
    }

    fn reserve(&mut self, size: usize) -> Result<()> {
        let available = self.available();
        if size > available {
            return Err(VpuError::OutOfMemory {
                requested: size,
                available,
            });
        }
        self.used += size;
        Ok(())
    }

    fn overlaps(&self, start: u64, end: u64) -> Option<BufferId> {
        self.ranges
            .range(..end)
            .next_back()
            .filter(|(_, (existing_end, _))| *existing_end > start)
            .map(|(_, (_, owner))| *owner)
    }

    fn track(&mut self, memory: &DeviceMemory, id: BufferId) -> Result<()> {
        if let Some(owner) = self.overlaps(memory.bus.0, memory.end()) {
            return Err(VpuError::InvalidInput(format!(
                "bus range {}+{} aliases live buffer {}",
                memory.bus, memory.size, owner.0
            )));
        }
        self.ranges.insert(memory.bus.0, (memory.end(), id));
        Ok(())
    }

    fn untrack(&mut self, memory: &DeviceMemory) {
        self.ranges.remove(&memory.bus.0);
    }

    fn next_id(&mut self) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        id
    }

    fn allocate(&mut self, size: usize, direction: Direction) -> Result<DeviceMemory> {
        self.reserve(size)?;
        match self.hal.alloc(size, direction) {
            Ok(memory) => Ok(memory),
            Err(err) => {
                self.used -= size;
                Err(err.into())
            }
        }
    }

    fn deallocate(&mut self, memory: &DeviceMemory) {
        self.used = self.used.saturating_sub(memory.size);
        if let Err(err) = self.hal.free(memory) {
            warn!("Failed to free device memory at {}: {}", memory.bus, err);
        }
    }

    /// Allocate a buffer of `kind`.
    ///
    /// Reference buffers need picture geometry for their side-table; use
    /// [`BufferPool::acquire_reference`] for those.
    pub fn acquire(&mut self, kind: BufferKind, size: usize) -> Result<BufferId> {
        match kind {
            BufferKind::Picture => {
                return Err(VpuError::InvalidInput(
                    "picture buffers are registered with admit_picture".to_string(),
                ))
            }
            BufferKind::Reference => {
                return Err(VpuError::InvalidInput(
                    "reference buffers are allocated with acquire_reference".to_string(),
                ))
            }
            BufferKind::Output | BufferKind::Analysis => {}
        }
        if size == 0 {
            return Err(VpuError::InvalidInput("zero-sized buffer".to_string()));
        }

        let memory = self.allocate(size, Direction::None)?;
        let id = self.next_id();
        if let Err(err) = self.track(&memory, id) {
            self.deallocate(&memory);
            return Err(err);
        }
        debug!("Acquired {:?} buffer {} at {} ({} bytes)", kind, id.0, memory.bus, size);
        self.live.insert(
            id,
            Buffer {
                id,
                kind,
                memory,
                pending: Direction::None,
                side_table: None,
            },
        );
        Ok(id)
    }

    /// Allocate a reference frame and its compression side-table together.
    pub fn acquire_reference(
        &mut self,
        dimensions: Dimensions,
        format: ColorFormat,
    ) -> Result<BufferId> {
        let frame_size = format.frame_size(dimensions.width, dimensions.height);
        let table_size = compression_table_size(dimensions);

        let memory = self.allocate(frame_size, Direction::None)?;
        let side_table = match self.allocate(table_size, Direction::None) {
            Ok(table) => table,
            Err(err) => {
                self.deallocate(&memory);
                return Err(err);
            }
        };

        let id = self.next_id();
        if let Err(err) = self.track(&memory, id) {
            self.deallocate(&side_table);
            self.deallocate(&memory);
            return Err(err);
        }
        if let Err(err) = self.track(&side_table, id) {
            self.untrack(&memory);
            self.deallocate(&side_table);
            self.deallocate(&memory);
            return Err(err);
        }

        debug!(
            "Acquired reference buffer {} at {} ({} bytes, side-table {} bytes)",
            id.0, memory.bus, frame_size, table_size
        );
        self.live.insert(
            id,
            Buffer {
                id,
                kind: BufferKind::Reference,
                memory,
                pending: Direction::None,
                side_table: Some(side_table),
            },
        );
        Ok(id)
    }

    /// Register the planes of an admitted picture.
    ///
    /// The planes are caller memory. They are tracked for aliasing and marked
    /// as pending host-to-device until the first job that reads them.
    pub fn admit_picture(&mut self, picture: &Picture) -> Result<Vec<BufferId>> {
        let mut planes = Vec::new();
        for (bus, size) in picture.plane_ranges() {
            let memory = DeviceMemory {
                bus,
                virt: 0,
                size,
            };
            let id = self.next_id();
            if let Err(err) = self.track(&memory, id) {
                for plane in &planes {
                    if let Err(release_err) = self.release(*plane) {
                        warn!("Failed to unregister plane {}: {}", plane.0, release_err);
                    }
                }
                return Err(err);
            }
            self.live.insert(
                id,
                Buffer {
                    id,
                    kind: BufferKind::Picture,
                    memory,
                    pending: Direction::HostToDevice,
                    side_table: None,
                },
            );
            planes.push(id);
        }
        Ok(planes)
    }

    /// Release a buffer. HAL memory is freed, picture planes are unregistered.
    pub fn release(&mut self, id: BufferId) -> Result<()> {
        let buffer = self.live.remove(&id).ok_or(VpuError::UnknownBuffer(id.0))?;
        self.untrack(&buffer.memory);
        if let Some(table) = &buffer.side_table {
            self.untrack(table);
        }
        if buffer.is_external() {
            return Ok(());
        }
        if let Some(table) = &buffer.side_table {
            self.deallocate(table);
        }
        self.deallocate(&buffer.memory);
        Ok(())
    }

    /// Flag a pending copy. `Direction::None` clears all marks.
    pub fn mark(&mut self, id: BufferId, direction: Direction) -> Result<()> {
        let buffer = self
            .live
            .get_mut(&id)
            .ok_or(VpuError::UnknownBuffer(id.0))?;
        buffer.pending = match direction {
            Direction::None => Direction::None,
            d => buffer.pending.union(d),
        };
        Ok(())
    }

    /// Make host writes visible to the device if a copy is pending.
    pub fn sync_for_device(&mut self, id: BufferId) -> Result<()> {
        self.sync(id, Direction::HostToDevice)
    }

    /// Make device writes visible to the host if a copy is pending.
    pub fn sync_for_cpu(&mut self, id: BufferId) -> Result<()> {
        self.sync(id, Direction::DeviceToHost)
    }

    fn sync(&mut self, id: BufferId, direction: Direction) -> Result<()> {
        let buffer = self.buffer(id)?;
        if buffer.pending == Direction::None || !buffer.pending.includes(direction) {
            return Ok(());
        }
        self.hal.sync(&buffer.memory, direction)?;
        if let Some(buffer) = self.live.get_mut(&id) {
            buffer.pending = buffer.pending.without(direction);
        }
        Ok(())
    }

    /// Read `len` bytes written by the device, syncing first if needed.
    pub fn read(&mut self, id: BufferId, len: usize) -> Result<Vec<u8>> {
        self.sync_for_cpu(id)?;
        let buffer = self.buffer(id)?;
        if len > buffer.memory.size {
            return Err(VpuError::InvalidInput(format!(
                "read of {len} bytes from {}-byte buffer {}",
                buffer.memory.size, id.0
            )));
        }
        Ok(self.hal.read(&buffer.memory, 0, len)?)
    }

    /// Release every buffer still live.
    pub fn release_all(&mut self) {
        let ids: Vec<BufferId> = self.live.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.release(id) {
                warn!("Failed to release buffer {}: {}", id.0, err);
            }
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let hal_owned = self.live.values().filter(|b| !b.is_external()).count();
        if hal_owned > 0 {
            debug!("Buffer pool dropped with {} live buffers, freeing", hal_owned);
        }
        self.release_all();
    }
}

/// Buffer pool and reference slot table, guarded together by one lock.
pub struct SharedResources {
    pub pool: BufferPool,
    pub slots: ReferenceSlots,
    /// Reference frames no slot holds, kept for reuse.
    spare_references: Vec<BufferId>,
}

impl SharedResources {
    pub fn new(pool: BufferPool, slot_count: usize) -> Self {
        Self {
            pool,
            slots: ReferenceSlots::new(slot_count),
            spare_references: Vec::new(),
        }
    }

    /// Reference frame for a new reconstruction, reusing a spare one first.
    pub fn take_reference(&mut self, dimensions: Dimensions, format: ColorFormat) -> Result<BufferId> {
        match self.spare_references.pop() {
            Some(id) => Ok(id),
            None => self.pool.acquire_reference(dimensions, format),
        }
    }

    /// Return a reference frame nothing holds any more.
    pub fn recycle_reference(&mut self, id: BufferId) {
        if !self.spare_references.contains(&id) {
            self.spare_references.push(id);
        }
    }

    pub fn spare_references(&self) -> usize {
        self.spare_references.len()
    }

    /// Empty every slot and free all reference frames.
    pub fn release_references(&mut self) {
        let mut held = self.slots.clear();
        held.append(&mut self.spare_references);
        for id in held {
            if let Err(err) = self.pool.release(id) {
                warn!("Failed to release reference buffer {}: {}", id.0, err);
            }
        }
    }
}
