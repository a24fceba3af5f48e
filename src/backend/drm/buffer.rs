//! Scanout buffers and their bookkeeping
//!
//! Buffers handed to a [`DrmPipeline`](super::DrmPipeline) live in the [`BufferArena`] of their gpu
//! and are referred to by [`BufferId`]s. Every slot of the arena carries a set of [`BufferUse`]
//! flags: a renderer acquires a slot, presenting it makes it the pipeline's primary buffer,
//! a successful commit puts it in flight and its page flip puts it on screen. A slot without any
//! use is free again and can be acquired by its owner for the next frame.
//!
//! Ids carry a generation, so an id of a buffer that was dropped in the meantime never
//! resolves to a different buffer reusing the same slot.

use std::{fmt, io, rc::Rc};

use drm::control::framebuffer;
use drm_fourcc::DrmFourcc;
use tracing::{trace, warn};

use super::device::{DumbBufferInfo, KmsDevice};

/// A buffer that can be scanned out
pub trait DrmBuffer: fmt::Debug {
    /// Framebuffer to attach to a plane or crtc
    fn framebuffer(&self) -> framebuffer::Handle;
    /// Size in pixels
    fn size(&self) -> (u32, u32);
    /// Pixel format
    fn format(&self) -> DrmFourcc;
}

/// A dumb buffer with its framebuffer
///
/// Destroyed on the device when dropped.
pub struct DumbBuffer {
    device: Rc<dyn KmsDevice>,
    info: DumbBufferInfo,
    format: DrmFourcc,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("info", &self.info)
            .field("format", &self.format)
            .finish()
    }
}

impl DumbBuffer {
    /// Allocate a new dumb buffer on `device`
    pub fn new(device: &Rc<dyn KmsDevice>, size: (u32, u32), format: DrmFourcc) -> io::Result<DumbBuffer> {
        let info = device.create_dumb_buffer(size, format)?;
        trace!(?size, ?format, handle = info.handle, "Allocated dumb buffer");
        Ok(DumbBuffer {
            device: device.clone(),
            info,
            format,
        })
    }

    /// GEM handle of the buffer
    pub fn handle(&self) -> u32 {
        self.info.handle
    }

    /// Bytes per row
    pub fn pitch(&self) -> u32 {
        self.info.pitch
    }

    /// Map the buffer and hand its pixels to `f`
    pub fn map<F: FnOnce(&mut [u8])>(&self, f: F) -> io::Result<()> {
        let mut f = Some(f);
        self.device.map_dumb_buffer(&self.info, &mut |data| {
            if let Some(f) = f.take() {
                f(data)
            }
        })
    }
}

impl DrmBuffer for DumbBuffer {
    fn framebuffer(&self) -> framebuffer::Handle {
        self.info.framebuffer
    }

    fn size(&self) -> (u32, u32) {
        self.info.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_dumb_buffer(&self.info) {
            warn!("Failed to destroy dumb buffer {}: {}", self.info.handle, err);
        }
    }
}

bitflags::bitflags! {
    /// What a buffer is currently used for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUse: u8 {
        /// Handed out to a renderer
        const ACQUIRED = 1 << 0;
        /// Latest frame of a pipeline, submitted by the next commit
        const PRIMARY = 1 << 1;
        /// Committed, waiting for its page flip
        const IN_FLIGHT = 1 << 2;
        /// On screen
        const SCANOUT = 1 << 3;
    }
}

/// Generation checked reference into a [`BufferArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    buffer: Option<Rc<dyn DrmBuffer>>,
    generation: u32,
    uses: BufferUse,
    reusable: bool,
}

/// Storage of all scanout buffers of a gpu
#[derive(Debug, Default)]
pub struct BufferArena {
    slots: Vec<Slot>,
}

impl BufferArena {
    /// An empty arena
    pub fn new() -> BufferArena {
        BufferArena::default()
    }

    /// Store a buffer, marked [`BufferUse::ACQUIRED`]
    ///
    /// A `reusable` buffer stays in the arena when all its uses end and can be acquired again,
    /// any other buffer is dropped at that point.
    pub fn insert(&mut self, buffer: Rc<dyn DrmBuffer>, reusable: bool) -> BufferId {
        let index = match self.slots.iter().position(|slot| slot.buffer.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    buffer: None,
                    generation: 0,
                    uses: BufferUse::empty(),
                    reusable: false,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.buffer = Some(buffer);
        slot.uses = BufferUse::ACQUIRED;
        slot.reusable = reusable;
        BufferId {
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, id: BufferId) -> Option<&Slot> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation && slot.buffer.is_some())
    }

    fn slot_mut(&mut self, id: BufferId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation && slot.buffer.is_some())
    }

    /// Whether `id` still refers to a buffer
    pub fn contains(&self, id: BufferId) -> bool {
        self.slot(id).is_some()
    }

    /// The buffer behind `id`
    pub fn get(&self, id: BufferId) -> Option<Rc<dyn DrmBuffer>> {
        self.slot(id).and_then(|slot| slot.buffer.clone())
    }

    /// Current uses of a buffer, empty for stale ids
    pub fn uses(&self, id: BufferId) -> BufferUse {
        self.slot(id).map(|slot| slot.uses).unwrap_or_else(BufferUse::empty)
    }

    /// Acquire the first idle reusable buffer accepted by `filter`
    pub fn acquire(&mut self, filter: impl Fn(&dyn DrmBuffer) -> bool) -> Option<BufferId> {
        let index = self.slots.iter().position(|slot| {
            slot.reusable
                && slot.uses.is_empty()
                && slot.buffer.as_deref().map(|buffer| filter(buffer)).unwrap_or(false)
        })?;
        let slot = &mut self.slots[index];
        slot.uses = BufferUse::ACQUIRED;
        Some(BufferId {
            index,
            generation: slot.generation,
        })
    }

    /// Add a use to a buffer. Returns `false` for stale ids.
    pub fn mark(&mut self, id: BufferId, uses: BufferUse) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.uses |= uses;
                true
            }
            None => false,
        }
    }

    /// Remove a use from a buffer, freeing it once no use remains and it is not reusable
    pub fn unmark(&mut self, id: BufferId, uses: BufferUse) {
        if let Some(slot) = self.slot_mut(id) {
            slot.uses -= uses;
            if slot.uses.is_empty() && !slot.reusable {
                Self::free(slot);
            }
        }
    }

    /// Drop a buffer from the arena
    ///
    /// A buffer still in use is only orphaned and gets freed once its last use ends.
    pub fn remove(&mut self, id: BufferId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.reusable = false;
            if slot.uses.is_empty() {
                Self::free(slot);
            }
        }
    }

    fn free(slot: &mut Slot) {
        slot.buffer = None;
        slot.uses = BufferUse::empty();
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Number of buffers stored
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.buffer.is_some()).count()
    }

    /// Whether no buffer is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The buffers of one scanout engine, on screen and waiting for the next flip
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutSlots {
    current: Option<BufferId>,
    next: Option<BufferId>,
}

impl ScanoutSlots {
    /// Buffer on screen
    pub fn current(&self) -> Option<BufferId> {
        self.current
    }

    /// Buffer committed and waiting for its flip
    pub fn next(&self) -> Option<BufferId> {
        self.next
    }

    /// Replace the buffer waiting for its flip
    pub fn set_next(&mut self, arena: &mut BufferArena, buffer: Option<BufferId>) {
        if self.next == buffer {
            return;
        }
        if let Some(old) = self.next.take() {
            arena.unmark(old, BufferUse::IN_FLIGHT);
        }
        if let Some(buffer) = buffer {
            if arena.mark(buffer, BufferUse::IN_FLIGHT) {
                self.next = Some(buffer);
            }
        }
    }

    /// The pending flip completed, the next buffer is now on screen
    pub fn flip(&mut self, arena: &mut BufferArena) {
        let Some(next) = self.next.take() else {
            return;
        };
        if let Some(old) = self.current.take() {
            if old != next {
                arena.unmark(old, BufferUse::SCANOUT);
            }
        }
        arena.mark(next, BufferUse::SCANOUT);
        arena.unmark(next, BufferUse::IN_FLIGHT);
        if arena.contains(next) {
            self.current = Some(next);
        }
    }

    /// Release both buffers
    pub fn clear(&mut self, arena: &mut BufferArena) {
        if let Some(next) = self.next.take() {
            arena.unmark(next, BufferUse::IN_FLIGHT);
        }
        if let Some(current) = self.current.take() {
            arena.unmark(current, BufferUse::SCANOUT);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{BufferArena, BufferUse, DrmBuffer, DumbBuffer, ScanoutSlots};
    use crate::backend::drm::device::{
        dummy::{DeviceCall, DummyDevice},
        KmsDevice,
    };
    use drm_fourcc::DrmFourcc;

    fn buffer(device: &Rc<dyn KmsDevice>) -> Rc<dyn DrmBuffer> {
        Rc::new(DumbBuffer::new(device, (64, 64), DrmFourcc::Xrgb8888).unwrap())
    }

    #[test]
    fn stale_ids_do_not_resolve() {
        let dummy = Rc::new(DummyDevice::new());
        let device: Rc<dyn KmsDevice> = dummy.clone();
        let mut arena = BufferArena::new();

        let first = arena.insert(buffer(&device), false);
        arena.unmark(first, BufferUse::ACQUIRED);
        assert!(!arena.contains(first));
        assert_eq!(dummy.count_calls(|c| matches!(c, DeviceCall::DestroyDumb(_))), 1);

        let second = arena.insert(buffer(&device), false);
        assert!(arena.contains(second));
        assert!(arena.get(first).is_none());
        assert!(!arena.mark(first, BufferUse::PRIMARY));
    }

    #[test]
    fn reusable_buffers_return_after_flip() {
        let dummy = Rc::new(DummyDevice::new());
        let device: Rc<dyn KmsDevice> = dummy;
        let mut arena = BufferArena::new();
        let mut slots = ScanoutSlots::default();

        let a = arena.insert(buffer(&device), true);
        let b = arena.insert(buffer(&device), true);
        arena.unmark(b, BufferUse::ACQUIRED);

        // a is presented and committed
        arena.mark(a, BufferUse::PRIMARY);
        arena.unmark(a, BufferUse::ACQUIRED);
        slots.set_next(&mut arena, Some(a));
        slots.flip(&mut arena);
        assert_eq!(arena.uses(a), BufferUse::PRIMARY | BufferUse::SCANOUT);
        assert_eq!(arena.acquire(|_| true), Some(b));

        // b replaces a
        arena.mark(b, BufferUse::PRIMARY);
        arena.unmark(b, BufferUse::ACQUIRED);
        arena.unmark(a, BufferUse::PRIMARY);
        slots.set_next(&mut arena, Some(b));
        assert_eq!(arena.acquire(|_| true), None);
        slots.flip(&mut arena);
        assert_eq!(slots.current(), Some(b));
        assert!(arena.uses(a).is_empty());
        assert_eq!(arena.acquire(|_| true), Some(a));
    }

    #[test]
    fn removed_buffer_lives_until_flipped_away() {
        let dummy = Rc::new(DummyDevice::new());
        let device: Rc<dyn KmsDevice> = dummy.clone();
        let mut arena = BufferArena::new();
        let mut slots = ScanoutSlots::default();

        let a = arena.insert(buffer(&device), true);
        arena.unmark(a, BufferUse::ACQUIRED);
        slots.set_next(&mut arena, Some(a));
        slots.flip(&mut arena);

        arena.remove(a);
        assert!(arena.contains(a));
        slots.clear(&mut arena);
        assert!(!arena.contains(a));
        assert!(arena.is_empty());
        assert_eq!(dummy.count_calls(|c| matches!(c, DeviceCall::DestroyDumb(_))), 1);
    }
}
