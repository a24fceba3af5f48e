//! Software rendering into dumb buffers
//!
//! [`DumbRenderBackend`] keeps a [`DumbSwapchain`] per output of its gpu. The compositor paints
//! into the mapped buffer between [`begin_frame`](RenderBackend::begin_frame) and
//! [`end_frame`](RenderBackend::end_frame). The age of the acquired buffer together with the
//! [`DamageJournal`] tells which part of it is outdated.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt, io,
    rc::{Rc, Weak},
};

use drm_fourcc::DrmFourcc;
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, info_span, trace, warn};

use super::{Error, RenderBackend};
use crate::{
    backend::drm::{
        BufferId, BufferUse, DrmBuffer, DrmGpu, DrmOutput, DumbBuffer, GpuContext, GpuEvent, GpuId,
        OutputId, TestFrameSource,
    },
    utils::{Physical, Rectangle, SignalToken, Size},
};

/// Number of buffers per swapchain
pub const SLOT_CAP: usize = 3;

#[derive(Debug)]
struct SwapSlot {
    buffer: Rc<DumbBuffer>,
    id: BufferId,
    age: u8,
}

/// A buffer handed out by [`DumbSwapchain::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSlot {
    /// Index of the slot in the swapchain
    pub index: usize,
    /// The buffer in the arena of the gpu
    pub id: BufferId,
    /// Number of frames since the content of the buffer was presented, `0` if unknown
    pub age: u8,
}

/// Fixed set of re-usable dumb buffers of one size
///
/// The buffers live in the [`BufferArena`](crate::backend::drm::BufferArena) of the gpu, a
/// buffer is free again once the arena reports no use of it.
pub struct DumbSwapchain {
    gpu: Rc<GpuContext>,
    size: (u32, u32),
    format: DrmFourcc,
    slots: SmallVec<[SwapSlot; SLOT_CAP]>,
}

impl fmt::Debug for DumbSwapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbSwapchain")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("slots", &self.slots)
            .finish()
    }
}

impl DumbSwapchain {
    /// Create an empty swapchain, buffers are allocated on demand
    pub fn new(gpu: Rc<GpuContext>, size: (u32, u32), format: DrmFourcc) -> DumbSwapchain {
        DumbSwapchain {
            gpu,
            size,
            format,
            slots: SmallVec::new(),
        }
    }

    /// Size of the buffers
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Maximum number of buffers
    pub fn slot_count(&self) -> usize {
        SLOT_CAP
    }

    /// Acquire the first free buffer, allocating one if the swapchain is not full yet
    ///
    /// Returns `None` if every buffer is in use.
    pub fn acquire(&mut self) -> io::Result<Option<AcquiredSlot>> {
        {
            let mut arena = self.gpu.buffers().borrow_mut();
            for (index, slot) in self.slots.iter().enumerate() {
                if arena.uses(slot.id).is_empty() && arena.mark(slot.id, BufferUse::ACQUIRED) {
                    return Ok(Some(AcquiredSlot {
                        index,
                        id: slot.id,
                        age: slot.age,
                    }));
                }
            }
        }
        if self.slots.len() >= SLOT_CAP {
            return Ok(None);
        }

        let buffer = Rc::new(DumbBuffer::new(self.gpu.device(), self.size, self.format)?);
        let id = self
            .gpu
            .buffers()
            .borrow_mut()
            .insert(buffer.clone() as Rc<dyn DrmBuffer>, true);
        self.slots.push(SwapSlot { buffer, id, age: 0 });
        Ok(Some(AcquiredSlot {
            index: self.slots.len() - 1,
            id,
            age: 0,
        }))
    }

    /// The buffer of slot `index`
    pub fn buffer(&self, index: usize) -> Option<&Rc<DumbBuffer>> {
        self.slots.get(index).map(|slot| &slot.buffer)
    }

    /// The buffer of slot `index` was presented
    pub fn submitted(&mut self, index: usize) {
        if index >= self.slots.len() {
            return;
        }
        for slot in &mut self.slots {
            if slot.age > 0 {
                slot.age = slot.age.saturating_add(1);
            }
        }
        self.slots[index].age = 1;
    }

    /// Forget the content of slot `index`
    pub fn reset_age(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.age = 0;
        }
    }

    /// Change the size of the buffers
    ///
    /// Returns whether the size changed. Buffers still in use stay alive until they are released.
    pub fn resize(&mut self, size: (u32, u32)) -> bool {
        if self.size == size {
            return false;
        }
        self.size = size;
        self.release();
        true
    }

    fn release(&mut self) {
        let Ok(mut arena) = self.gpu.buffers().try_borrow_mut() else {
            warn!("Buffer arena is busy, leaking swapchain buffers");
            return;
        };
        for slot in self.slots.drain(..) {
            arena.remove(slot.id);
        }
    }
}

impl Drop for DumbSwapchain {
    fn drop(&mut self) {
        self.release();
    }
}

/// Damage of the latest frames
///
/// Accumulates what changed since a buffer of a given age was presented.
#[derive(Debug, Clone)]
pub struct DamageJournal {
    capacity: usize,
    log: VecDeque<Vec<Rectangle<i32, Physical>>>,
}

impl DamageJournal {
    /// Create a journal remembering `capacity` frames
    pub fn new(capacity: usize) -> DamageJournal {
        DamageJournal {
            capacity,
            log: VecDeque::with_capacity(capacity),
        }
    }

    /// Number of frames remembered
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the number of frames remembered
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.log.truncate(capacity);
    }

    /// Record the damage of a new frame
    pub fn add(&mut self, damage: &[Rectangle<i32, Physical>]) {
        self.log.push_front(damage.to_vec());
        self.log.truncate(self.capacity);
    }

    /// Forget all frames
    pub fn clear(&mut self) {
        self.log.clear();
    }

    /// Region outdated in a buffer of `age`
    ///
    /// Falls back to `fallback` when the age is unknown or older than the journal.
    pub fn accumulate(&self, age: u8, fallback: Rectangle<i32, Physical>) -> Vec<Rectangle<i32, Physical>> {
        let age = age as usize;
        if age == 0 || age > self.log.len() {
            return vec![fallback];
        }
        let mut region: Vec<Rectangle<i32, Physical>> = Vec::new();
        for rect in self.log.iter().take(age - 1).flatten() {
            if !rect.is_empty() && !region.contains(rect) {
                region.push(*rect);
            }
        }
        region
    }
}

#[derive(Debug)]
struct OutputState {
    output: Weak<DrmOutput>,
    swapchain: DumbSwapchain,
    journal: DamageJournal,
    current: Option<AcquiredSlot>,
    last: Option<BufferId>,
}

struct DumbRenderer {
    gpu: Rc<GpuContext>,
    format: DrmFourcc,
    outputs: RefCell<IndexMap<OutputId, OutputState>>,
    span: tracing::Span,
}

impl fmt::Debug for DumbRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbRenderer")
            .field("gpu", &self.gpu.id())
            .field("format", &self.format)
            .field("outputs", &self.outputs.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn buffer_size(size: Size<i32, Physical>) -> (u32, u32) {
    (size.w.max(0) as u32, size.h.max(0) as u32)
}

impl DumbRenderer {
    fn add_output(&self, output: &Rc<DrmOutput>) {
        let swapchain = DumbSwapchain::new(self.gpu.clone(), buffer_size(output.pixel_size()), self.format);
        let journal = DamageJournal::new(swapchain.slot_count());
        debug!(parent: &self.span, "Rendering output {}", output.name());
        self.outputs.borrow_mut().insert(
            output.id(),
            OutputState {
                output: Rc::downgrade(output),
                swapchain,
                journal,
                current: None,
                last: None,
            },
        );
    }

    fn remove_output(&self, output: OutputId) {
        if let Some(mut state) = self.outputs.borrow_mut().shift_remove(&output) {
            if let Some(slot) = state.current.take() {
                self.gpu.buffers().borrow_mut().unmark(slot.id, BufferUse::ACQUIRED);
            }
            debug!(parent: &self.span, "Stopped rendering output {:?}", output);
        }
    }
}

impl TestFrameSource for DumbRenderer {
    fn render_test_frame(&self, output: OutputId, size: Size<i32, Physical>) -> Option<BufferId> {
        let mut outputs = self.outputs.borrow_mut();
        let Some(state) = outputs.get_mut(&output) else {
            warn!(parent: &self.span, "Test frame requested for unknown output {:?}", output);
            return None;
        };
        if state.swapchain.resize(buffer_size(size)) {
            state.journal.clear();
        }
        let slot = match state.swapchain.acquire() {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                debug!(parent: &self.span, "No free buffer for a test frame");
                return None;
            }
            Err(err) => {
                warn!(parent: &self.span, "Failed to allocate a test frame: {}", err);
                return None;
            }
        };
        let cleared = state
            .swapchain
            .buffer(slot.index)
            .map(|buffer| buffer.map(|pixels| pixels.fill(0)));
        if let Some(Err(err)) = cleared {
            warn!(parent: &self.span, "Failed to clear a test frame: {}", err);
            self.gpu.buffers().borrow_mut().unmark(slot.id, BufferUse::ACQUIRED);
            return None;
        }
        state.swapchain.reset_age(slot.index);
        trace!(parent: &self.span, "Rendered test frame for {:?}", output);
        Some(slot.id)
    }
}

/// [`RenderBackend`] painting into cpu-mapped dumb buffers
#[derive(Debug)]
pub struct DumbRenderBackend {
    renderer: Rc<DumbRenderer>,
    _outputs_token: SignalToken,
    initialized: bool,
}

impl DumbRenderBackend {
    /// Render the outputs of `gpu` in [`DrmFourcc::Xrgb8888`]
    pub fn new(gpu: &DrmGpu) -> DumbRenderBackend {
        DumbRenderBackend::with_format(gpu, DrmFourcc::Xrgb8888)
    }

    /// Render the outputs of `gpu` in `format`
    pub fn with_format(gpu: &DrmGpu, format: DrmFourcc) -> DumbRenderBackend {
        let context = gpu.context().clone();
        let span = info_span!(parent: context.span(), "renderer_dumb");
        let renderer = Rc::new(DumbRenderer {
            gpu: context,
            format,
            outputs: RefCell::new(IndexMap::new()),
            span,
        });
        for output in gpu.outputs() {
            renderer.add_output(output);
        }

        let weak = Rc::downgrade(&renderer);
        let token = gpu.signaler().register(move |event| {
            let Some(renderer) = weak.upgrade() else {
                return;
            };
            match event {
                GpuEvent::OutputEnabled(output) => renderer.add_output(output),
                GpuEvent::OutputDisabled(output) | GpuEvent::OutputRemoved(output) => {
                    renderer.remove_output(output.id())
                }
                GpuEvent::OutputAdded(_) => {}
            }
        });

        DumbRenderBackend {
            renderer,
            _outputs_token: token,
            initialized: false,
        }
    }

    /// Paint into the buffer of the frame started on `output`
    ///
    /// `f` receives the pixels and the number of bytes per row.
    pub fn with_frame_buffer<T>(&self, output: OutputId, f: impl FnOnce(&mut [u8], u32) -> T) -> Result<T, Error> {
        let outputs = self.renderer.outputs.borrow();
        let state = outputs.get(&output).ok_or(Error::UnknownOutput(output))?;
        let slot = state.current.ok_or(Error::NoFrame(output))?;
        let buffer = state.swapchain.buffer(slot.index).ok_or(Error::NoFrame(output))?;
        let pitch = buffer.pitch();
        let mut result = None;
        buffer
            .map(|pixels| result = Some(f(pixels, pitch)))
            .map_err(Error::Mapping)?;
        result.ok_or(Error::NoFrame(output))
    }

    fn output(&self, output: OutputId) -> Result<Rc<DrmOutput>, Error> {
        self.renderer
            .outputs
            .borrow()
            .get(&output)
            .and_then(|state| state.output.upgrade())
            .ok_or(Error::UnknownOutput(output))
    }
}

impl RenderBackend for DumbRenderBackend {
    fn gpu(&self) -> GpuId {
        self.renderer.gpu.id()
    }

    fn init(&mut self) -> Result<(), Error> {
        let source: Weak<dyn TestFrameSource> = Rc::downgrade(&self.renderer) as Weak<dyn TestFrameSource>;
        self.renderer.gpu.set_test_frame_source(Some(source));
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn has_output(&self, output: OutputId) -> bool {
        self.renderer.outputs.borrow().contains_key(&output)
    }

    #[profiling::function]
    fn begin_frame(&mut self, output: OutputId) -> Result<Vec<Rectangle<i32, Physical>>, Error> {
        let drm_output = self.output(output)?;
        let size = drm_output.pixel_size();

        let mut outputs = self.renderer.outputs.borrow_mut();
        let state = outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
        if let Some(stale) = state.current.take() {
            self.renderer
                .gpu
                .buffers()
                .borrow_mut()
                .unmark(stale.id, BufferUse::ACQUIRED);
        }
        if state.swapchain.resize(buffer_size(size)) {
            state.journal.clear();
        }
        let slot = state
            .swapchain
            .acquire()
            .map_err(Error::Allocation)?
            .ok_or(Error::NoFreeBuffer(output))?;
        state.current = Some(slot);
        Ok(state.journal.accumulate(slot.age, Rectangle::from_size(size)))
    }

    #[profiling::function]
    fn end_frame(&mut self, output: OutputId, damage: &[Rectangle<i32, Physical>]) -> Result<(), Error> {
        let drm_output = self.output(output)?;
        let slot = {
            let mut outputs = self.renderer.outputs.borrow_mut();
            let state = outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
            let slot = state.current.take().ok_or(Error::NoFrame(output))?;
            state.swapchain.submitted(slot.index);
            state.journal.add(damage);
            state.last = Some(slot.id);
            slot
        };

        if drm_output.present(slot.id) {
            Ok(())
        } else {
            // a disabled output never took the buffer
            self.renderer
                .gpu
                .buffers()
                .borrow_mut()
                .unmark(slot.id, BufferUse::ACQUIRED);
            Err(Error::PresentFailed(output))
        }
    }

    fn scanout(&mut self, output: OutputId, buffer: BufferId) -> bool {
        match self.output(output) {
            Ok(drm_output) => drm_output.present(buffer),
            Err(_) => false,
        }
    }

    fn texture_for_output(&self, output: OutputId) -> Option<BufferId> {
        self.renderer.outputs.borrow().get(&output).and_then(|state| state.last)
    }
}

impl Drop for DumbRenderBackend {
    fn drop(&mut self) {
        if self.initialized {
            self.renderer.gpu.set_test_frame_source(None);
        }
    }
}
