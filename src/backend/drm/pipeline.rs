//! Presentation pipelines
//!
//! A [`DrmPipeline`] binds one crtc to a connector and, on atomic devices, a primary plane.
//! Tiled displays bind one triple per tile. The pipeline stages property values on its objects,
//! validates them with test-only commits and finally commits them together with a new buffer.
//!
//! Every change touching the hardware is tested first, with one exception: disabling a pipeline
//! commits immediately, as no frame will follow that could carry the change.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use drm::control::framebuffer;
use drm_fourcc::DrmFourcc;
use tracing::{debug, error, info_span, instrument, trace, warn};

use super::{
    buffer::{BufferArena, BufferId, BufferUse, DrmBuffer, DumbBuffer},
    config::DrmConfig,
    device::{AtomicCommitFlags, AtomicRequest, DeviceCapabilities, KmsDevice, ObjectHandle},
    gpu::GpuId,
    object::{
        ConnectorProp, CrtcProp, DrmConnector, DrmCrtc, DrmPlane, ObjectRef, Transformations, DPMS_OFF,
        DPMS_ON,
    },
    output::OutputId,
};
use crate::utils::{Physical, Point, PresentationClock, Rectangle, Size};

/// Renders frames for pipelines that need a buffer before their output presented anything
pub trait TestFrameSource {
    /// Render a frame of `size` for `output`
    ///
    /// The buffer is returned acquired from the arena of the gpu.
    fn render_test_frame(&self, output: OutputId, size: Size<i32, Physical>) -> Option<BufferId>;
}

/// State of a gpu shared with its pipelines and outputs
pub struct GpuContext {
    id: GpuId,
    device: Rc<dyn KmsDevice>,
    atomic: bool,
    streams: bool,
    stream_presenter: Cell<bool>,
    capabilities: DeviceCapabilities,
    clock: PresentationClock,
    config: DrmConfig,
    session_active: Cell<bool>,
    span: tracing::Span,
    buffers: RefCell<BufferArena>,
    pipelines: RefCell<Vec<Weak<DrmPipeline>>>,
    test_frames: RefCell<Option<Weak<dyn TestFrameSource>>>,
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("atomic", &self.atomic)
            .field("streams", &self.streams)
            .field("capabilities", &self.capabilities)
            .field("clock", &self.clock)
            .field("session_active", &self.session_active.get())
            .finish_non_exhaustive()
    }
}

impl GpuContext {
    pub(crate) fn new(
        device: Rc<dyn KmsDevice>,
        atomic: bool,
        streams: bool,
        config: DrmConfig,
        span: tracing::Span,
    ) -> GpuContext {
        let mut capabilities = device.capabilities();
        if config.disable_modifiers {
            capabilities.addfb2_modifiers = false;
        }
        let clock = if capabilities.monotonic_timestamps {
            PresentationClock::Monotonic
        } else {
            PresentationClock::Realtime
        };
        GpuContext {
            id: GpuId::next(),
            device,
            atomic,
            streams,
            stream_presenter: Cell::new(false),
            capabilities,
            clock,
            config,
            session_active: Cell::new(true),
            span,
            buffers: RefCell::new(BufferArena::new()),
            pipelines: RefCell::new(Vec::new()),
            test_frames: RefCell::new(None),
        }
    }

    /// Identifier of the gpu
    pub fn id(&self) -> GpuId {
        self.id
    }

    /// The kernel device
    pub fn device(&self) -> &Rc<dyn KmsDevice> {
        &self.device
    }

    /// Whether atomic mode-setting is used
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Whether the session currently owns the device
    ///
    /// Kernel events are left queued while it does not.
    pub fn is_session_active(&self) -> bool {
        self.session_active.get()
    }

    /// Follow a pause or resume of the session
    pub fn set_session_active(&self, active: bool) {
        self.session_active.set(active);
    }

    /// Whether the driver presents through EGLStreams (`nvidia-drm`)
    pub fn uses_streams(&self) -> bool {
        self.streams
    }

    /// Whether frames reach the screen through a stream instead of page flips
    pub fn stream_presenter(&self) -> bool {
        self.streams && self.stream_presenter.get()
    }

    /// Mark a stream based renderer as presenting the frames of this gpu
    pub fn set_stream_presenter(&self, enabled: bool) {
        self.stream_presenter.set(enabled);
    }

    /// Capabilities of the device
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// Largest supported cursor
    pub fn cursor_size(&self) -> (u32, u32) {
        self.capabilities.cursor_size
    }

    /// Clock of the page flip timestamps
    pub fn presentation_clock(&self) -> PresentationClock {
        self.clock
    }

    /// Configuration the gpu was opened with
    pub fn config(&self) -> DrmConfig {
        self.config
    }

    /// Logging span of the gpu
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Scanout buffers of the gpu
    pub fn buffers(&self) -> &RefCell<BufferArena> {
        &self.buffers
    }

    /// Pipelines driving outputs
    pub fn pipelines(&self) -> Vec<Rc<DrmPipeline>> {
        let mut pipelines = self.pipelines.borrow_mut();
        pipelines.retain(|pipeline| pipeline.strong_count() > 0);
        pipelines.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn register_pipeline(&self, pipeline: &Rc<DrmPipeline>) {
        let mut pipelines = self.pipelines.borrow_mut();
        if !pipelines.iter().any(|p| p.as_ptr() == Rc::as_ptr(pipeline)) {
            pipelines.push(Rc::downgrade(pipeline));
        }
    }

    pub(crate) fn unregister_pipeline(&self, pipeline: &Rc<DrmPipeline>) {
        self.pipelines
            .borrow_mut()
            .retain(|p| p.strong_count() > 0 && p.as_ptr() != Rc::as_ptr(pipeline));
    }

    /// Set the renderer providing test frames
    pub fn set_test_frame_source(&self, source: Option<Weak<dyn TestFrameSource>>) {
        *self.test_frames.borrow_mut() = source;
    }

    /// The renderer providing test frames, if one is alive
    pub fn test_frame_source(&self) -> Option<Rc<dyn TestFrameSource>> {
        self.test_frames.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.id.release();
    }
}

/// Refresh behavior of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fixed refresh rate
    #[default]
    Fixed,
    /// Variable refresh rate following the frames
    Adaptive,
}

/// Gamma lookup table with one ramp per channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaRamp {
    red: Vec<u16>,
    green: Vec<u16>,
    blue: Vec<u16>,
}

impl GammaRamp {
    /// Create a ramp. Fails if the channels differ in length or are empty.
    pub fn new(red: Vec<u16>, green: Vec<u16>, blue: Vec<u16>) -> Option<GammaRamp> {
        if red.is_empty() || red.len() != green.len() || red.len() != blue.len() {
            return None;
        }
        Some(GammaRamp { red, green, blue })
    }

    /// The identity ramp with `size` entries
    pub fn linear(size: usize) -> GammaRamp {
        let size = size.max(2);
        let ramp: Vec<u16> = (0..size)
            .map(|i| (i as u64 * u16::MAX as u64 / (size as u64 - 1)) as u16)
            .collect();
        GammaRamp {
            red: ramp.clone(),
            green: ramp.clone(),
            blue: ramp,
        }
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.red.len()
    }

    /// Red channel
    pub fn red(&self) -> &[u16] {
        &self.red
    }

    /// Green channel
    pub fn green(&self) -> &[u16] {
        &self.green
    }

    /// Blue channel
    pub fn blue(&self) -> &[u16] {
        &self.blue
    }

    /// Contents of a `GAMMA_LUT` blob, an array of `struct drm_color_lut`
    pub fn lut_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size() * 8);
        for ((red, green), blue) in self.red.iter().zip(&self.green).zip(&self.blue) {
            for value in [*red, *green, *blue, 0] {
                data.extend_from_slice(&value.to_ne_bytes());
            }
        }
        data
    }
}

/// A mode as offered by a pipeline, spanning all tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineMode {
    /// Size in pixels
    pub size: Size<i32, Physical>,
    /// Refresh rate in mHz
    pub refresh_rate: u32,
    /// Whether the monitor prefers this mode
    pub preferred: bool,
}

#[derive(Debug)]
struct CursorState {
    pos: Point<i32, Physical>,
    buffer: Option<Rc<DumbBuffer>>,
    // the hardware state is unknown until the first ioctl
    image_dirty: bool,
    pos_dirty: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        CursorState {
            pos: (100, 100).into(),
            buffer: None,
            image_dirty: true,
            pos_dirty: true,
        }
    }
}

impl CursorState {
    fn mark_dirty(&mut self) {
        self.image_dirty = true;
        self.pos_dirty = true;
    }
}

/// Connectors, crtcs and primary planes driven together
#[derive(Debug)]
pub struct DrmPipeline {
    gpu: Rc<GpuContext>,
    connectors: Vec<Rc<DrmConnector>>,
    crtcs: Vec<Rc<DrmCrtc>>,
    primary_planes: Vec<Rc<DrmPlane>>,
    objects: Vec<ObjectRef>,
    primary_buffer: Cell<Option<BufferId>>,
    // set while a test buffer stands in for the primary buffer
    old_test_buffer: Cell<Option<Option<BufferId>>>,
    active: Cell<bool>,
    legacy_needs_modeset: Cell<bool>,
    cursor: RefCell<CursorState>,
    output: Cell<Option<OutputId>>,
    last_flags: Cell<AtomicCommitFlags>,
    span: tracing::Span,
}

impl DrmPipeline {
    /// Create a pipeline. Atomic devices need a primary plane.
    pub fn new(
        gpu: Rc<GpuContext>,
        connector: Rc<DrmConnector>,
        crtc: Rc<DrmCrtc>,
        primary_plane: Option<Rc<DrmPlane>>,
    ) -> DrmPipeline {
        let span = info_span!(parent: gpu.span(), "drm_pipeline", crtc = ?crtc.handle());
        let mut pipeline = DrmPipeline {
            gpu,
            connectors: Vec::new(),
            crtcs: Vec::new(),
            primary_planes: Vec::new(),
            objects: Vec::new(),
            primary_buffer: Cell::new(None),
            old_test_buffer: Cell::new(None),
            active: Cell::new(true),
            legacy_needs_modeset: Cell::new(true),
            cursor: RefCell::new(CursorState::default()),
            output: Cell::new(None),
            last_flags: Cell::new(AtomicCommitFlags::empty()),
            span,
        };
        pipeline.push_objects(connector, crtc, primary_plane);
        pipeline
    }

    fn push_objects(&mut self, connector: Rc<DrmConnector>, crtc: Rc<DrmCrtc>, primary_plane: Option<Rc<DrmPlane>>) {
        self.objects.push(ObjectRef::Connector(connector.clone()));
        self.connectors.push(connector);
        self.objects.push(ObjectRef::Crtc(crtc.clone()));
        self.crtcs.push(crtc);
        if let Some(plane) = primary_plane {
            self.objects.push(ObjectRef::Plane(plane.clone()));
            self.primary_planes.push(plane);
        }
    }

    /// Add another tile of a tiled display
    ///
    /// Only possible with atomic mode-setting without streams.
    pub fn add_output(
        &mut self,
        connector: Rc<DrmConnector>,
        crtc: Rc<DrmCrtc>,
        primary_plane: Option<Rc<DrmPlane>>,
    ) -> bool {
        if !self.gpu.is_atomic() || self.gpu.uses_streams() || primary_plane.is_none() {
            warn!(parent: &self.span, "Tiled displays require atomic mode-setting");
            return false;
        }
        self.push_objects(connector, crtc, primary_plane);
        true
    }

    /// Stage the values of a freshly assembled pipeline, without committing them
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn setup(&self) {
        for (connector, crtc) in self.connectors.iter().zip(&self.crtcs) {
            connector.find_current_mode(crtc.current_mode());
        }
        if !self.gpu.is_atomic() {
            return;
        }
        for (i, (connector, crtc)) in self.connectors.iter().zip(&self.crtcs).enumerate() {
            connector
                .object()
                .set_pending(ConnectorProp::CrtcId as usize, crtc.id() as u64);
            crtc.object().set_pending(CrtcProp::Active as usize, 1);
            if let Some(mode) = connector.current_mode() {
                if let Err(err) = crtc
                    .object()
                    .set_pending_blob(CrtcProp::ModeId as usize, Some(&mode.blob_data()))
                {
                    warn!("Failed to create mode blob: {}", err);
                }
            }
            if let Some(plane) = self.primary_planes.get(i) {
                plane.set_crtc(crtc.id());
                plane.set_transformation(Transformations::ROTATE_0);
                self.stage_plane_geometry(i, plane);
            }
        }
        self.check_test_buffer();
    }

    /// Test the pending values together with all other pipelines of the gpu
    ///
    /// On success the pending values of this pipeline advance to next, otherwise they are reset.
    /// Legacy devices can not test, they only perform an outstanding mode-set.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn test(&self) -> bool {
        if self.gpu.is_atomic() {
            let held = self.gpu.pipelines();
            let mut pipelines: Vec<&DrmPipeline> = held.iter().map(|pipeline| &**pipeline).collect();
            if !pipelines.iter().any(|pipeline| std::ptr::eq(*pipeline, self)) {
                pipelines.push(self);
            }
            self.check_test_buffer() && self.atomic_test(&pipelines)
        } else if self.legacy_needs_modeset.get() {
            // keep the mode found in setup, usually the one the firmware left
            self.modeset(self.mode_index())
        } else {
            true
        }
    }

    /// Test the pending values of several pipelines with one test-only commit
    ///
    /// Nothing advances or rolls back, callers decide what to do with the result.
    #[profiling::function]
    pub fn test_pipelines(pipelines: &[&DrmPipeline]) -> bool {
        let Some(first) = pipelines.first() else {
            return true;
        };
        if !first.gpu.is_atomic() {
            return true;
        }

        let mut request = AtomicRequest::new();
        let mut flags = AtomicCommitFlags::empty();
        for pipeline in pipelines {
            if !pipeline.check_test_buffer() {
                return false;
            }
            pipeline.populate_atomic_values(&mut request, &mut flags);
        }
        let flags = (flags - AtomicCommitFlags::PAGE_FLIP_EVENT) | AtomicCommitFlags::TEST_ONLY;
        match first.gpu.device().atomic_commit(flags, &request) {
            Ok(()) => true,
            Err(err) => {
                trace!("Test commit of {} pipeline(s) failed: {}", pipelines.len(), err);
                false
            }
        }
    }

    fn atomic_test(&self, pipelines: &[&DrmPipeline]) -> bool {
        if Self::test_pipelines(pipelines) {
            self.accept_test();
            true
        } else {
            self.reject_test();
            false
        }
    }

    /// Advance the tested values to next and drop the replaced buffer
    pub(crate) fn accept_test(&self) {
        self.release_old_test_buffer();
        for object in &self.objects {
            object.object().commit_pending();
        }
    }

    /// Reset the pending values to the last tested state
    pub(crate) fn reject_test(&self) {
        self.restore_old_test_buffer();
        for object in &self.objects {
            object.object().rollback_pending();
        }
    }

    /// Present a buffer
    ///
    /// The buffer becomes the primary buffer of the pipeline. A failed atomic commit is
    /// retried once with refreshed properties.
    #[profiling::function]
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn present(&self, buffer: BufferId) -> bool {
        self.set_primary_buffer(Some(buffer));
        if self.gpu.stream_presenter()
            && !self.objects.iter().any(|object| object.object().needs_commit())
        {
            // the stream queues the flip, kms only carries pending changes
            return true;
        }

        if self.gpu.is_atomic() {
            if !self.atomic_commit() {
                self.update_properties();
                if !self.atomic_commit() {
                    warn!("Atomic present failed!");
                    self.print_debug_info();
                    return false;
                }
            }
            true
        } else if !self.present_legacy() {
            warn!("Present failed!");
            false
        } else {
            true
        }
    }

    fn atomic_commit(&self) -> bool {
        let mut request = AtomicRequest::new();
        let mut flags = AtomicCommitFlags::empty();
        self.populate_atomic_values(&mut request, &mut flags);

        let device = self.gpu.device();
        let test_flags = (flags - AtomicCommitFlags::PAGE_FLIP_EVENT) | AtomicCommitFlags::TEST_ONLY;
        let result = match device.atomic_commit(test_flags, &request) {
            Err(err) => {
                warn!("Atomic test failed! {}", err);
                self.print_debug_info();
                false
            }
            Ok(()) => match device.atomic_commit(flags, &request) {
                Err(err) => {
                    error!("Atomic commit failed! This never should've happened! {}", err);
                    self.dump_state(true);
                    false
                }
                Ok(()) => true,
            },
        };

        if result {
            self.release_old_test_buffer();
            for object in &self.objects {
                object.object().commit_pending();
            }
            for object in &self.objects {
                object.object().commit();
            }
            let mut arena = self.gpu.buffers().borrow_mut();
            for plane in &self.primary_planes {
                if self.active.get() {
                    plane.set_next(&mut arena, self.primary_buffer.get());
                } else {
                    plane.release_buffers(&mut arena);
                }
            }
        } else {
            self.restore_old_test_buffer();
            for object in &self.objects {
                object.object().rollback_pending();
            }
        }
        result
    }

    fn populate_atomic_values(&self, request: &mut AtomicRequest, flags: &mut AtomicCommitFlags) {
        if !self.gpu.stream_presenter() && self.active.get() {
            *flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        if self.objects.iter().any(ObjectRef::needs_modeset) {
            *flags |= AtomicCommitFlags::ALLOW_MODESET;
        } else {
            *flags |= AtomicCommitFlags::NONBLOCK;
        }
        self.last_flags.set(*flags);

        let framebuffer = if self.active.get() {
            self.primary_framebuffer().map(u32::from).unwrap_or(0)
        } else {
            0
        };
        for (i, plane) in self.primary_planes.iter().enumerate() {
            self.stage_plane_geometry(i, plane);
            plane.set_framebuffer(framebuffer);
        }
        for object in &self.objects {
            object.object().atomic_populate(request);
        }
    }

    fn stage_plane_geometry(&self, index: usize, plane: &DrmPlane) {
        let Some(connector) = self.connectors.get(index) else {
            return;
        };
        let mode_size = connector
            .current_mode()
            .map(|mode| mode.size())
            .unwrap_or_default();
        let source = self.rotated(mode_size);
        let (x, y) = connector.tile_pos();
        plane.set_source(Rectangle::from_loc_and_size(
            (x, y),
            (source.w.max(0) as u32, source.h.max(0) as u32),
        ));
        plane.set_destination(Rectangle::from_loc_and_size((0, 0), mode_size));
    }

    fn present_legacy(&self) -> bool {
        let crtc = &self.crtcs[0];
        let needs_modeset = {
            let arena = self.gpu.buffers().borrow();
            let current = crtc.current_buffer().and_then(|id| arena.get(id));
            let primary = self.primary_buffer.get().and_then(|id| arena.get(id));
            match (current, primary) {
                (_, None) => {
                    warn!("No buffer to present");
                    return false;
                }
                (None, Some(_)) => true,
                (Some(current), Some(primary)) => current.size() != primary.size(),
            }
        };
        if needs_modeset && !self.modeset(self.mode_index()) {
            return false;
        }

        self.last_flags.set(AtomicCommitFlags::PAGE_FLIP_EVENT);
        let Some(framebuffer) = self.primary_framebuffer() else {
            return false;
        };
        if let Err(err) = self.gpu.device().page_flip(crtc.handle(), framebuffer) {
            warn!("Page flip failed: {}", err);
            return false;
        }
        crtc.set_next(&mut self.gpu.buffers().borrow_mut(), self.primary_buffer.get());
        true
    }

    /// Switch to the mode with `mode_index`
    ///
    /// Atomic devices test the new mode, dropping a hardware rotation if the rotated mode fails.
    /// Legacy devices apply it right away.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn modeset(&self, mode_index: usize) -> bool {
        let old_index = self.mode_index();
        if self.gpu.is_atomic() {
            let mut works = self.stage_mode(mode_index) && self.test();
            if !works
                && self.transformation() != Transformations::ROTATE_0
                && self.set_pending_transformation(Transformations::ROTATE_0)
            {
                // the failed test reset the pending values
                works = self.stage_mode(mode_index) && self.test();
            }
            if !works {
                debug!("Modeset failed!");
                for object in &self.objects {
                    object.object().rollback_pending();
                }
                for connector in &self.connectors {
                    let _ = connector.set_mode_index(old_index);
                }
                return false;
            }
            true
        } else {
            self.modeset_legacy(mode_index, old_index)
        }
    }

    fn stage_mode(&self, mode_index: usize) -> bool {
        for (connector, crtc) in self.connectors.iter().zip(&self.crtcs) {
            if let Err(err) = connector.set_mode_index(mode_index) {
                warn!("{}", err);
                return false;
            }
            let Some(mode) = connector.current_mode() else {
                return false;
            };
            if let Err(err) = crtc
                .object()
                .set_pending_blob(CrtcProp::ModeId as usize, Some(&mode.blob_data()))
            {
                warn!("Failed to create mode blob: {}", err);
                return false;
            }
            if connector.has_overscan() {
                connector.set_overscan(connector.overscan(), mode.size());
            }
        }
        true
    }

    fn modeset_legacy(&self, mode_index: usize, old_index: usize) -> bool {
        let connector = &self.connectors[0];
        let crtc = &self.crtcs[0];
        if let Err(err) = connector.set_mode_index(mode_index) {
            warn!("{}", err);
            return false;
        }
        let mode = connector.current_mode().map(|mode| mode.mode());

        let applied = self.check_test_buffer()
            && match self.primary_framebuffer() {
                Some(framebuffer) => match self.gpu.device().set_crtc(
                    crtc.handle(),
                    Some(framebuffer),
                    &[connector.handle()],
                    mode,
                ) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("Modeset failed! {}", err);
                        false
                    }
                },
                None => {
                    warn!("Modeset failed: no buffer to scan out");
                    false
                }
            };
        if !applied {
            let _ = connector.set_mode_index(old_index);
            self.restore_old_test_buffer();
            return false;
        }

        self.release_old_test_buffer();
        crtc.set_current_mode(mode);
        let mut arena = self.gpu.buffers().borrow_mut();
        crtc.set_next(&mut arena, self.primary_buffer.get());
        crtc.flip_buffer(&mut arena);
        self.legacy_needs_modeset.set(false);
        true
    }

    /// Make sure a buffer of the current source size is attached
    ///
    /// Renders a test frame through the gpu's [`TestFrameSource`] or allocates a dumb buffer.
    /// The replaced buffer is kept, so a failing test can restore it.
    pub fn check_test_buffer(&self) -> bool {
        let size = self.source_size();
        let wanted = (size.w.max(0) as u32, size.h.max(0) as u32);
        if let Some(primary) = self.primary_buffer.get() {
            let arena = self.gpu.buffers().borrow();
            if arena.get(primary).map(|buffer| buffer.size() == wanted).unwrap_or(false) {
                return true;
            }
        }
        if !self.active.get() {
            return true;
        }

        let buffer = match (self.output.get(), self.gpu.test_frame_source()) {
            (Some(output), Some(source)) => match source.render_test_frame(output, size) {
                Some(buffer) => buffer,
                None => {
                    debug!("Failed to render a test frame");
                    return false;
                }
            },
            _ => match DumbBuffer::new(self.gpu.device(), wanted, DrmFourcc::Xrgb8888) {
                Ok(dumb) => self
                    .gpu
                    .buffers()
                    .borrow_mut()
                    .insert(Rc::new(dumb) as Rc<dyn DrmBuffer>, false),
                Err(err) => {
                    warn!("Failed to allocate a test buffer: {}", err);
                    return false;
                }
            },
        };

        let mut arena = self.gpu.buffers().borrow_mut();
        arena.mark(buffer, BufferUse::PRIMARY);
        arena.unmark(buffer, BufferUse::ACQUIRED);
        let previous = self.primary_buffer.replace(Some(buffer));
        if let Some(Some(stale)) = self.old_test_buffer.replace(Some(previous)) {
            arena.unmark(stale, BufferUse::PRIMARY);
        }
        true
    }

    fn set_primary_buffer(&self, buffer: Option<BufferId>) {
        let mut arena = self.gpu.buffers().borrow_mut();
        // a real frame supersedes any test buffer
        if let Some(Some(stale)) = self.old_test_buffer.take() {
            if Some(stale) != buffer {
                arena.unmark(stale, BufferUse::PRIMARY);
            }
        }
        let old = self.primary_buffer.replace(buffer);
        if old == buffer {
            return;
        }
        if let Some(buffer) = buffer {
            arena.mark(buffer, BufferUse::PRIMARY);
            arena.unmark(buffer, BufferUse::ACQUIRED);
        }
        if let Some(old) = old {
            arena.unmark(old, BufferUse::PRIMARY);
        }
    }

    fn release_old_test_buffer(&self) {
        if let Some(Some(old)) = self.old_test_buffer.take() {
            self.gpu.buffers().borrow_mut().unmark(old, BufferUse::PRIMARY);
        }
    }

    fn restore_old_test_buffer(&self) {
        if let Some(old) = self.old_test_buffer.take() {
            if let Some(test) = self.primary_buffer.replace(old) {
                if Some(test) != old {
                    self.gpu.buffers().borrow_mut().unmark(test, BufferUse::PRIMARY);
                }
            }
        }
    }

    fn primary_framebuffer(&self) -> Option<framebuffer::Handle> {
        let id = self.primary_buffer.get()?;
        self.gpu.buffers().borrow().get(id).map(|buffer| buffer.framebuffer())
    }

    /// Set the cursor image through the legacy cursor ioctl. `None` hides the cursor.
    #[instrument(level = "trace", parent = &self.span, skip(self, buffer))]
    pub fn set_cursor(&self, buffer: Option<Rc<DumbBuffer>>) -> bool {
        {
            let cursor = self.cursor.borrow();
            let unchanged = match (&cursor.buffer, &buffer) {
                (Some(old), Some(new)) => Rc::ptr_eq(old, new),
                (None, None) => true,
                _ => false,
            };
            if !cursor.image_dirty && unchanged {
                return true;
            }
        }

        let image = buffer.as_ref().map(|buffer| (buffer.handle(), buffer.size()));
        for crtc in &self.crtcs {
            if let Err(err) = self.gpu.device().set_cursor(crtc.handle(), image) {
                warn!("Could not set cursor: {}", err);
                return false;
            }
        }
        let mut cursor = self.cursor.borrow_mut();
        cursor.buffer = buffer;
        cursor.image_dirty = false;
        true
    }

    /// Move the cursor through the legacy cursor ioctl
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn move_cursor(&self, pos: Point<i32, Physical>) -> bool {
        {
            let cursor = self.cursor.borrow();
            if !cursor.pos_dirty && cursor.pos == pos {
                return true;
            }
        }
        for crtc in &self.crtcs {
            if let Err(err) = self.gpu.device().move_cursor(crtc.handle(), (pos.x, pos.y)) {
                warn!("Could not move cursor: {}", err);
                return false;
            }
        }
        let mut cursor = self.cursor.borrow_mut();
        cursor.pos = pos;
        cursor.pos_dirty = false;
        true
    }

    /// Enable or disable the pipeline
    ///
    /// Disabling clears the cursor and commits right away. Enabling only tests the new state,
    /// the next [`present`](DrmPipeline::present) commits it.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn set_active(&self, active: bool) -> bool {
        let device = self.gpu.device();
        if self.active.get() && !active {
            // cursor before primary plane, amdgpu crashes otherwise
            for crtc in &self.crtcs {
                if let Err(err) = device.set_cursor(crtc.handle(), None) {
                    warn!("Could not clear cursor: {}", err);
                }
            }
            self.cursor.borrow_mut().mark_dirty();
        }

        let was_active = self.active.replace(active);
        let success = if self.gpu.is_atomic() {
            for (i, (connector, crtc)) in self.connectors.iter().zip(&self.crtcs).enumerate() {
                let crtc_id = if active { crtc.id() } else { 0 };
                connector
                    .object()
                    .set_pending(ConnectorProp::CrtcId as usize, crtc_id as u64);
                crtc.object().set_pending(CrtcProp::Active as usize, active as u64);
                let mode = if active {
                    connector.current_mode().map(|mode| mode.blob_data())
                } else {
                    None
                };
                if let Err(err) = crtc
                    .object()
                    .set_pending_blob(CrtcProp::ModeId as usize, mode.as_deref())
                {
                    warn!("Failed to create mode blob: {}", err);
                }
                if let Some(plane) = self.primary_planes.get(i) {
                    plane.set_crtc(crtc_id);
                }
            }
            if active {
                let mut success = self.test();
                if !success {
                    self.update_properties();
                    success = self.test();
                }
                success
            } else {
                self.atomic_commit()
            }
        } else {
            let connector = &self.connectors[0];
            let dpms = connector
                .object()
                .prop(ConnectorProp::Dpms as usize)
                .map(|prop| prop.handle());
            match dpms {
                None => {
                    warn!("Setting active failed: dpms property missing!");
                    false
                }
                Some(prop) => {
                    let value = if active { DPMS_ON } else { DPMS_OFF };
                    match device.set_property(ObjectHandle::Connector(connector.handle()), prop, value) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!("Failed to set dpms: {}", err);
                            false
                        }
                    }
                }
            }
        };

        if !success {
            self.active.set(was_active);
            warn!("Setting active to {} failed", active);
        }
        if self.active.get() {
            let buffer = self.cursor.borrow().buffer.clone();
            self.set_cursor(buffer);
        }
        success
    }

    /// Apply a gamma ramp, through `GAMMA_LUT` where available
    #[instrument(level = "debug", parent = &self.span, skip(self, ramp))]
    pub fn set_gamma_ramp(&self, ramp: &GammaRamp) -> bool {
        // some older intel chips lack GAMMA_LUT on atomic
        if self.gpu.is_atomic() && self.crtcs[0].object().has(CrtcProp::GammaLut as usize) {
            let data = ramp.lut_data();
            for crtc in &self.crtcs {
                if let Err(err) = crtc
                    .object()
                    .set_pending_blob(CrtcProp::GammaLut as usize, Some(&data))
                {
                    warn!("Could not create gamma LUT property blob: {}", err);
                    return false;
                }
            }
            if !self.test() {
                warn!("Setting gamma failed!");
                return false;
            }
        } else {
            for crtc in &self.crtcs {
                if let Err(err) =
                    self.gpu
                        .device()
                        .set_gamma(crtc.handle(), ramp.red(), ramp.green(), ramp.blue())
                {
                    warn!("Setting gamma failed! {}", err);
                    return false;
                }
            }
        }
        true
    }

    /// Rotate the primary planes and test the result
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn set_transformation(&self, transformation: Transformations) -> bool {
        self.set_pending_transformation(transformation) && self.test()
    }

    fn set_pending_transformation(&self, transformation: Transformations) -> bool {
        if self.transformation() == transformation {
            return true;
        }
        if !self.gpu.is_atomic() {
            return false;
        }
        if !self
            .primary_planes
            .iter()
            .all(|plane| plane.set_transformation(transformation))
        {
            for plane in &self.primary_planes {
                plane.object().rollback_pending();
            }
            return false;
        }
        true
    }

    /// Switch between fixed and variable refresh rate
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn set_sync_mode(&self, mode: SyncMode) -> bool {
        if !self.vrr_capable() {
            return mode == SyncMode::Fixed;
        }
        let vrr = (mode == SyncMode::Adaptive) as u64;
        if self.gpu.is_atomic() {
            let mut needs_test = false;
            for crtc in &self.crtcs {
                match crtc.object().pending(CrtcProp::VrrEnabled as usize) {
                    None => return false,
                    Some(pending) if pending != vrr => {
                        needs_test = true;
                        crtc.object().set_pending(CrtcProp::VrrEnabled as usize, vrr);
                    }
                    Some(_) => {}
                }
            }
            !needs_test || self.test()
        } else {
            let crtc = &self.crtcs[0];
            let prop = crtc
                .object()
                .prop(CrtcProp::VrrEnabled as usize)
                .map(|prop| prop.handle());
            match prop {
                Some(prop) => self
                    .gpu
                    .device()
                    .set_property(ObjectHandle::Crtc(crtc.handle()), prop, vrr)
                    .map_err(|err| warn!("Failed to set VRR_ENABLED: {}", err))
                    .is_ok(),
                None => false,
            }
        }
    }

    /// Set the overscan in percent, only for single connector pipelines
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn set_overscan(&self, overscan: u32) -> bool {
        if overscan > 100
            || self.connectors.len() > 1
            || (overscan != 0 && !self.connectors[0].has_overscan())
        {
            return false;
        }
        let connector = &self.connectors[0];
        let size = connector
            .current_mode()
            .map(|mode| mode.size())
            .unwrap_or_default();
        connector.set_overscan(overscan, size);
        self.test()
    }

    /// The pending buffer reached the screen
    #[profiling::function]
    pub fn page_flipped(&self) {
        let mut arena = self.gpu.buffers().borrow_mut();
        for object in &self.objects {
            match object {
                ObjectRef::Crtc(crtc) => crtc.flip_buffer(&mut arena),
                ObjectRef::Plane(plane) => plane.flip_buffer(&mut arena),
                ObjectRef::Connector(_) => {}
            }
        }
    }

    /// Re-read the properties of all objects
    pub fn update_properties(&self) {
        for object in &self.objects {
            if let Err(err) = object.object().update_properties() {
                warn!(
                    "Failed to update properties of {} {}: {}",
                    object.kind(),
                    object.object().id(),
                    err
                );
            }
        }
        // the cursor state is unknown after a vt switch with legacy
        self.cursor.borrow_mut().mark_dirty();
    }

    /// Whether the kernel state matches the objects of this pipeline
    ///
    /// True iff every connector and primary plane is attached to its crtc.
    pub fn is_connected(&self) -> bool {
        if self.primary_planes.is_empty() {
            return false;
        }
        self.connectors
            .iter()
            .zip(&self.crtcs)
            .zip(&self.primary_planes)
            .all(|((connector, crtc), plane)| {
                connector.object().current(ConnectorProp::CrtcId as usize) == Some(crtc.id() as u64)
                    && plane.current_crtc() == crtc.id() as u64
            })
    }

    /// Whether every tile of a tiled display is driven by this pipeline
    pub fn is_complete(&self) -> bool {
        let Some(tile) = self.connectors[0].tile() else {
            return true;
        };
        if self.gpu.uses_streams() {
            return true;
        }
        (0..tile.num_tiles_x).all(|x| {
            (0..tile.num_tiles_y).all(|y| {
                self.connectors.iter().any(|connector| {
                    connector
                        .tile()
                        .map(|info| info.group_id == tile.group_id && info.loc_x == x && info.loc_y == y)
                        .unwrap_or(false)
                })
            })
        })
    }

    /// Log the last commit flags and all properties
    pub fn print_debug_info(&self) {
        self.dump_state(false);
    }

    fn dump_state(&self, error: bool) {
        let flags = self.last_flags.get();
        let mut lines = vec![if flags.is_empty() {
            String::from("Flags: none")
        } else {
            format!("Flags: {:?}", flags)
        }];
        lines.push(String::from("Drm objects:"));
        for object in &self.objects {
            lines.push(format!("{} {}", object.kind(), object.object().id()));
            lines.extend(object.object().describe().into_iter().map(|line| format!("\t{}", line)));
        }
        for line in lines {
            if error {
                error!(parent: &self.span, "{}", line);
            } else {
                warn!(parent: &self.span, "{}", line);
            }
        }
    }

    fn rotated(&self, size: Size<i32, Physical>) -> Size<i32, Physical> {
        if self
            .transformation()
            .intersects(Transformations::ROTATE_90 | Transformations::ROTATE_270)
        {
            (size.h, size.w).into()
        } else {
            size
        }
    }

    /// Size of the buffers this pipeline scans out
    pub fn source_size(&self) -> Size<i32, Physical> {
        self.rotated(self.connectors[0].total_mode_size(self.mode_index()))
    }

    /// Pending rotation of the primary planes
    pub fn transformation(&self) -> Transformations {
        self.primary_planes
            .first()
            .map(|plane| plane.transformation())
            .unwrap_or(Transformations::ROTATE_0)
    }

    /// Whether the pipeline is enabled
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Whether the cursor overlaps the screen
    pub fn is_cursor_visible(&self) -> bool {
        let cursor = self.cursor.borrow();
        let Some(buffer) = &cursor.buffer else {
            return false;
        };
        let (w, h) = buffer.size();
        let screen = Rectangle::from_size(self.connectors[0].total_mode_size(self.mode_index()));
        Rectangle::from_loc_and_size(cursor.pos, (w as i32, h as i32)).overlaps(screen)
    }

    /// Last cursor position applied
    pub fn cursor_pos(&self) -> Point<i32, Physical> {
        self.cursor.borrow().pos
    }

    /// The gpu of the pipeline
    pub fn gpu(&self) -> &Rc<GpuContext> {
        &self.gpu
    }

    /// All connectors, one per tile
    pub fn connectors(&self) -> &[Rc<DrmConnector>] {
        &self.connectors
    }

    /// All crtcs, one per tile
    pub fn crtcs(&self) -> &[Rc<DrmCrtc>] {
        &self.crtcs
    }

    /// All primary planes, empty on legacy devices
    pub fn primary_planes(&self) -> &[Rc<DrmPlane>] {
        &self.primary_planes
    }

    /// The first connector
    pub fn connector(&self) -> &Rc<DrmConnector> {
        &self.connectors[0]
    }

    /// The first crtc
    pub fn crtc(&self) -> &Rc<DrmCrtc> {
        &self.crtcs[0]
    }

    /// The first primary plane
    pub fn primary_plane(&self) -> Option<&Rc<DrmPlane>> {
        self.primary_planes.first()
    }

    /// All bound objects
    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    /// Latest buffer handed to the pipeline
    pub fn primary_buffer(&self) -> Option<BufferId> {
        self.primary_buffer.get()
    }

    /// Buffer on screen
    pub fn current_buffer(&self) -> Option<BufferId> {
        match self.primary_planes.first() {
            Some(plane) => plane.current_buffer(),
            None => self.crtcs[0].current_buffer(),
        }
    }

    /// Flags of the last commit
    pub fn last_flags(&self) -> AtomicCommitFlags {
        self.last_flags.get()
    }

    /// Output presenting through this pipeline
    pub fn output(&self) -> Option<OutputId> {
        self.output.get()
    }

    pub(crate) fn set_output(&self, output: Option<OutputId>) {
        self.output.set(output);
    }

    /// Index of the selected mode
    pub fn mode_index(&self) -> usize {
        self.connectors[0].mode_index()
    }

    /// Modes of the pipeline
    pub fn mode_list(&self) -> Vec<PipelineMode> {
        let connector = &self.connectors[0];
        let modes = connector.modes();
        modes
            .iter()
            .enumerate()
            .map(|(i, mode)| PipelineMode {
                size: connector.total_mode_size(i),
                refresh_rate: mode.refresh_rate(),
                preferred: mode.is_preferred(),
            })
            .collect()
    }

    /// The selected mode
    pub fn current_mode(&self) -> Option<PipelineMode> {
        let connector = &self.connectors[0];
        connector.current_mode().map(|mode| PipelineMode {
            size: connector.total_mode_size(self.mode_index()),
            refresh_rate: mode.refresh_rate(),
            preferred: mode.is_preferred(),
        })
    }

    /// Whether all monitors support variable refresh rates
    pub fn vrr_capable(&self) -> bool {
        self.connectors.iter().all(|connector| connector.vrr_capable())
    }

    /// Whether overscan can be set
    pub fn has_overscan(&self) -> bool {
        self.connectors.len() == 1 && self.connectors[0].has_overscan()
    }

    /// Tile group of a tiled display
    pub fn tiling_group(&self) -> Option<u32> {
        self.connectors[0].tile().map(|tile| tile.group_id)
    }
}

impl Drop for DrmPipeline {
    fn drop(&mut self) {
        if let Ok(mut arena) = self.gpu.buffers().try_borrow_mut() {
            if let Some(Some(old)) = self.old_test_buffer.take() {
                arena.unmark(old, BufferUse::PRIMARY);
            }
            if let Some(primary) = self.primary_buffer.take() {
                arena.unmark(primary, BufferUse::PRIMARY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use drm_fourcc::DrmFourcc;

    use super::{DrmPipeline, GammaRamp, GpuContext, SyncMode};
    use crate::backend::drm::{
        buffer::{BufferId, BufferUse, DrmBuffer, DumbBuffer},
        config::DrmConfig,
        device::{
            dummy::{test_mode, DeviceCall, DummyDevice, DummyPlaneType},
            AtomicCommitFlags, KmsDevice,
        },
        object::{ConnectorProp, CrtcProp, DrmConnector, DrmCrtc, DrmPlane, Transformations},
    };

    struct Fixture {
        dummy: Rc<DummyDevice>,
        gpu: Rc<GpuContext>,
        connector: Rc<DrmConnector>,
        crtc: Rc<DrmCrtc>,
        plane: Option<Rc<DrmPlane>>,
    }

    impl Fixture {
        fn new(dummy: DummyDevice, rotation: bool) -> Fixture {
            let dummy = Rc::new(dummy);
            let atomic = dummy.enable_atomic();
            let crtc = dummy.add_crtc();
            let plane = dummy.add_plane(DummyPlaneType::Primary, 0b1, rotation);
            let connector = dummy.add_connector(vec![test_mode(640, 480, 60, true), test_mode(320, 240, 60, false)], 0b1);
            let device: Rc<dyn KmsDevice> = dummy.clone();
            let gpu = Rc::new(GpuContext::new(
                device.clone(),
                atomic,
                false,
                DrmConfig::default(),
                tracing::Span::none(),
            ));
            Fixture {
                connector: DrmConnector::new(device.clone(), connector, atomic).unwrap(),
                crtc: DrmCrtc::new(device.clone(), crtc, 0, atomic).unwrap(),
                plane: atomic.then(|| DrmPlane::new(device, plane).unwrap()),
                dummy,
                gpu,
            }
        }

        fn pipeline(&self) -> Rc<DrmPipeline> {
            let pipeline = Rc::new(DrmPipeline::new(
                self.gpu.clone(),
                self.connector.clone(),
                self.crtc.clone(),
                self.plane.clone(),
            ));
            self.gpu.register_pipeline(&pipeline);
            pipeline
        }

        fn buffer(&self, size: (u32, u32)) -> BufferId {
            let dumb = DumbBuffer::new(self.gpu.device(), size, DrmFourcc::Xrgb8888).unwrap();
            self.gpu
                .buffers()
                .borrow_mut()
                .insert(Rc::new(dumb) as Rc<dyn DrmBuffer>, true)
        }
    }

    #[test]
    fn connected_once_committed() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(!pipeline.is_connected());
        assert!(pipeline.test());
        assert!(!pipeline.is_connected());

        let buffer = fixture.buffer((640, 480));
        assert!(pipeline.present(buffer));
        assert!(pipeline.is_connected());
        assert_eq!(
            fixture.dummy.value(fixture.connector.id(), "CRTC_ID"),
            Some(fixture.crtc.id() as u64)
        );
        assert!(pipeline.last_flags().contains(AtomicCommitFlags::PAGE_FLIP_EVENT));
        assert!(pipeline.last_flags().contains(AtomicCommitFlags::ALLOW_MODESET));
    }

    #[test]
    fn buffers_follow_page_flips() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        let first = fixture.buffer((640, 480));
        assert!(pipeline.present(first));
        assert_eq!(
            fixture.gpu.buffers().borrow().uses(first),
            BufferUse::PRIMARY | BufferUse::IN_FLIGHT
        );
        pipeline.page_flipped();
        assert_eq!(pipeline.current_buffer(), Some(first));

        let second = fixture.buffer((640, 480));
        assert!(pipeline.present(second));
        assert!(pipeline.last_flags().contains(AtomicCommitFlags::NONBLOCK));
        assert_eq!(fixture.gpu.buffers().borrow().uses(first), BufferUse::SCANOUT);
        pipeline.page_flipped();
        assert!(fixture.gpu.buffers().borrow().uses(first).is_empty());
        assert_eq!(pipeline.current_buffer(), Some(second));
    }

    #[test]
    fn disable_clears_cursor_before_commit() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.present(fixture.buffer((640, 480))));
        fixture.dummy.clear_calls();

        assert!(pipeline.set_active(false));
        let calls = fixture.dummy.calls();
        let cursor = calls
            .iter()
            .position(|call| *call == DeviceCall::SetCursor(fixture.crtc.handle(), false))
            .unwrap();
        let commit = calls
            .iter()
            .position(|call| matches!(call, DeviceCall::AtomicCommit(_)))
            .unwrap();
        assert!(cursor < commit);
        assert_eq!(fixture.dummy.value(fixture.crtc.id(), "ACTIVE"), Some(0));
        assert!(!pipeline.is_active());
    }

    #[test]
    fn enable_tests_and_restores_cursor() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.present(fixture.buffer((640, 480))));
        let cursor = Rc::new(DumbBuffer::new(fixture.gpu.device(), (64, 64), DrmFourcc::Argb8888).unwrap());
        assert!(pipeline.set_cursor(Some(cursor)));
        assert!(pipeline.set_active(false));
        fixture.dummy.clear_calls();

        assert!(pipeline.set_active(true));
        assert_eq!(
            fixture
                .dummy
                .count_calls(|call| matches!(call, DeviceCall::AtomicCommit(_))),
            0
        );
        assert!(fixture
            .dummy
            .calls()
            .contains(&DeviceCall::SetCursor(fixture.crtc.handle(), true)));
        assert_eq!(
            fixture.crtc.object().prop(CrtcProp::Active as usize).unwrap().next(),
            1
        );
    }

    #[test]
    fn rotation_falls_back_to_rotate_0() {
        let fixture = Fixture::new(DummyDevice::new(), true);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.test());
        assert!(pipeline.set_transformation(Transformations::ROTATE_90));
        assert_eq!(pipeline.source_size(), (480, 640).into());

        let rotate_90 = Transformations::ROTATE_90.bits();
        fixture
            .dummy
            .reject_tests_where(move |request| request.iter().any(|(_, name, value)| name == "rotation" && *value == rotate_90));
        assert!(pipeline.modeset(1));
        assert_eq!(pipeline.transformation(), Transformations::ROTATE_0);
        assert_eq!(pipeline.mode_index(), 1);
    }

    #[test]
    fn failed_modeset_keeps_mode() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.test());
        fixture.dummy.reject_tests_where(|_| true);
        assert!(!pipeline.modeset(1));
        assert_eq!(pipeline.mode_index(), 0);
    }

    #[test]
    fn present_retries_once() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();

        let failures = Rc::new(Cell::new(1u32));
        let remaining = failures.clone();
        fixture.dummy.reject_commits_where(move |_| {
            let left = remaining.get();
            remaining.set(left.saturating_sub(1));
            left > 0
        });
        assert!(pipeline.present(fixture.buffer((640, 480))));
        assert_eq!(failures.get(), 0);
        assert_eq!(
            fixture
                .dummy
                .count_calls(|call| matches!(call, DeviceCall::AtomicCommit(_))),
            2
        );
    }

    #[test]
    fn failed_present_rolls_back() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.test());
        fixture.dummy.reject_commits_where(|_| true);

        assert!(!pipeline.present(fixture.buffer((640, 480))));
        for object in pipeline.objects() {
            for index in 0..13 {
                if let Some(prop) = object.object().prop(index) {
                    assert_eq!(prop.pending(), prop.next(), "{}", prop.name());
                }
            }
        }
        assert!(!pipeline.is_connected());
    }

    #[test]
    fn batched_test_advances_all_objects() {
        let dummy = Rc::new(DummyDevice::new());
        let crtcs = [dummy.add_crtc(), dummy.add_crtc()];
        let planes = [
            dummy.add_plane(DummyPlaneType::Primary, 0b01, false),
            dummy.add_plane(DummyPlaneType::Primary, 0b10, false),
        ];
        let connectors = [
            dummy.add_connector(vec![test_mode(640, 480, 60, true)], 0b11),
            dummy.add_connector(vec![test_mode(800, 600, 60, true)], 0b11),
        ];
        let device: Rc<dyn KmsDevice> = dummy.clone();
        let gpu = Rc::new(GpuContext::new(
            device.clone(),
            true,
            false,
            DrmConfig::default(),
            tracing::Span::none(),
        ));
        let pipelines: Vec<DrmPipeline> = (0..2)
            .map(|i| {
                let pipeline = DrmPipeline::new(
                    gpu.clone(),
                    DrmConnector::new(device.clone(), connectors[i], true).unwrap(),
                    DrmCrtc::new(device.clone(), crtcs[i], i, true).unwrap(),
                    Some(DrmPlane::new(device.clone(), planes[i]).unwrap()),
                );
                pipeline.setup();
                pipeline
            })
            .collect();

        dummy.clear_calls();
        let batch: Vec<&DrmPipeline> = pipelines.iter().collect();
        assert!(DrmPipeline::test_pipelines(&batch));
        assert_eq!(dummy.count_calls(|call| *call == DeviceCall::AtomicTest), 1);

        for pipeline in &pipelines {
            for object in pipeline.objects() {
                object.object().commit_pending();
                for index in 0..13 {
                    if let Some(prop) = object.object().prop(index) {
                        assert_eq!(prop.next(), prop.pending(), "{}", prop.name());
                    }
                }
            }
        }
        assert_eq!(
            pipelines[1]
                .connector()
                .object()
                .prop(ConnectorProp::CrtcId as usize)
                .unwrap()
                .next(),
            u32::from(crtcs[1]) as u64
        );
    }

    #[test]
    fn legacy_test_only_modesets() {
        let fixture = Fixture::new(DummyDevice::legacy(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();

        assert!(pipeline.test());
        assert!(pipeline.test());
        assert_eq!(
            fixture
                .dummy
                .count_calls(|call| matches!(call, DeviceCall::SetCrtc(_))),
            1
        );
        assert!(DrmPipeline::test_pipelines(&[&pipeline]));
        assert!(!pipeline.is_connected());

        assert!(pipeline.present(fixture.buffer((640, 480))));
        assert!(fixture
            .dummy
            .calls()
            .contains(&DeviceCall::PageFlip(fixture.crtc.handle())));
    }

    #[test]
    fn legacy_test_keeps_the_firmware_mode() {
        let fixture = Fixture::new(DummyDevice::legacy(), false);
        fixture.crtc.set_current_mode(Some(test_mode(320, 240, 60, false)));
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert_eq!(pipeline.mode_index(), 1);

        assert!(pipeline.test());
        assert_eq!(pipeline.mode_index(), 1);
        assert_eq!(pipeline.source_size(), (320, 240).into());
        assert_eq!(
            fixture
                .dummy
                .count_calls(|call| matches!(call, DeviceCall::SetCrtc(_))),
            1
        );
    }

    #[test]
    fn legacy_modeset_failure_restores_mode() {
        let fixture = Fixture::new(DummyDevice::legacy(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        fixture.dummy.fail_legacy(true);
        assert!(!pipeline.modeset(1));
        assert_eq!(pipeline.mode_index(), 0);
    }

    #[test]
    fn sync_mode_requires_capable_monitor() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.set_sync_mode(SyncMode::Fixed));
        assert!(!pipeline.set_sync_mode(SyncMode::Adaptive));

        fixture.dummy.set_value(fixture.connector.id(), "vrr_capable", 1);
        fixture.connector.refresh().unwrap();
        assert!(pipeline.set_sync_mode(SyncMode::Adaptive));
        assert_eq!(
            fixture
                .crtc
                .object()
                .prop(CrtcProp::VrrEnabled as usize)
                .unwrap()
                .next(),
            1
        );
    }

    #[test]
    fn overscan_bounds() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(!pipeline.set_overscan(101));
        assert!(!pipeline.set_overscan(10));
        assert!(pipeline.set_overscan(0));
    }

    #[test]
    fn gamma_reuses_identical_blobs() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        pipeline.setup();
        assert!(pipeline.test());

        let ramp = GammaRamp::linear(256);
        fixture.dummy.clear_calls();
        assert!(pipeline.set_gamma_ramp(&ramp));
        assert_eq!(
            fixture
                .dummy
                .count_calls(|call| matches!(call, DeviceCall::CreateBlob(_))),
            1
        );
        assert!(pipeline.set_gamma_ramp(&ramp));
        assert_eq!(
            fixture
                .dummy
                .count_calls(|call| matches!(call, DeviceCall::CreateBlob(_))),
            1
        );
    }

    #[test]
    fn cursor_fast_path() {
        let fixture = Fixture::new(DummyDevice::new(), false);
        let pipeline = fixture.pipeline();
        let cursor = Rc::new(DumbBuffer::new(fixture.gpu.device(), (64, 64), DrmFourcc::Argb8888).unwrap());
        fixture.dummy.clear_calls();

        assert!(pipeline.set_cursor(Some(cursor.clone())));
        assert!(pipeline.set_cursor(Some(cursor)));
        assert!(pipeline.move_cursor((10, 10).into()));
        assert!(pipeline.move_cursor((10, 10).into()));
        assert_eq!(fixture.dummy.calls().len(), 2);
        assert_eq!(pipeline.cursor_pos(), (10, 10).into());
        assert!(pipeline.is_cursor_visible());

        pipeline.update_properties();
        assert!(pipeline.move_cursor((10, 10).into()));
        assert_eq!(fixture.dummy.calls().len(), 3);
    }

    #[test]
    fn gamma_ramp_layout() {
        assert!(GammaRamp::new(vec![0; 4], vec![0; 3], vec![0; 4]).is_none());
        let ramp = GammaRamp::linear(2);
        assert_eq!(ramp.red(), &[0, u16::MAX]);
        let data = ramp.lut_data();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[8..10], &u16::MAX.to_ne_bytes());
        assert_eq!(&data[14..16], &[0, 0]);
    }
}
