//! Outputs driven by a drm pipeline
//!
//! A [`DrmOutput`] is what the compositor sees of a configured monitor. It forwards
//! configuration changes to its [`DrmPipeline`], keeps the hardware cursor buffers and reports
//! frame completion through its [`RenderLoop`].
//!
//! The pipeline of an output may be replaced while the gpu searches for a new configuration,
//! the output itself keeps its identity.

use std::{
    cell::{Cell, Ref, RefCell},
    fmt,
    rc::Rc,
    time::Duration,
};

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace, warn};

use super::{
    buffer::{BufferId, DrmBuffer, DumbBuffer},
    device::AtomicCommitFlags,
    object::Transformations,
    pipeline::{DrmPipeline, GammaRamp, GpuContext, PipelineMode, SyncMode},
};
use crate::utils::{Physical, Point, PresentationClock, SignalToken, Signaler, Size, Transform};

crate::utils::ids::id_gen!(output_id);

/// Unique identifier of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(usize);

impl OutputId {
    pub(crate) fn next() -> OutputId {
        OutputId(output_id::next())
    }
}

/// Progress of the frames of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// A frame reached the screen, at the given monotonic time
    Completed(Duration),
    /// A frame could not be presented
    Failed,
}

#[derive(Debug)]
struct RenderLoopInner {
    refresh_rate: Cell<u32>,
    last_presentation: Cell<Option<Duration>>,
    completed: Cell<u64>,
    failed: Cell<u64>,
    signaler: Signaler<FrameEvent>,
}

/// Frame timing of an output
///
/// Clones refer to the same loop.
#[derive(Debug, Clone)]
pub struct RenderLoop {
    inner: Rc<RenderLoopInner>,
}

impl RenderLoop {
    /// Create a loop for a refresh rate in mHz
    pub fn new(refresh_rate: u32) -> RenderLoop {
        RenderLoop {
            inner: Rc::new(RenderLoopInner {
                refresh_rate: Cell::new(refresh_rate),
                last_presentation: Cell::new(None),
                completed: Cell::new(0),
                failed: Cell::new(0),
                signaler: Signaler::new(),
            }),
        }
    }

    /// Refresh rate in mHz
    pub fn refresh_rate(&self) -> u32 {
        self.inner.refresh_rate.get()
    }

    /// Update the refresh rate after a mode change
    pub fn set_refresh_rate(&self, refresh_rate: u32) {
        self.inner.refresh_rate.set(refresh_rate);
    }

    /// Duration of one refresh cycle
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.inner.refresh_rate.get() {
            0 => None,
            rate => Some(Duration::from_nanos(1_000_000_000_000 / rate as u64)),
        }
    }

    /// Monotonic time the last frame reached the screen
    pub fn last_presentation_time(&self) -> Option<Duration> {
        self.inner.last_presentation.get()
    }

    /// Estimated time of the next vblank
    pub fn next_presentation_time(&self) -> Option<Duration> {
        Some(self.inner.last_presentation.get()? + self.refresh_interval()?)
    }

    /// Number of frames that reached the screen
    pub fn completed_frames(&self) -> u64 {
        self.inner.completed.get()
    }

    /// Number of frames that failed
    pub fn failed_frames(&self) -> u64 {
        self.inner.failed.get()
    }

    /// A frame reached the screen at `timestamp`, in the monotonic clock
    pub fn notify_frame_completed(&self, timestamp: Duration) {
        self.inner.last_presentation.set(Some(timestamp));
        self.inner.completed.set(self.inner.completed.get() + 1);
        self.inner.signaler.signal(FrameEvent::Completed(timestamp));
    }

    /// A frame could not be presented
    pub fn notify_frame_failed(&self) {
        self.inner.failed.set(self.inner.failed.get() + 1);
        self.inner.signaler.signal(FrameEvent::Failed);
    }

    /// Get notified of frame completions and failures
    #[must_use]
    pub fn register<F: FnMut(&FrameEvent) + 'static>(&self, callback: F) -> SignalToken {
        self.inner.signaler.register(callback)
    }
}

/// A monitor driven by a pipeline
pub struct DrmOutput {
    id: OutputId,
    gpu: Rc<GpuContext>,
    pipeline: RefCell<Rc<DrmPipeline>>,
    name: String,
    render_loop: RenderLoop,
    page_flip_pending: Cell<bool>,
    transform: Cell<Transform>,
    cursors: RefCell<Vec<Rc<DumbBuffer>>>,
    cursor_index: Cell<usize>,
}

impl fmt::Debug for DrmOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmOutput")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("page_flip_pending", &self.page_flip_pending.get())
            .finish_non_exhaustive()
    }
}

impl DrmOutput {
    /// Create an output presenting through `pipeline`
    pub fn new(gpu: Rc<GpuContext>, pipeline: Rc<DrmPipeline>) -> Rc<DrmOutput> {
        let id = OutputId::next();
        pipeline.set_output(Some(id));
        let refresh_rate = pipeline
            .current_mode()
            .map(|mode| mode.refresh_rate)
            .unwrap_or(60_000);
        let name = pipeline.connector().name();
        debug!("Created output {} ({:?})", name, id);
        Rc::new(DrmOutput {
            id,
            gpu,
            name,
            render_loop: RenderLoop::new(refresh_rate),
            pipeline: RefCell::new(pipeline),
            page_flip_pending: Cell::new(false),
            transform: Cell::new(Transform::Normal),
            cursors: RefCell::new(Vec::new()),
            cursor_index: Cell::new(0),
        })
    }

    /// Identifier of the output
    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Connector name, like `DP-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The gpu driving the output
    pub fn gpu(&self) -> &Rc<GpuContext> {
        &self.gpu
    }

    /// The pipeline presenting the frames
    pub fn pipeline(&self) -> Rc<DrmPipeline> {
        self.pipeline.borrow().clone()
    }

    /// Swap the pipeline, returning the previous one
    pub(crate) fn set_pipeline(&self, pipeline: Rc<DrmPipeline>) -> Rc<DrmPipeline> {
        pipeline.set_output(Some(self.id));
        let old = self.pipeline.replace(pipeline);
        if !Rc::ptr_eq(&old, &*self.pipeline.borrow()) {
            old.set_output(None);
        }
        old
    }

    /// Frame timing of the output
    pub fn render_loop(&self) -> &RenderLoop {
        &self.render_loop
    }

    /// Whether a presented frame waits for its page flip
    pub fn is_page_flip_pending(&self) -> bool {
        self.page_flip_pending.get()
    }

    /// Present a frame from the gpu's buffer arena
    ///
    /// Failures are reported to the render loop.
    #[profiling::function]
    pub fn present(&self, buffer: BufferId) -> bool {
        let pipeline = self.pipeline();
        if !pipeline.is_active() {
            debug!("Refusing to present on disabled output {}", self.name);
            self.render_loop.notify_frame_failed();
            return false;
        }
        if !pipeline.present(buffer) {
            self.render_loop.notify_frame_failed();
            return false;
        }
        if pipeline.last_flags().contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            self.page_flip_pending.set(true);
        } else {
            // no event will arrive for this frame
            pipeline.page_flipped();
            self.render_loop
                .notify_frame_completed(PresentationClock::Monotonic.now());
        }
        true
    }

    /// The presented frame reached the screen at `timestamp`, in the monotonic clock
    pub fn page_flipped(&self, timestamp: Duration) {
        trace!("Page flip on output {}", self.name);
        self.page_flip_pending.set(false);
        self.pipeline().page_flipped();
        self.render_loop.notify_frame_completed(timestamp);
    }

    /// Allocate the hardware cursor buffers
    ///
    /// Returns `false` if they could not be created, compositors should fall back to
    /// software cursors then.
    pub fn init_cursor(&self, size: (u32, u32)) -> bool {
        let mut cursors = Vec::with_capacity(2);
        for _ in 0..2 {
            match DumbBuffer::new(self.gpu.device(), size, DrmFourcc::Argb8888) {
                Ok(buffer) => cursors.push(Rc::new(buffer)),
                Err(err) => {
                    warn!("Failed to create cursor buffer for output {}: {}", self.name, err);
                    return false;
                }
            }
        }
        *self.cursors.borrow_mut() = cursors;
        true
    }

    /// Size of the hardware cursor, if one was created
    pub fn cursor_size(&self) -> Option<(u32, u32)> {
        self.cursors
            .borrow()
            .first()
            .map(|buffer| buffer.size())
    }

    /// Draw a new cursor image and show it
    ///
    /// The image is drawn into the cursor buffer not currently on screen.
    pub fn update_cursor(&self, draw: impl FnOnce(&mut [u8])) -> bool {
        let buffer = {
            let cursors = self.cursors.borrow();
            if cursors.is_empty() {
                return false;
            }
            let index = (self.cursor_index.get() + 1) % cursors.len();
            self.cursor_index.set(index);
            cursors[index].clone()
        };
        if let Err(err) = buffer.map(draw) {
            warn!("Failed to map cursor buffer: {}", err);
            return false;
        }
        self.pipeline().set_cursor(Some(buffer))
    }

    /// Hide the hardware cursor
    pub fn hide_cursor(&self) -> bool {
        self.pipeline().set_cursor(None)
    }

    /// Move the hardware cursor
    pub fn move_cursor(&self, position: Point<i32, Physical>) -> bool {
        self.pipeline().move_cursor(position)
    }

    /// Whether the output scans out frames
    pub fn is_enabled(&self) -> bool {
        self.pipeline().is_active()
    }

    /// Enable or disable the output
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let pipeline = self.pipeline();
        if !pipeline.set_active(enabled) {
            return false;
        }
        if !enabled {
            // a disabled crtc sends no more events
            self.page_flip_pending.set(false);
        }
        true
    }

    /// Modes of the monitor
    pub fn modes(&self) -> Vec<PipelineMode> {
        self.pipeline().mode_list()
    }

    /// The selected mode
    pub fn current_mode(&self) -> Option<PipelineMode> {
        self.pipeline().current_mode()
    }

    /// Switch to the mode with `index`
    pub fn set_mode(&self, index: usize) -> bool {
        let pipeline = self.pipeline();
        if !pipeline.modeset(index) {
            return false;
        }
        if let Some(mode) = pipeline.current_mode() {
            self.render_loop.set_refresh_rate(mode.refresh_rate);
        }
        // the new mode may have dropped the hardware rotation
        if pipeline.transformation() == Transformations::ROTATE_0 {
            self.transform.set(Transform::Normal);
        }
        true
    }

    /// Current transform of the output
    pub fn transform(&self) -> Transform {
        self.transform.get()
    }

    /// Rotate the output through the primary plane
    ///
    /// Fails if the hardware can not rotate, compositors should rotate while rendering then.
    pub fn set_transform(&self, transform: Transform) -> bool {
        if self
            .pipeline()
            .set_transformation(Transformations::from_transform(transform))
        {
            self.transform.set(transform);
            true
        } else {
            false
        }
    }

    /// Size of the buffers the output scans out
    pub fn pixel_size(&self) -> Size<i32, Physical> {
        self.pipeline().source_size()
    }

    /// Physical size in millimeters
    pub fn physical_size(&self) -> Option<(u32, u32)> {
        self.pipeline().connector().physical_size()
    }

    /// Raw EDID of the monitor
    pub fn edid(&self) -> Option<Vec<u8>> {
        self.pipeline().connector().edid()
    }

    /// Number of gamma ramp entries
    pub fn gamma_ramp_size(&self) -> u32 {
        self.pipeline().crtc().gamma_ramp_size()
    }

    /// Apply a gamma ramp
    pub fn set_gamma_ramp(&self, ramp: &GammaRamp) -> bool {
        self.pipeline().set_gamma_ramp(ramp)
    }

    /// Whether the monitor supports variable refresh rates
    pub fn vrr_capable(&self) -> bool {
        self.pipeline().vrr_capable()
    }

    /// Switch between fixed and adaptive refresh
    pub fn set_sync_mode(&self, mode: SyncMode) -> bool {
        self.pipeline().set_sync_mode(mode)
    }

    /// Whether overscan can be configured
    pub fn has_overscan(&self) -> bool {
        self.pipeline().has_overscan()
    }

    /// Set the overscan in percent
    pub fn set_overscan(&self, overscan: u32) -> bool {
        self.pipeline().set_overscan(overscan)
    }

    pub(crate) fn cursor_buffers(&self) -> Ref<'_, Vec<Rc<DumbBuffer>>> {
        self.cursors.borrow()
    }
}

impl Drop for DrmOutput {
    fn drop(&mut self) {
        if let Ok(pipeline) = self.pipeline.try_borrow() {
            if pipeline.output() == Some(self.id) {
                pipeline.set_output(None);
            }
        }
        output_id::remove(self.id.0);
    }
}
