//! Rendering functionality and abstractions
//!
//! A [`RenderBackend`] renders the frames of the outputs of one gpu and hands them to
//! [`DrmOutput::present`](crate::backend::drm::DrmOutput::present). Frames are bracketed by
//! [`begin_frame`](RenderBackend::begin_frame), which returns the region that has to be
//! repainted, and [`end_frame`](RenderBackend::end_frame), which presents the result.
//!
//! - [`dumb`] renders into cpu-mapped dumb buffers,
//! - [`multi`] dispatches to one backend per gpu.

use std::{fmt, io};

use crate::{
    backend::drm::{BufferId, GpuId, OutputId},
    utils::{Physical, Rectangle},
};

pub mod dumb;
#[cfg(feature = "renderer_multi")]
pub mod multi;

/// Errors of render backends
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No backend drives the output
    #[error("No render backend drives output {0:?}")]
    UnknownOutput(OutputId),
    /// `end_frame` was called without `begin_frame`
    #[error("No frame was started on output {0:?}")]
    NoFrame(OutputId),
    /// Every buffer of the swapchain is still in use
    #[error("No free buffer for output {0:?}")]
    NoFreeBuffer(OutputId),
    /// Allocating a buffer failed
    #[error("Failed to allocate a buffer")]
    Allocation(#[source] io::Error),
    /// Mapping a buffer failed
    #[error("Failed to map a buffer")]
    Mapping(#[source] io::Error),
    /// The output refused the frame
    #[error("Output {0:?} failed to present the frame")]
    PresentFailed(OutputId),
}

/// Renderer of the outputs of one gpu
pub trait RenderBackend: fmt::Debug {
    /// The gpu whose outputs this backend renders
    fn gpu(&self) -> GpuId;

    /// Prepare the backend for rendering
    fn init(&mut self) -> Result<(), Error>;

    /// Whether [`init`](RenderBackend::init) was called
    fn is_initialized(&self) -> bool;

    /// Whether this backend renders `output`
    fn has_output(&self, output: OutputId) -> bool;

    /// Start a frame on `output`
    ///
    /// Returns the region of the new buffer whose content is outdated.
    fn begin_frame(&mut self, output: OutputId) -> Result<Vec<Rectangle<i32, Physical>>, Error>;

    /// Finish the frame started with [`begin_frame`](RenderBackend::begin_frame) and present it
    ///
    /// `damage` is the region that changed compared to the previous frame.
    fn end_frame(&mut self, output: OutputId, damage: &[Rectangle<i32, Physical>]) -> Result<(), Error>;

    /// Present `buffer` on `output` without composition
    ///
    /// Returns `false` if the backend can not scan out the buffer, render it instead.
    fn scanout(&mut self, output: OutputId, buffer: BufferId) -> bool {
        let _ = (output, buffer);
        false
    }

    /// Buffer holding the latest frame of `output`
    fn texture_for_output(&self, output: OutputId) -> Option<BufferId>;
}
