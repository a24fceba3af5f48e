use std::{io, rc::Rc, time::Duration};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::trace;

use crate::backend::drm::{
    device::PageFlipEvent,
    error::{AccessError, Error},
    pipeline::GpuContext,
};

/// Events of a [`GpuNotifier`]
#[derive(Debug)]
pub enum DrmEvent {
    /// A page flip completed, hand it to [`DrmGpu::page_flipped`](super::DrmGpu::page_flipped)
    PageFlip(PageFlipEvent),
    /// Reading the events of the device failed
    Error(Error),
}

/// Timing of a page flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMetadata {
    /// When the flip happened, in the monotonic clock
    pub time: Duration,
    /// Vblank sequence number of the flip
    pub sequence: u32,
}

/// Event source of a gpu's device node
///
/// Insert it into a calloop event loop to receive the page flips of the gpu. Nothing is read
/// while the session is paused, see [`GpuContext::set_session_active`].
#[derive(Debug)]
pub struct GpuNotifier {
    gpu: Rc<GpuContext>,
    token: Option<Token>,
    span: tracing::Span,
}

impl GpuNotifier {
    pub(super) fn new(gpu: Rc<GpuContext>, span: tracing::Span) -> GpuNotifier {
        GpuNotifier { gpu, token: None, span }
    }

    fn unpollable() -> calloop::Error {
        calloop::Error::IoError(io::Error::new(
            io::ErrorKind::Unsupported,
            "device has no pollable file descriptor",
        ))
    }
}

impl EventSource for GpuNotifier {
    type Event = DrmEvent;
    type Metadata = Option<EventMetadata>;
    type Ret = ();
    type Error = io::Error;

    #[profiling::function]
    fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }
        let _guard = self.span.enter();
        if !self.gpu.is_session_active() {
            // pausing waited for all flips, the events stay queued in the kernel
            trace!("Session paused, leaving drm events queued");
            return Ok(PostAction::Continue);
        }
        match self.gpu.device().receive_events() {
            Ok(events) => {
                for event in events {
                    trace!("Got a page-flip event for crtc ({:?})", event.crtc);
                    let mut metadata = Some(EventMetadata {
                        time: self.gpu.presentation_clock().flip_time(event.duration),
                        sequence: event.frame,
                    });
                    callback(DrmEvent::PageFlip(event), &mut metadata);
                }
            }
            Err(source) => {
                callback(
                    DrmEvent::Error(Error::Access(AccessError {
                        errmsg: "Error processing drm events",
                        dev: self.gpu.device().dev_path(),
                        source,
                    })),
                    &mut None,
                );
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token = Some(token);
        let fd = self.gpu.device().event_fd().ok_or_else(Self::unpollable)?;
        // Safety: the device, and with it the fd, outlives this source
        unsafe { poll.register(fd, Interest::READ, Mode::Level, token) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token = Some(token);
        let fd = self.gpu.device().event_fd().ok_or_else(Self::unpollable)?;
        poll.reregister(fd, Interest::READ, Mode::Level, token)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        let fd = self.gpu.device().event_fd().ok_or_else(Self::unpollable)?;
        poll.unregister(fd)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use calloop::EventLoop;
    use drm_fourcc::DrmFourcc;

    use super::DrmEvent;
    use crate::backend::drm::{
        buffer::{DrmBuffer, DumbBuffer},
        config::DrmConfig,
        device::{
            dummy::{test_mode, DummyDevice, DummyPlaneType},
            KmsDevice, PageFlipEvent,
        },
        gpu::DrmGpu,
        output::FrameEvent,
    };

    #[test]
    fn page_flips_reach_the_output() {
        crate::utils::init_test_logging();
        let dummy = Rc::new(DummyDevice::new());
        dummy.add_crtc();
        dummy.add_plane(DummyPlaneType::Primary, 0b1, false);
        dummy.add_connector(vec![test_mode(800, 600, 60, true)], 0b1);
        let mut gpu = DrmGpu::new(dummy.clone() as Rc<dyn KmsDevice>, DrmConfig::default()).unwrap();
        gpu.update_outputs().unwrap();
        let gpu = Rc::new(gpu);
        let output = gpu.outputs()[0].clone();

        let completed = Rc::new(Cell::new(0));
        let seen = completed.clone();
        let _token = output.render_loop().register(move |event| {
            if let FrameEvent::Completed(_) = event {
                seen.set(seen.get() + 1);
            }
        });

        let mut event_loop: EventLoop<'_, ()> = EventLoop::try_new().unwrap();
        let dispatching = gpu.clone();
        event_loop
            .handle()
            .insert_source(gpu.notifier(), move |event, metadata, _: &mut ()| {
                if let DrmEvent::PageFlip(event) = event {
                    assert!(metadata.is_some());
                    dispatching.page_flipped(event);
                }
            })
            .map_err(|err| err.error)
            .unwrap();

        let size = output.pixel_size();
        let buffer = DumbBuffer::new(gpu.device(), (size.w as u32, size.h as u32), DrmFourcc::Xrgb8888).unwrap();
        let buffer = gpu
            .context()
            .buffers()
            .borrow_mut()
            .insert(Rc::new(buffer) as Rc<dyn DrmBuffer>, false);
        assert!(output.present(buffer));
        assert!(output.is_page_flip_pending());

        event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        assert_eq!(completed.get(), 1);
        assert!(!output.is_page_flip_pending());
        assert_eq!(dummy.pending_events(), 0);

        // a paused session leaves the events to the kernel
        let crtc = output.pipeline().crtc().handle();
        dummy.push_event(PageFlipEvent {
            crtc,
            frame: 2,
            duration: Duration::from_millis(32),
        });
        gpu.context().set_session_active(false);
        event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        assert_eq!(dummy.pending_events(), 1);

        gpu.context().set_session_active(true);
        event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        assert_eq!(dummy.pending_events(), 0);
        assert_eq!(completed.get(), 1);
    }
}
