//! Rendering on several gpus
//!
//! [`MultiRenderBackend`] holds one [`RenderBackend`] per gpu and forwards every per-output call
//! to the backend that renders the output. The primary backend is created first and dropped
//! last, secondary backends follow the gpus as they get plugged and unplugged.

use tracing::{debug, error, info_span, warn};

use super::{Error, RenderBackend};
use crate::{
    backend::drm::{BackendEvent, BufferId, GpuId, OutputId},
    utils::{Physical, Rectangle},
};

/// Dispatcher over the render backends of all gpus
#[derive(Debug)]
pub struct MultiRenderBackend {
    // the primary backend is always the first
    backends: Vec<Box<dyn RenderBackend>>,
    initialized: bool,
    span: tracing::Span,
}

impl MultiRenderBackend {
    /// Create a dispatcher rendering on `primary`
    pub fn new(primary: Box<dyn RenderBackend>) -> MultiRenderBackend {
        let span = info_span!("renderer_multi", primary = ?primary.gpu());
        MultiRenderBackend {
            backends: vec![primary],
            initialized: false,
            span,
        }
    }

    /// The backend of the primary gpu
    pub fn primary(&self) -> &dyn RenderBackend {
        &*self.backends[0]
    }

    /// All backends, the primary first
    pub fn backends(&self) -> impl Iterator<Item = &dyn RenderBackend> {
        self.backends.iter().map(|backend| &**backend)
    }

    /// Add the backend of a new gpu
    ///
    /// The backend is initialized right away if the dispatcher already is.
    pub fn add_backend(&mut self, mut backend: Box<dyn RenderBackend>) -> Result<(), Error> {
        let gpu = backend.gpu();
        if self.backends.iter().any(|known| known.gpu() == gpu) {
            debug!(parent: &self.span, "Gpu {:?} already has a render backend", gpu);
            return Ok(());
        }
        if self.initialized && !backend.is_initialized() {
            backend.init()?;
        }
        debug!(parent: &self.span, "Added render backend for gpu {:?}", gpu);
        self.backends.push(backend);
        Ok(())
    }

    /// Drop the backend of an unplugged gpu
    ///
    /// The primary backend is never removed, returns whether a backend was dropped.
    pub fn remove_backend(&mut self, gpu: GpuId) -> bool {
        match self.backends.iter().position(|backend| backend.gpu() == gpu) {
            Some(0) => {
                warn!(parent: &self.span, "Refusing to remove the primary render backend");
                false
            }
            Some(index) => {
                drop(self.backends.remove(index));
                debug!(parent: &self.span, "Removed render backend of gpu {:?}", gpu);
                true
            }
            None => false,
        }
    }

    /// Follow a gpu hot-plug of the drm backend
    ///
    /// `create` builds the render backend for an added gpu, returning `None` skips the gpu.
    pub fn handle_backend_event<F>(&mut self, event: &BackendEvent, create: F) -> Result<(), Error>
    where
        F: FnOnce(GpuId) -> Option<Box<dyn RenderBackend>>,
    {
        match *event {
            BackendEvent::GpuAdded(gpu) => match create(gpu) {
                Some(backend) => self.add_backend(backend),
                None => Ok(()),
            },
            BackendEvent::GpuRemoved(gpu) => {
                self.remove_backend(gpu);
                Ok(())
            }
        }
    }

    fn find_backend(&self, output: OutputId) -> Result<usize, Error> {
        self.backends
            .iter()
            .position(|backend| backend.has_output(output))
            .ok_or_else(|| {
                error!(parent: &self.span, "No render backend drives output {:?}", output);
                Error::UnknownOutput(output)
            })
    }
}

impl RenderBackend for MultiRenderBackend {
    fn gpu(&self) -> GpuId {
        self.backends[0].gpu()
    }

    fn init(&mut self) -> Result<(), Error> {
        for backend in &mut self.backends {
            if !backend.is_initialized() {
                backend.init()?;
            }
        }
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn has_output(&self, output: OutputId) -> bool {
        self.backends.iter().any(|backend| backend.has_output(output))
    }

    fn begin_frame(&mut self, output: OutputId) -> Result<Vec<Rectangle<i32, Physical>>, Error> {
        let index = self.find_backend(output)?;
        self.backends[index].begin_frame(output)
    }

    fn end_frame(&mut self, output: OutputId, damage: &[Rectangle<i32, Physical>]) -> Result<(), Error> {
        let index = self.find_backend(output)?;
        self.backends[index].end_frame(output, damage)
    }

    fn scanout(&mut self, output: OutputId, buffer: BufferId) -> bool {
        match self.find_backend(output) {
            Ok(index) => self.backends[index].scanout(output, buffer),
            Err(_) => false,
        }
    }

    fn texture_for_output(&self, output: OutputId) -> Option<BufferId> {
        let index = self.find_backend(output).ok()?;
        self.backends[index].texture_for_output(output)
    }
}

impl Drop for MultiRenderBackend {
    fn drop(&mut self) {
        // secondaries may still refer to resources of the primary
        while self.backends.len() > 1 {
            self.backends.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::MultiRenderBackend;
    use crate::{
        backend::{
            drm::{BackendEvent, BufferId, GpuId, OutputId},
            renderer::{Error, RenderBackend},
        },
        utils::{Physical, Rectangle},
    };

    type Log = Rc<RefCell<Vec<String>>>;

    #[derive(Debug)]
    struct RecordingBackend {
        name: &'static str,
        gpu: GpuId,
        outputs: Vec<OutputId>,
        initialized: bool,
        log: Log,
    }

    impl RecordingBackend {
        fn boxed(name: &'static str, outputs: Vec<OutputId>, log: &Log) -> Box<dyn RenderBackend> {
            Box::new(RecordingBackend {
                name,
                gpu: GpuId::next(),
                outputs,
                initialized: false,
                log: log.clone(),
            })
        }

        fn record(&self, what: &str) {
            self.log.borrow_mut().push(format!("{} {}", self.name, what));
        }
    }

    impl RenderBackend for RecordingBackend {
        fn gpu(&self) -> GpuId {
            self.gpu
        }

        fn init(&mut self) -> Result<(), Error> {
            self.initialized = true;
            self.record("init");
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            self.initialized
        }

        fn has_output(&self, output: OutputId) -> bool {
            self.outputs.contains(&output)
        }

        fn begin_frame(&mut self, _output: OutputId) -> Result<Vec<Rectangle<i32, Physical>>, Error> {
            self.record("begin");
            Ok(Vec::new())
        }

        fn end_frame(&mut self, _output: OutputId, damage: &[Rectangle<i32, Physical>]) -> Result<(), Error> {
            self.record(&format!("end {}", damage.len()));
            Ok(())
        }

        fn texture_for_output(&self, _output: OutputId) -> Option<BufferId> {
            self.record("texture");
            None
        }
    }

    impl Drop for RecordingBackend {
        fn drop(&mut self) {
            self.record("drop");
        }
    }

    #[test]
    fn calls_reach_the_owning_backend() {
        let log = Log::default();
        let (first, second, stray) = (OutputId::next(), OutputId::next(), OutputId::next());
        let mut multi = MultiRenderBackend::new(RecordingBackend::boxed("primary", vec![first], &log));
        multi
            .add_backend(RecordingBackend::boxed("secondary", vec![second], &log))
            .unwrap();
        multi.init().unwrap();
        log.borrow_mut().clear();

        multi.begin_frame(second).unwrap();
        multi
            .end_frame(second, &[Rectangle::from_loc_and_size((0, 0), (1, 1))])
            .unwrap();
        multi.begin_frame(first).unwrap();
        assert!(multi.texture_for_output(first).is_none());
        assert!(!multi.scanout(first, unused_buffer()));
        assert!(matches!(multi.begin_frame(stray), Err(Error::UnknownOutput(_))));
        assert!(!multi.has_output(stray));

        assert_eq!(
            *log.borrow(),
            vec!["secondary begin", "secondary end 1", "primary begin", "primary texture"]
        );
    }

    #[test]
    fn secondary_init_waits_for_the_dispatcher() {
        let log = Log::default();
        let mut multi = MultiRenderBackend::new(RecordingBackend::boxed("primary", vec![], &log));
        multi
            .add_backend(RecordingBackend::boxed("early", vec![], &log))
            .unwrap();
        assert!(log.borrow().is_empty());

        multi.init().unwrap();
        let late = RecordingBackend::boxed("late", vec![], &log);
        let late_gpu = late.gpu();
        multi
            .handle_backend_event(&BackendEvent::GpuAdded(late_gpu), |_| Some(late))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["primary init", "early init", "late init"]);
        assert!(multi.backends().all(|backend| backend.is_initialized()));

        multi
            .handle_backend_event(&BackendEvent::GpuRemoved(late_gpu), |_| None)
            .unwrap();
        assert_eq!(multi.backends().count(), 2);
    }

    #[test]
    fn primary_is_dropped_last() {
        let log = Log::default();
        let mut multi = MultiRenderBackend::new(RecordingBackend::boxed("primary", vec![], &log));
        let primary_gpu = multi.gpu();
        multi
            .add_backend(RecordingBackend::boxed("a", vec![], &log))
            .unwrap();
        multi
            .add_backend(RecordingBackend::boxed("b", vec![], &log))
            .unwrap();
        assert!(!multi.remove_backend(primary_gpu));
        assert_eq!(multi.primary().gpu(), primary_gpu);

        drop(multi);
        assert_eq!(*log.borrow(), vec!["b drop", "a drop", "primary drop"]);
    }

    fn unused_buffer() -> BufferId {
        use crate::backend::drm::{
            device::{dummy::DummyDevice, KmsDevice},
            BufferArena, DrmBuffer, DumbBuffer,
        };
        use drm_fourcc::DrmFourcc;

        let device: Rc<dyn KmsDevice> = Rc::new(DummyDevice::new());
        let buffer = DumbBuffer::new(&device, (1, 1), DrmFourcc::Xrgb8888).unwrap();
        BufferArena::new().insert(Rc::new(buffer) as Rc<dyn DrmBuffer>, false)
    }
}
