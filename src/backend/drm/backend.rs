//! Platform of all gpus of a seat
//!
//! [`DrmBackend`] opens gpus through a [`Session`], keeps them until they get unplugged and
//! follows the session across vt switches: pausing waits for the outstanding page flips, resuming
//! re-reads the kernel state and tests the enabled outputs again.

use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
    rc::Rc,
};

use rustix::fs::OFlags;
use tracing::{debug, info, info_span, instrument, warn};

use super::{
    config::DrmConfig,
    device::{DrmDevice, DrmDeviceFd, KmsDevice},
    error::{AccessError, Error},
    gpu::{DrmGpu, GpuId},
};
use crate::{
    backend::session::{AsErrno, Event as SessionEvent, Session},
    utils::{DeviceFd, SignalToken, Signaler},
};

/// Changes of the gpu set of a [`DrmBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// A gpu was added and its outputs are configured
    GpuAdded(GpuId),
    /// A gpu was removed, its outputs are gone
    GpuRemoved(GpuId),
}

#[derive(Debug)]
struct GpuEntry {
    gpu: DrmGpu,
    // `None` for devices not opened through the session
    fd: Option<DeviceFd>,
    dev_id: Option<libc::dev_t>,
}

/// All gpus opened through one session
#[derive(Debug)]
pub struct DrmBackend<S: Session> {
    session: S,
    config: DrmConfig,
    gpus: Vec<GpuEntry>,
    active: bool,
    signaler: Signaler<BackendEvent>,
    span: tracing::Span,
}

impl<S: Session> DrmBackend<S> {
    /// Create a backend without any gpu
    pub fn new(session: S, config: DrmConfig) -> DrmBackend<S> {
        let span = info_span!("backend_drm");
        let active = session.is_active();
        DrmBackend {
            session,
            config,
            gpus: Vec::new(),
            active,
            signaler: Signaler::new(),
            span,
        }
    }

    /// The session devices are opened with
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Mutable access to the session
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Gpu hot-plug notifications
    pub fn signaler(&self) -> &Signaler<BackendEvent> {
        &self.signaler
    }

    /// Get notified about added and removed gpus
    #[must_use]
    pub fn register<F: FnMut(&BackendEvent) + 'static>(&self, callback: F) -> SignalToken {
        self.signaler.register(callback)
    }

    /// Whether the backend currently drives the hardware
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Open the gpu at `path` and configure its outputs
    ///
    /// Adding a gpu that is already known returns the existing one.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn add_gpu(&mut self, path: &Path) -> Result<GpuId, Error> {
        if let Some(gpu) = self.find_gpu_by_path(path) {
            debug!("Gpu {:?} is already known", path);
            return Ok(gpu.context().id());
        }
        if !self.session.is_active() {
            return Err(Error::DeviceInactive);
        }

        let fd = self
            .session
            .open(
                path,
                OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            )
            .map_err(|err| {
                warn!("Failed to open {:?}: {:?}", path, err);
                Error::Access(AccessError {
                    errmsg: "Failed to open the device node",
                    dev: Some(path.to_path_buf()),
                    source: io::Error::from_raw_os_error(err.as_errno().unwrap_or(libc::EIO)),
                })
            })?;
        let fd = DeviceFd::from(fd);
        let dev_id = match fd.dev_id() {
            Ok(dev_id) => Some(dev_id),
            Err(err) => {
                debug!("{}", Error::UnableToGetDeviceId(err));
                None
            }
        };

        let device: Rc<dyn KmsDevice> = Rc::new(DrmDevice::new(DrmDeviceFd::new(fd.clone())));
        match self.insert_gpu(device, Some(fd.clone()), dev_id) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.close(fd);
                Err(err)
            }
        }
    }

    /// Take over an already opened device
    pub fn add_device(&mut self, device: Rc<dyn KmsDevice>) -> Result<GpuId, Error> {
        self.insert_gpu(device, None, None)
    }

    fn insert_gpu(
        &mut self,
        device: Rc<dyn KmsDevice>,
        fd: Option<DeviceFd>,
        dev_id: Option<libc::dev_t>,
    ) -> Result<GpuId, Error> {
        let mut gpu = DrmGpu::new(device, self.config)?;
        gpu.context().set_session_active(self.active);
        gpu.update_outputs()?;
        let id = gpu.context().id();
        info!(
            parent: &self.span,
            "Added gpu {:?} with {} outputs",
            gpu.path(),
            gpu.outputs().len()
        );
        self.gpus.push(GpuEntry { gpu, fd, dev_id });
        self.signaler.signal(BackendEvent::GpuAdded(id));
        Ok(id)
    }

    /// Tear down a gpu and all of its outputs
    ///
    /// Returns `false` if the gpu is not known.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn remove_gpu(&mut self, id: GpuId) -> bool {
        let Some(index) = self.gpus.iter().position(|entry| entry.gpu.context().id() == id) else {
            return false;
        };
        let GpuEntry { gpu, fd, .. } = self.gpus.remove(index);
        info!("Removing gpu {:?}", gpu.path());
        // waits for outstanding flips and drops the outputs
        drop(gpu);
        if let Some(fd) = fd {
            self.close(fd);
        }
        self.signaler.signal(BackendEvent::GpuRemoved(id));
        true
    }

    fn close(&mut self, fd: DeviceFd) {
        match fd.try_unwrap() {
            Ok(fd) => {
                if let Err(err) = self.session.close(fd) {
                    warn!(parent: &self.span, "Failed to close device: {:?}", err);
                }
            }
            Err(fd) => debug!(
                parent: &self.span,
                "Device {} is still referenced, closing it with its last user",
                fd.as_raw_fd()
            ),
        }
    }

    /// All gpus
    pub fn gpus(&self) -> impl Iterator<Item = &DrmGpu> {
        self.gpus.iter().map(|entry| &entry.gpu)
    }

    /// The first gpu that was added
    pub fn primary_gpu(&self) -> Option<&DrmGpu> {
        self.gpus.first().map(|entry| &entry.gpu)
    }

    /// Look up a gpu
    pub fn gpu(&self, id: GpuId) -> Option<&DrmGpu> {
        self.gpus().find(|gpu| gpu.context().id() == id)
    }

    /// Look up a gpu for modification
    pub fn gpu_mut(&mut self, id: GpuId) -> Option<&mut DrmGpu> {
        self.gpus
            .iter_mut()
            .map(|entry| &mut entry.gpu)
            .find(|gpu| gpu.context().id() == id)
    }

    /// Find the gpu opened as file descriptor `fd`
    pub fn find_gpu_by_fd(&self, fd: RawFd) -> Option<&DrmGpu> {
        self.gpus
            .iter()
            .find(|entry| entry.fd.as_ref().map(|own| own.as_raw_fd()) == Some(fd))
            .map(|entry| &entry.gpu)
    }

    /// Find the gpu of the device number `dev_id`
    pub fn find_gpu_by_dev_id(&self, dev_id: libc::dev_t) -> Option<&DrmGpu> {
        self.gpus
            .iter()
            .find(|entry| entry.dev_id == Some(dev_id))
            .map(|entry| &entry.gpu)
    }

    /// Find the gpu of the device node at `path`
    pub fn find_gpu_by_path(&self, path: &Path) -> Option<&DrmGpu> {
        self.gpus().find(|gpu| gpu.path().map(|own| own == path).unwrap_or(false))
    }

    /// Re-scan the outputs of a gpu after a hot-plug
    pub fn update_outputs(&mut self, id: GpuId) -> Result<(), Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        match self.gpu_mut(id) {
            Some(gpu) => gpu.update_outputs(),
            None => Ok(()),
        }
    }

    /// Deliver the pending events of a gpu
    ///
    /// Nothing is read while the session is paused, the events stay queued in the kernel.
    pub fn dispatch(&self, id: GpuId) {
        if !self.session.is_active() {
            return;
        }
        if let Some(gpu) = self.gpu(id) {
            gpu.dispatch_events();
        }
    }

    /// React to a state change of the session
    pub fn handle_session_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::PauseSession => self.pause(),
            SessionEvent::ActivateSession => self.resume(),
        }
    }

    /// Stop driving the hardware
    ///
    /// Waits until every outstanding page flip completed.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn pause(&mut self) {
        if !self.active {
            return;
        }
        for entry in &self.gpus {
            entry.gpu.wait_idle();
            entry.gpu.context().set_session_active(false);
        }
        self.active = false;
        info!("Drm backend paused");
    }

    /// Take back the hardware after a vt switch
    ///
    /// Another client may have changed any property, so all objects are read again and the
    /// enabled outputs are tested against the new state. Monitors plugged in meanwhile are
    /// picked up as well.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn resume(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        for entry in &mut self.gpus {
            let gpu = &mut entry.gpu;
            gpu.context().set_session_active(true);
            for output in gpu.outputs() {
                let pipeline = output.pipeline();
                pipeline.update_properties();
                if output.is_enabled() && !pipeline.set_active(true) {
                    warn!("Output {} failed to resume", output.name());
                }
            }
            if let Err(err) = gpu.update_outputs() {
                warn!("Failed to update outputs of gpu {:?}: {}", gpu.path(), err);
            }
        }
        info!("Drm backend resumed");
    }
}

impl<S: Session> Drop for DrmBackend<S> {
    fn drop(&mut self) {
        let ids: Vec<GpuId> = self.gpus.iter().map(|entry| entry.gpu.context().id()).collect();
        for id in ids {
            self.remove_gpu(id);
        }
    }
}
