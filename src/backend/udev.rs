//!
//! `udev` related functionality for automated device scanning.
//!
//! This module mainly provides the [`UdevBackend`], which monitors the available drm devices
//! of a seat and reports changes as [`UdevEvent`]s when inserted into a [`calloop`] event loop.
//! Pair it with a [`DrmBackend`](crate::backend::drm::DrmBackend): add a gpu on
//! [`UdevEvent::Added`], re-scan its outputs on [`UdevEvent::Changed`] and remove it on
//! [`UdevEvent::Removed`].
//!
//! Additionally this contains some utility functions related to scanning.

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt,
    io::Result as IoResult,
    os::unix::io::{AsRawFd, BorrowedFd},
    path::{Path, PathBuf},
};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use libc::dev_t;
use tracing::{debug, info, info_span, warn};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

/// Backend to monitor available drm devices.
///
/// Provides a way to automatically scan for available gpus and notifies the
/// given handler of any changes. Can be used to provide hot-plug functionality for gpus and
/// attached monitors.
pub struct UdevBackend {
    devices: HashMap<dev_t, PathBuf>,
    monitor: MonitorSocket,
    token: Option<Token>,
    span: tracing::Span,
}

impl fmt::Debug for UdevBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdevBackend")
            .field("devices", &self.devices)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl UdevBackend {
    /// Creates a new [`UdevBackend`] for the gpus of `seat`
    pub fn new<S: AsRef<str>>(seat: S) -> IoResult<UdevBackend> {
        let span = info_span!("backend_udev", seat = seat.as_ref());
        let _guard = span.enter();

        let devices = all_gpus(seat)?
            .into_iter()
            // Create devices
            .flat_map(|path| match rustix::fs::stat(&path) {
                Ok(stat) => Some((stat.st_rdev as dev_t, path)),
                Err(err) => {
                    warn!("Unable to get id of {:?}, Error: {:?}. Skipping", path, err);
                    None
                }
            })
            .collect();

        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;

        drop(_guard);
        Ok(UdevBackend {
            devices,
            monitor,
            token: None,
            span,
        })
    }

    /// Devices known at the moment
    ///
    /// Use this right after creation to add the gpus that were present before the backend
    /// started listening.
    pub fn device_list(&self) -> impl Iterator<Item = (dev_t, &Path)> {
        self.devices.iter().map(|(id, path)| (*id, path.as_path()))
    }

    fn monitor_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the socket is owned by `self` and outlives the borrow
        unsafe { BorrowedFd::borrow_raw(self.monitor.as_raw_fd()) }
    }
}

/// Events generated by the [`UdevBackend`], notifying you of changes in system devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdevEvent {
    /// A new device has been detected
    Added {
        /// ID of the new device
        device_id: dev_t,
        /// Path of the new device
        path: PathBuf,
    },
    /// A device has changed
    ///
    /// This usually indicates that some connectors did become available or were unplugged.
    /// Scan again for connected monitors.
    Changed {
        /// ID of the changed device
        device_id: dev_t,
    },
    /// A device has been removed
    Removed {
        /// ID of the removed device
        device_id: dev_t,
    },
}

impl EventSource for UdevBackend {
    type Event = UdevEvent;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> IoResult<PostAction>
    where
        F: FnMut(UdevEvent, &mut ()),
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }
        let _guard = self.span.enter();

        for event in self.monitor.iter() {
            debug!(
                "Udev event: type={:?}, devnum={:?} devnode={:?}",
                event.event_type(),
                event.devnum(),
                event.devnode()
            );
            match event.event_type() {
                // New device
                EventType::Add => {
                    if let (Some(path), Some(devnum)) = (event.devnode(), event.devnum()) {
                        info!("New device: #{} at {}", devnum, path.display());
                        if self.devices.insert(devnum, path.to_path_buf()).is_none() {
                            callback(
                                UdevEvent::Added {
                                    device_id: devnum,
                                    path: path.to_path_buf(),
                                },
                                &mut (),
                            );
                        }
                    }
                }
                // Device removed
                EventType::Remove => {
                    if let Some(devnum) = event.devnum() {
                        info!("Device removed: #{}", devnum);
                        if self.devices.remove(&devnum).is_some() {
                            callback(UdevEvent::Removed { device_id: devnum }, &mut ());
                        }
                    }
                }
                // New connector
                EventType::Change => {
                    if let Some(devnum) = event.devnum() {
                        info!("Device changed: #{}", devnum);
                        if self.devices.contains_key(&devnum) {
                            callback(UdevEvent::Changed { device_id: devnum }, &mut ());
                        } else {
                            debug!("changed, but device not tracked by backend");
                        }
                    } else {
                        debug!("changed, but no devnum");
                    }
                }
                _ => {}
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token = Some(token);
        // Safety: the socket is unregistered before the backend is dropped
        unsafe { poll.register(self.monitor_fd(), Interest::READ, Mode::Level, token) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token = Some(token);
        poll.reregister(self.monitor_fd(), Interest::READ, Mode::Level, token)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(self.monitor_fd())
    }
}

/// Returns the path of the primary GPU device if any
///
/// The primary gpu is the one the firmware booted with (`boot_vga`), falling back to the first
/// gpu of the seat.
pub fn primary_gpu<S: AsRef<str>>(seat: S) -> IoResult<Option<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut result = None;
    for device in enumerator.scan_devices()? {
        if device
            .property_value("ID_SEAT")
            .map(|x| x.to_os_string())
            .unwrap_or_else(|| OsString::from("seat0"))
            == *seat.as_ref()
        {
            if let Some(pci) = device.parent_with_subsystem(Path::new("pci"))? {
                if let Some(id) = pci.attribute_value("boot_vga") {
                    if id == "1" {
                        result = Some(device);
                    }
                }
            } else if result.is_none() {
                result = Some(device);
            }
        }
    }
    Ok(result.and_then(|device| device.devnode().map(PathBuf::from)))
}

/// Returns the paths of all available GPU devices of `seat`
pub fn all_gpus<S: AsRef<str>>(seat: S) -> IoResult<Vec<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;
    Ok(enumerator
        .scan_devices()?
        .filter(|device| {
            device
                .property_value("ID_SEAT")
                .map(|x| x.to_os_string())
                .unwrap_or_else(|| OsString::from("seat0"))
                == *seat.as_ref()
        })
        .flat_map(|device| device.devnode().map(PathBuf::from))
        .collect())
}

/// Returns the loaded driver for a device named by its [`dev_t`]
pub fn driver(dev: dev_t) -> IoResult<Option<OsString>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;
    Ok(enumerator
        .scan_devices()?
        .filter(|device| device.devnum() == Some(dev))
        .flat_map(|dev| {
            let mut device = Some(dev);
            while let Some(dev) = device {
                if dev.driver().is_some() {
                    return dev.driver().map(std::ffi::OsStr::to_os_string);
                }
                device = dev.parent();
            }
            None
        })
        .next())
}
