//!
//! Implementation of the `Session` trait by opening device nodes directly.
//!
//! This requires permissions for any device opened through this interface, which almost
//! certainly means running as root. Use this session type *only* as a fallback or for testing,
//! if anything better is available.
//!
//! Switching vts needs a tty, passed to [`DirectSession::new`]. Without one
//! [`change_vt`](Session::change_vt) fails with [`Error::NoTty`].
//!
//! The session does not catch the vt switch signals itself, whoever does reports the switch
//! with [`DirectSession::set_active`] and the session broadcasts it through its
//! [`Signaler`].

use std::{
    cell::Cell,
    io,
    os::unix::io::{AsFd, AsRawFd, OwnedFd},
    path::{Path, PathBuf},
};

use rustix::fs::{major, Mode, OFlags};
use tracing::{debug, info, warn};

use super::{AsErrno, Event, Session};
use crate::utils::{SignalToken, Signaler};

#[cfg(any(target_os = "linux", target_os = "android"))]
const TTY_MAJOR: u32 = 4;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const TTY_MAJOR: u32 = 0;

mod tty {
    use std::os::unix::io::BorrowedFd;

    use rustix::ioctl::{ioctl, BadOpcode, IntegerSetter, RawOpcode};

    const VT_ACTIVATE: RawOpcode = 0x5606;

    /// Switch the console to `vt`
    pub fn vt_activate(tty: BorrowedFd<'_>, vt: i32) -> rustix::io::Result<()> {
        // SAFETY: VT_ACTIVATE takes the vt number by value and writes nothing back
        unsafe { ioctl(tty, IntegerSetter::<BadOpcode<VT_ACTIVATE>>::new(vt as usize)) }
    }
}

/// Errors of the direct session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to open a device
    #[error("Failed to open {path:?}")]
    Open {
        /// The device path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The given path is not a tty
    #[error("{0:?} is not a tty")]
    NotATty(PathBuf),
    /// The session was created without a tty
    #[error("No tty to switch vts with")]
    NoTty,
    /// Switching the vt failed
    #[error("Failed to switch to vt {vt}")]
    ChangeVt {
        /// The requested vt
        vt: i32,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The session is paused
    #[error("Session is not active")]
    Inactive,
}

impl AsErrno for Error {
    fn as_errno(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. } | Error::ChangeVt { source, .. } => source.raw_os_error(),
            Error::NotATty(_) => Some(libc::ENOTTY),
            Error::NoTty | Error::Inactive => None,
        }
    }
}

/// [`Session`] opening device nodes directly
#[derive(Debug)]
pub struct DirectSession {
    tty: Option<OwnedFd>,
    seat: String,
    active: Cell<bool>,
    signaler: Signaler<Event>,
    span: tracing::Span,
}

impl DirectSession {
    /// Create a new session, optionally on the tty at `tty`
    pub fn new(tty: Option<&Path>) -> Result<DirectSession, Error> {
        let span = tracing::info_span!("backend_session", "type" = "direct");
        let _guard = span.enter();

        let tty = match tty {
            Some(path) => {
                let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(|err| {
                    Error::Open {
                        path: path.to_path_buf(),
                        source: err.into(),
                    }
                })?;
                let stat = rustix::fs::fstat(&fd).map_err(|err| Error::Open {
                    path: path.to_path_buf(),
                    source: err.into(),
                })?;
                if major(stat.st_rdev) != TTY_MAJOR {
                    return Err(Error::NotATty(path.to_path_buf()));
                }
                info!("Using tty {:?}", path);
                Some(fd)
            }
            None => None,
        };

        drop(_guard);
        Ok(DirectSession {
            tty,
            seat: String::from("seat0"),
            active: Cell::new(true),
            signaler: Signaler::new(),
            span,
        })
    }

    /// Session state changes
    pub fn signaler(&self) -> &Signaler<Event> {
        &self.signaler
    }

    /// Get notified when the session gets paused or activated
    #[must_use]
    pub fn register<F: FnMut(&Event) + 'static>(&self, callback: F) -> SignalToken {
        self.signaler.register(callback)
    }

    /// Report a vt switch away from (`false`) or back to (`true`) this session
    pub fn set_active(&self, active: bool) {
        if self.active.replace(active) == active {
            return;
        }
        let _guard = self.span.enter();
        if active {
            debug!("Session activated");
            self.signaler.signal(Event::ActivateSession);
        } else {
            debug!("Session paused");
            self.signaler.signal(Event::PauseSession);
        }
    }
}

impl Session for DirectSession {
    type Error = Error;

    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Error> {
        if !self.active.get() {
            return Err(Error::Inactive);
        }
        debug!(parent: &self.span, "Opening device: {:?}", path);
        rustix::fs::open(path, flags, Mode::empty()).map_err(|err| Error::Open {
            path: path.to_path_buf(),
            source: err.into(),
        })
    }

    fn close(&mut self, fd: OwnedFd) -> Result<(), Error> {
        debug!(parent: &self.span, "Closing device: {}", fd.as_raw_fd());
        drop(fd);
        Ok(())
    }

    fn change_vt(&mut self, vt: i32) -> Result<(), Error> {
        let tty = self.tty.as_ref().ok_or(Error::NoTty)?;
        tty::vt_activate(tty.as_fd(), vt).map_err(|err| {
            let source = io::Error::from(err);
            warn!(parent: &self.span, "Failed to switch to vt {}: {}", vt, source);
            Error::ChangeVt { vt, source }
        })
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn seat(&self) -> String {
        self.seat.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, os::unix::io::AsFd, path::Path, rc::Rc};

    use rustix::fs::OFlags;

    use super::{DirectSession, Error};
    use crate::backend::session::{AsErrno, Event, Session};

    #[test]
    fn opens_and_closes_devices() {
        let mut session = DirectSession::new(None).unwrap();
        let fd = session
            .open(Path::new("/dev/null"), OFlags::RDWR | OFlags::CLOEXEC)
            .unwrap();
        session.close(fd).unwrap();

        let err = session
            .open(Path::new("/nonexistent/device"), OFlags::RDWR)
            .unwrap_err();
        assert_eq!(err.as_errno(), Some(libc::ENOENT));
    }

    #[test]
    fn vt_switching_needs_a_tty() {
        let mut session = DirectSession::new(None).unwrap();
        assert!(matches!(session.change_vt(2), Err(Error::NoTty)));
        assert!(matches!(
            DirectSession::new(Some(Path::new("/dev/null"))),
            Err(Error::NotATty(_))
        ));
    }

    #[test]
    fn vt_activate_rejects_other_files() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = super::tty::vt_activate(file.as_fd(), 2).unwrap_err();
        assert_eq!(err, rustix::io::Errno::NOTTY);
    }

    #[test]
    fn pausing_blocks_opening() {
        let mut session = DirectSession::new(None).unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = events.clone();
        let _token = session.register(move |event| seen.borrow_mut().push(*event));

        session.set_active(false);
        session.set_active(false);
        assert!(!session.is_active());
        assert!(matches!(
            session.open(Path::new("/dev/null"), OFlags::RDWR),
            Err(Error::Inactive)
        ));
        session.set_active(true);

        assert_eq!(*events.borrow(), vec![Event::PauseSession, Event::ActivateSession]);
        assert_eq!(session.seat(), "seat0");
    }
}
