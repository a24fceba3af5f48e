use drm::control::RawResourceHandle;
use std::{io, path::PathBuf};

/// Error of a kernel request on a drm device
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Errors thrown by the drm backend
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Unable to determine device id of drm device
    #[error("Unable to determine device id of drm device")]
    UnableToGetDeviceId(#[source] io::Error),
    /// The device or one of its objects can not be used
    #[error("Discovery failed: {0}")]
    Discovery(&'static str),
    /// Device is currently paused
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// A device object misses a property that atomic mode-setting requires
    #[error("The drm object ({handle:?}) is missing a required property '{name}'")]
    UnknownProperty {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// The requested mode index does not exist
    #[error("Mode index {0} is out of range")]
    NoSuchMode(usize),
}
