//! Access to the kernel mode-setting interface
//!
//! Everything the drm backend needs from the kernel goes through the [`KmsDevice`] trait.
//! [`DrmDevice`] implements it on top of an open device node, all values exchanged through
//! it are plain snapshots, so the rest of the backend never holds borrowed kernel state.

use std::{fmt, io, os::unix::io::BorrowedFd, path::PathBuf, time::Duration};

use drm::control::{connector, crtc, encoder, framebuffer, plane, property, Mode, RawResourceHandle};
use drm_fourcc::DrmFourcc;

pub use drm::control::AtomicCommitFlags;

mod fd;
mod kms;

pub use self::fd::DrmDeviceFd;
pub use self::kms::DrmDevice;

#[cfg(test)]
pub(crate) mod dummy;

/// Kernel handle of an object carrying properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectHandle {
    /// A connector
    Connector(connector::Handle),
    /// A crtc
    Crtc(crtc::Handle),
    /// A plane
    Plane(plane::Handle),
}

impl ObjectHandle {
    /// Numeric id of this object
    pub fn id(&self) -> u32 {
        match self {
            ObjectHandle::Connector(handle) => u32::from(*handle),
            ObjectHandle::Crtc(handle) => u32::from(*handle),
            ObjectHandle::Plane(handle) => u32::from(*handle),
        }
    }
}

impl From<ObjectHandle> for RawResourceHandle {
    fn from(handle: ObjectHandle) -> Self {
        match handle {
            ObjectHandle::Connector(handle) => handle.into(),
            ObjectHandle::Crtc(handle) => handle.into(),
            ObjectHandle::Plane(handle) => handle.into(),
        }
    }
}

/// Resource handles reported by a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceResources {
    /// Connectors, in kernel order
    pub connectors: Vec<connector::Handle>,
    /// Crtcs, ordered by pipe index
    pub crtcs: Vec<crtc::Handle>,
}

/// Snapshot of a connector
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Type of the physical port
    pub interface: connector::Interface,
    /// Index among the connectors of the same interface
    pub interface_id: u32,
    /// Connection state
    pub state: connector::State,
    /// Physical size in millimeters
    pub size: Option<(u32, u32)>,
    /// Supported modes
    pub modes: Vec<Mode>,
    /// Encoders able to drive this connector
    pub encoders: Vec<encoder::Handle>,
}

/// Snapshot of an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Bitmask of compatible crtcs, bit `n` refers to the crtc with pipe index `n`
    pub possible_crtcs: u32,
}

/// Snapshot of a crtc
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    /// Mode currently programmed
    pub mode: Option<Mode>,
    /// Number of entries of the legacy gamma ramp
    pub gamma_length: u32,
}

/// Snapshot of a plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Bitmask of compatible crtcs, bit `n` refers to the crtc with pipe index `n`
    pub possible_crtcs: u32,
    /// Supported pixel formats
    pub formats: Vec<u32>,
}

/// Snapshot of one property of a device object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Kernel handle of the property
    pub handle: property::Handle,
    /// Name as reported by the kernel
    pub name: String,
    /// Current value
    pub value: u64,
    /// Whether the property rejects writes
    pub immutable: bool,
    /// Whether the value is a blob id
    pub blob: bool,
    /// Names and values of an enum property
    pub enums: Vec<(String, u64)>,
}

/// A page flip completion reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    /// Crtc that flipped
    pub crtc: crtc::Handle,
    /// Vblank sequence number
    pub frame: u32,
    /// Timestamp in the presentation clock of the device
    pub duration: Duration,
}

/// A dumb buffer allocated on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBufferInfo {
    /// GEM handle
    pub handle: u32,
    /// Framebuffer wrapping the buffer
    pub framebuffer: framebuffer::Handle,
    /// Size in pixels
    pub size: (u32, u32),
    /// Bytes per row
    pub pitch: u32,
}

/// Capabilities of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Maximum cursor size
    pub cursor_size: (u32, u32),
    /// Page-flip events carry monotonic timestamps
    pub monotonic_timestamps: bool,
    /// Framebuffers may carry format modifiers
    pub addfb2_modifiers: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        DeviceCapabilities {
            cursor_size: (64, 64),
            monotonic_timestamps: false,
            addfb2_modifiers: false,
        }
    }
}

/// Property values to submit with one atomic commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    entries: Vec<(RawResourceHandle, property::Handle, u64)>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    /// Add a property value
    pub fn add(&mut self, object: impl Into<RawResourceHandle>, property: property::Handle, value: u64) {
        self.entries.push((object.into(), property, value));
    }

    /// All values of this request, in insertion order
    pub fn entries(&self) -> &[(RawResourceHandle, property::Handle, u64)] {
        &self.entries
    }

    /// Whether no value was added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Kernel mode-setting interface of one device node
///
/// Errors are reported as [`io::Error`]s of the failing ioctl.
pub trait KmsDevice: fmt::Debug {
    /// Path of the device node, if known
    fn dev_path(&self) -> Option<PathBuf>;
    /// File descriptor to poll for events
    fn event_fd(&self) -> Option<BorrowedFd<'_>>;
    /// Name of the kernel driver
    fn driver_name(&self) -> io::Result<String>;
    /// Capabilities of the device
    fn capabilities(&self) -> DeviceCapabilities;
    /// Request atomic mode-setting. Returns whether the driver supports it.
    fn enable_atomic(&self) -> bool;
    /// Request universal planes. Returns whether the driver supports them.
    fn enable_universal_planes(&self) -> bool;

    /// Connectors and crtcs of the device
    fn resources(&self) -> io::Result<DeviceResources>;
    /// Planes of the device
    fn planes(&self) -> io::Result<Vec<plane::Handle>>;
    /// Snapshot of a connector
    fn connector_info(&self, connector: connector::Handle) -> io::Result<ConnectorInfo>;
    /// Snapshot of an encoder
    fn encoder_info(&self, encoder: encoder::Handle) -> io::Result<EncoderInfo>;
    /// Snapshot of a crtc
    fn crtc_info(&self, crtc: crtc::Handle) -> io::Result<CrtcInfo>;
    /// Snapshot of a plane
    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo>;
    /// All properties of an object with their current values
    fn properties(&self, object: ObjectHandle) -> io::Result<Vec<PropertyInfo>>;

    /// Contents of a property blob
    fn blob(&self, blob: u64) -> io::Result<Vec<u8>>;
    /// Create a property blob
    fn create_blob(&self, data: &[u8]) -> io::Result<u64>;
    /// Destroy a property blob
    fn destroy_blob(&self, blob: u64) -> io::Result<()>;

    /// Submit an atomic request
    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> io::Result<()>;
    /// Legacy blocking mode-set
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()>;
    /// Legacy page flip, requesting a completion event
    fn page_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()>;
    /// Legacy cursor image. `None` hides the cursor.
    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<(u32, (u32, u32))>) -> io::Result<()>;
    /// Legacy cursor position
    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()>;
    /// Legacy gamma ramp
    fn set_gamma(&self, crtc: crtc::Handle, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()>;
    /// Legacy property write
    fn set_property(&self, object: ObjectHandle, property: property::Handle, value: u64) -> io::Result<()>;

    /// Read all pending page flip events
    fn receive_events(&self) -> io::Result<Vec<PageFlipEvent>>;
    /// Wait until events can be read. Returns `false` on timeout.
    fn wait_for_events(&self, timeout: Duration) -> io::Result<bool>;

    /// Allocate a dumb buffer with a framebuffer
    fn create_dumb_buffer(&self, size: (u32, u32), format: DrmFourcc) -> io::Result<DumbBufferInfo>;
    /// Free a dumb buffer and its framebuffer
    fn destroy_dumb_buffer(&self, buffer: &DumbBufferInfo) -> io::Result<()>;
    /// Map a dumb buffer and hand its pixels to `f`
    fn map_dumb_buffer(&self, buffer: &DumbBufferInfo, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()>;
}
