use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    os::unix::io::{AsFd, BorrowedFd},
    path::PathBuf,
    time::Duration,
};

use drm::{
    buffer::Buffer as _,
    control::{
        connector, crtc, dumbbuffer::DumbBuffer, encoder, plane, property, atomic::AtomicModeReq,
        Device as ControlDevice, Event, Mode, PageFlipFlags,
    },
    ClientCapability, Device as BasicDevice, DriverCapability,
};
use drm_fourcc::DrmFourcc;
use rustix::event::{PollFd, PollFlags};
use tracing::{debug, trace};

use super::{
    AtomicCommitFlags, AtomicRequest, ConnectorInfo, CrtcInfo, DeviceCapabilities, DeviceResources,
    DrmDeviceFd, DumbBufferInfo, EncoderInfo, KmsDevice, ObjectHandle, PageFlipEvent, PlaneInfo,
    PropertyInfo,
};
use crate::utils::DevPath;

/// A drm device node driven through the `drm` crate
#[derive(Debug)]
pub struct DrmDevice {
    fd: DrmDeviceFd,
    dumb_buffers: RefCell<HashMap<u32, DumbBuffer>>,
}

impl DrmDevice {
    /// Wrap an open device node
    pub fn new(fd: DrmDeviceFd) -> DrmDevice {
        DrmDevice {
            fd,
            dumb_buffers: RefCell::new(HashMap::new()),
        }
    }

    /// The underlying file descriptor
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    fn crtc_mask(&self, allowed: &[crtc::Handle]) -> io::Result<u32> {
        let resources = self.fd.resource_handles()?;
        Ok(resources
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| allowed.contains(crtc))
            .fold(0, |mask, (index, _)| mask | (1 << index)))
    }
}

impl KmsDevice for DrmDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        self.fd.dev_path()
    }

    fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.fd.as_fd())
    }

    fn driver_name(&self) -> io::Result<String> {
        Ok(self.fd.get_driver()?.name().to_string_lossy().into_owned())
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let defaults = DeviceCapabilities::default();
        let cap = |cap| self.fd.get_driver_capability(cap).ok();
        DeviceCapabilities {
            cursor_size: (
                cap(DriverCapability::CursorWidth)
                    .map(|w| w as u32)
                    .unwrap_or(defaults.cursor_size.0),
                cap(DriverCapability::CursorHeight)
                    .map(|h| h as u32)
                    .unwrap_or(defaults.cursor_size.1),
            ),
            monotonic_timestamps: cap(DriverCapability::MonotonicTimestamp) == Some(1),
            addfb2_modifiers: cap(DriverCapability::AddFB2Modifiers) == Some(1),
        }
    }

    fn enable_atomic(&self) -> bool {
        self.fd.set_client_capability(ClientCapability::Atomic, true).is_ok()
    }

    fn enable_universal_planes(&self) -> bool {
        self.fd
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok()
    }

    fn resources(&self) -> io::Result<DeviceResources> {
        let resources = self.fd.resource_handles()?;
        Ok(DeviceResources {
            connectors: resources.connectors().to_vec(),
            crtcs: resources.crtcs().to_vec(),
        })
    }

    fn planes(&self) -> io::Result<Vec<plane::Handle>> {
        Ok(self.fd.plane_handles()?.to_vec())
    }

    fn connector_info(&self, connector: connector::Handle) -> io::Result<ConnectorInfo> {
        let info = self.fd.get_connector(connector, true)?;
        Ok(ConnectorInfo {
            interface: info.interface(),
            interface_id: info.interface_id(),
            state: info.state(),
            size: info.size(),
            modes: info.modes().to_vec(),
            encoders: info.encoders().to_vec(),
        })
    }

    fn encoder_info(&self, encoder: encoder::Handle) -> io::Result<EncoderInfo> {
        let info = self.fd.get_encoder(encoder)?;
        let resources = self.fd.resource_handles()?;
        let allowed = resources.filter_crtcs(info.possible_crtcs());
        Ok(EncoderInfo {
            possible_crtcs: self.crtc_mask(&allowed)?,
        })
    }

    fn crtc_info(&self, crtc: crtc::Handle) -> io::Result<CrtcInfo> {
        let info = self.fd.get_crtc(crtc)?;
        Ok(CrtcInfo {
            mode: info.mode(),
            gamma_length: info.gamma_length(),
        })
    }

    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo> {
        let info = self.fd.get_plane(plane)?;
        let resources = self.fd.resource_handles()?;
        let allowed = resources.filter_crtcs(info.possible_crtcs());
        Ok(PlaneInfo {
            possible_crtcs: self.crtc_mask(&allowed)?,
            formats: info.formats().to_vec(),
        })
    }

    fn properties(&self, object: ObjectHandle) -> io::Result<Vec<PropertyInfo>> {
        let set = match object {
            ObjectHandle::Connector(handle) => self.fd.get_properties(handle)?,
            ObjectHandle::Crtc(handle) => self.fd.get_properties(handle)?,
            ObjectHandle::Plane(handle) => self.fd.get_properties(handle)?,
        };
        let (handles, values) = set.as_props_and_values();

        let mut properties = Vec::with_capacity(handles.len());
        for (handle, value) in handles.iter().zip(values.iter()) {
            let info = match self.fd.get_property(*handle) {
                Ok(info) => info,
                Err(err) => {
                    debug!("Skipping unreadable property {:?} of {:?}: {}", handle, object, err);
                    continue;
                }
            };
            let enums = match info.value_type() {
                property::ValueType::Enum(enums) => {
                    let (_, entries) = enums.values();
                    entries
                        .iter()
                        .map(|entry| (entry.name().to_string_lossy().into_owned(), entry.value()))
                        .collect()
                }
                _ => Vec::new(),
            };
            properties.push(PropertyInfo {
                handle: *handle,
                name: info.name().to_string_lossy().into_owned(),
                value: *value,
                immutable: !info.mutable(),
                blob: matches!(info.value_type(), property::ValueType::Blob),
                enums,
            });
        }
        Ok(properties)
    }

    fn blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.fd.get_property_blob(blob)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u64> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.fd.as_fd(), &mut data)?;
        Ok(u64::from(blob.blob_id))
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.fd.destroy_property_blob(blob)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for (object, property, value) in request.entries() {
            req.add_raw_property(*object, *property, *value);
        }
        self.fd.atomic_commit(flags, req)
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<drm::control::framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        self.fd.set_crtc(crtc, framebuffer, (0, 0), connectors, mode)
    }

    fn page_flip(&self, crtc: crtc::Handle, framebuffer: drm::control::framebuffer::Handle) -> io::Result<()> {
        self.fd.page_flip(crtc, framebuffer, PageFlipFlags::EVENT, None)
    }

    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<(u32, (u32, u32))>) -> io::Result<()> {
        let (handle, (width, height)) = buffer.unwrap_or((0, (0, 0)));
        drm_ffi::mode::set_cursor(self.fd.as_fd(), crtc.into(), handle, width, height)?;
        Ok(())
    }

    #[allow(deprecated)]
    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()> {
        self.fd.move_cursor(crtc, position)
    }

    fn set_gamma(&self, crtc: crtc::Handle, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        self.fd.set_gamma(crtc, red, green, blue)
    }

    fn set_property(&self, object: ObjectHandle, property: property::Handle, value: u64) -> io::Result<()> {
        match object {
            ObjectHandle::Connector(handle) => self.fd.set_property(handle, property, value),
            ObjectHandle::Crtc(handle) => self.fd.set_property(handle, property, value),
            ObjectHandle::Plane(handle) => self.fd.set_property(handle, property, value),
        }
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlipEvent>> {
        Ok(self
            .fd
            .receive_events()?
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(PageFlipEvent {
                    crtc: event.crtc,
                    frame: event.frame,
                    duration: event.duration,
                }),
                _ => {
                    trace!("Got a non-page-flip event of device '{:?}'.", self.fd.dev_path());
                    None
                }
            })
            .collect())
    }

    fn wait_for_events(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let ready = rustix::event::poll(&mut fds, timeout.as_millis().min(i32::MAX as u128) as i32)?;
        Ok(ready > 0)
    }

    fn create_dumb_buffer(&self, size: (u32, u32), format: DrmFourcc) -> io::Result<DumbBufferInfo> {
        let buffer = self.fd.create_dumb_buffer(size, format, 32)?;
        let framebuffer = match self.fd.add_framebuffer(&buffer, 24, 32) {
            Ok(fb) => fb,
            Err(err) => {
                let _ = self.fd.destroy_dumb_buffer(buffer);
                return Err(err);
            }
        };
        let info = DumbBufferInfo {
            handle: u32::from(buffer.handle()),
            framebuffer,
            size: buffer.size(),
            pitch: buffer.pitch(),
        };
        self.dumb_buffers.borrow_mut().insert(info.handle, buffer);
        Ok(info)
    }

    fn destroy_dumb_buffer(&self, buffer: &DumbBufferInfo) -> io::Result<()> {
        let result = self.fd.destroy_framebuffer(buffer.framebuffer);
        if let Some(dumb) = self.dumb_buffers.borrow_mut().remove(&buffer.handle) {
            self.fd.destroy_dumb_buffer(dumb)?;
        }
        result
    }

    fn map_dumb_buffer(&self, buffer: &DumbBufferInfo, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        let mut buffers = self.dumb_buffers.borrow_mut();
        let dumb = buffers
            .get_mut(&buffer.handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let mut mapping = self.fd.map_dumb_buffer(dumb)?;
        f(&mut mapping);
        Ok(())
    }
}
