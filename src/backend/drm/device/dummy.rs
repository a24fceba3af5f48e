//! Scripted in-memory device used by the tests of the drm backend

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    time::Duration,
};

use drm::control::{connector, crtc, encoder, framebuffer, from_u32, plane, property, Mode};
use drm_fourcc::DrmFourcc;
use rustix::event::{eventfd, EventfdFlags};

use super::{
    AtomicCommitFlags, AtomicRequest, ConnectorInfo, CrtcInfo, DeviceCapabilities, DeviceResources,
    DumbBufferInfo, EncoderInfo, KmsDevice, ObjectHandle, PageFlipEvent, PlaneInfo, PropertyInfo,
};

/// A request the device received
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceCall {
    AtomicTest,
    AtomicCommit(AtomicCommitFlags),
    CreateBlob(u64),
    DestroyBlob(u64),
    SetCrtc(crtc::Handle),
    PageFlip(crtc::Handle),
    SetCursor(crtc::Handle, bool),
    MoveCursor(crtc::Handle, (i32, i32)),
    SetGamma(crtc::Handle),
    SetProperty(u32, String, u64),
    CreateDumb((u32, u32)),
    DestroyDumb(u32),
}

/// Property values of a request, resolved to `(object id, property name, value)`
pub(crate) type ResolvedRequest = [(u32, String, u64)];

type Predicate = Box<dyn Fn(&ResolvedRequest) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DummyPlaneType {
    Overlay = 0,
    Primary = 1,
    Cursor = 2,
}

#[derive(Default)]
struct DummyState {
    connectors: Vec<(connector::Handle, ConnectorInfo)>,
    encoders: HashMap<encoder::Handle, EncoderInfo>,
    crtcs: Vec<(crtc::Handle, CrtcInfo)>,
    planes: Vec<(plane::Handle, PlaneInfo)>,
    properties: HashMap<u32, Vec<PropertyInfo>>,
    blobs: HashMap<u64, Vec<u8>>,
    dumb_buffers: HashMap<u32, Vec<u8>>,
    events: VecDeque<PageFlipEvent>,
    next_id: u32,
}

impl DummyState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn add_property(&mut self, object: u32, name: &str, value: u64, immutable: bool, blob: bool) {
        self.add_enum_property(object, name, value, immutable, blob, Vec::new());
    }

    fn add_enum_property(
        &mut self,
        object: u32,
        name: &str,
        value: u64,
        immutable: bool,
        blob: bool,
        enums: Vec<(String, u64)>,
    ) {
        let id = self.next_id();
        let handle: property::Handle = from_u32(id).expect("non-zero id");
        self.properties.entry(object).or_default().push(PropertyInfo {
            handle,
            name: name.to_string(),
            value,
            immutable,
            blob,
            enums,
        });
    }

    fn resolve(&self, request: &AtomicRequest) -> Vec<(u32, String, u64)> {
        request
            .entries()
            .iter()
            .map(|(object, property, value)| {
                let object = u32::from(*object);
                let name = self
                    .properties
                    .get(&object)
                    .and_then(|props| props.iter().find(|p| p.handle == *property))
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                (object, name, *value)
            })
            .collect()
    }
}

/// A fake device with a scripted topology
///
/// Atomic commits apply their values to the property tables, so later
/// `properties` queries observe them like on real hardware.
pub(crate) struct DummyDevice {
    atomic: bool,
    driver: String,
    capabilities: DeviceCapabilities,
    state: RefCell<DummyState>,
    calls: RefCell<Vec<DeviceCall>>,
    reject_tests: RefCell<Option<Predicate>>,
    reject_commits: RefCell<Option<Predicate>>,
    fail_blobs: Cell<bool>,
    fail_legacy: Cell<bool>,
    idle_waits: Cell<u32>,
    // readable while events are queued
    event_fd: OwnedFd,
}

impl std::fmt::Debug for DummyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyDevice")
            .field("atomic", &self.atomic)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl DummyDevice {
    pub fn new() -> DummyDevice {
        DummyDevice {
            atomic: true,
            driver: String::from("dummy"),
            capabilities: DeviceCapabilities {
                monotonic_timestamps: true,
                ..Default::default()
            },
            state: RefCell::new(DummyState::default()),
            calls: RefCell::new(Vec::new()),
            reject_tests: RefCell::new(None),
            reject_commits: RefCell::new(None),
            fail_blobs: Cell::new(false),
            fail_legacy: Cell::new(false),
            idle_waits: Cell::new(0),
            event_fd: eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).expect("eventfd"),
        }
    }

    pub fn legacy() -> DummyDevice {
        DummyDevice {
            atomic: false,
            ..DummyDevice::new()
        }
    }

    pub fn with_driver(mut self, driver: &str) -> DummyDevice {
        self.driver = driver.to_string();
        self
    }

    pub fn add_crtc(&self) -> crtc::Handle {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        let handle: crtc::Handle = from_u32(id).expect("non-zero id");
        state.crtcs.push((
            handle,
            CrtcInfo {
                mode: None,
                gamma_length: 256,
            },
        ));
        state.add_property(id, "ACTIVE", 0, false, false);
        state.add_property(id, "MODE_ID", 0, false, true);
        state.add_property(id, "VRR_ENABLED", 0, false, false);
        state.add_property(id, "GAMMA_LUT", 0, false, true);
        state.add_property(id, "GAMMA_LUT_SIZE", 256, true, false);
        handle
    }

    pub fn add_plane(&self, kind: DummyPlaneType, possible_crtcs: u32, rotation: bool) -> plane::Handle {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        let handle: plane::Handle = from_u32(id).expect("non-zero id");
        state.planes.push((
            handle,
            PlaneInfo {
                possible_crtcs,
                formats: vec![DrmFourcc::Xrgb8888 as u32, DrmFourcc::Argb8888 as u32],
            },
        ));
        let types = vec![
            (String::from("Overlay"), DummyPlaneType::Overlay as u64),
            (String::from("Primary"), DummyPlaneType::Primary as u64),
            (String::from("Cursor"), DummyPlaneType::Cursor as u64),
        ];
        state.add_enum_property(id, "type", kind as u64, true, false, types);
        for name in [
            "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "FB_ID", "CRTC_ID",
        ] {
            state.add_property(id, name, 0, false, false);
        }
        if rotation {
            state.add_property(id, "rotation", 1, false, false);
        }
        handle
    }

    pub fn add_connector(&self, modes: Vec<Mode>, possible_crtcs: u32) -> connector::Handle {
        let mut state = self.state.borrow_mut();
        let encoder_id = state.next_id();
        let encoder: encoder::Handle = from_u32(encoder_id).expect("non-zero id");
        state.encoders.insert(encoder, EncoderInfo { possible_crtcs });

        let id = state.next_id();
        let handle: connector::Handle = from_u32(id).expect("non-zero id");
        let index = state.connectors.len() as u32;
        state.connectors.push((
            handle,
            ConnectorInfo {
                interface: connector::Interface::DisplayPort,
                interface_id: index + 1,
                state: connector::State::Connected,
                size: Some((600, 340)),
                modes,
                encoders: vec![encoder],
            },
        ));
        state.add_property(id, "CRTC_ID", 0, false, false);
        state.add_property(id, "non-desktop", 0, true, false);
        state.add_property(id, "vrr_capable", 0, true, false);
        handle
    }

    /// Adds a property to an existing object
    pub fn add_object_property(&self, object: u32, name: &str, value: u64, immutable: bool, blob: bool) {
        self.state
            .borrow_mut()
            .add_property(object, name, value, immutable, blob);
    }

    /// Adds an enum property to an existing object
    pub fn add_object_enum_property(&self, object: u32, name: &str, value: u64, enums: &[(&str, u64)]) {
        let enums = enums.iter().map(|(n, v)| (n.to_string(), *v)).collect();
        self.state
            .borrow_mut()
            .add_enum_property(object, name, value, false, false, enums);
    }

    /// Stores a blob as if it had been created by another client
    pub fn insert_blob(&self, data: &[u8]) -> u64 {
        let mut state = self.state.borrow_mut();
        let id = state.next_id() as u64;
        state.blobs.insert(id, data.to_vec());
        id
    }

    pub fn remove_connector(&self, connector: connector::Handle) {
        let mut state = self.state.borrow_mut();
        state.connectors.retain(|(handle, _)| *handle != connector);
        state.properties.remove(&u32::from(connector));
    }

    pub fn remove_crtc(&self, crtc: crtc::Handle) {
        let mut state = self.state.borrow_mut();
        state.crtcs.retain(|(handle, _)| *handle != crtc);
        state.properties.remove(&u32::from(crtc));
    }

    pub fn set_connection(&self, connector: connector::Handle, connected: bool) {
        let mut state = self.state.borrow_mut();
        if let Some((_, info)) = state.connectors.iter_mut().find(|(h, _)| *h == connector) {
            info.state = if connected {
                connector::State::Connected
            } else {
                connector::State::Disconnected
            };
        }
    }

    /// Overwrites a property value, simulating changes by another master
    pub fn set_value(&self, object: u32, name: &str, value: u64) {
        let mut state = self.state.borrow_mut();
        if let Some(prop) = state
            .properties
            .get_mut(&object)
            .and_then(|props| props.iter_mut().find(|p| p.name == name))
        {
            prop.value = value;
        }
    }

    pub fn value(&self, object: u32, name: &str) -> Option<u64> {
        self.state
            .borrow()
            .properties
            .get(&object)
            .and_then(|props| props.iter().find(|p| p.name == name))
            .map(|p| p.value)
    }

    pub fn reject_tests_where(&self, predicate: impl Fn(&ResolvedRequest) -> bool + 'static) {
        *self.reject_tests.borrow_mut() = Some(Box::new(predicate));
    }

    pub fn reject_commits_where(&self, predicate: impl Fn(&ResolvedRequest) -> bool + 'static) {
        *self.reject_commits.borrow_mut() = Some(Box::new(predicate));
    }

    pub fn clear_rejections(&self) {
        *self.reject_tests.borrow_mut() = None;
        *self.reject_commits.borrow_mut() = None;
    }

    pub fn fail_blobs(&self, fail: bool) {
        self.fail_blobs.set(fail);
    }

    pub fn fail_legacy(&self, fail: bool) {
        self.fail_legacy.set(fail);
    }

    pub fn push_event(&self, event: PageFlipEvent) {
        self.state.borrow_mut().events.push_back(event);
        self.wake();
    }

    fn wake(&self) {
        rustix::io::write(&self.event_fd, &1u64.to_ne_bytes()).expect("eventfd write");
    }

    pub fn pending_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    pub fn live_blobs(&self) -> usize {
        self.state.borrow().blobs.len()
    }

    pub fn idle_waits(&self) -> u32 {
        self.idle_waits.get()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn count_calls(&self, f: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|call| f(call)).count()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.borrow_mut().push(call);
    }

    fn legacy_result(&self) -> io::Result<()> {
        if self.fail_legacy.get() {
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        } else {
            Ok(())
        }
    }
}

fn invalid() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl KmsDevice for DummyDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/dev/dri/dummy"))
    }

    fn event_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.event_fd.as_fd())
    }

    fn driver_name(&self) -> io::Result<String> {
        Ok(self.driver.clone())
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn enable_atomic(&self) -> bool {
        self.atomic
    }

    fn enable_universal_planes(&self) -> bool {
        self.atomic
    }

    fn resources(&self) -> io::Result<DeviceResources> {
        let state = self.state.borrow();
        Ok(DeviceResources {
            connectors: state.connectors.iter().map(|(h, _)| *h).collect(),
            crtcs: state.crtcs.iter().map(|(h, _)| *h).collect(),
        })
    }

    fn planes(&self) -> io::Result<Vec<plane::Handle>> {
        Ok(self.state.borrow().planes.iter().map(|(h, _)| *h).collect())
    }

    fn connector_info(&self, connector: connector::Handle) -> io::Result<ConnectorInfo> {
        self.state
            .borrow()
            .connectors
            .iter()
            .find(|(h, _)| *h == connector)
            .map(|(_, info)| info.clone())
            .ok_or_else(invalid)
    }

    fn encoder_info(&self, encoder: encoder::Handle) -> io::Result<EncoderInfo> {
        self.state
            .borrow()
            .encoders
            .get(&encoder)
            .copied()
            .ok_or_else(invalid)
    }

    fn crtc_info(&self, crtc: crtc::Handle) -> io::Result<CrtcInfo> {
        self.state
            .borrow()
            .crtcs
            .iter()
            .find(|(h, _)| *h == crtc)
            .map(|(_, info)| info.clone())
            .ok_or_else(invalid)
    }

    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo> {
        self.state
            .borrow()
            .planes
            .iter()
            .find(|(h, _)| *h == plane)
            .map(|(_, info)| info.clone())
            .ok_or_else(invalid)
    }

    fn properties(&self, object: ObjectHandle) -> io::Result<Vec<PropertyInfo>> {
        self.state
            .borrow()
            .properties
            .get(&object.id())
            .cloned()
            .ok_or_else(invalid)
    }

    fn blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.state.borrow().blobs.get(&blob).cloned().ok_or_else(invalid)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u64> {
        if self.fail_blobs.get() {
            return Err(invalid());
        }
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id() as u64;
            state.blobs.insert(id, data.to_vec());
            id
        };
        self.record(DeviceCall::CreateBlob(id));
        Ok(id)
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.record(DeviceCall::DestroyBlob(blob));
        self.state
            .borrow_mut()
            .blobs
            .remove(&blob)
            .map(|_| ())
            .ok_or_else(invalid)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &AtomicRequest) -> io::Result<()> {
        if !self.atomic {
            return Err(invalid());
        }
        let resolved = self.state.borrow().resolve(request);
        if resolved.iter().any(|(_, name, _)| name.is_empty()) {
            return Err(invalid());
        }

        if flags.contains(AtomicCommitFlags::TEST_ONLY) {
            self.record(DeviceCall::AtomicTest);
            return match &*self.reject_tests.borrow() {
                Some(reject) if reject(&resolved) => Err(invalid()),
                _ => Ok(()),
            };
        }

        self.record(DeviceCall::AtomicCommit(flags));
        if let Some(reject) = &*self.reject_commits.borrow() {
            if reject(&resolved) {
                return Err(invalid());
            }
        }

        let mut state = self.state.borrow_mut();
        for (object, name, value) in &resolved {
            if let Some(prop) = state
                .properties
                .get_mut(object)
                .and_then(|props| props.iter_mut().find(|p| p.name == *name))
            {
                prop.value = *value;
            }
        }
        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            let crtcs: Vec<crtc::Handle> = state
                .crtcs
                .iter()
                .map(|(h, _)| *h)
                .filter(|h| resolved.iter().any(|(object, _, _)| *object == u32::from(*h)))
                .collect();
            for crtc in crtcs {
                state.events.push_back(PageFlipEvent {
                    crtc,
                    frame: 1,
                    duration: Duration::from_millis(16),
                });
            }
            drop(state);
            self.wake();
        }
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        _framebuffer: Option<framebuffer::Handle>,
        _connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        self.record(DeviceCall::SetCrtc(crtc));
        self.legacy_result()?;
        if let Some((_, info)) = self.state.borrow_mut().crtcs.iter_mut().find(|(h, _)| *h == crtc) {
            info.mode = mode;
        }
        Ok(())
    }

    fn page_flip(&self, crtc: crtc::Handle, _framebuffer: framebuffer::Handle) -> io::Result<()> {
        self.record(DeviceCall::PageFlip(crtc));
        self.legacy_result()?;
        self.push_event(PageFlipEvent {
            crtc,
            frame: 1,
            duration: Duration::from_millis(16),
        });
        Ok(())
    }

    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<(u32, (u32, u32))>) -> io::Result<()> {
        self.record(DeviceCall::SetCursor(crtc, buffer.is_some()));
        self.legacy_result()
    }

    fn move_cursor(&self, crtc: crtc::Handle, position: (i32, i32)) -> io::Result<()> {
        self.record(DeviceCall::MoveCursor(crtc, position));
        self.legacy_result()
    }

    fn set_gamma(&self, crtc: crtc::Handle, _red: &[u16], _green: &[u16], _blue: &[u16]) -> io::Result<()> {
        self.record(DeviceCall::SetGamma(crtc));
        self.legacy_result()
    }

    fn set_property(&self, object: ObjectHandle, property: property::Handle, value: u64) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let prop = state
            .properties
            .get_mut(&object.id())
            .and_then(|props| props.iter_mut().find(|p| p.handle == property))
            .ok_or_else(invalid)?;
        prop.value = value;
        let name = prop.name.clone();
        drop(state);
        self.record(DeviceCall::SetProperty(object.id(), name, value));
        self.legacy_result()
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlipEvent>> {
        let mut counter = [0u8; 8];
        // nothing to clear if no event was queued
        let _ = rustix::io::read(&self.event_fd, &mut counter);
        Ok(self.state.borrow_mut().events.drain(..).collect())
    }

    fn wait_for_events(&self, _timeout: Duration) -> io::Result<bool> {
        self.idle_waits.set(self.idle_waits.get() + 1);
        Ok(!self.state.borrow().events.is_empty())
    }

    fn create_dumb_buffer(&self, size: (u32, u32), _format: DrmFourcc) -> io::Result<DumbBufferInfo> {
        self.record(DeviceCall::CreateDumb(size));
        let mut state = self.state.borrow_mut();
        let handle = state.next_id();
        let framebuffer: framebuffer::Handle = from_u32(state.next_id()).expect("non-zero id");
        state
            .dumb_buffers
            .insert(handle, vec![0; (size.0 * size.1 * 4) as usize]);
        Ok(DumbBufferInfo {
            handle,
            framebuffer,
            size,
            pitch: size.0 * 4,
        })
    }

    fn destroy_dumb_buffer(&self, buffer: &DumbBufferInfo) -> io::Result<()> {
        self.record(DeviceCall::DestroyDumb(buffer.handle));
        self.state
            .borrow_mut()
            .dumb_buffers
            .remove(&buffer.handle)
            .map(|_| ())
            .ok_or_else(invalid)
    }

    fn map_dumb_buffer(&self, buffer: &DumbBufferInfo, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let data = state.dumb_buffers.get_mut(&buffer.handle).ok_or_else(invalid)?;
        f(data);
        Ok(())
    }
}

/// A mode with the given size and refresh rate
pub(crate) fn test_mode(width: u16, height: u16, refresh: u32, preferred: bool) -> Mode {
    // SAFETY: drm_mode_modeinfo is a plain C struct, all zero is a valid value
    let mut raw: drm_ffi::drm_mode_modeinfo = unsafe { std::mem::zeroed() };
    raw.hdisplay = width;
    raw.vdisplay = height;
    raw.htotal = width + 160;
    raw.vtotal = height + 40;
    raw.vrefresh = refresh;
    raw.clock = (raw.htotal as u32 * raw.vtotal as u32 * refresh) / 1000;
    raw.type_ = if preferred {
        drm_ffi::DRM_MODE_TYPE_PREFERRED | drm_ffi::DRM_MODE_TYPE_DRIVER
    } else {
        drm_ffi::DRM_MODE_TYPE_DRIVER
    };
    let name = format!("{}x{}", width, height);
    for (dst, src) in raw.name.iter_mut().zip(name.bytes()) {
        *dst = src as _;
    }
    Mode::from(raw)
}
