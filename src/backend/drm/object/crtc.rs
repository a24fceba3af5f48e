use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use drm::control::{crtc, Mode};

use super::{DrmObject, PropertyDefinition};
use crate::backend::drm::{
    buffer::{BufferArena, BufferId, ScanoutSlots},
    device::{KmsDevice, ObjectHandle},
    error::{AccessError, Error},
};

/// Properties of a crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CrtcProp {
    /// `MODE_ID`
    ModeId,
    /// `ACTIVE`
    Active,
    /// `VRR_ENABLED`
    VrrEnabled,
    /// `GAMMA_LUT`
    GammaLut,
    /// `GAMMA_LUT_SIZE`
    GammaLutSize,
}

static CRTC_PROPS: [PropertyDefinition; 5] = [
    PropertyDefinition::required("MODE_ID"),
    PropertyDefinition::required("ACTIVE"),
    PropertyDefinition::optional("VRR_ENABLED"),
    PropertyDefinition::optional("GAMMA_LUT"),
    PropertyDefinition::optional("GAMMA_LUT_SIZE"),
];

/// A crtc
#[derive(Debug)]
pub struct DrmCrtc {
    object: DrmObject,
    handle: crtc::Handle,
    pipe_index: usize,
    mode: Cell<Option<Mode>>,
    gamma_length: Cell<u32>,
    scanout: RefCell<ScanoutSlots>,
}

impl DrmCrtc {
    /// Query a crtc and its properties. `pipe_index` is its position in the resource list.
    pub fn new(
        device: Rc<dyn KmsDevice>,
        handle: crtc::Handle,
        pipe_index: usize,
        atomic: bool,
    ) -> Result<Rc<Self>, Error> {
        let object = DrmObject::new(device, ObjectHandle::Crtc(handle), atomic, &CRTC_PROPS)?;
        let crtc = DrmCrtc {
            object,
            handle,
            pipe_index,
            mode: Cell::new(None),
            gamma_length: Cell::new(0),
            scanout: RefCell::new(ScanoutSlots::default()),
        };
        crtc.query_state()?;
        Ok(Rc::new(crtc))
    }

    fn query_state(&self) -> Result<(), Error> {
        let device = self.object.device();
        let info = device.crtc_info(self.handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to query crtc",
                dev: device.dev_path(),
                source,
            })
        })?;
        self.mode.set(info.mode);
        self.gamma_length.set(info.gamma_length);
        Ok(())
    }

    /// Re-query mode and properties
    pub fn refresh(&self) -> Result<(), Error> {
        self.query_state()?;
        self.object.update_properties()
    }

    /// The property table
    pub fn object(&self) -> &DrmObject {
        &self.object
    }

    /// Kernel handle
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Numeric id
    pub fn id(&self) -> u32 {
        self.object.id()
    }

    /// Position of the crtc in the device resources, used by `possible_crtcs` masks
    pub fn pipe_index(&self) -> usize {
        self.pipe_index
    }

    /// Mode programmed in hardware, as of the last query or legacy mode-set
    pub fn current_mode(&self) -> Option<Mode> {
        self.mode.get()
    }

    pub(crate) fn set_current_mode(&self, mode: Option<Mode>) {
        self.mode.set(mode);
    }

    /// Whether the crtc currently scans out
    pub fn is_active(&self) -> bool {
        if self.object.is_atomic() {
            self.object.current(CrtcProp::Active as usize) == Some(1)
        } else {
            self.mode.get().is_some()
        }
    }

    /// Number of gamma ramp entries
    pub fn gamma_ramp_size(&self) -> u32 {
        self.object
            .current(CrtcProp::GammaLutSize as usize)
            .map(|size| size as u32)
            .unwrap_or_else(|| self.gamma_length.get())
    }

    /// Buffer scanned out through legacy page flips
    pub fn current_buffer(&self) -> Option<BufferId> {
        self.scanout.borrow().current()
    }

    /// Buffer waiting for its legacy page flip
    pub fn next_buffer(&self) -> Option<BufferId> {
        self.scanout.borrow().next()
    }

    /// Record the buffer of a legacy page flip
    pub fn set_next(&self, arena: &mut BufferArena, buffer: Option<BufferId>) {
        self.scanout.borrow_mut().set_next(arena, buffer);
    }

    /// The next buffer reached the screen
    pub fn flip_buffer(&self, arena: &mut BufferArena) {
        self.scanout.borrow_mut().flip(arena);
    }

    /// Forget all buffers
    pub fn release_buffers(&self, arena: &mut BufferArena) {
        self.scanout.borrow_mut().clear(arena);
    }

    /// Committing the pending values requires a modeset
    pub fn needs_modeset(&self) -> bool {
        self.object.prop_needs_commit(CrtcProp::Active as usize)
            || self.object.prop_needs_commit(CrtcProp::ModeId as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{CrtcProp, DrmCrtc};
    use crate::backend::drm::device::{dummy::DummyDevice, KmsDevice};

    #[test]
    fn activation_needs_modeset() {
        let dummy = Rc::new(DummyDevice::new());
        let handle = dummy.add_crtc();
        let device: Rc<dyn KmsDevice> = dummy;
        let crtc = DrmCrtc::new(device, handle, 0, true).unwrap();

        assert!(!crtc.is_active());
        assert_eq!(crtc.gamma_ramp_size(), 256);
        assert!(!crtc.needs_modeset());
        crtc.object().set_pending(CrtcProp::VrrEnabled as usize, 1);
        assert!(!crtc.needs_modeset());
        crtc.object().set_pending(CrtcProp::Active as usize, 1);
        assert!(crtc.needs_modeset());
    }

    #[test]
    fn legacy_activity_follows_mode() {
        let dummy = Rc::new(DummyDevice::legacy());
        let handle = dummy.add_crtc();
        let device: Rc<dyn KmsDevice> = dummy;
        let crtc = DrmCrtc::new(device, handle, 0, false).unwrap();

        assert!(!crtc.is_active());
        crtc.set_current_mode(Some(crate::backend::drm::device::dummy::test_mode(640, 480, 60, true)));
        assert!(crtc.is_active());
    }
}
