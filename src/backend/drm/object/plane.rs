use std::{cell::RefCell, rc::Rc};

use drm::control::plane;
use drm_fourcc::DrmFourcc;

use super::{DrmObject, PropertyDefinition};
use crate::{
    backend::drm::{
        buffer::{BufferArena, BufferId, ScanoutSlots},
        device::{KmsDevice, ObjectHandle},
        error::{AccessError, Error},
    },
    utils::{Buffer, Physical, Rectangle, Size, Transform},
};

/// Properties of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PlaneProp {
    /// `type`
    Type,
    /// `SRC_X`, 16.16 fixed point
    SrcX,
    /// `SRC_Y`, 16.16 fixed point
    SrcY,
    /// `SRC_W`, 16.16 fixed point
    SrcW,
    /// `SRC_H`, 16.16 fixed point
    SrcH,
    /// `CRTC_X`
    CrtcX,
    /// `CRTC_Y`
    CrtcY,
    /// `CRTC_W`
    CrtcW,
    /// `CRTC_H`
    CrtcH,
    /// `FB_ID`
    FbId,
    /// `CRTC_ID`
    CrtcId,
    /// `rotation`
    Rotation,
    /// `IN_FORMATS`
    InFormats,
}

static PLANE_PROPS: [PropertyDefinition; 13] = [
    PropertyDefinition::required("type"),
    PropertyDefinition::required("SRC_X"),
    PropertyDefinition::required("SRC_Y"),
    PropertyDefinition::required("SRC_W"),
    PropertyDefinition::required("SRC_H"),
    PropertyDefinition::required("CRTC_X"),
    PropertyDefinition::required("CRTC_Y"),
    PropertyDefinition::required("CRTC_W"),
    PropertyDefinition::required("CRTC_H"),
    PropertyDefinition::required("FB_ID"),
    PropertyDefinition::required("CRTC_ID"),
    PropertyDefinition::optional("rotation"),
    PropertyDefinition::optional("IN_FORMATS"),
];

/// Role of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    /// Main scanout plane of a crtc
    Primary,
    /// Additional layer
    Overlay,
    /// Cursor layer
    Cursor,
}

bitflags::bitflags! {
    /// Values of the `rotation` property
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Transformations: u64 {
        /// No rotation
        const ROTATE_0 = 1 << 0;
        /// Rotated by 90 degrees counter-clockwise
        const ROTATE_90 = 1 << 1;
        /// Rotated by 180 degrees
        const ROTATE_180 = 1 << 2;
        /// Rotated by 270 degrees counter-clockwise
        const ROTATE_270 = 1 << 3;
        /// Mirrored horizontally
        const REFLECT_X = 1 << 4;
        /// Mirrored vertically
        const REFLECT_Y = 1 << 5;
    }
}

impl Transformations {
    /// The plane rotation implementing an output transform
    pub fn from_transform(transform: Transform) -> Transformations {
        let rotation = match transform.degrees() {
            90 => Transformations::ROTATE_90,
            180 => Transformations::ROTATE_180,
            270 => Transformations::ROTATE_270,
            _ => Transformations::ROTATE_0,
        };
        if transform.flipped() {
            rotation | Transformations::REFLECT_X
        } else {
            rotation
        }
    }

    fn from_property_name(name: &str) -> Option<Transformations> {
        Some(match name {
            "rotate-0" => Transformations::ROTATE_0,
            "rotate-90" => Transformations::ROTATE_90,
            "rotate-180" => Transformations::ROTATE_180,
            "rotate-270" => Transformations::ROTATE_270,
            "reflect-x" => Transformations::REFLECT_X,
            "reflect-y" => Transformations::REFLECT_Y,
            _ => return None,
        })
    }
}

/// A hardware plane
#[derive(Debug)]
pub struct DrmPlane {
    object: DrmObject,
    handle: plane::Handle,
    kind: PlaneType,
    possible_crtcs: u32,
    formats: Vec<u32>,
    supported_transformations: Transformations,
    scanout: RefCell<ScanoutSlots>,
}

impl DrmPlane {
    /// Query a plane and its properties. Planes only exist on atomic devices.
    pub fn new(device: Rc<dyn KmsDevice>, handle: plane::Handle) -> Result<Rc<Self>, Error> {
        let info = device.plane_info(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to query plane",
                dev: device.dev_path(),
                source,
            })
        })?;
        let object = DrmObject::new(device, ObjectHandle::Plane(handle), true, &PLANE_PROPS)?;

        let kind = match object
            .prop(PlaneProp::Type as usize)
            .and_then(|prop| prop.current_enum().map(str::to_owned))
            .as_deref()
        {
            Some("Primary") => PlaneType::Primary,
            Some("Cursor") => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };

        let supported_transformations = match object.prop(PlaneProp::Rotation as usize) {
            None => Transformations::ROTATE_0,
            Some(prop) => {
                let named = prop
                    .enum_names()
                    .filter_map(Transformations::from_property_name)
                    .fold(Transformations::empty(), |all, t| all | t);
                // bitmask properties may come without their names, the test decides then
                if named.is_empty() {
                    Transformations::all()
                } else {
                    named
                }
            }
        };

        Ok(Rc::new(DrmPlane {
            object,
            handle,
            kind,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            supported_transformations,
            scanout: RefCell::new(ScanoutSlots::default()),
        }))
    }

    /// The property table
    pub fn object(&self) -> &DrmObject {
        &self.object
    }

    /// Kernel handle
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// Numeric id
    pub fn id(&self) -> u32 {
        self.object.id()
    }

    /// Role of this plane
    pub fn plane_type(&self) -> PlaneType {
        self.kind
    }

    /// Bitmask of compatible crtc pipe indices
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    /// Whether the crtc with `pipe_index` can use this plane
    pub fn is_crtc_supported(&self, pipe_index: usize) -> bool {
        pipe_index < 32 && self.possible_crtcs & (1 << pipe_index) != 0
    }

    /// Supported pixel formats
    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    /// Whether the plane can scan out `format`
    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&(format as u32))
    }

    /// Rotations the plane advertises
    pub fn supported_transformations(&self) -> Transformations {
        self.supported_transformations
    }

    /// Pending rotation, [`Transformations::ROTATE_0`] without a `rotation` property
    pub fn transformation(&self) -> Transformations {
        self.object
            .pending(PlaneProp::Rotation as usize)
            .map(Transformations::from_bits_truncate)
            .unwrap_or(Transformations::ROTATE_0)
    }

    /// Stage a rotation. Fails if it is not supported.
    pub fn set_transformation(&self, transformation: Transformations) -> bool {
        if !self.object.has(PlaneProp::Rotation as usize) {
            return transformation == Transformations::ROTATE_0;
        }
        if !self.supported_transformations.contains(transformation) {
            return false;
        }
        self.object
            .set_pending(PlaneProp::Rotation as usize, transformation.bits())
    }

    /// Stage the source rectangle in buffer coordinates
    pub fn set_source(&self, source: Rectangle<u32, Buffer>) {
        // 16.16 fixed point
        let fixed = |v: u32| (v as u64) << 16;
        self.object.set_pending(PlaneProp::SrcX as usize, fixed(source.loc.x));
        self.object.set_pending(PlaneProp::SrcY as usize, fixed(source.loc.y));
        self.object.set_pending(PlaneProp::SrcW as usize, fixed(source.size.w));
        self.object.set_pending(PlaneProp::SrcH as usize, fixed(source.size.h));
    }

    /// Stage the destination rectangle on the crtc
    pub fn set_destination(&self, destination: Rectangle<i32, Physical>) {
        // CRTC_X and CRTC_Y are signed
        self.object
            .set_pending(PlaneProp::CrtcX as usize, destination.loc.x as i64 as u64);
        self.object
            .set_pending(PlaneProp::CrtcY as usize, destination.loc.y as i64 as u64);
        self.object
            .set_pending(PlaneProp::CrtcW as usize, destination.size.w as u64);
        self.object
            .set_pending(PlaneProp::CrtcH as usize, destination.size.h as u64);
    }

    /// Staged source size in pixels
    pub fn source_size(&self) -> Size<u32, Buffer> {
        let get = |prop: PlaneProp| (self.object.pending(prop as usize).unwrap_or(0) >> 16) as u32;
        (get(PlaneProp::SrcW), get(PlaneProp::SrcH)).into()
    }

    /// Stage the crtc to attach to, `0` detaches the plane
    pub fn set_crtc(&self, crtc: u32) {
        self.object.set_pending(PlaneProp::CrtcId as usize, crtc as u64);
    }

    /// Stage the framebuffer to scan out, `0` for none
    pub fn set_framebuffer(&self, framebuffer: u32) {
        self.object.set_pending(PlaneProp::FbId as usize, framebuffer as u64);
    }

    /// Crtc id the plane is attached to in hardware
    pub fn current_crtc(&self) -> u64 {
        self.object.current(PlaneProp::CrtcId as usize).unwrap_or(0)
    }

    /// Buffer committed to this plane and waiting for its page flip
    pub fn next_buffer(&self) -> Option<BufferId> {
        self.scanout.borrow().next()
    }

    /// Buffer on screen
    pub fn current_buffer(&self) -> Option<BufferId> {
        self.scanout.borrow().current()
    }

    /// Record the buffer of a successful commit
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
        self.object.prop_needs_commit(PlaneProp::CrtcId as usize)
    }
}
