//! Connectors, crtcs and planes of a drm device
//!
//! A [`DrmObject`] is the property table of one kernel object. The typed wrappers
//! [`DrmConnector`], [`DrmCrtc`] and [`DrmPlane`] add the queries specific to their object type
//! and expose their properties through index enums.

use std::{
    cell::{Ref, RefCell},
    fmt, io,
    rc::Rc,
};

use tracing::{debug, warn};

use super::{
    device::{AtomicRequest, KmsDevice, ObjectHandle},
    error::{AccessError, Error},
    property::DrmProperty,
};

mod connector;
mod crtc;
mod plane;

pub use self::connector::{ConnectorMode, ConnectorProp, DrmConnector, TileInfo};
pub(crate) use self::connector::{DPMS_OFF, DPMS_ON};
pub use self::crtc::{CrtcProp, DrmCrtc};
pub use self::plane::{DrmPlane, PlaneProp, PlaneType, Transformations};

/// Whether the atomic model needs a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Discovery fails without it on atomic devices
    Required,
    /// May be missing
    Optional,
}

/// A property an object type knows about
#[derive(Debug, Clone, Copy)]
pub struct PropertyDefinition {
    /// Kernel name of the property
    pub name: &'static str,
    /// Whether it must exist
    pub requirement: Requirement,
}

impl PropertyDefinition {
    pub(crate) const fn required(name: &'static str) -> PropertyDefinition {
        PropertyDefinition {
            name,
            requirement: Requirement::Required,
        }
    }

    pub(crate) const fn optional(name: &'static str) -> PropertyDefinition {
        PropertyDefinition {
            name,
            requirement: Requirement::Optional,
        }
    }
}

/// Property table of one kernel object
pub struct DrmObject {
    device: Rc<dyn KmsDevice>,
    handle: ObjectHandle,
    atomic: bool,
    definitions: &'static [PropertyDefinition],
    properties: RefCell<Vec<Option<DrmProperty>>>,
}

impl fmt::Debug for DrmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmObject")
            .field("handle", &self.handle)
            .field("atomic", &self.atomic)
            .finish()
    }
}

impl DrmObject {
    /// Read the properties of `handle`
    ///
    /// On atomic devices a missing [`Requirement::Required`] property fails the discovery.
    pub fn new(
        device: Rc<dyn KmsDevice>,
        handle: ObjectHandle,
        atomic: bool,
        definitions: &'static [PropertyDefinition],
    ) -> Result<DrmObject, Error> {
        let object = DrmObject {
            device,
            handle,
            atomic,
            definitions,
            properties: RefCell::new((0..definitions.len()).map(|_| None).collect()),
        };
        object.update_properties()?;
        Ok(object)
    }

    /// Kernel handle of the object
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Numeric id of the object
    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    /// Device owning this object
    pub fn device(&self) -> &Rc<dyn KmsDevice> {
        &self.device
    }

    /// Whether the object belongs to an atomic device
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Refresh the current values of all properties from the kernel
    pub fn update_properties(&self) -> Result<(), Error> {
        let infos = self.device.properties(self.handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to read object properties",
                dev: self.device.dev_path(),
                source,
            })
        })?;

        let mut properties = self.properties.borrow_mut();
        for (definition, slot) in self.definitions.iter().zip(properties.iter_mut()) {
            match infos.iter().find(|info| info.name == definition.name) {
                Some(info) => match slot {
                    Some(prop) => prop.update(&self.device, info.value),
                    None => *slot = Some(DrmProperty::new(&self.device, info.clone())),
                },
                None => {
                    if self.atomic && definition.requirement == Requirement::Required {
                        warn!(
                            "Required property {} missing on object {}",
                            definition.name,
                            self.id()
                        );
                        return Err(Error::UnknownProperty {
                            handle: self.handle.into(),
                            name: definition.name,
                        });
                    }
                    *slot = None;
                }
            }
        }
        Ok(())
    }

    /// Access a property by index
    pub fn prop(&self, index: usize) -> Option<Ref<'_, DrmProperty>> {
        Ref::filter_map(self.properties.borrow(), |props| {
            props.get(index).and_then(Option::as_ref)
        })
        .ok()
    }

    /// Whether the property exists on this object
    pub fn has(&self, index: usize) -> bool {
        self.prop(index).is_some()
    }

    /// Run `f` on a property, if it exists
    pub fn with_prop<T>(&self, index: usize, f: impl FnOnce(&mut DrmProperty) -> T) -> Option<T> {
        let mut props = self.properties.borrow_mut();
        props.get_mut(index).and_then(Option::as_mut).map(f)
    }

    /// Current value of a property
    pub fn current(&self, index: usize) -> Option<u64> {
        self.prop(index).map(|prop| prop.current())
    }

    /// Pending value of a property
    pub fn pending(&self, index: usize) -> Option<u64> {
        self.prop(index).map(|prop| prop.pending())
    }

    /// Stage a value. Returns `false` if the property is missing or immutable.
    pub fn set_pending(&self, index: usize, value: u64) -> bool {
        self.with_prop(index, |prop| prop.set_pending(value))
            .unwrap_or(false)
    }

    /// Stage a blob. Returns `Ok(false)` if the property is missing.
    pub fn set_pending_blob(&self, index: usize, data: Option<&[u8]>) -> io::Result<bool> {
        let device = self.device.clone();
        self.with_prop(index, |prop| prop.set_pending_blob(&device, data))
            .transpose()
            .map(|set| set.is_some())
    }

    /// Stage an enum entry by name
    pub fn set_enum(&self, index: usize, name: &str) -> bool {
        self.with_prop(index, |prop| prop.set_enum(name)).unwrap_or(false)
    }

    /// Whether a property's pending value differs from its current one
    pub fn prop_needs_commit(&self, index: usize) -> bool {
        self.prop(index).map(|prop| prop.needs_commit()).unwrap_or(false)
    }

    /// Whether any property has a pending value differing from its current one
    pub fn needs_commit(&self) -> bool {
        self.properties
            .borrow()
            .iter()
            .flatten()
            .any(DrmProperty::needs_commit)
    }

    /// Add the pending value of every mutable property to `request`
    pub fn atomic_populate(&self, request: &mut AtomicRequest) {
        for prop in self.properties.borrow().iter().flatten() {
            if !prop.is_immutable() {
                request.add(self.handle, prop.handle(), prop.pending());
            }
        }
    }

    /// Pending → next on every property
    pub fn commit_pending(&self) {
        for prop in self.properties.borrow_mut().iter_mut().flatten() {
            prop.commit_pending();
        }
    }

    /// Pending → current on every property
    pub fn commit(&self) {
        for prop in self.properties.borrow_mut().iter_mut().flatten() {
            prop.commit();
        }
    }

    /// Next → pending on every property
    pub fn rollback_pending(&self) {
        for prop in self.properties.borrow_mut().iter_mut().flatten() {
            prop.rollback_pending();
        }
    }

    /// One line per property: `name: current/next/pending`
    pub fn describe(&self) -> Vec<String> {
        self.properties
            .borrow()
            .iter()
            .flatten()
            .map(|prop| {
                format!(
                    "{}: {}/{}/{}",
                    prop.name(),
                    prop.current(),
                    prop.next(),
                    prop.pending()
                )
            })
            .collect()
    }

    pub(crate) fn log_properties(&self) {
        for line in self.describe() {
            debug!("\t{}", line);
        }
    }
}

/// A reference to any object bound to a pipeline
#[derive(Debug, Clone)]
pub enum ObjectRef {
    /// A connector
    Connector(Rc<DrmConnector>),
    /// A crtc
    Crtc(Rc<DrmCrtc>),
    /// A plane
    Plane(Rc<DrmPlane>),
}

impl ObjectRef {
    /// The property table of the object
    pub fn object(&self) -> &DrmObject {
        match self {
            ObjectRef::Connector(connector) => connector.object(),
            ObjectRef::Crtc(crtc) => crtc.object(),
            ObjectRef::Plane(plane) => plane.object(),
        }
    }

    /// Whether committing the pending values requires a modeset
    pub fn needs_modeset(&self) -> bool {
        match self {
            ObjectRef::Connector(connector) => connector.needs_modeset(),
            ObjectRef::Crtc(crtc) => crtc.needs_modeset(),
            ObjectRef::Plane(plane) => plane.needs_modeset(),
        }
    }

    /// Short type name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ObjectRef::Connector(_) => "connector",
            ObjectRef::Crtc(_) => "crtc",
            ObjectRef::Plane(_) => "plane",
        }
    }
}
