//! Staged values of kernel object properties
//!
//! Every [`DrmProperty`] keeps three values:
//!
//! - `current`: what the kernel is known to hold,
//! - `next`: the last value a test-only commit accepted,
//! - `pending`: the value the next test or commit is going to submit.
//!
//! Values only move forward through [`DrmProperty::commit_pending`] (pending → next, after a
//! successful test) and [`DrmProperty::commit`] (pending → current, after a successful commit),
//! and backwards through [`DrmProperty::rollback_pending`] (next → pending, after a failed test).

use std::{fmt, io, rc::Rc};

use drm::control::property;
use tracing::{debug, warn};

use super::device::{KmsDevice, PropertyInfo};

/// A property blob held by one or more staging slots
///
/// Blobs created through [`DrmProperty::set_pending_blob`] are destroyed once no slot
/// references them anymore. Blobs read back from the kernel are never destroyed by us.
pub struct PropertyBlob {
    device: Rc<dyn KmsDevice>,
    id: u64,
    data: Vec<u8>,
    owned: bool,
}

impl PropertyBlob {
    /// Kernel id of the blob
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Contents of the blob
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBlob")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if self.owned {
            if let Err(err) = self.device.destroy_blob(self.id) {
                warn!("Failed to destroy property blob {}: {}", self.id, err);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    value: u64,
    blob: Option<Rc<PropertyBlob>>,
}

impl Slot {
    fn scalar(value: u64) -> Slot {
        Slot { value, blob: None }
    }
}

/// One property of a drm object
#[derive(Debug)]
pub struct DrmProperty {
    handle: property::Handle,
    name: String,
    immutable: bool,
    is_blob: bool,
    enums: Vec<(String, u64)>,
    current: Slot,
    next: Slot,
    pending: Slot,
}

impl DrmProperty {
    /// Create the property from a kernel snapshot. All three values start out equal.
    pub fn new(device: &Rc<dyn KmsDevice>, info: PropertyInfo) -> DrmProperty {
        let slot = if info.blob {
            Slot {
                value: info.value,
                blob: read_blob(device, info.value),
            }
        } else {
            Slot::scalar(info.value)
        };
        DrmProperty {
            handle: info.handle,
            name: info.name,
            immutable: info.immutable,
            is_blob: info.blob,
            enums: info.enums,
            current: slot.clone(),
            next: slot.clone(),
            pending: slot,
        }
    }

    /// Kernel handle of the property
    pub fn handle(&self) -> property::Handle {
        self.handle
    }

    /// Name of the property
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the property rejects writes
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Whether the values are blob ids
    pub fn is_blob(&self) -> bool {
        self.is_blob
    }

    /// Value the kernel is known to hold
    pub fn current(&self) -> u64 {
        self.current.value
    }

    /// Value accepted by the last successful test
    pub fn next(&self) -> u64 {
        self.next.value
    }

    /// Value submitted by the next test or commit
    pub fn pending(&self) -> u64 {
        self.pending.value
    }

    /// Contents of the current blob
    pub fn current_blob(&self) -> Option<&[u8]> {
        self.current.blob.as_deref().map(PropertyBlob::data)
    }

    /// Contents of the pending blob
    pub fn pending_blob(&self) -> Option<&[u8]> {
        self.pending.blob.as_deref().map(PropertyBlob::data)
    }

    /// Stage a scalar value. Returns `false` for immutable properties.
    pub fn set_pending(&mut self, value: u64) -> bool {
        if self.immutable {
            debug!("Refusing write of {} to immutable property {}", value, self.name);
            return false;
        }
        if self.pending.value == value {
            return true;
        }
        let blob = [&self.next, &self.current]
            .into_iter()
            .find(|slot| slot.value == value)
            .and_then(|slot| slot.blob.clone());
        self.pending = Slot { value, blob };
        true
    }

    /// Stage a blob, `None` clears the property.
    ///
    /// Content equal to one of the staged blobs reuses that blob instead of creating a new one.
    pub fn set_pending_blob(&mut self, device: &Rc<dyn KmsDevice>, data: Option<&[u8]>) -> io::Result<()> {
        if self.immutable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("property {} is immutable", self.name),
            ));
        }
        let Some(data) = data else {
            self.pending = Slot::scalar(0);
            return Ok(());
        };

        let existing = [&self.pending, &self.next, &self.current]
            .into_iter()
            .find(|slot| slot.blob.as_deref().map(PropertyBlob::data) == Some(data))
            .cloned();
        if let Some(slot) = existing {
            self.pending = slot;
            return Ok(());
        }

        let id = device.create_blob(data)?;
        self.pending = Slot {
            value: id,
            blob: Some(Rc::new(PropertyBlob {
                device: device.clone(),
                id,
                data: data.to_vec(),
                owned: true,
            })),
        };
        Ok(())
    }

    /// Name of the pending enum value
    pub fn pending_enum(&self) -> Option<&str> {
        self.enum_name(self.pending.value)
    }

    /// Name of the current enum value
    pub fn current_enum(&self) -> Option<&str> {
        self.enum_name(self.current.value)
    }

    /// Value of an enum entry
    pub fn enum_value(&self, name: &str) -> Option<u64> {
        self.enums
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, value)| *value)
    }

    /// Names of all enum entries
    pub fn enum_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.enums.iter().map(|(name, _)| name.as_str())
    }

    /// Whether the property knows the enum entry `name`
    pub fn has_enum(&self, name: &str) -> bool {
        self.enum_value(name).is_some()
    }

    /// Stage an enum entry by name. Returns `false` if unknown or immutable.
    pub fn set_enum(&mut self, name: &str) -> bool {
        match self.enum_value(name) {
            Some(value) => self.set_pending(value),
            None => false,
        }
    }

    fn enum_name(&self, value: u64) -> Option<&str> {
        self.enums
            .iter()
            .find(|(_, entry)| *entry == value)
            .map(|(name, _)| name.as_str())
    }

    /// Whether the pending value differs from the current one
    pub fn needs_commit(&self) -> bool {
        self.pending.value != self.current.value
    }

    /// Pending → next, after a successful test
    pub fn commit_pending(&mut self) {
        self.next = self.pending.clone();
    }

    /// Pending → current, after a successful commit
    pub fn commit(&mut self) {
        self.current = self.pending.clone();
    }

    /// Next → pending, after a failed test
    pub fn rollback_pending(&mut self) {
        self.pending = self.next.clone();
    }

    /// Refresh the current value from the kernel, the staged values are kept.
    pub fn update(&mut self, device: &Rc<dyn KmsDevice>, value: u64) {
        if self.current.value == value {
            return;
        }
        let known = [&self.pending, &self.next]
            .into_iter()
            .find(|slot| slot.value == value)
            .cloned();
        self.current = match known {
            Some(slot) => slot,
            None if self.is_blob => Slot {
                value,
                blob: read_blob(device, value),
            },
            None => Slot::scalar(value),
        };
    }
}

fn read_blob(device: &Rc<dyn KmsDevice>, id: u64) -> Option<Rc<PropertyBlob>> {
    if id == 0 {
        return None;
    }
    match device.blob(id) {
        Ok(data) => Some(Rc::new(PropertyBlob {
            device: device.clone(),
            id,
            data,
            owned: false,
        })),
        Err(err) => {
            debug!("Failed to read property blob {}: {}", id, err);
            None
        }
    }
}
