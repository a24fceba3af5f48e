use std::{
    cell::{Cell, Ref, RefCell},
    rc::Rc,
};

use drm::control::{connector, Mode, ModeFlags, ModeTypeFlags};
use scan_fmt::scan_fmt;
use tracing::{debug, warn};

use super::{DrmObject, PropertyDefinition};
use crate::{
    backend::drm::{
        device::{ConnectorInfo, KmsDevice, ObjectHandle},
        error::{AccessError, Error},
    },
    utils::{Physical, Size},
};

/// Properties of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ConnectorProp {
    /// `CRTC_ID`
    CrtcId,
    /// `non-desktop`
    NonDesktop,
    /// `DPMS`
    Dpms,
    /// `EDID`
    Edid,
    /// `overscan`
    Overscan,
    /// `vrr_capable`
    VrrCapable,
    /// `underscan`
    Underscan,
    /// `underscan vborder`
    UnderscanVBorder,
    /// `underscan hborder`
    UnderscanHBorder,
    /// `TILE`
    Tile,
}

static CONNECTOR_PROPS: [PropertyDefinition; 10] = [
    PropertyDefinition::required("CRTC_ID"),
    PropertyDefinition::optional("non-desktop"),
    PropertyDefinition::optional("DPMS"),
    PropertyDefinition::optional("EDID"),
    PropertyDefinition::optional("overscan"),
    PropertyDefinition::optional("vrr_capable"),
    PropertyDefinition::optional("underscan"),
    PropertyDefinition::optional("underscan vborder"),
    PropertyDefinition::optional("underscan hborder"),
    PropertyDefinition::optional("TILE"),
];

/// `DPMS` value of an enabled connector
pub(crate) const DPMS_ON: u64 = 0;
/// `DPMS` value of a disabled connector
pub(crate) const DPMS_OFF: u64 = 3;

/// A mode supported by a connector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectorMode {
    mode: Mode,
    refresh_rate: u32,
}

impl ConnectorMode {
    /// Wrap a kernel mode
    pub fn new(mode: Mode) -> ConnectorMode {
        ConnectorMode {
            refresh_rate: refresh_rate(&mode),
            mode,
        }
    }

    /// The kernel mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Size in pixels
    pub fn size(&self) -> Size<i32, Physical> {
        let (w, h) = self.mode.size();
        (w as i32, h as i32).into()
    }

    /// Refresh rate in mHz
    pub fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    /// Whether the driver marks this mode as preferred
    pub fn is_preferred(&self) -> bool {
        self.mode.mode_type().contains(ModeTypeFlags::PREFERRED)
    }

    /// The kernel representation, as submitted in a `MODE_ID` blob
    pub fn blob_data(&self) -> Vec<u8> {
        let raw: drm_ffi::drm_mode_modeinfo = self.mode.into();
        // SAFETY: drm_mode_modeinfo is a plain C struct without padding
        unsafe {
            std::slice::from_raw_parts(
                &raw as *const drm_ffi::drm_mode_modeinfo as *const u8,
                std::mem::size_of::<drm_ffi::drm_mode_modeinfo>(),
            )
        }
        .to_vec()
    }
}

/// Refresh rate of a mode in mHz
fn refresh_rate(mode: &Mode) -> u32 {
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return mode.vrefresh() * 1000;
    }

    let mut numerator = mode.clock() as u64 * 1_000_000;
    let mut denominator = htotal * vtotal;
    if mode.flags().contains(ModeFlags::INTERLACE) {
        numerator *= 2;
    }
    if mode.flags().contains(ModeFlags::DBLSCAN) {
        denominator *= 2;
    }
    if mode.vscan() > 1 {
        denominator *= mode.vscan() as u64;
    }
    ((numerator + denominator / 2) / denominator) as u32
}

/// Layout of one tile of a tiled display, as reported by the `TILE` blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileInfo {
    /// Id shared by all tiles of one display
    pub group_id: u32,
    /// Tile flags, bit 0 marks a single monitor enclosure
    pub flags: u32,
    /// Number of tiles horizontally
    pub num_tiles_x: u32,
    /// Number of tiles vertically
    pub num_tiles_y: u32,
    /// Column of this tile
    pub loc_x: u32,
    /// Row of this tile
    pub loc_y: u32,
    /// Width of this tile in pixels
    pub tile_width: u32,
    /// Height of this tile in pixels
    pub tile_height: u32,
}

impl TileInfo {
    /// Parse the `group:flags:tiles_x:tiles_y:loc_x:loc_y:width:height` blob format
    pub fn parse(data: &[u8]) -> Option<TileInfo> {
        let text = std::str::from_utf8(data).ok()?.trim_end_matches('\0').trim();
        let (group_id, flags, num_tiles_x, num_tiles_y, loc_x, loc_y, tile_width, tile_height) = scan_fmt!(
            text,
            "{d}:{d}:{d}:{d}:{d}:{d}:{d}:{d}",
            u32,
            u32,
            u32,
            u32,
            u32,
            u32,
            u32,
            u32
        )
        .ok()?;
        // the kernel reports sizes minus one
        Some(TileInfo {
            group_id,
            flags,
            num_tiles_x,
            num_tiles_y,
            loc_x,
            loc_y,
            tile_width: tile_width + 1,
            tile_height: tile_height + 1,
        })
    }

    /// Number of tiles of the group
    pub fn tile_count(&self) -> u32 {
        self.num_tiles_x * self.num_tiles_y
    }
}

/// A display connector
#[derive(Debug)]
pub struct DrmConnector {
    object: DrmObject,
    handle: connector::Handle,
    info: RefCell<ConnectorInfo>,
    modes: RefCell<Vec<ConnectorMode>>,
    tile: Cell<Option<TileInfo>>,
    possible_crtcs: Cell<u32>,
    mode_index: Cell<usize>,
}

impl DrmConnector {
    /// Query a connector and its properties
    pub fn new(device: Rc<dyn KmsDevice>, handle: connector::Handle, atomic: bool) -> Result<Rc<Self>, Error> {
        let info = query_info(&device, handle)?;
        let object = DrmObject::new(device, ObjectHandle::Connector(handle), atomic, &CONNECTOR_PROPS)?;
        let connector = DrmConnector {
            object,
            handle,
            modes: RefCell::new(info.modes.iter().copied().map(ConnectorMode::new).collect()),
            info: RefCell::new(info),
            tile: Cell::new(None),
            possible_crtcs: Cell::new(0),
            mode_index: Cell::new(0),
        };
        if connector.modes.borrow().is_empty() && connector.is_connected() {
            debug!("Connector {} reports no modes", connector.name());
        }
        connector.mode_index.set(connector.preferred_mode_index());
        connector.update_possible_crtcs();
        connector.update_tile();
        Ok(Rc::new(connector))
    }

    /// The property table
    pub fn object(&self) -> &DrmObject {
        &self.object
    }

    /// Kernel handle
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// Numeric id
    pub fn id(&self) -> u32 {
        self.object.id()
    }

    /// Re-query connection state, modes and properties
    pub fn refresh(&self) -> Result<(), Error> {
        let info = query_info(self.object.device(), self.handle)?;
        *self.modes.borrow_mut() = info.modes.iter().copied().map(ConnectorMode::new).collect();
        *self.info.borrow_mut() = info;
        if self.mode_index.get() >= self.modes.borrow().len() {
            self.mode_index.set(self.preferred_mode_index());
        }
        self.object.update_properties()?;
        self.update_possible_crtcs();
        self.update_tile();
        Ok(())
    }

    fn update_possible_crtcs(&self) {
        let device = self.object.device();
        let mask = self
            .info
            .borrow()
            .encoders
            .iter()
            .filter_map(|encoder| match device.encoder_info(*encoder) {
                Ok(info) => Some(info.possible_crtcs),
                Err(err) => {
                    debug!("Failed to query encoder {:?}: {}", encoder, err);
                    None
                }
            })
            .fold(0, |mask, crtcs| mask | crtcs);
        self.possible_crtcs.set(mask);
    }

    fn update_tile(&self) {
        let tile = self
            .object
            .prop(ConnectorProp::Tile as usize)
            .and_then(|prop| prop.current_blob().and_then(TileInfo::parse));
        self.tile.set(tile);
    }

    /// Human readable name, like `DP-1`
    pub fn name(&self) -> String {
        let info = self.info.borrow();
        format!("{}-{}", interface_name(info.interface), info.interface_id)
    }

    /// Whether a monitor is plugged in
    pub fn is_connected(&self) -> bool {
        self.info.borrow().state == connector::State::Connected
    }

    /// Whether the monitor must not be used as a desktop output (e.g. VR headsets)
    pub fn is_non_desktop(&self) -> bool {
        self.object.current(ConnectorProp::NonDesktop as usize) == Some(1)
    }

    /// Physical size in millimeters
    pub fn physical_size(&self) -> Option<(u32, u32)> {
        self.info.borrow().size
    }

    /// Raw EDID blob, if provided
    pub fn edid(&self) -> Option<Vec<u8>> {
        self.object
            .prop(ConnectorProp::Edid as usize)
            .and_then(|prop| prop.current_blob().map(<[u8]>::to_vec))
    }

    /// Supported modes
    pub fn modes(&self) -> Ref<'_, [ConnectorMode]> {
        Ref::map(self.modes.borrow(), Vec::as_slice)
    }

    /// Index of `mode` in [`DrmConnector::modes`]
    pub fn find_mode(&self, mode: &Mode) -> Option<usize> {
        self.modes.borrow().iter().position(|m| m.mode() == *mode)
    }

    /// Index of the preferred mode, or the first one
    pub fn preferred_mode_index(&self) -> usize {
        self.modes
            .borrow()
            .iter()
            .position(ConnectorMode::is_preferred)
            .unwrap_or(0)
    }

    /// Index of the selected mode
    pub fn mode_index(&self) -> usize {
        self.mode_index.get()
    }

    /// Select a mode. Fails for indices out of range.
    pub fn set_mode_index(&self, index: usize) -> Result<(), Error> {
        if index >= self.modes.borrow().len() {
            return Err(Error::NoSuchMode(index));
        }
        self.mode_index.set(index);
        Ok(())
    }

    /// The selected mode
    pub fn current_mode(&self) -> Option<ConnectorMode> {
        self.modes.borrow().get(self.mode_index.get()).copied()
    }

    /// Select the mode programmed on the crtc, or the preferred one if it is not in the list
    pub fn find_current_mode(&self, crtc_mode: Option<Mode>) {
        let index = crtc_mode
            .and_then(|mode| self.find_mode(&mode))
            .unwrap_or_else(|| self.preferred_mode_index());
        self.mode_index.set(index);
    }

    /// Size of mode `index`, spanning all tiles of a tiled display
    pub fn total_mode_size(&self, index: usize) -> Size<i32, Physical> {
        let size = self
            .modes
            .borrow()
            .get(index)
            .map(ConnectorMode::size)
            .unwrap_or_default();
        match self.tile.get() {
            Some(tile) => (size.w * tile.num_tiles_x as i32, size.h * tile.num_tiles_y as i32).into(),
            None => size,
        }
    }

    /// Offset of this connector's tile inside the whole display
    pub fn tile_pos(&self) -> (u32, u32) {
        match (self.tile.get(), self.current_mode()) {
            (Some(tile), Some(mode)) => {
                let size = mode.size();
                (tile.loc_x * size.w as u32, tile.loc_y * size.h as u32)
            }
            _ => (0, 0),
        }
    }

    /// Bitmask of compatible crtc pipe indices
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs.get()
    }

    /// Whether the crtc with `pipe_index` can drive this connector
    pub fn is_crtc_supported(&self, pipe_index: usize) -> bool {
        pipe_index < 32 && self.possible_crtcs.get() & (1 << pipe_index) != 0
    }

    /// Tile layout, if this connector is part of a tiled display
    pub fn tile(&self) -> Option<TileInfo> {
        self.tile.get()
    }

    /// Whether the monitor supports variable refresh rates
    pub fn vrr_capable(&self) -> bool {
        self.object.current(ConnectorProp::VrrCapable as usize) == Some(1)
    }

    /// Whether overscan can be configured
    pub fn has_overscan(&self) -> bool {
        self.object.has(ConnectorProp::Overscan as usize)
            || self.object.has(ConnectorProp::Underscan as usize)
    }

    /// Pending overscan in percent, 0 if not configurable
    pub fn overscan(&self) -> u32 {
        if let Some(value) = self.object.pending(ConnectorProp::Overscan as usize) {
            value as u32
        } else {
            self.object
                .pending(ConnectorProp::UnderscanVBorder as usize)
                .unwrap_or(0) as u32
        }
    }

    /// Stage an overscan value through `overscan` or the `underscan` properties
    pub fn set_overscan(&self, overscan: u32, mode_size: Size<i32, Physical>) -> bool {
        if self.object.has(ConnectorProp::Overscan as usize) {
            return self
                .object
                .set_pending(ConnectorProp::Overscan as usize, overscan as u64);
        }
        if !self.object.has(ConnectorProp::Underscan as usize) {
            return false;
        }
        let aspect_ratio = mode_size.w as f64 / mode_size.h.max(1) as f64;
        let hborder = (overscan as f64 * aspect_ratio) as u64;
        let state = if overscan > 0 { "on" } else { "off" };
        if !self.object.set_enum(ConnectorProp::Underscan as usize, state) {
            warn!("Connector {} has no underscan value {}", self.name(), state);
            return false;
        }
        self.object
            .set_pending(ConnectorProp::UnderscanVBorder as usize, overscan as u64);
        self.object
            .set_pending(ConnectorProp::UnderscanHBorder as usize, hborder);
        true
    }

    /// Committing the pending values requires a modeset
    pub fn needs_modeset(&self) -> bool {
        self.object.prop_needs_commit(ConnectorProp::CrtcId as usize)
    }
}

fn query_info(device: &Rc<dyn KmsDevice>, handle: connector::Handle) -> Result<ConnectorInfo, Error> {
    device.connector_info(handle).map_err(|source| {
        Error::Access(AccessError {
            errmsg: "Failed to query connector",
            dev: device.dev_path(),
            source,
        })
    })
}

fn interface_name(interface: connector::Interface) -> &'static str {
    use connector::Interface;
    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::LVDS => "LVDS",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{ConnectorMode, ConnectorProp, DrmConnector, TileInfo};
    use crate::backend::drm::device::{
        dummy::{test_mode, DummyDevice},
        KmsDevice,
    };

    #[test]
    fn parse_tile_blob() {
        let tile = TileInfo::parse(b"3:1:2:1:1:0:1919:2159\0").unwrap();
        assert_eq!(
            tile,
            TileInfo {
                group_id: 3,
                flags: 1,
                num_tiles_x: 2,
                num_tiles_y: 1,
                loc_x: 1,
                loc_y: 0,
                tile_width: 1920,
                tile_height: 2160,
            }
        );
        assert_eq!(tile.tile_count(), 2);
        assert!(TileInfo::parse(b"garbage").is_none());
    }

    #[test]
    fn refresh_rate_in_millihertz() {
        let mode = ConnectorMode::new(test_mode(1920, 1080, 60, true));
        // 2080 * 1120 * 60 / 1000 kHz pixel clock
        assert!((59_000..=61_000).contains(&mode.refresh_rate()));
        assert!(mode.is_preferred());
        assert_eq!(mode.size(), (1920, 1080).into());
    }

    #[test]
    fn connector_queries() {
        let dummy = Rc::new(DummyDevice::new());
        let handle = dummy.add_connector(
            vec![test_mode(1280, 720, 60, false), test_mode(1920, 1080, 60, true)],
            0b10,
        );
        let device: Rc<dyn KmsDevice> = dummy.clone();
        let connector = DrmConnector::new(device, handle, true).unwrap();

        assert!(connector.is_connected());
        assert!(!connector.is_non_desktop());
        assert_eq!(connector.preferred_mode_index(), 1);
        assert!(connector.is_crtc_supported(1));
        assert!(!connector.is_crtc_supported(0));
        assert_eq!(connector.name(), "DP-1");
        assert!(!connector.has_overscan());

        assert_eq!(connector.mode_index(), 1);
        connector.find_current_mode(Some(test_mode(1280, 720, 60, false)));
        assert_eq!(connector.mode_index(), 0);
        connector.find_current_mode(None);
        assert_eq!(connector.mode_index(), 1);
        assert!(connector.set_mode_index(2).is_err());

        dummy.set_connection(handle, false);
        connector.refresh().unwrap();
        assert!(!connector.is_connected());
    }

    #[test]
    fn underscan_fallback() {
        let dummy = Rc::new(DummyDevice::new());
        let handle = dummy.add_connector(vec![test_mode(1600, 900, 60, true)], 1);
        let id = u32::from(handle);
        dummy.add_object_enum_property(id, "underscan", 0, &[("off", 0), ("on", 1), ("auto", 2)]);
        dummy.add_object_property(id, "underscan vborder", 0, false, false);
        dummy.add_object_property(id, "underscan hborder", 0, false, false);
        let device: Rc<dyn KmsDevice> = dummy;
        let connector = DrmConnector::new(device, handle, true).unwrap();

        assert!(connector.has_overscan());
        assert!(connector.set_overscan(18, (1600, 900).into()));
        assert_eq!(connector.object().pending(ConnectorProp::Underscan as usize), Some(1));
        assert_eq!(
            connector
                .object()
                .pending(ConnectorProp::UnderscanHBorder as usize),
            Some(32)
        );
        assert_eq!(connector.overscan(), 18);
    }
}
