//! Gpu management
//!
//! A [`DrmGpu`] owns every connector, crtc and plane of one device node together with the
//! outputs built from them. [`DrmGpu::update_outputs`] compares the objects of the device
//! with the known ones after hot-plugs and searches for a working configuration of the
//! connectors that are not driven yet.
//!
//! The search hands candidate assignments from [`Combinations`] to
//! [`DrmPipeline::test_pipelines`], the first candidate the driver accepts wins. If that does
//! not cover every new connector, the search is repeated over all objects of the device with
//! the existing outputs temporarily disabled.
//!
//! Changes of the output set are published through the gpu's [`Signaler`]:
//!
//! ```no_run
//! # use kms_output::backend::drm::{DrmGpu, GpuEvent};
//! # fn register(gpu: &DrmGpu) {
//! let _token = gpu.signaler().register(|event| match event {
//!     GpuEvent::OutputAdded(output) => println!("new output {}", output.name()),
//!     GpuEvent::OutputRemoved(output) => println!("output {} is gone", output.name()),
//!     _ => {}
//! });
//! # }
//! ```

use std::{cell::Cell, fmt, io, path::PathBuf, rc::Rc, time::Duration};

use tracing::{debug, info, info_span, instrument, trace, warn};

use super::{
    config::DrmConfig,
    device::{KmsDevice, PageFlipEvent},
    error::{AccessError, Error},
    object::{DrmConnector, DrmCrtc, DrmPlane},
    output::DrmOutput,
    pipeline::{DrmPipeline, GpuContext},
};
use crate::utils::{PresentationClock, Signaler};

mod notifier;
mod search;

pub use self::notifier::{DrmEvent, EventMetadata, GpuNotifier};
pub use self::search::{Assignment, Combinations};

crate::utils::ids::id_gen!(gpu_id);

/// Unique identifier of a gpu
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuId(usize);

impl GpuId {
    pub(crate) fn next() -> GpuId {
        GpuId(gpu_id::next())
    }

    pub(crate) fn release(self) {
        gpu_id::remove(self.0);
    }
}

/// Changes of the outputs of a gpu
#[derive(Debug, Clone)]
pub enum GpuEvent {
    /// An output passed its test and is driven now
    OutputAdded(Rc<DrmOutput>),
    /// An output was removed, its monitor got unplugged
    OutputRemoved(Rc<DrmOutput>),
    /// An output is about to be tested, render resources for it are needed
    OutputEnabled(Rc<DrmOutput>),
    /// An output will not be driven anymore, its render resources can be dropped
    OutputDisabled(Rc<DrmOutput>),
}

/// How long [`DrmGpu::wait_idle`] waits for a single event
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// All display objects of one device node
pub struct DrmGpu {
    context: Rc<GpuContext>,
    path: Option<PathBuf>,
    connectors: Vec<Rc<DrmConnector>>,
    crtcs: Vec<Rc<DrmCrtc>>,
    planes: Vec<Rc<DrmPlane>>,
    unused_connectors: Vec<Rc<DrmConnector>>,
    unused_crtcs: Vec<Rc<DrmCrtc>>,
    unused_planes: Vec<Rc<DrmPlane>>,
    outputs: Vec<Rc<DrmOutput>>,
    signaler: Signaler<GpuEvent>,
    software_cursor_forced: Cell<bool>,
    span: tracing::Span,
}

impl fmt::Debug for DrmGpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmGpu")
            .field("path", &self.path)
            .field("context", &self.context)
            .field("connectors", &self.connectors.len())
            .field("crtcs", &self.crtcs.len())
            .field("planes", &self.planes.len())
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl DrmGpu {
    /// Take over a device node
    ///
    /// Enables atomic mode-setting unless the driver lacks it or `config` forbids it. A device
    /// without crtcs is rejected, it can not drive any display.
    pub fn new(device: Rc<dyn KmsDevice>, config: DrmConfig) -> Result<DrmGpu, Error> {
        let path = device.dev_path();
        let span = info_span!("backend_drm_gpu", device = ?path);
        let _guard = span.enter();

        let resources = device.resources().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: path.clone(),
                source,
            })
        })?;
        if resources.crtcs.is_empty() {
            return Err(Error::Discovery("Device has no crtcs"));
        }

        let driver = device.driver_name().unwrap_or_else(|err| {
            warn!("Failed to query the driver name: {}", err);
            String::new()
        });
        let streams = driver == "nvidia-drm";

        let mut planes = Vec::new();
        let atomic = if config.force_legacy {
            info!("Atomic mode-setting disabled by configuration");
            false
        } else if device.enable_atomic() {
            if !device.enable_universal_planes() {
                warn!("Failed to enable universal planes");
            }
            match device.planes() {
                Ok(handles) => {
                    for handle in handles {
                        match DrmPlane::new(device.clone(), handle) {
                            Ok(plane) => planes.push(plane),
                            Err(err) => warn!("Ignoring plane {:?}: {}", handle, err),
                        }
                    }
                }
                Err(err) => warn!("Failed to list planes: {}", err),
            }
            if planes.is_empty() {
                warn!("Failed to create any plane. Falling back to legacy mode");
            }
            !planes.is_empty()
        } else {
            info!("Atomic mode-setting unsupported by the driver");
            false
        };
        if !atomic {
            planes.clear();
        }
        info!(driver = %driver, atomic, streams, "Initialized gpu");

        drop(_guard);
        let context = Rc::new(GpuContext::new(device, atomic, streams, config, span.clone()));
        Ok(DrmGpu {
            context,
            path,
            connectors: Vec::new(),
            crtcs: Vec::new(),
            unused_planes: planes.clone(),
            planes,
            unused_connectors: Vec::new(),
            unused_crtcs: Vec::new(),
            outputs: Vec::new(),
            signaler: Signaler::new(),
            software_cursor_forced: Cell::new(false),
            span,
        })
    }

    /// State shared with pipelines and outputs
    pub fn context(&self) -> &Rc<GpuContext> {
        &self.context
    }

    /// The kernel device
    pub fn device(&self) -> &Rc<dyn KmsDevice> {
        self.context.device()
    }

    /// Path of the device node
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Whether atomic mode-setting is used
    pub fn is_atomic(&self) -> bool {
        self.context.is_atomic()
    }

    /// Whether the driver presents through EGLStreams
    pub fn uses_streams(&self) -> bool {
        self.context.uses_streams()
    }

    /// Largest supported hardware cursor
    pub fn cursor_size(&self) -> (u32, u32) {
        self.context.cursor_size()
    }

    /// Clock of the page flip timestamps
    pub fn presentation_clock(&self) -> PresentationClock {
        self.context.presentation_clock()
    }

    /// Whether creating a hardware cursor failed for one of the outputs
    pub fn is_software_cursor_forced(&self) -> bool {
        self.software_cursor_forced.get()
    }

    /// Output changes of this gpu
    pub fn signaler(&self) -> &Signaler<GpuEvent> {
        &self.signaler
    }

    /// Outputs driven by this gpu
    pub fn outputs(&self) -> &[Rc<DrmOutput>] {
        &self.outputs
    }

    /// Connected desktop connectors
    pub fn connectors(&self) -> &[Rc<DrmConnector>] {
        &self.connectors
    }

    /// All crtcs
    pub fn crtcs(&self) -> &[Rc<DrmCrtc>] {
        &self.crtcs
    }

    /// All planes, empty for legacy devices
    pub fn planes(&self) -> &[Rc<DrmPlane>] {
        &self.planes
    }

    /// Connectors without an output
    pub fn unused_connectors(&self) -> &[Rc<DrmConnector>] {
        &self.unused_connectors
    }

    /// Crtcs without an output
    pub fn unused_crtcs(&self) -> &[Rc<DrmCrtc>] {
        &self.unused_crtcs
    }

    /// Planes without an output
    pub fn unused_planes(&self) -> &[Rc<DrmPlane>] {
        &self.unused_planes
    }

    /// An event source delivering the page flips of this gpu
    pub fn notifier(&self) -> GpuNotifier {
        GpuNotifier::new(self.context.clone(), self.span.clone())
    }

    /// Compare the objects of the device with the known ones and configure new connectors
    ///
    /// Outputs depending on vanished objects are removed. An error is only returned if the
    /// device could not be queried at all.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn update_outputs(&mut self) -> Result<(), Error> {
        let device = self.context.device().clone();
        let atomic = self.context.is_atomic();
        let resources = device.resources().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: self.path.clone(),
                source,
            })
        })?;

        let mut removed_crtcs = Vec::new();
        self.crtcs.retain(|crtc| {
            let present = resources.crtcs.contains(&crtc.handle());
            if !present {
                removed_crtcs.push(crtc.clone());
            }
            present
        });
        for (pipe_index, handle) in resources.crtcs.iter().enumerate() {
            if self.crtcs.iter().any(|crtc| crtc.handle() == *handle) {
                continue;
            }
            match DrmCrtc::new(device.clone(), *handle, pipe_index, atomic) {
                Ok(crtc) => self.crtcs.push(crtc),
                Err(err) => warn!("Ignoring crtc {:?}: {}", handle, err),
            }
        }

        let mut removed_connectors = Vec::new();
        self.connectors.retain(|connector| {
            let present = resources.connectors.contains(&connector.handle())
                && match connector.refresh() {
                    Ok(()) => connector.is_connected(),
                    Err(err) => {
                        warn!("Failed to refresh connector {}: {}", connector.id(), err);
                        false
                    }
                };
            if !present {
                debug!("Connector {} is gone", connector.name());
                removed_connectors.push(connector.clone());
            }
            present
        });
        for handle in &resources.connectors {
            if self.connectors.iter().any(|connector| connector.handle() == *handle) {
                continue;
            }
            let connector = match DrmConnector::new(device.clone(), *handle, atomic) {
                Ok(connector) => connector,
                Err(err) => {
                    warn!("Ignoring connector {:?}: {}", handle, err);
                    continue;
                }
            };
            if connector.is_non_desktop() {
                debug!("Skipping non-desktop connector {}", connector.name());
                continue;
            }
            if !connector.is_connected() {
                continue;
            }
            self.connectors.push(connector);
        }

        let stale: Vec<Rc<DrmOutput>> = self
            .outputs
            .iter()
            .filter(|output| {
                let pipeline = output.pipeline();
                pipeline
                    .connectors()
                    .iter()
                    .any(|connector| removed_connectors.iter().any(|removed| Rc::ptr_eq(connector, removed)))
                    || pipeline
                        .crtcs()
                        .iter()
                        .any(|crtc| removed_crtcs.iter().any(|removed| Rc::ptr_eq(crtc, removed)))
            })
            .cloned()
            .collect();
        for output in stale {
            self.remove_output(&output);
        }
        self.rebuild_pools();

        if !self.unused_connectors.is_empty() {
            // plane properties may have changed since the last search
            for plane in &self.planes {
                if let Err(err) = plane.object().update_properties() {
                    warn!("Failed to update properties of plane {}: {}", plane.id(), err);
                }
            }

            let unused_connectors = self.unused_connectors.clone();
            let mut config = self
                .find_working_combination(&[], &unused_connectors, &self.unused_crtcs, &self.unused_planes)
                .unwrap_or_default();

            if config.len() < unused_connectors.len() && self.unused_crtcs.len() >= unused_connectors.len() {
                for output in config.drain(..) {
                    self.context.unregister_pipeline(&output.pipeline());
                    self.signaler.signal(GpuEvent::OutputDisabled(output));
                }
                config = self.reconfigure_all();
            }

            for output in config {
                if !self.context.config().force_software_cursor && !output.init_cursor(self.cursor_size()) {
                    self.software_cursor_forced.set(true);
                }
                self.context.register_pipeline(&output.pipeline());
                self.outputs.push(output.clone());
                info!("Added output {}", output.name());
                self.signaler.signal(GpuEvent::OutputAdded(output));
            }
            self.rebuild_pools();
        }
        debug_assert!(self.resources_consistent());
        Ok(())
    }

    // search again with the objects of the existing outputs, returns the new outputs
    fn reconfigure_all(&mut self) -> Vec<Rc<DrmOutput>> {
        debug!("Searching a configuration over all objects of the device");
        let existing = self.outputs.clone();
        let enabled: Vec<bool> = existing.iter().map(|output| output.is_enabled()).collect();
        // the old configuration must not interfere with the tests
        for (output, _) in existing.iter().zip(&enabled).filter(|(_, enabled)| **enabled) {
            output.pipeline().set_active(false);
        }

        let originals: Vec<Rc<DrmPipeline>> = existing.iter().map(|output| output.pipeline()).collect();
        match self.find_working_combination(&existing, &self.connectors, &self.crtcs, &self.planes) {
            Some(config) => {
                // fresh pipelines start active, outputs that were off stay off
                for ((output, original), enabled) in existing.iter().zip(&originals).zip(&enabled) {
                    if !*enabled && !Rc::ptr_eq(&output.pipeline(), original) && !output.set_enabled(false) {
                        warn!("Failed to keep output {} disabled", output.name());
                    }
                }
                // outputs the winner did not move onto a new pipeline lost their monitor
                let uncovered: Vec<_> = existing
                    .iter()
                    .zip(&originals)
                    .filter(|(output, original)| Rc::ptr_eq(&output.pipeline(), original))
                    .map(|(output, _)| output.clone())
                    .collect();
                for output in uncovered {
                    self.remove_output(&output);
                }
                config
            }
            None => {
                warn!("No working configuration found, restoring the previous one");
                for (output, _) in existing.iter().zip(&enabled).filter(|(_, enabled)| **enabled) {
                    output.pipeline().set_active(true);
                }
                Vec::new()
            }
        }
    }

    /// Test candidate assignments until the driver accepts one
    ///
    /// Existing `outputs` whose connector is part of a candidate are moved onto the new
    /// pipeline, new connectors get new outputs. Returns the new outputs of the winning
    /// candidate, or `None` if no candidate passed.
    #[profiling::function]
    pub fn find_working_combination(
        &self,
        outputs: &[Rc<DrmOutput>],
        connectors: &[Rc<DrmConnector>],
        crtcs: &[Rc<DrmCrtc>],
        planes: &[Rc<DrmPlane>],
    ) -> Option<Vec<Rc<DrmOutput>>> {
        for candidate in Combinations::new(connectors, crtcs, planes, self.context.is_atomic()) {
            let mut pipelines = Vec::with_capacity(candidate.len());
            let mut created = Vec::new();
            let mut moved = Vec::new();

            for assignment in candidate {
                let pipeline = Rc::new(DrmPipeline::new(
                    self.context.clone(),
                    assignment.connector.clone(),
                    assignment.crtc,
                    assignment.plane,
                ));
                match outputs
                    .iter()
                    .find(|output| Rc::ptr_eq(output.pipeline().connector(), &assignment.connector))
                {
                    Some(output) => {
                        let original = output.set_pipeline(pipeline.clone());
                        moved.push((output.clone(), original));
                    }
                    None => {
                        let output = DrmOutput::new(self.context.clone(), pipeline.clone());
                        // render resources for the test frame
                        self.signaler.signal(GpuEvent::OutputEnabled(output.clone()));
                        created.push(output);
                    }
                }
                pipeline.setup();
                pipelines.push(pipeline);
            }

            let batch: Vec<&DrmPipeline> = pipelines.iter().map(|pipeline| &**pipeline).collect();
            if DrmPipeline::test_pipelines(&batch) {
                for pipeline in &pipelines {
                    pipeline.accept_test();
                }
                for (output, original) in moved {
                    self.context.unregister_pipeline(&original);
                    self.context.register_pipeline(&output.pipeline());
                }
                debug!("Found a working configuration with {} output(s)", pipelines.len());
                return Some(created);
            }

            trace!("Candidate with {} pipeline(s) failed", pipelines.len());
            for pipeline in &pipelines {
                pipeline.reject_test();
            }
            for output in created {
                self.signaler.signal(GpuEvent::OutputDisabled(output));
            }
            for (output, original) in moved {
                output.set_pipeline(original);
            }
        }
        None
    }

    /// Remove an output and return its objects to the unused pools
    pub fn remove_output(&mut self, output: &Rc<DrmOutput>) {
        let Some(index) = self.outputs.iter().position(|o| Rc::ptr_eq(o, output)) else {
            return;
        };
        let output = self.outputs.remove(index);
        info!("Removing output {}", output.name());
        self.signaler.signal(GpuEvent::OutputDisabled(output.clone()));
        self.signaler.signal(GpuEvent::OutputRemoved(output.clone()));
        self.context.unregister_pipeline(&output.pipeline());
        self.rebuild_pools();
    }

    fn rebuild_pools(&mut self) {
        let pipelines: Vec<Rc<DrmPipeline>> = self.outputs.iter().map(|output| output.pipeline()).collect();
        self.unused_connectors = self
            .connectors
            .iter()
            .filter(|connector| {
                !pipelines
                    .iter()
                    .any(|p| p.connectors().iter().any(|c| Rc::ptr_eq(c, connector)))
            })
            .cloned()
            .collect();
        self.unused_crtcs = self
            .crtcs
            .iter()
            .filter(|crtc| !pipelines.iter().any(|p| p.crtcs().iter().any(|c| Rc::ptr_eq(c, crtc))))
            .cloned()
            .collect();
        self.unused_planes = self
            .planes
            .iter()
            .filter(|plane| {
                !pipelines
                    .iter()
                    .any(|p| p.primary_planes().iter().any(|pl| Rc::ptr_eq(pl, plane)))
            })
            .cloned()
            .collect();
    }

    /// Whether the unused pools and the objects held by outputs partition all objects
    pub fn resources_consistent(&self) -> bool {
        fn partitions<T>(all: &[Rc<T>], unused: &[Rc<T>], held: Vec<Rc<T>>) -> bool {
            held.len() + unused.len() == all.len()
                && all.iter().all(|object| {
                    let in_unused = unused.iter().filter(|o| Rc::ptr_eq(o, object)).count();
                    let in_held = held.iter().filter(|o| Rc::ptr_eq(o, object)).count();
                    in_unused + in_held == 1
                })
        }

        let pipelines: Vec<Rc<DrmPipeline>> = self.outputs.iter().map(|output| output.pipeline()).collect();
        partitions(
            &self.connectors,
            &self.unused_connectors,
            pipelines.iter().flat_map(|p| p.connectors().iter().cloned()).collect(),
        ) && partitions(
            &self.crtcs,
            &self.unused_crtcs,
            pipelines.iter().flat_map(|p| p.crtcs().iter().cloned()).collect(),
        ) && partitions(
            &self.planes,
            &self.unused_planes,
            pipelines.iter().flat_map(|p| p.primary_planes().iter().cloned()).collect(),
        )
    }

    /// Block until no output waits for a page flip
    ///
    /// Gives up if the device stays silent for 30 seconds.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn wait_idle(&self) {
        while self.outputs.iter().any(|output| output.is_page_flip_pending()) {
            match self.context.device().wait_for_events(IDLE_TIMEOUT) {
                Ok(true) => self.dispatch_events(),
                Ok(false) => {
                    warn!(
                        "No drm events for gpu {:?} within last {} seconds",
                        self.path,
                        IDLE_TIMEOUT.as_secs()
                    );
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("Polling the device failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Read the pending events of the device and deliver them to the outputs
    pub fn dispatch_events(&self) {
        match self.context.device().receive_events() {
            Ok(events) => {
                for event in events {
                    self.page_flipped(event);
                }
            }
            Err(err) => warn!("Failed to read drm events: {}", err),
        }
    }

    /// Deliver a page flip to the output that waits for it
    ///
    /// Returns the output, or `None` if no output waits for a flip on that crtc anymore.
    #[profiling::function]
    pub fn page_flipped(&self, event: PageFlipEvent) -> Option<Rc<DrmOutput>> {
        let Some(output) = self
            .outputs
            .iter()
            .find(|output| {
                output.is_page_flip_pending()
                    && output
                        .pipeline()
                        .crtcs()
                        .iter()
                        .any(|crtc| crtc.handle() == event.crtc)
            })
            .cloned()
        else {
            trace!("Ignoring page flip on crtc {:?} without a waiting output", event.crtc);
            return None;
        };

        output.page_flipped(self.presentation_clock().flip_time(event.duration));
        Some(output)
    }
}

impl Drop for DrmGpu {
    fn drop(&mut self) {
        self.wait_idle();
        for output in self.outputs.clone() {
            self.remove_output(&output);
        }
    }
}
