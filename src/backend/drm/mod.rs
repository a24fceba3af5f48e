//! Drm/Kms output backend
//!
//! This module drives the displays attached to drm devices. It is organized bottom-up:
//!
//! - [`device`] abstracts the kernel mode-setting interface behind [`KmsDevice`],
//! - [`property`] and [`object`] track the properties of connectors, crtcs and planes, staging
//!   new values until a test-only commit accepted them and a real commit applied them,
//! - [`pipeline`] binds a crtc to its connectors and planes and runs the test and commit
//!   protocol for them,
//! - [`gpu`] owns all objects of a device node and searches for a working assignment of
//!   connectors to crtcs and planes,
//! - [`output`] is what a compositor renders to,
//! - [`backend`] keeps the gpus of a session.
//!
//! ## How to use it
//!
//! Open a gpu through a [`DrmBackend`], render into the outputs it reports and deliver the
//! page flip events of the device:
//!
//! ```no_run
//! use kms_output::backend::{
//!     drm::{DrmBackend, DrmConfig},
//!     session::DirectSession,
//! };
//!
//! let session = DirectSession::new(None).expect("no session");
//! let mut backend = DrmBackend::new(session, DrmConfig::from_env());
//! let gpu = backend
//!     .add_gpu(std::path::Path::new("/dev/dri/card0"))
//!     .expect("failed to open the gpu");
//! for output in backend.gpu(gpu).unwrap().outputs() {
//!     println!("{}: {:?}", output.name(), output.current_mode());
//! }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod gpu;
pub mod object;
pub mod output;
pub mod pipeline;
pub mod property;

pub use self::backend::{BackendEvent, DrmBackend};
pub use self::buffer::{BufferArena, BufferId, BufferUse, DrmBuffer, DumbBuffer, ScanoutSlots};
pub use self::config::DrmConfig;
pub use self::device::{DrmDevice, DrmDeviceFd, KmsDevice};
pub use self::error::{AccessError, Error};
pub use self::gpu::{Combinations, DrmEvent, DrmGpu, EventMetadata, GpuEvent, GpuId, GpuNotifier};
pub use self::object::{DrmConnector, DrmCrtc, DrmObject, DrmPlane, ObjectRef, Transformations};
pub use self::output::{DrmOutput, FrameEvent, OutputId, RenderLoop};
pub use self::pipeline::{DrmPipeline, GammaRamp, GpuContext, PipelineMode, SyncMode, TestFrameSource};
pub use self::property::{DrmProperty, PropertyBlob};
