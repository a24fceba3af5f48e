//! Backend (session/display/rendering) helpers
//!
//! Collection of the building blocks needed to show frames on monitors attached to the
//! gpus of a seat:
//!
//! - [`session`] opens device nodes and follows vt switches,
//! - [`udev`] discovers gpus and reports hot-plugs,
//! - [`drm`] discovers displays and configures and drives them,
//! - [`renderer`] renders the frames handed to the displays.

pub mod drm;
pub mod renderer;
pub mod session;

#[cfg(feature = "backend_udev")]
pub mod udev;
