#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # kms-output: the display side of a wayland compositor
//!
//! This crate discovers the gpus of a seat and the monitors attached to them, finds a hardware
//! configuration driving as many monitors as possible and presents rendered frames on them
//! through the kernel mode-setting interface.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the mode-setting core: device objects and their properties,
//!   presentation pipelines, gpus and the outputs built on top of them,
//! - [`backend::session`] and [`backend::udev`] provide device access and hot-plug detection,
//! - [`backend::renderer`] contains render backends feeding frames into the outputs,
//! - [`utils`] holds geometry, clock and signaling helpers.
//!
//! ## The event loop
//!
//! Everything is single-threaded and built around [`calloop`]. A gpu exposes its device node as
//! an event source ([`GpuNotifier`](backend::drm::GpuNotifier)) delivering page flips, which
//! complete the frames of the outputs and let the compositor start the next ones.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. Every gpu logs inside
//! a `backend_drm_gpu` span naming its device node, every pipeline inside a `drm_pipeline`
//! span naming its crtc.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod utils;
