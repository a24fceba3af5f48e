//! Various utilities functions and types

pub mod clock;
mod fd;
mod geometry;
pub(crate) mod ids;
pub mod signaling;

pub use self::clock::{Clock, Monotonic, PresentationClock, Realtime, Time};
pub use self::fd::{DevPath, DeviceFd};
pub use self::geometry::{Buffer, Coordinate, Physical, Point, Rectangle, Size, Transform};
pub use self::signaling::{SignalToken, Signaler};

/// Route the logs of a test to the test output, filtered by `RUST_LOG`
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // another test may have installed it already
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}
