use std::{cmp::Ordering, marker::PhantomData, time::Duration};

use rustix::time::{ClockId, Timespec};

/// Monotonic clock
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> ClockId {
        ClockId::Monotonic
    }
}

/// Realtime clock
#[derive(Debug)]
pub struct Realtime;

impl ClockSource for Realtime {
    fn id() -> ClockId {
        ClockId::Realtime
    }
}

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> ClockId;
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind> {
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Kind> {
        rustix::time::clock_gettime(Kind::id()).into()
    }
}

impl<Kind: ClockSource> Default for Clock<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    tp: Timespec,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Gets the duration between self and a later time
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        let lhs = Duration::from(later);
        let rhs = Duration::from(*self);
        lhs.saturating_sub(rhs)
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind> From<Time<Kind>> for Duration {
    fn from(time: Time<Kind>) -> Self {
        Duration::new(time.tp.tv_sec.max(0) as u64, time.tp.tv_nsec.max(0) as u32)
    }
}

impl<Kind> From<Duration> for Time<Kind> {
    fn from(tp: Duration) -> Self {
        Time {
            tp: Timespec {
                tv_sec: tp.as_secs() as _,
                tv_nsec: tp.subsec_nanos() as _,
            },
            _kind: PhantomData,
        }
    }
}

impl<Kind> From<Timespec> for Time<Kind> {
    fn from(tp: Timespec) -> Self {
        Time { tp, _kind: PhantomData }
    }
}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time")
            .field("tv_sec", &self.tp.tv_sec)
            .field("tv_nsec", &self.tp.tv_nsec)
            .finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.tp.tv_sec == other.tp.tv_sec && self.tp.tv_nsec == other.tp.tv_nsec
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tp
            .tv_sec
            .cmp(&other.tp.tv_sec)
            .then(self.tp.tv_nsec.cmp(&other.tp.tv_nsec))
    }
}

/// Clock a drm device stamps its page-flip events with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationClock {
    /// The device reports `CLOCK_MONOTONIC` timestamps
    Monotonic,
    /// The device reports `CLOCK_REALTIME` timestamps
    Realtime,
}

impl PresentationClock {
    /// Current time of this clock
    pub fn now(&self) -> Duration {
        match self {
            PresentationClock::Monotonic => Clock::<Monotonic>::new().now().into(),
            PresentationClock::Realtime => Clock::<Realtime>::new().now().into(),
        }
    }

    /// Converts a kernel timestamp of this clock into the monotonic clock
    ///
    /// The seconds reported by the kernel are truncated to 32 bits, they are
    /// extended using the current time of this clock as reference.
    pub fn to_monotonic(&self, timestamp: Duration) -> Duration {
        match self {
            PresentationClock::Monotonic => {
                unwrap_kernel_timestamp(timestamp, PresentationClock::Monotonic.now())
            }
            PresentationClock::Realtime => {
                let now = PresentationClock::Realtime.now();
                let monotonic_now = PresentationClock::Monotonic.now();
                shift_timestamp(unwrap_kernel_timestamp(timestamp, now), now, monotonic_now)
            }
        }
    }

    /// Monotonic time of a page flip reported with a timestamp of this clock
    ///
    /// Some drivers report no timestamp at all, those flips are taken to happen now.
    pub fn flip_time(&self, timestamp: Duration) -> Duration {
        let time = self.to_monotonic(timestamp);
        if time.is_zero() {
            PresentationClock::Monotonic.now()
        } else {
            time
        }
    }
}

const WRAP_SECS: u64 = 1 << 32;

/// Restores the upper bits of a timestamp whose seconds were truncated to 32 bits.
///
/// `reference` is a current reading of the same clock, the result is the value
/// closest to it.
pub fn unwrap_kernel_timestamp(raw: Duration, reference: Duration) -> Duration {
    let raw_secs = raw.as_secs() & (WRAP_SECS - 1);
    let reference_secs = reference.as_secs();
    let mut secs = (reference_secs & !(WRAP_SECS - 1)) | raw_secs;

    if secs >= WRAP_SECS && secs > reference_secs.saturating_add(WRAP_SECS / 2) {
        secs -= WRAP_SECS;
    } else if secs.saturating_add(WRAP_SECS / 2) < reference_secs {
        secs += WRAP_SECS;
    }

    Duration::new(secs, raw.subsec_nanos())
}

/// Moves `timestamp` from a clock reading `from_now` into a clock reading `to_now`.
pub fn shift_timestamp(timestamp: Duration, from_now: Duration, to_now: Duration) -> Duration {
    if timestamp <= from_now {
        to_now.saturating_sub(from_now - timestamp)
    } else {
        to_now + (timestamp - from_now)
    }
}
