//! Time readings derived from the POSIX `clock_gettime` family.
//!
//! The scheduler and the timer wheel are driven exclusively by the
//! [monotonic](monotonic_ms) clock so that wall-clock adjustments cannot
//! reorder deadlines; the [wall clock](realtime_ms) is only consulted for
//! human-facing output.

use std::mem::MaybeUninit;
use std::time::Duration;

/// A timeout larger than any deadline the runtime will ever arm.
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[inline]
fn clock_gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    // Only fails for an invalid clock id.
    fatal_assert!(rc == 0, "clock_gettime({})", clock);
    unsafe { ts.assume_init() }
}

/// Milliseconds since an unspecified epoch, from `CLOCK_MONOTONIC`.
///
/// Not affected by settimeofday / NTP slewing. This is the time base for
/// every deadline in the runtime.
#[inline]
pub fn monotonic_ms() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Nanoseconds since an unspecified epoch, from `CLOCK_MONOTONIC`.
#[inline]
pub fn monotonic_ns() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Milliseconds since the Unix epoch, from `CLOCK_REALTIME`.
#[inline]
pub fn realtime_ms() -> u64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
