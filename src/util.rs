//! Small helpers shared across the runtime: thread / fiber identification,
//! backtrace capture and the fatal assertion macro used for programming
//! errors.

use std::backtrace::Backtrace;
use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<libc::pid_t> = Cell::new(0);
}

/// Kernel thread id of the calling thread (`gettid`), cached per thread.
#[inline]
pub fn thread_id() -> libc::pid_t {
    CACHED_TID.with(|tid| {
        let mut id = tid.get();
        if id == 0 {
            id = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            tid.set(id);
        }
        id
    })
}

/// Id of the fiber running on this thread, 0 when called outside any fiber.
#[inline]
pub fn fiber_id() -> u64 {
    crate::fiber::current_id()
}

/// Captured backtrace rendered to a string, for fault and assertion logs.
pub fn backtrace_string() -> String {
    Backtrace::force_capture().to_string()
}

/// Asserts an internal invariant.
///
/// Violations are programming errors, not recoverable conditions: the macro
/// logs the condition, the formatted context and a backtrace to the
/// `"system"` logger, then panics.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr) => {
        $crate::fatal_assert!($cond, "")
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            ::log::error!(
                target: "system",
                "assertion failed: {} {}\nbacktrace:\n{}",
                ::std::stringify!($cond),
                ::std::format_args!($($arg)*),
                $crate::util::backtrace_string(),
            );
            panic!("assertion failed: {}", ::std::stringify!($cond));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        assert_eq!(thread_id(), thread_id());
        let main = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main, other);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn fatal_assert_panics() {
        fatal_assert!(1 + 1 == 3, "math {}", "broke");
    }
}
