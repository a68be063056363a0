//! Replacement entry points for the blocking I/O family.
//!
//! Each wrapper mirrors its libc counterpart bit-for-bit: same argument
//! types, same return convention, same `errno` surface. The difference is
//! what happens on a would-block result inside a fiber: instead of
//! blocking the worker thread, the wrapper registers a readiness interest
//! (and, when the descriptor carries a timeout, a conditional timer) with
//! the current [reactor](crate::reactor) and suspends the calling fiber
//! until the descriptor is ready, the deadline fires, or the wait is
//! cancelled.
//!
//! Interception is opt-in per thread through [`set_enabled`]; scheduler
//! workers enable it on startup. A disabled thread, a descriptor unknown
//! to the [registry](crate::fd), a non-socket, or a socket the user
//! explicitly made non-blocking all delegate straight to libc.
//!
//! Timeout errors surface as `ETIMEDOUT`; `EINTR` is retried internally;
//! `EAGAIN` is hidden by the wait-and-retry loop; everything else passes
//! through untouched.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use once_cell::sync::Lazy;

use crate::config::Config;
use crate::fd::{FdCtx, FdRegistry, TIMEOUT_NONE};
use crate::fiber::{self, Fiber};
use crate::reactor::{Interest, IoReactor};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether the calling thread intercepts blocking calls.
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

/// Turns interception on or off for the calling thread.
#[inline]
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|flag| flag.set(on));
}

// Cached `tcp.connect.timeout`, kept current by a config listener so the
// connect path never touches the registry lock.
static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(5000);

static CONNECT_TIMEOUT_VAR: Lazy<()> = Lazy::new(|| {
    let var = Config::lookup::<i64>("tcp.connect.timeout", 5000, "tcp connect timeout");
    CONNECT_TIMEOUT_MS.store(var.get(), Ordering::Release);
    var.add_listener(|old, new| {
        log::info!(
            target: "system",
            "tcp connect timeout changed from {} to {}",
            old,
            new
        );
        CONNECT_TIMEOUT_MS.store(*new, Ordering::Release);
    });
});

fn connect_timeout_ms() -> u64 {
    Lazy::force(&CONNECT_TIMEOUT_VAR);
    let ms = CONNECT_TIMEOUT_MS.load(Ordering::Acquire);
    if ms < 0 {
        TIMEOUT_NONE
    } else {
        ms as u64
    }
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(code: c_int) {
    unsafe { *libc::__errno_location() = code };
}

// Per-wait cancellation marker shared between the waiting fiber and its
// deadline timer. Holds the errno to surface, 0 while the wait is live.
struct TimerInfo {
    cancelled: AtomicI32,
}

impl TimerInfo {
    fn new() -> Arc<TimerInfo> {
        Arc::new(TimerInfo {
            cancelled: AtomicI32::new(0),
        })
    }
}

// Arms the conditional deadline timer of patterns I and C: when it fires
// first, it marks the wait timed out and cancels the interest, which
// resumes the fiber.
fn arm_deadline(
    reactor: &Arc<IoReactor>,
    info: &Arc<TimerInfo>,
    fd: c_int,
    interest: Interest,
    timeout_ms: u64,
) -> Arc<crate::timer::Timer> {
    let witness: Arc<dyn std::any::Any + Send + Sync> = info.clone();
    let weak_info = Arc::downgrade(info);
    let weak_reactor = Arc::downgrade(reactor);
    reactor.add_conditional_timer(
        timeout_ms,
        move || {
            let info = match weak_info.upgrade() {
                Some(info) => info,
                None => return,
            };
            if info.cancelled.load(Ordering::Acquire) != 0 {
                return;
            }
            info.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
            if let Some(reactor) = weak_reactor.upgrade() {
                reactor.cancel_event(fd, interest);
            }
        },
        Arc::downgrade(&witness),
        false,
    )
}

// Pattern I: run `op` until it succeeds, waiting out EAGAIN on the
// reactor with the descriptor's per-direction timeout.
fn do_io<F>(fd: c_int, interest: Interest, timeout_kind: c_int, op: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !is_enabled() {
        return op();
    }
    let ctx: Arc<FdCtx> = match FdRegistry::instance().get(fd, false) {
        Some(ctx) => ctx,
        None => return op(),
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout_ms = ctx.timeout_ms(timeout_kind);
    let info = TimerInfo::new();

    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }
        // A zero timeout means a single non-blocking probe: surface the
        // would-block result without touching the reactor.
        if timeout_ms == 0 {
            return n;
        }
        let reactor = match IoReactor::current() {
            Some(reactor) => reactor,
            None => return n,
        };

        let timer = if timeout_ms != TIMEOUT_NONE {
            Some(arm_deadline(&reactor, &info, fd, interest, timeout_ms))
        } else {
            None
        };

        if let Err(err) = reactor.add_event(fd, interest, None) {
            log::error!(target: "system", "wait registration for fd {}: {}", fd, err);
            if let Some(timer) = timer {
                timer.cancel();
            }
            return -1;
        }

        fiber::yield_suspended();

        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = info.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Woken by readiness (or a bare cancel): probe again.
    }
}

/// Suspends the current fiber for `ms` milliseconds without blocking its
/// worker. Zero returns immediately; outside a reactor this falls back to
/// a plain thread sleep.
pub(crate) fn sleep_ms(ms: u64) {
    if ms == 0 {
        return;
    }
    let reactor = match IoReactor::current() {
        Some(reactor) => reactor,
        None => return std::thread::sleep(std::time::Duration::from_millis(ms)),
    };
    let fiber = Fiber::current();
    let weak = Arc::downgrade(&reactor);
    reactor.add_timer(
        ms,
        move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    fiber::yield_suspended();
}

/// `sleep(3)`: seconds granularity.
pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

/// `usleep(3)`: microseconds granularity (millisecond resolution here).
pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !is_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

/// `nanosleep(2)`: the shimmed path never reports a remainder.
///
/// # Safety
///
/// `req` must point to a valid `timespec`; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_enabled() {
        return libc::nanosleep(req, rem);
    }
    let req = &*req;
    sleep_ms(req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000);
    0
}

/// `socket(2)`, additionally seeding the descriptor registry.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_enabled() || fd < 0 {
        return fd;
    }
    FdRegistry::instance().get(fd, true);
    fd
}

/// `connect(2)` with an explicit timeout (pattern C).
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let ctx = match FdRegistry::instance().get(fd, false) {
        Some(ctx) => ctx,
        None => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    let reactor = match IoReactor::current() {
        Some(reactor) => reactor,
        None => return n,
    };

    let info = TimerInfo::new();
    let timer = if timeout_ms != TIMEOUT_NONE {
        Some(arm_deadline(&reactor, &info, fd, Interest::WRITE, timeout_ms))
    } else {
        None
    };

    match reactor.add_event(fd, Interest::WRITE, None) {
        Ok(()) => {
            fiber::yield_suspended();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let cancelled = info.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            log::error!(target: "system", "connect wait registration for fd {}: {}", fd, err);
        }
    }

    // The socket error option carries the final outcome of the attempt.
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// `connect(2)` using the configured `tcp.connect.timeout`.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout_ms())
}

/// `accept(2)`, additionally seeding the registry with the new descriptor.
///
/// # Safety
///
/// `addr`/`addrlen` follow the `accept(2)` contract (both may be null).
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let new_fd = do_io(fd, Interest::READ, libc::SO_RCVTIMEO, || {
        libc::accept(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if new_fd >= 0 {
        FdRegistry::instance().get(new_fd, true);
    }
    new_fd
}

/// `read(2)`.
///
/// # Safety
///
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, Interest::READ, libc::SO_RCVTIMEO, || {
        libc::read(fd, buf, count)
    })
}

/// `readv(2)`.
///
/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Interest::READ, libc::SO_RCVTIMEO, || {
        libc::readv(fd, iov, iovcnt)
    })
}

/// `recv(2)`.
///
/// # Safety
///
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Interest::READ, libc::SO_RCVTIMEO, || {
        libc::recv(fd, buf, len, flags)
    })
}

/// `recvfrom(2)`.
///
/// # Safety
///
/// Pointer arguments follow the `recvfrom(2)` contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, Interest::READ, libc::SO_RCVTIMEO, || {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// `recvmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid `msghdr`.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Interest::READ, libc::SO_RCVTIMEO, || {
        libc::recvmsg(fd, msg, flags)
    })
}

/// `write(2)`.
///
/// # Safety
///
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, Interest::WRITE, libc::SO_SNDTIMEO, || {
        libc::write(fd, buf, count)
    })
}

/// `writev(2)`.
///
/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Interest::WRITE, libc::SO_SNDTIMEO, || {
        libc::writev(fd, iov, iovcnt)
    })
}

/// `send(2)`.
///
/// # Safety
///
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Interest::WRITE, libc::SO_SNDTIMEO, || {
        libc::send(fd, buf, len, flags)
    })
}

/// `sendto(2)`.
///
/// # Safety
///
/// Pointer arguments follow the `sendto(2)` contract.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(fd, Interest::WRITE, libc::SO_SNDTIMEO, || {
        libc::sendto(fd, buf, len, flags, to, tolen)
    })
}

/// `sendmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid `msghdr`.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Interest::WRITE, libc::SO_SNDTIMEO, || {
        libc::sendmsg(fd, msg, flags)
    })
}

/// `close(2)`: cancels every reactor interest on `fd` (waking the waiters)
/// and drops its registry entry before closing.
pub fn close(fd: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { libc::close(fd) };
    }
    if FdRegistry::instance().get(fd, false).is_some() {
        if let Some(reactor) = IoReactor::current() {
            reactor.cancel_all(fd);
        }
        FdRegistry::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl(2)` restricted to one integer argument.
///
/// `F_SETFL`/`F_GETFL` virtualize `O_NONBLOCK` for registered sockets: the
/// user-visible flag is what the user last set, while the descriptor is
/// kept non-blocking underneath.
///
/// # Safety
///
/// For pointer-taking commands `arg` must be a valid pointer cast to
/// `usize`.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match FdRegistry::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    libc::fcntl(fd, cmd, flags)
                }
                _ => libc::fcntl(fd, cmd, flags),
            }
        }
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, cmd);
            if flags < 0 {
                return flags;
            }
            match FdRegistry::instance().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => libc::fcntl(fd, cmd, arg),
    }
}

/// `ioctl(2)`: `FIONBIO` is captured into the registry's user flag.
///
/// # Safety
///
/// `arg` must follow the contract of the given `request`.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let on = *(arg as *mut c_int) != 0;
        if let Some(ctx) = FdRegistry::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(on);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// `getsockopt(2)`: plain passthrough.
///
/// # Safety
///
/// Pointer arguments follow the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// `setsockopt(2)`: `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into the
/// registry so the shim can enforce them; the call is still delegated.
///
/// # Safety
///
/// `optval` must point to `optlen` valid bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdRegistry::instance().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            ctx.set_timeout_ms(
                optname,
                tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000,
            );
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_is_per_thread() {
        set_enabled(true);
        assert!(is_enabled());
        let other = std::thread::spawn(is_enabled).join().unwrap();
        assert!(!other);
        set_enabled(false);
        assert!(!is_enabled());
    }

    #[test]
    fn disabled_thread_delegates() {
        set_enabled(false);
        // A plain pipe read through the shim behaves exactly like libc.
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload = b"xyz";
        let wrote = unsafe { write(fds[1], payload.as_ptr() as *const c_void, payload.len()) };
        assert_eq!(wrote, 3);
        let mut buf = [0u8; 8];
        let got = unsafe { read(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(got, 3);
        assert_eq!(&buf[..3], payload);
        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }

    #[test]
    fn fcntl_virtualizes_nonblock_flag() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let ctx = FdRegistry::instance().get(fd, false).unwrap();

        // The registry made the socket non-blocking underneath, but the
        // user never asked for it.
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(real & libc::O_NONBLOCK != 0);
        let visible = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert!(visible & libc::O_NONBLOCK == 0);

        // Setting it through the shim flips the user flag only.
        let rc = unsafe { fcntl(fd, libc::F_SETFL, (visible | libc::O_NONBLOCK) as usize) };
        assert_eq!(rc, 0);
        assert!(ctx.user_nonblock());
        let visible = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert!(visible & libc::O_NONBLOCK != 0);

        set_enabled(false);
        unsafe { libc::close(fd) };
        FdRegistry::instance().del(fd);
    }

    #[test]
    fn setsockopt_records_timeouts() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 250_000,
        };
        let rc = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);
        let ctx = FdRegistry::instance().get(fd, false).unwrap();
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), 1250);
        assert_eq!(ctx.timeout_ms(libc::SO_SNDTIMEO), TIMEOUT_NONE);
        set_enabled(false);
        unsafe { libc::close(fd) };
        FdRegistry::instance().del(fd);
    }
}
