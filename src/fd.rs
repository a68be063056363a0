//! Per-descriptor metadata registry.
//!
//! The [hook](crate::hook) layer keeps descriptors in non-blocking mode
//! underneath applications while preserving the blocking semantics they
//! asked for. The bookkeeping needed for that lives here: whether the fd is
//! a socket, whether *the user* asked for non-blocking mode, whether the
//! runtime switched the fd to non-blocking behind the user's back, and the
//! per-direction timeouts captured from `setsockopt`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Timeout value meaning "no timeout configured".
pub const TIMEOUT_NONE: u64 = u64::MAX;

/// Metadata for one file descriptor.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Inspects `fd` and records it.
    ///
    /// Sockets are switched to `O_NONBLOCK` here; the user-visible flag
    /// stays untouched and is virtualized by the hook layer's `fcntl`.
    fn new(fd: RawFd) -> FdCtx {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let is_socket = unsafe {
            libc::fstat(fd, stat.as_mut_ptr()) == 0
                && stat.assume_init().st_mode & libc::S_IFMT == libc::S_IFSOCK
        };
        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }
        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the runtime forced `O_NONBLOCK` on the underlying fd.
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    /// Whether the application itself requested non-blocking mode.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// Timeout for one direction, keyed like `setsockopt`:
    /// `SO_RCVTIMEO` or `SO_SNDTIMEO`.
    #[inline]
    pub fn timeout_ms(&self, kind: libc::c_int) -> u64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Relaxed)
        } else {
            self.send_timeout_ms.load(Ordering::Relaxed)
        }
    }

    #[inline]
    pub fn set_timeout_ms(&self, kind: libc::c_int, ms: u64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Relaxed);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }
}

/// Process-wide fd-to-metadata map, grown geometrically.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static INSTANCE: Lazy<FdRegistry> = Lazy::new(|| FdRegistry {
    slots: RwLock::new(vec![None; 64]),
});

impl FdRegistry {
    /// The singleton, initialized on first use.
    #[inline]
    pub fn instance() -> &'static FdRegistry {
        &INSTANCE
    }

    /// Returns the metadata for `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().expect("fd registry lock");
            if let Some(slot) = slots.get(fd as usize) {
                if slot.is_some() || !auto_create {
                    return slot.clone();
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().expect("fd registry lock");
        if fd as usize >= slots.len() {
            slots.resize(fd as usize * 3 / 2 + 1, None);
        }
        if slots[fd as usize].is_none() {
            slots[fd as usize] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[fd as usize].clone()
    }

    /// Drops the metadata for `fd`. Outstanding handles stay usable but are
    /// marked closed.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().expect("fd registry lock");
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_socket_fd_is_classified() {
        let file = tempfile::tempfile().unwrap();
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        let ctx = FdRegistry::instance().get(fd, true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        FdRegistry::instance().del(fd);
        assert!(ctx.is_closed());
        assert!(FdRegistry::instance().get(fd, false).is_none());
    }

    #[test]
    fn socket_is_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = FdRegistry::instance().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), TIMEOUT_NONE);
        ctx.set_timeout_ms(libc::SO_RCVTIMEO, 1500);
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), 1500);
        assert_eq!(ctx.timeout_ms(libc::SO_SNDTIMEO), TIMEOUT_NONE);

        FdRegistry::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn registry_grows_past_initial_capacity() {
        // Only exercises the resize path; fd 200 does not need to be open
        // for get() to classify it as non-socket.
        let ctx = FdRegistry::instance().get(200, true).unwrap();
        assert!(!ctx.is_socket());
        FdRegistry::instance().del(200);
    }
}
