//! Minimal machine-context primitive.
//!
//! A [`Context`] is a saved processor state (callee-saved registers, stack
//! pointer, program counter) that execution can be switched into and out of.
//! The implementation delegates to the POSIX `ucontext` family through
//! `libc`; everything above this module only sees capture, rewind and
//! switch.
//!
//! A context is self-referential once captured (`glibc` points the FPU
//! state pointer into the structure itself), so contexts are only handed
//! out boxed and never move afterwards.

use std::cell::UnsafeCell;

/// A saved machine context, pinned on the heap.
pub(crate) struct Context {
    inner: UnsafeCell<libc::ucontext_t>,
}

// Contexts are mutated only by the thread performing the switch; the fiber
// lifecycle (one Running fiber per thread) serializes every access.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Captures the calling thread's current context.
    pub fn captured() -> Box<Context> {
        let ctx = Box::new(Context {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        });
        let rc = unsafe { libc::getcontext(ctx.inner.get()) };
        fatal_assert!(rc == 0, "getcontext");
        ctx
    }

    /// Points this context at `entry`, to run on the given stack when first
    /// switched to.
    ///
    /// # Safety
    ///
    /// `stack` must stay valid (and unused by anything else) until the
    /// context either finishes or is rewound again, and no other thread may
    /// be executing on this context.
    pub unsafe fn rewind(&self, stack: *mut u8, stack_size: usize, entry: extern "C" fn()) {
        let ucp = self.inner.get();
        let rc = libc::getcontext(ucp);
        fatal_assert!(rc == 0, "getcontext");
        (*ucp).uc_link = std::ptr::null_mut();
        (*ucp).uc_stack.ss_sp = stack as *mut libc::c_void;
        (*ucp).uc_stack.ss_size = stack_size;
        libc::makecontext(ucp, entry, 0);
    }

    /// Saves the current state into `from` and resumes execution at `to`.
    ///
    /// Returns when something later switches back into `from`.
    ///
    /// # Safety
    ///
    /// `from` must describe the currently executing context and `to` a
    /// context that is not running on any thread.
    pub unsafe fn switch(from: &Context, to: &Context) {
        let rc = libc::swapcontext(from.inner.get(), to.inner.get());
        fatal_assert!(rc == 0, "swapcontext");
    }
}
