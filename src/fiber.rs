//! Cooperative execution contexts.
//!
//! A [`Fiber`] is a callback bound to its own stack and saved machine
//! context. Fibers never run on their own: a [scheduler](crate::scheduler)
//! worker switches into one with [`resume`](Fiber::resume) and the fiber
//! hands control back with [`yield_ready`] / [`yield_suspended`] or by
//! finishing.
//!
//! Two implicit fibers exist per participating OS thread: the *trampoline*
//! (the thread's original stack, created lazily by [`Fiber::current`]) and
//! the scheduler fiber installed by the dispatch loop. Ordinary fibers
//! switch with the scheduler fiber; a caller-mode scheduler fiber is itself
//! a child of the trampoline and switches with it through
//! [`call`](Fiber::call) / [`back`](Fiber::back).
//!
//! Lifecycle:
//!
//! ```text
//! Init ──resume──> Running ──yield_ready──────> Ready ────┐
//!  ^                  │ └────yield_suspended──> Suspended │ (re-queued,
//!  └─reset─ Terminated/Faulted <──return/panic─┘          │  resumed)
//! ```

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};
use crate::scheduler;

pub(crate) mod ctx;
pub mod stack;

pub use stack::{set_stack_allocator, StackAllocator, SystemStackAllocator};

use ctx::Context;
use stack::Stack;

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Constructed or reset, never resumed since.
    Init = 0,
    /// Runnable, waiting in (or headed for) the scheduler queue.
    Ready = 1,
    /// Currently executing on some thread.
    Running = 2,
    /// Parked until an event, timer or explicit reschedule.
    Suspended = 3,
    /// Callback returned normally.
    Terminated = 4,
    /// Callback panicked.
    Faulted = 5,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Running,
            3 => State::Suspended,
            4 => State::Terminated,
            5 => State::Faulted,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<Arc<ConfigVar<u32>>> =
    Lazy::new(|| Config::lookup::<u32>("fiber.stack_size", 128 * 1024, "fiber stack size"));

/// Configured stack size for new fibers, in bytes.
#[inline]
pub fn default_stack_size() -> usize {
    STACK_SIZE.get() as usize
}

thread_local! {
    // Raw pointer on purpose: the running fiber must not be kept alive by
    // TLS, or a terminating fiber could free its own stack mid-switch.
    static CURRENT: Cell<*const Fiber> = Cell::new(std::ptr::null());
    static TRAMPOLINE: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

type Callback = Box<dyn FnOnce() + Send>;

/// A cooperatively scheduled execution context with its own stack.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    ctx: Box<Context>,
    stack: Option<Stack>,
    callback: Mutex<Option<Callback>>,
    // Termination yields to the trampoline instead of the scheduler fiber.
    caller_child: bool,
}

impl Fiber {
    /// Creates a fiber running `callback` on a fresh stack.
    ///
    /// `stack_size` of 0 means the configured `fiber.stack_size`. The fiber
    /// starts in [`State::Init`] and runs only once something resumes it.
    pub fn new<F>(callback: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_flags(Box::new(callback), stack_size, false)
    }

    /// A fiber whose termination yields back to the thread trampoline.
    /// Only the caller-mode scheduler fiber is one.
    pub(crate) fn new_caller_child(callback: Callback, stack_size: usize) -> Arc<Fiber> {
        Self::with_flags(callback, stack_size, true)
    }

    fn with_flags(callback: Callback, stack_size: usize, caller_child: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            default_stack_size()
        } else {
            stack_size
        };
        let stack = Stack::new(stack_size);
        let ctx = Context::captured();
        unsafe { ctx.rewind(stack.base(), stack.size(), fiber_entry) };

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(target: "system", "fiber {} created, stack {} bytes", id, stack_size);
        Arc::new(Fiber {
            id,
            state: AtomicU8::new(State::Init as u8),
            ctx,
            stack: Some(stack),
            callback: Mutex::new(Some(callback)),
            caller_child,
        })
    }

    // The thread's original stack wrapped as a fiber. Id 0, no owned stack,
    // considered Running whenever control is on it.
    fn new_trampoline() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: 0,
            state: AtomicU8::new(State::Running as u8),
            ctx: Context::captured(),
            stack: None,
            callback: Mutex::new(None),
            caller_child: false,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_trampoline(&self) -> bool {
        self.stack.is_none()
    }

    /// Rebinds a finished fiber to a new callback, reusing its stack.
    ///
    /// Requires state Init, Terminated or Faulted; the fiber keeps its
    /// identity and returns to [`State::Init`].
    pub fn reset<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = match &self.stack {
            Some(stack) => stack,
            None => {
                fatal_assert!(false, "reset of trampoline fiber {}", self.id);
                return;
            }
        };
        let state = self.state();
        fatal_assert!(
            state == State::Init || state == State::Terminated || state == State::Faulted,
            "reset of fiber {} in state {:?}",
            self.id,
            state
        );
        *self.callback.lock().expect("fiber callback lock") = Some(Box::new(callback));
        unsafe { self.ctx.rewind(stack.base(), stack.size(), fiber_entry) };
        self.set_state(State::Init);
    }

    /// Switches from the scheduler fiber into this fiber.
    ///
    /// Returns when the fiber yields or finishes. Must run on a thread with
    /// an installed scheduler fiber; resuming a Running fiber is a
    /// programming error.
    pub(crate) fn resume(&self) {
        let partner = scheduler::scheduler_fiber_raw();
        fatal_assert!(!partner.is_null(), "resume with no scheduler fiber on this thread");
        fatal_assert!(
            self.state() != State::Running,
            "resume of running fiber {}",
            self.id
        );
        self.set_state(State::Running);
        set_current(self as *const Fiber);
        unsafe { Context::switch(&(*partner).ctx, &self.ctx) };
    }

    // Switch back to this thread's scheduler fiber. State is chosen by the
    // caller beforehand.
    fn swap_out(&self) {
        let partner = scheduler::scheduler_fiber_raw();
        fatal_assert!(!partner.is_null(), "yield with no scheduler fiber on this thread");
        set_current(partner);
        unsafe { Context::switch(&self.ctx, &(*partner).ctx) };
    }

    /// Switches from the trampoline into this fiber (caller-mode only).
    pub(crate) fn call(&self) {
        let trampoline = Fiber::current();
        fatal_assert!(
            trampoline.is_trampoline(),
            "call from non-trampoline fiber {}",
            trampoline.id
        );
        fatal_assert!(
            self.state() != State::Running,
            "call of running fiber {}",
            self.id
        );
        self.set_state(State::Running);
        set_current(self as *const Fiber);
        unsafe { Context::switch(&trampoline.ctx, &self.ctx) };
    }

    // Counterpart of call: back to the trampoline.
    fn back(&self) {
        let trampoline = TRAMPOLINE.with(|t| {
            t.borrow()
                .as_ref()
                .map(|f| Arc::as_ptr(f))
                .unwrap_or(std::ptr::null())
        });
        fatal_assert!(!trampoline.is_null(), "back with no trampoline on this thread");
        set_current(trampoline);
        unsafe { Context::switch(&self.ctx, &(*trampoline).ctx) };
    }

    /// The fiber currently executing on this thread.
    ///
    /// On a thread that has not run a fiber yet this installs the
    /// trampoline fiber and returns it.
    pub fn current() -> Arc<Fiber> {
        let raw = CURRENT.with(|c| c.get());
        if !raw.is_null() {
            // The running fiber is kept alive by its executor, never by TLS.
            unsafe {
                Arc::increment_strong_count(raw);
                return Arc::from_raw(raw);
            }
        }
        let trampoline = Fiber::new_trampoline();
        set_current(Arc::as_ptr(&trampoline));
        TRAMPOLINE.with(|t| *t.borrow_mut() = Some(trampoline.clone()));
        trampoline
    }

    /// Number of fibers alive process-wide, trampolines included.
    #[inline]
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            fatal_assert!(
                state == State::Init || state == State::Terminated || state == State::Faulted,
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        }
    }
}

#[inline]
fn set_current(fiber: *const Fiber) {
    CURRENT.with(|c| c.set(fiber));
}

/// Id of the fiber running on this thread; 0 outside any fiber (and on the
/// trampoline). Never allocates, safe to call from the logger.
#[inline]
pub fn current_id() -> u64 {
    let raw = CURRENT.with(|c| c.get());
    if raw.is_null() {
        0
    } else {
        unsafe { (*raw).id }
    }
}

/// Yields the current fiber back to the scheduler, leaving it runnable.
///
/// The scheduler will re-enqueue it, so control returns after other ready
/// tasks have had a turn. Requires a Running fiber.
pub fn yield_ready() {
    let cur = Fiber::current();
    fatal_assert!(
        cur.state() == State::Running,
        "yield_ready from fiber {} in state {:?}",
        cur.id,
        cur.state()
    );
    cur.set_state(State::Ready);
    cur.swap_out();
}

/// Yields the current fiber and parks it.
///
/// Nothing will run it again until something re-schedules it (a readiness
/// event, a timer, or an explicit [`schedule`](crate::scheduler::Scheduler)).
/// Requires a Running fiber.
pub fn yield_suspended() {
    let cur = Fiber::current();
    fatal_assert!(
        cur.state() == State::Running,
        "yield_suspended from fiber {} in state {:?}",
        cur.id,
        cur.state()
    );
    cur.set_state(State::Suspended);
    cur.swap_out();
}

/// Puts the current fiber to sleep without blocking its worker thread.
///
/// Inside a reactor this arms a one-shot timer and suspends; a zero
/// duration returns immediately without yielding. Outside any reactor it
/// falls back to a thread sleep.
pub fn sleep(timeout: Duration) {
    crate::hook::sleep_ms(timeout.as_millis() as u64);
}

// Shared entry point of every fiber with a stack: runs the callback, records
// the outcome, then leaves for good.
extern "C" fn fiber_entry() {
    let cur = Fiber::current();
    let callback = cur
        .callback
        .lock()
        .expect("fiber callback lock")
        .take();
    fatal_assert!(callback.is_some(), "fiber {} entered without a callback", cur.id);

    match catch_unwind(AssertUnwindSafe(callback.unwrap())) {
        Ok(()) => cur.set_state(State::Terminated),
        Err(payload) => {
            cur.set_state(State::Faulted);
            log::error!(
                target: "system",
                "fiber {} faulted: {}\nbacktrace:\n{}",
                cur.id,
                panic_message(&payload),
                crate::util::backtrace_string(),
            );
        }
    }

    // Drop our own reference before leaving: the executor's reference keeps
    // the stack alive across the final switch.
    let caller_child = cur.caller_child;
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        if caller_child {
            (*raw).back();
        } else {
            (*raw).swap_out();
        }
    }
    log::error!(target: "system", "terminated fiber resumed");
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_is_current_by_default() {
        let fiber = Fiber::current();
        assert_eq!(fiber.id(), 0);
        assert!(fiber.is_trampoline());
        assert_eq!(fiber.state(), State::Running);
        assert_eq!(current_id(), 0);
    }

    #[test]
    fn new_fiber_starts_init_with_fresh_id() {
        let a = Fiber::new(|| {}, 0);
        let b = Fiber::new(|| {}, 16 * 1024);
        assert_eq!(a.state(), State::Init);
        assert!(b.id() > a.id());
        // Never resumed: dropping in Init must be fine.
    }

    #[test]
    fn reset_keeps_identity() {
        let fiber = Fiber::new(|| {}, 16 * 1024);
        let id = fiber.id();
        fiber.reset(|| {});
        assert_eq!(fiber.id(), id);
        assert_eq!(fiber.state(), State::Init);
    }

    #[test]
    fn default_stack_size_tracks_config() {
        let var = Config::lookup::<u32>("fiber.stack_size", 128 * 1024, "fiber stack size");
        let before = var.get();
        var.set(256 * 1024);
        assert_eq!(default_stack_size(), 256 * 1024);
        var.set(before);
    }
}
