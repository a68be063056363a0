//! The I/O reactor: a [scheduler](crate::scheduler) whose idle fiber waits
//! on `epoll` and a [timer wheel](crate::timer) bounding that wait.
//!
//! Fibers (or plain callbacks) park on descriptor readiness through
//! [`add_event`](IoReactor::add_event); the idle loop translates kernel
//! events back into scheduled tasks. All registrations are edge-triggered
//! and one-shot from the caller's point of view: a delivered or cancelled
//! interest must be re-registered to observe the next readiness.
//!
//! A self-pipe wakes the idle loop early when work or a nearer deadline
//! shows up while it sits in `epoll_wait`.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{self, Scheduler, SchedulerExt, Task};
use crate::timer::{Timer, TimerWheel};

bitflags::bitflags! {
    /// Readiness directions a descriptor can be waited on for.
    ///
    /// Bit values match `EPOLLIN` / `EPOLLOUT` so interest masks translate
    /// to the kernel without remapping.
    pub struct Interest: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

fn interest_name(interest: Interest) -> &'static str {
    if interest == Interest::READ {
        "read"
    } else if interest == Interest::WRITE {
        "write"
    } else {
        "read|write"
    }
}

type WaiterFn = Box<dyn FnOnce() + Send>;

enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(WaiterFn),
}

impl Waiter {
    fn into_task(self) -> Task {
        match self {
            Waiter::Fiber(fiber) => Task::fiber(fiber),
            Waiter::Callback(callback) => Task::callback(callback),
        }
    }
}

// One registered direction: who to wake, and where.
struct EventSlot {
    scheduler: Option<Arc<Scheduler>>,
    waiter: Option<Waiter>,
}

impl Default for EventSlot {
    fn default() -> Self {
        EventSlot {
            scheduler: None,
            waiter: None,
        }
    }
}

struct FdContextInner {
    interests: Interest,
    read: EventSlot,
    write: EventSlot,
}

impl FdContextInner {
    fn slot_mut(&mut self, interest: Interest) -> &mut EventSlot {
        if interest == Interest::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

// Per-descriptor event record; its address doubles as the epoll user data.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner {
                interests: Interest::empty(),
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<IoReactor>>> = RefCell::new(None);
}

// epoll user data of the self-pipe read end.
const TICKLE_TOKEN: u64 = 0;

const INITIAL_CONTEXTS: usize = 64;
const MAX_WAIT_EVENTS: usize = 64;
const MAX_WAIT_MS: u64 = 5000;

/// Scheduler + readiness loop + timer wheel.
pub struct IoReactor {
    scheduler: Arc<Scheduler>,
    wheel: TimerWheel,
    epoll_fd: RawFd,
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    weak_self: Weak<IoReactor>,
}

impl IoReactor {
    /// Creates a reactor with `threads` workers and starts them.
    ///
    /// With `use_caller` the constructing thread is claimed as worker zero
    /// (see [`Scheduler::new`]); readiness and timers are then only
    /// processed while draining in [`stop`](Self::stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoReactor>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::EpollCreate(io::Error::last_os_error()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::SelfPipe(err));
        }
        // Neither end may ever block: the idle loop drains until empty and
        // tickles must be fire-and-forget even when the pipe is full.
        for fd in pipe_fds {
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
            fatal_assert!(rc == 0, "self-pipe O_NONBLOCK");
        }

        let scheduler = Scheduler::new(threads, use_caller, name);
        let wheel = TimerWheel::new();
        let mut contexts = Vec::with_capacity(INITIAL_CONTEXTS);
        for fd in 0..INITIAL_CONTEXTS {
            contexts.push(Arc::new(FdContext::new(fd as RawFd)));
        }

        let reactor = Arc::new_cyclic(|weak: &Weak<IoReactor>| IoReactor {
            scheduler,
            wheel,
            epoll_fd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            contexts: RwLock::new(contexts),
            weak_self: weak.clone(),
        });

        let ext: Weak<dyn SchedulerExt> = reactor.weak_self.clone();
        reactor.scheduler.install_ext(ext);
        {
            let weak = reactor.weak_self.clone();
            reactor.wheel.set_front_hook(move || {
                // A nearer deadline: cut the current epoll wait short.
                if let Some(reactor) = weak.upgrade() {
                    reactor.tickle();
                }
            });
        }

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut event)
        };
        if rc != 0 {
            return Err(Error::EpollCtl {
                op: "add",
                fd: pipe_fds[0],
                source: io::Error::last_os_error(),
            });
        }

        if use_caller {
            CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(reactor.weak_self.clone()));
        }
        reactor.scheduler.start();
        Ok(reactor)
    }

    /// The reactor the calling thread is running under, if any.
    pub fn current() -> Option<Arc<IoReactor>> {
        CURRENT_REACTOR.with(|r| r.borrow().as_ref().and_then(Weak::upgrade))
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// The underlying scheduler.
    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Kernel ids of the reactor's workers, for affinity pinning.
    #[inline]
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.scheduler.thread_ids()
    }

    /// Enqueues `f` to run in a fiber on any worker.
    #[inline]
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    /// Enqueues an existing fiber for resumption.
    #[inline]
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Enqueues a [`Task`] (carrying an optional affinity).
    #[inline]
    pub fn schedule_task(&self, task: Task) {
        self.scheduler.schedule_task(task);
    }

    /// Schedules `callback` to fire in `period_ms`; periodic timers re-arm
    /// themselves until [cancelled](crate::timer::Timer::cancel).
    #[inline]
    pub fn add_timer<F>(&self, period_ms: u64, callback: F, periodic: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.wheel.add_timer(period_ms, callback, periodic)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback is suppressed
    /// if `witness` no longer resolves when the deadline arrives.
    #[inline]
    pub fn add_conditional_timer<F>(
        &self,
        period_ms: u64,
        callback: F,
        witness: Weak<dyn Any + Send + Sync>,
        periodic: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.wheel.add_conditional_timer(period_ms, callback, witness, periodic)
    }

    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read().expect("reactor registry lock");
            if let Some(ctx) = contexts.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut contexts = self.contexts.write().expect("reactor registry lock");
        if fd as usize >= contexts.len() {
            let target = fd as usize * 3 / 2 + 1;
            for fd in contexts.len()..target {
                contexts.push(Arc::new(FdContext::new(fd as RawFd)));
            }
        }
        contexts[fd as usize].clone()
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc != 0 {
            return Err(Error::EpollCtl {
                op: match op {
                    libc::EPOLL_CTL_ADD => "add",
                    libc::EPOLL_CTL_MOD => "mod",
                    _ => "del",
                },
                fd,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Registers a one-shot interest in `interest` readiness of `fd`.
    ///
    /// With a callback the callback is scheduled on readiness; without one
    /// the *current fiber* (which must be Running) is parked and resumed on
    /// readiness. Registering an already-registered direction is a
    /// programming error.
    pub fn add_event(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: Option<WaiterFn>,
    ) -> Result<()> {
        fatal_assert!(
            interest == Interest::READ || interest == Interest::WRITE,
            "add_event with interest mask {:?}",
            interest
        );
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().expect("fd context lock");

        fatal_assert!(
            !inner.interests.contains(interest),
            "{} interest registered twice for fd {}",
            interest_name(interest),
            fd
        );

        let op = if inner.interests.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let events = libc::EPOLLET as u32 | (inner.interests | interest).bits();
        self.epoll_ctl(op, fd, events, Arc::as_ptr(&ctx) as u64)?;

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.interests |= interest;
        let scheduler = scheduler::current().unwrap_or_else(|| self.scheduler.clone());
        let slot = inner.slot_mut(interest);
        fatal_assert!(
            slot.waiter.is_none() && slot.scheduler.is_none(),
            "event slot for fd {} not empty",
            fd
        );
        slot.scheduler = Some(scheduler);
        slot.waiter = Some(match callback {
            Some(callback) => Waiter::Callback(callback),
            None => {
                let current = Fiber::current();
                fatal_assert!(
                    current.state() == State::Running,
                    "fiber {} registering a wait while {:?}",
                    current.id(),
                    current.state()
                );
                Waiter::Fiber(current)
            }
        });
        Ok(())
    }

    /// Withdraws an interest without waking its waiter.
    ///
    /// Returns `false` when the direction was not registered.
    pub fn del_event(&self, fd: RawFd, interest: Interest) -> bool {
        let ctx = {
            let contexts = self.contexts.read().expect("reactor registry lock");
            match contexts.get(fd as usize) {
                Some(ctx) => ctx.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().expect("fd context lock");
        if !inner.interests.contains(interest) {
            return false;
        }

        let remaining = inner.interests - interest;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let events = libc::EPOLLET as u32 | remaining.bits();
        if let Err(err) = self.epoll_ctl(op, fd, events, Arc::as_ptr(&ctx) as u64) {
            log::error!(target: "system", "del_event: {}", err);
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.interests = remaining;
        let slot = inner.slot_mut(interest);
        slot.scheduler = None;
        slot.waiter = None;
        true
    }

    /// Withdraws an interest and schedules its waiter exactly once, so the
    /// blocked side can observe the cancellation and unwind.
    pub fn cancel_event(&self, fd: RawFd, interest: Interest) -> bool {
        let ctx = {
            let contexts = self.contexts.read().expect("reactor registry lock");
            match contexts.get(fd as usize) {
                Some(ctx) => ctx.clone(),
                None => return false,
            }
        };
        let wakeup;
        {
            let mut inner = ctx.inner.lock().expect("fd context lock");
            if !inner.interests.contains(interest) {
                return false;
            }

            let remaining = inner.interests - interest;
            let op = if remaining.is_empty() {
                libc::EPOLL_CTL_DEL
            } else {
                libc::EPOLL_CTL_MOD
            };
            let events = libc::EPOLLET as u32 | remaining.bits();
            if let Err(err) = self.epoll_ctl(op, fd, events, Arc::as_ptr(&ctx) as u64) {
                log::error!(target: "system", "cancel_event: {}", err);
                return false;
            }
            inner.interests = remaining;
            wakeup = Self::take_slot(&mut inner, interest);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        // Waiters are scheduled outside the descriptor lock.
        if let Some((scheduler, task)) = wakeup {
            scheduler.schedule_task(task);
        }
        true
    }

    /// Withdraws every interest on `fd` and wakes all waiters. Used by
    /// `close`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = {
            let contexts = self.contexts.read().expect("reactor registry lock");
            match contexts.get(fd as usize) {
                Some(ctx) => ctx.clone(),
                None => return false,
            }
        };
        let mut wakeups = Vec::with_capacity(2);
        {
            let mut inner = ctx.inner.lock().expect("fd context lock");
            if inner.interests.is_empty() {
                return false;
            }
            if let Err(err) = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0, Arc::as_ptr(&ctx) as u64)
            {
                log::error!(target: "system", "cancel_all: {}", err);
                return false;
            }
            for interest in [Interest::READ, Interest::WRITE] {
                if inner.interests.contains(interest) {
                    inner.interests -= interest;
                    wakeups.extend(Self::take_slot(&mut inner, interest));
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
            }
            fatal_assert!(inner.interests.is_empty(), "cancel_all left interests behind");
        }
        for (scheduler, task) in wakeups {
            scheduler.schedule_task(task);
        }
        true
    }

    // Empties one slot, translating it to (owner, task).
    fn take_slot(
        inner: &mut FdContextInner,
        interest: Interest,
    ) -> Option<(Arc<Scheduler>, Task)> {
        let slot = inner.slot_mut(interest);
        let scheduler = slot.scheduler.take()?;
        let waiter = slot.waiter.take();
        fatal_assert!(waiter.is_some(), "interest bit set with an empty slot");
        Some((scheduler, waiter.unwrap().into_task()))
    }

    /// Outstanding registered interests, over all descriptors.
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    /// Stops the reactor once the queue is drained, no interests are
    /// pending and the timer wheel is empty, then joins the workers.
    pub fn stop(&self) {
        self.scheduler.stop();
        CURRENT_REACTOR.with(|r| {
            let clear = r
                .borrow()
                .as_ref()
                .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), self));
            if clear {
                *r.borrow_mut() = None;
            }
        });
    }

    // Wake the idle loop: one byte down the self-pipe, only when somebody
    // is actually parked in epoll_wait.
    fn reactor_tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const _, 1) };
        if rc != 1 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a pending wakeup.
            fatal_assert!(
                err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted,
                "self-pipe write: {}",
                err
            );
        }
    }

    fn reactor_stopping(&self) -> bool {
        self.scheduler.base_stopping()
            && self.pending_events.load(Ordering::Acquire) == 0
            && !self.wheel.has_timers()
    }

    // The reactor's idle fiber: epoll wait bounded by the timer wheel.
    fn reactor_idle(&self) {
        log::debug!(target: "system", "reactor {} idle loop entered", self.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_WAIT_EVENTS];

        loop {
            if self.reactor_stopping() {
                log::info!(target: "system", "reactor {} idle loop exiting", self.name());
                break;
            }

            let timeout_ms = self
                .wheel
                .next_delay_ms()
                .map_or(MAX_WAIT_MS, |delay| delay.min(MAX_WAIT_MS));
            let ready = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        events.as_mut_ptr(),
                        MAX_WAIT_EVENTS as libc::c_int,
                        timeout_ms as libc::c_int,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    log::error!(target: "system", "epoll_wait: {}", err);
                    break 0;
                }
            };

            for event in &events[..ready] {
                if event.u64 == TICKLE_TOKEN {
                    self.drain_tickle_pipe();
                    continue;
                }
                // Safe: context records live as long as the reactor and the
                // registration was keyed on this pointer.
                let ctx = unsafe { &*(event.u64 as *const FdContext) };
                self.dispatch_ready(ctx, event.events);
            }

            let expired = self.wheel.drain_expired();
            if !expired.is_empty() {
                self.scheduler.schedule_batch(
                    expired
                        .into_iter()
                        .map(|callback| Task::callback(move || callback())),
                );
            }

            // Hand the freshly scheduled tasks to the dispatch loop.
            fiber::yield_suspended();
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut _, buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }

    // Translates one epoll event into scheduled waiters and reprograms the
    // descriptor's remaining interests.
    fn dispatch_ready(&self, ctx: &FdContext, event_bits: u32) {
        let mut wakeups = Vec::with_capacity(2);
        {
            let mut inner = ctx.inner.lock().expect("fd context lock");
            let mut bits = event_bits;
            // Errors and hangups wake both directions so waiters can
            // observe the failure from the syscall itself.
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            }
            let ready = Interest::from_bits_truncate(bits) & inner.interests;
            if ready.is_empty() {
                return;
            }

            let remaining = inner.interests - ready;
            let op = if remaining.is_empty() {
                libc::EPOLL_CTL_DEL
            } else {
                libc::EPOLL_CTL_MOD
            };
            let events = libc::EPOLLET as u32 | remaining.bits();
            if let Err(err) =
                self.epoll_ctl(op, ctx.fd, events, ctx as *const FdContext as u64)
            {
                log::error!(target: "system", "dispatch_ready: {}", err);
                return;
            }
            inner.interests = remaining;

            for interest in [Interest::READ, Interest::WRITE] {
                if ready.contains(interest) {
                    wakeups.extend(Self::take_slot(&mut inner, interest));
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        for (scheduler, task) in wakeups {
            scheduler.schedule_task(task);
        }
    }
}

impl SchedulerExt for IoReactor {
    fn tickle(&self) {
        self.reactor_tickle();
    }

    fn stopping(&self) -> bool {
        self.reactor_stopping()
    }

    fn idle(&self) {
        self.reactor_idle();
    }

    fn on_worker_start(&self) {
        CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(self.weak_self.clone()));
    }
}

impl Drop for IoReactor {
    fn drop(&mut self) {
        fatal_assert!(
            self.scheduler.is_stopping(),
            "reactor {} dropped while running",
            self.name()
        );
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
