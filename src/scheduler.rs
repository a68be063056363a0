//! M:N task dispatch over a pool of worker threads.
//!
//! A [`Scheduler`] owns a FIFO queue of [tasks](Task) — fibers or bare
//! callbacks, optionally pinned to one worker — and a set of threads
//! running the dispatch loop. In caller mode the constructing thread
//! itself becomes worker zero: a dedicated scheduler fiber is installed on
//! it and drained from [`stop`](Scheduler::stop).
//!
//! The dispatch loop per worker: take the oldest eligible task (affinity
//! match, fiber not currently Running), switch into it, then either
//! re-enqueue it (Ready), park it (Suspended) or let it go (finished).
//! With nothing eligible the worker switches into its idle fiber; the base
//! scheduler's idle spins through yields until stopped, the
//! [reactor](crate::reactor) replaces it with an `epoll` wait.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, State};
use crate::hook;
use crate::thread::Thread;
use crate::util;

type TaskFn = Box<dyn FnOnce() + Send>;

enum TaskKind {
    Fiber(Arc<Fiber>),
    Callback(TaskFn),
}

/// A unit of work for the scheduler: a fiber to resume or a callback to run
/// in a fiber, plus an optional worker-thread affinity.
pub struct Task {
    kind: TaskKind,
    thread: Option<libc::pid_t>,
}

impl Task {
    /// A task resuming an existing fiber.
    #[inline]
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread: None,
        }
    }

    /// A task running `f` inside a (reused) worker fiber.
    #[inline]
    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Callback(Box::new(f)),
            thread: None,
        }
    }

    /// Restricts the task to the worker with the given kernel thread id.
    #[inline]
    pub fn pinned_to(mut self, thread: libc::pid_t) -> Task {
        self.thread = Some(thread);
        self
    }
}

/// Hooks a composing runtime (the reactor) installs to replace the
/// scheduler's overridable points: wakeup, stop condition, idle behavior.
pub(crate) trait SchedulerExt: Send + Sync {
    fn tickle(&self);
    fn stopping(&self) -> bool;
    fn idle(&self);
    fn on_worker_start(&self);
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Arc<Scheduler>>> =
        std::cell::RefCell::new(None);
    // Dispatch-loop fiber of this thread; raw so fibers can switch to it
    // without keeping it alive (see fiber::CURRENT).
    static SCHEDULER_FIBER: std::cell::Cell<*const Fiber> =
        std::cell::Cell::new(std::ptr::null());
}

/// The scheduler the calling thread is running under, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|s| s.borrow().clone())
}

#[inline]
pub(crate) fn scheduler_fiber_raw() -> *const Fiber {
    SCHEDULER_FIBER.with(|f| f.get())
}

#[inline]
fn set_scheduler_fiber(fiber: *const Fiber) {
    SCHEDULER_FIBER.with(|f| f.set(fiber));
}

/// M:N fiber scheduler over a worker thread pool.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    // Threads to spawn in start(); excludes the caller-mode worker.
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_thread: Option<libc::pid_t>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    ext: OnceCell<Weak<dyn SchedulerExt>>,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Creates a scheduler named `name` with `threads` workers.
    ///
    /// With `use_caller` the constructing thread is claimed as worker zero
    /// and one thread fewer is spawned; the claimed thread only dispatches
    /// while draining inside [`stop`](Self::stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        fatal_assert!(threads > 0, "scheduler {:?} with zero threads", name);

        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| Scheduler {
            name: name.to_owned(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count: if use_caller { threads - 1 } else { threads },
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_thread: if use_caller {
                Some(util::thread_id())
            } else {
                None
            },
            root_fiber: Mutex::new(None),
            ext: OnceCell::new(),
            weak_self: weak.clone(),
        });

        if use_caller {
            // Claim the constructing thread: it gets a trampoline, a
            // dedicated scheduler fiber, and counts as a worker.
            Fiber::current();
            fatal_assert!(
                current().is_none(),
                "thread already owned by another scheduler"
            );
            let weak = Arc::downgrade(&scheduler);
            let root_fiber = Fiber::new_caller_child(
                Box::new(move || {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.run();
                    }
                }),
                0,
            );
            set_scheduler_fiber(Arc::as_ptr(&root_fiber));
            *scheduler
                .root_fiber
                .lock()
                .expect("scheduler root fiber lock") = Some(root_fiber);
            CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(scheduler.clone()));
            scheduler
                .thread_ids
                .lock()
                .expect("scheduler thread ids lock")
                .push(util::thread_id());
        }

        scheduler
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel ids of all workers, usable as [`Task::pinned_to`] targets.
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.thread_ids
            .lock()
            .expect("scheduler thread ids lock")
            .clone()
    }

    pub(crate) fn install_ext(&self, ext: Weak<dyn SchedulerExt>) {
        fatal_assert!(
            self.ext.set(ext).is_ok(),
            "scheduler extension installed twice"
        );
    }

    fn ext(&self) -> Option<Arc<dyn SchedulerExt>> {
        self.ext.get().and_then(Weak::upgrade)
    }

    /// Spawns the worker threads. Idempotent once running.
    pub fn start(&self) {
        let mut threads = self.threads.lock().expect("scheduler threads lock");
        if !self.stopping.load(Ordering::Acquire) {
            return;
        }
        self.stopping.store(false, Ordering::Release);
        fatal_assert!(threads.is_empty(), "scheduler {:?} restarted", self.name);

        let this = self.weak_self.upgrade().expect("scheduler started while dropping");
        let mut ids = self.thread_ids.lock().expect("scheduler thread ids lock");
        for i in 0..self.thread_count {
            let worker = this.clone();
            let thread = Thread::spawn(&format!("{}_{}", self.name, i), move || worker.run())
                .expect("spawning scheduler worker");
            ids.push(thread.id());
            threads.push(thread);
        }
    }

    /// Enqueues `f` to run in a fiber on any worker.
    #[inline]
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::callback(f));
    }

    /// Enqueues an existing fiber for resumption on any worker.
    #[inline]
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::fiber(fiber));
    }

    /// Enqueues a task, waking an idle worker if the queue was empty.
    pub fn schedule_task(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.queue.lock().expect("scheduler queue lock");
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueues a batch of tasks with at most one worker wakeup.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock().expect("scheduler queue lock");
            let was_empty = queue.is_empty();
            queue.extend(tasks);
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Moves the current fiber to the worker with kernel id `thread`
    /// (any worker when `None`) and yields.
    ///
    /// No-op when already running on a matching worker of this scheduler.
    pub fn switch_to(&self, thread: Option<libc::pid_t>) {
        fatal_assert!(current().is_some(), "switch_to outside any scheduler");
        if let Some(current) = current() {
            if std::ptr::eq(Arc::as_ptr(&current), self)
                && (thread.is_none() || thread == Some(util::thread_id()))
            {
                return;
            }
        }
        let mut task = Task::fiber(Fiber::current());
        if let Some(thread) = thread {
            task = task.pinned_to(thread);
        }
        self.schedule_task(task);
        fiber::yield_suspended();
    }

    /// Whether any worker is parked in its idle fiber.
    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Base stop condition: stop requested, queue drained, nothing active.
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().expect("scheduler queue lock").is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    fn tickle(&self) {
        match self.ext() {
            Some(ext) => ext.tickle(),
            None => log::trace!(target: "system", "tickle {}", self.name),
        }
    }

    fn stopping(&self) -> bool {
        match self.ext() {
            Some(ext) => ext.stopping(),
            None => self.base_stopping(),
        }
    }

    fn idle(&self) {
        match self.ext() {
            Some(ext) => ext.idle(),
            None => {
                log::debug!(target: "system", "idle {}", self.name);
                while !self.stopping() {
                    fiber::yield_suspended();
                }
            }
        }
    }

    /// Stops the scheduler: drains queued work, then joins the workers.
    ///
    /// In caller mode the constructing thread must call this; it dispatches
    /// remaining tasks on the spot before joining.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        let root_fiber = self
            .root_fiber
            .lock()
            .expect("scheduler root fiber lock")
            .clone();

        if let Some(ref root) = root_fiber {
            if self.thread_count == 0
                && (root.state() == State::Terminated || root.state() == State::Init)
            {
                log::info!(target: "system", "scheduler {} stopped", self.name);
                self.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    self.release_caller_thread();
                    return;
                }
            }
        }

        if self.root_thread.is_some() {
            // Caller-mode teardown must happen on the thread that owns the
            // scheduler fiber.
            fatal_assert!(
                current().map_or(false, |s| std::ptr::eq(Arc::as_ptr(&s), self)),
                "caller-mode scheduler stopped from a foreign thread"
            );
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if root_fiber.is_some() {
            self.tickle();
        }

        if let Some(ref root) = root_fiber {
            if !self.stopping() {
                root.call();
            }
        }

        let threads = {
            let mut threads = self.threads.lock().expect("scheduler threads lock");
            std::mem::take(&mut *threads)
        };
        for thread in threads {
            thread.join();
        }
        self.release_caller_thread();
    }

    // Undo the caller-thread claim so the thread can host another
    // scheduler later.
    fn release_caller_thread(&self) {
        if self.root_thread == Some(util::thread_id()) {
            CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = None);
            set_scheduler_fiber(std::ptr::null());
        }
    }

    // The per-worker dispatch loop.
    fn run(self: Arc<Self>) {
        log::debug!(target: "system", "scheduler {} dispatch loop entered", self.name);
        hook::set_enabled(true);
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        if let Some(ext) = self.ext() {
            ext.on_worker_start();
        }

        let tid = util::thread_id();
        if self.root_thread != Some(tid) {
            // Plain worker: its trampoline doubles as the scheduler fiber.
            let trampoline = Fiber::current();
            set_scheduler_fiber(Arc::as_ptr(&trampoline));
        }

        let idle_fiber = {
            let scheduler = self.clone();
            Fiber::new(move || scheduler.idle(), 0)
        };
        // Reused across bare-callback tasks.
        let mut scratch_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock().expect("scheduler queue lock");
                let mut idx = 0;
                while idx < queue.len() {
                    if let Some(thread) = queue[idx].thread {
                        if thread != tid {
                            // Pinned elsewhere: leave it, but make sure some
                            // other worker looks at the queue.
                            idx += 1;
                            tickle_me = true;
                            continue;
                        }
                    }
                    if let TaskKind::Fiber(ref fiber) = queue[idx].kind {
                        if fiber.state() == State::Running {
                            // Still winding down on another worker.
                            idx += 1;
                            continue;
                        }
                    }
                    task = queue.remove(idx);
                    self.active_count.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                tickle_me |= idx < queue.len();
            }
            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.kind) {
                Some(TaskKind::Fiber(fiber)) => {
                    if fiber.state() == State::Terminated || fiber.state() == State::Faulted {
                        // Stale entry for a finished fiber.
                        self.active_count.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(fiber),
                        State::Terminated | State::Faulted => {}
                        _ => fiber.set_state(State::Suspended),
                    }
                }
                Some(TaskKind::Callback(callback)) => {
                    let fiber = match scratch_fiber.take() {
                        Some(fiber) => {
                            fiber.reset(callback);
                            fiber
                        }
                        None => Fiber::new(callback, 0),
                    };
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(fiber),
                        // Finished: keep the fiber around for the next
                        // callback task.
                        State::Terminated | State::Faulted => scratch_fiber = Some(fiber),
                        // Parked somewhere (event slot, timer); whoever
                        // holds it will reschedule it.
                        _ => fiber.set_state(State::Suspended),
                    }
                }
                None => {
                    if idle_fiber.state() == State::Terminated {
                        log::info!(target: "system", "scheduler {} idle fiber finished", self.name);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::AcqRel);
                    match idle_fiber.state() {
                        State::Terminated | State::Faulted => {}
                        _ => idle_fiber.set_state(State::Suspended),
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("active", &self.active_count.load(Ordering::Relaxed))
            .field("idle", &self.idle_count.load(Ordering::Relaxed))
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn task_affinity_builder() {
        let task = Task::callback(|| {}).pinned_to(42);
        assert_eq!(task.thread, Some(42));
        let task = Task::fiber(Fiber::new(|| {}, 16 * 1024));
        assert_eq!(task.thread, None);
    }

    #[test]
    fn worker_mode_runs_scheduled_callbacks() {
        let scheduler = Scheduler::new(2, false, "sched-test");
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            scheduler.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn batch_schedule_runs_everything() {
        let scheduler = Scheduler::new(2, false, "sched-batch");
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                Task::callback(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        scheduler.schedule_batch(tasks);
        scheduler.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn yield_ready_interleaves_fibers() {
        let scheduler = Scheduler::new(1, false, "sched-yield");
        scheduler.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        // One batch, so both tasks are queued before either runs.
        scheduler.schedule_batch(vec![
            Task::callback(move || {
                order_a.lock().unwrap().push("a1");
                fiber::yield_ready();
                order_a.lock().unwrap().push("a2");
            }),
            Task::callback(move || {
                order_b.lock().unwrap().push("b");
            }),
        ]);
        scheduler.stop();
        assert_eq!(*order.lock().unwrap(), vec!["a1", "b", "a2"]);
    }

    #[test]
    fn affinity_pins_tasks_to_one_worker() {
        let scheduler = Scheduler::new(3, false, "sched-pin");
        scheduler.start();
        let target = scheduler.thread_ids()[0];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<Task> = (0..8)
            .map(|_| {
                let seen = seen.clone();
                Task::callback(move || {
                    seen.lock().unwrap().push(util::thread_id());
                })
                .pinned_to(target)
            })
            .collect();
        scheduler.schedule_batch(tasks);
        scheduler.stop();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|&tid| tid == target));
    }

    #[test]
    fn caller_mode_drains_on_stop() {
        let scheduler = Scheduler::new(1, true, "sched-caller");
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            scheduler.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Nothing ran yet: no worker threads, the queue drains in stop().
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
