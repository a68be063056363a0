//! Deadline-ordered timer wheel.
//!
//! Timers are keyed by `(deadline, insertion id)` on the monotonic clock,
//! so equal deadlines fire in insertion order. The wheel itself never runs
//! callbacks: its owner (the [reactor](crate::reactor) idle loop) asks for
//! [`next_delay_ms`](TimerWheel::next_delay_ms) to bound its wait, then
//! collects due callbacks with [`drain_expired`](TimerWheel::drain_expired)
//! and schedules them. Inserting a new earliest deadline fires the
//! owner-provided front-change hook so a long wait can be cut short.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

/// Backward clock movement beyond this is treated as a clock jump and
/// expires the whole wheel.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    period_ms: u64,
    deadline_ms: u64,
    callback: Option<TimerCallback>,
    periodic: bool,
}

/// Handle to a scheduled timer. Dropping the handle does not cancel it.
pub struct Timer {
    id: u64,
    state: Mutex<TimerState>,
    wheel: Weak<WheelInner>,
}

impl Timer {
    /// Removes the timer from its wheel and clears the callback, so it can
    /// never fire again. Idempotent; returns whether it was still armed.
    pub fn cancel(&self) -> bool {
        let inner = match self.wheel.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let mut timers = inner.timers.write().expect("timer wheel lock");
        let mut state = self.state.lock().expect("timer state lock");
        if state.callback.is_none() {
            return false;
        }
        state.callback = None;
        timers.remove(&(state.deadline_ms, self.id));
        true
    }

    /// Pushes the deadline out to `now + period`, keeping the period.
    /// Returns `false` for cancelled or already-fired one-shot timers.
    pub fn refresh(&self) -> bool {
        let inner = match self.wheel.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let mut timers = inner.timers.write().expect("timer wheel lock");
        let mut state = self.state.lock().expect("timer state lock");
        if state.callback.is_none() {
            return false;
        }
        let entry = match timers.remove(&(state.deadline_ms, self.id)) {
            Some(entry) => entry,
            None => return false,
        };
        state.deadline_ms = clock::monotonic_ms() + state.period_ms;
        timers.insert((state.deadline_ms, self.id), entry);
        true
    }

    /// Changes the period; the deadline becomes `now + period` when
    /// `from_now`, otherwise `previous start + period`.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let inner = match self.wheel.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let front_changed;
        {
            let mut timers = inner.timers.write().expect("timer wheel lock");
            let mut state = self.state.lock().expect("timer state lock");
            if state.period_ms == period_ms && !from_now {
                return true;
            }
            if state.callback.is_none() {
                return false;
            }
            let entry = match timers.remove(&(state.deadline_ms, self.id)) {
                Some(entry) => entry,
                None => return false,
            };
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                state.deadline_ms - state.period_ms
            };
            state.period_ms = period_ms;
            state.deadline_ms = start + period_ms;
            let key = (state.deadline_ms, self.id);
            timers.insert(key, entry);
            front_changed = timers.keys().next() == Some(&key)
                && !inner.front_signalled.swap(true, Ordering::AcqRel);
        }
        if front_changed {
            inner.front_changed();
        }
        true
    }
}

struct WheelInner {
    timers: RwLock<BTreeMap<(u64, u64), Arc<Timer>>>,
    // Suppresses repeated front-change notifications between two
    // next_delay_ms reads.
    front_signalled: AtomicBool,
    previous_ms: Mutex<u64>,
    next_id: AtomicU64,
    on_front_changed: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl WheelInner {
    fn front_changed(&self) {
        if let Some(hook) = self.on_front_changed.get() {
            hook();
        }
    }

    // A drain observing time more than an hour before the previous drain
    // means the clock jumped: treat every deadline as already past.
    fn detect_rollover(&self, now_ms: u64) -> bool {
        let mut previous = self.previous_ms.lock().expect("timer clock lock");
        let rollover = now_ms < previous.saturating_sub(ROLLOVER_THRESHOLD_MS);
        *previous = now_ms;
        rollover
    }
}

/// Ordered set of one-shot and periodic timers.
pub struct TimerWheel {
    inner: Arc<WheelInner>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            inner: Arc::new(WheelInner {
                timers: RwLock::new(BTreeMap::new()),
                front_signalled: AtomicBool::new(false),
                previous_ms: Mutex::new(clock::monotonic_ms()),
                next_id: AtomicU64::new(1),
                on_front_changed: OnceCell::new(),
            }),
        }
    }

    /// Installs the hook invoked when an insert becomes the new earliest
    /// deadline. Must not acquire wheel locks.
    pub(crate) fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        fatal_assert!(
            self.inner.on_front_changed.set(Box::new(hook)).is_ok(),
            "timer wheel front hook installed twice"
        );
    }

    /// Schedules `callback` to fire `period_ms` from now; a periodic timer
    /// re-arms itself with the same period after each fire.
    pub fn add_timer<F>(&self, period_ms: u64, callback: F, periodic: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_impl(period_ms, Arc::new(callback), periodic)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback is dropped
    /// silently if `witness` no longer resolves at fire time.
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
        let conditional = move || {
            if witness.upgrade().is_some() {
                callback();
            }
        };
        self.add_timer_impl(period_ms, Arc::new(conditional), periodic)
    }

    fn add_timer_impl(
        &self,
        period_ms: u64,
        callback: TimerCallback,
        periodic: bool,
    ) -> Arc<Timer> {
        let inner = &self.inner;
        let deadline_ms = clock::monotonic_ms() + period_ms;
        let timer = Arc::new(Timer {
            id: inner.next_id.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                period_ms,
                deadline_ms,
                callback: Some(callback),
                periodic,
            }),
            wheel: Arc::downgrade(inner),
        });

        let front_changed;
        {
            let mut timers = inner.timers.write().expect("timer wheel lock");
            let key = (deadline_ms, timer.id);
            timers.insert(key, timer.clone());
            front_changed = timers.keys().next() == Some(&key)
                && !inner.front_signalled.swap(true, Ordering::AcqRel);
        }
        if front_changed {
            inner.front_changed();
        }
        timer
    }

    /// Milliseconds until the earliest deadline, saturated to zero;
    /// `None` when the wheel is empty.
    pub fn next_delay_ms(&self) -> Option<u64> {
        let timers = self.inner.timers.read().expect("timer wheel lock");
        self.inner.front_signalled.store(false, Ordering::Release);
        let (&(deadline_ms, _), _) = timers.iter().next()?;
        Some(deadline_ms.saturating_sub(clock::monotonic_ms()))
    }

    pub fn has_timers(&self) -> bool {
        !self.inner.timers.read().expect("timer wheel lock").is_empty()
    }

    /// Removes every timer due at `now` or earlier and returns their
    /// callbacks in firing order; periodic timers are re-armed at
    /// `now + period`.
    pub fn drain_expired(&self) -> Vec<TimerCallback> {
        let now_ms = clock::monotonic_ms();
        {
            let timers = self.inner.timers.read().expect("timer wheel lock");
            if timers.is_empty() {
                return Vec::new();
            }
        }

        let mut timers = self.inner.timers.write().expect("timer wheel lock");
        if timers.is_empty() {
            return Vec::new();
        }
        let rollover = self.inner.detect_rollover(now_ms);
        if !rollover {
            match timers.keys().next() {
                Some(&(deadline_ms, _)) if deadline_ms > now_ms => return Vec::new(),
                _ => {}
            }
        }

        let expired = if rollover {
            std::mem::take(&mut *timers)
        } else {
            let pending = timers.split_off(&(now_ms + 1, 0));
            std::mem::replace(&mut *timers, pending)
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let mut state = timer.state.lock().expect("timer state lock");
            let callback = match state.callback.clone() {
                Some(callback) => callback,
                None => continue,
            };
            callbacks.push(callback);
            if state.periodic {
                state.deadline_ms = now_ms + state.period_ms;
                let key = (state.deadline_ms, timer.id);
                drop(state);
                timers.insert(key, timer);
            } else {
                state.callback = None;
            }
        }
        callbacks
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
