//! Timers and throttling.
//!
//! One background thread serves every timer of a registry: the fallback
//! re-poll interval of polled result sets and the trailing edge of throttled
//! invalidations. Callbacks run on the timer thread outside its lock and
//! should only enqueue work.

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use ripple_core::{Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, trace};

pub type TimerId = u64;

enum TimerCallback {
    Once(Box<dyn FnOnce() + Send>),
    Repeating(Arc<dyn Fn() + Send + Sync>, Duration),
}

#[derive(Default)]
struct SchedulerState {
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    timers: HashMap<TimerId, TimerCallback>,
    next_id: TimerId,
    shutdown: bool,
}

#[derive(Default)]
struct SchedulerInner {
    state: Mutex<SchedulerState>,
    wake: Condvar,
}

/// Background timer thread.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        let inner = Arc::new(SchedulerInner::default());
        let worker = inner.clone();
        thread::Builder::new()
            .name("ripple-timer".into())
            .spawn(move || run_timers(&worker))
            .map_err(|e| Error::store("scheduler", format!("failed to spawn timer thread: {e}")))?;
        Ok(Self { inner })
    }

    /// Runs `callback` once after `delay`.
    pub fn schedule_after(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.inner
            .insert(Instant::now() + delay, TimerCallback::Once(Box::new(callback)))
    }

    /// Runs `callback` every `period` until cancelled.
    pub fn schedule_repeating(&self, period: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.inner.insert(
            Instant::now() + period,
            TimerCallback::Repeating(Arc::new(callback), period),
        )
    }

    /// Cancels a timer. A callback already running is not interrupted.
    pub fn cancel(&self, id: TimerId) {
        self.inner.cancel(id);
    }

    /// Returns the number of live timers.
    pub fn timer_count(&self) -> usize {
        self.inner.state.lock().timers.len()
    }
}

impl SchedulerInner {
    fn insert(&self, at: Instant, callback: TimerCallback) -> TimerId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.insert(id, callback);
        state.deadlines.push(Reverse((at, id)));
        self.wake.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) {
        self.state.lock().timers.remove(&id);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.timers.clear();
        self.inner.wake.notify_one();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("timers", &self.timer_count())
            .finish()
    }
}

fn run_timers(inner: &SchedulerInner) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(&Reverse((at, id))) = state.deadlines.peek() else {
            inner.wake.wait(&mut state);
            continue;
        };
        let now = Instant::now();
        if at > now {
            inner.wake.wait_until(&mut state, at);
            continue;
        }
        state.deadlines.pop();

        // Cancelled timers leave stale deadlines behind.
        let fire: Box<dyn FnOnce() + Send> = match state.timers.remove(&id) {
            None => continue,
            Some(TimerCallback::Once(callback)) => callback,
            Some(TimerCallback::Repeating(callback, period)) => {
                state
                    .timers
                    .insert(id, TimerCallback::Repeating(callback.clone(), period));
                state.deadlines.push(Reverse((now + period, id)));
                Box::new(move || callback())
            }
        };
        MutexGuard::unlocked(&mut state, || {
            if catch_unwind(AssertUnwindSafe(fire)).is_err() {
                error!(timer = id, "timer callback panicked");
            }
        });
    }
    trace!("timer thread exiting");
}

struct ThrottleState {
    last_run: Option<Instant>,
    trailing: Option<TimerId>,
    cancelled: bool,
}

struct ThrottleInner {
    state: Mutex<ThrottleState>,
    window: Duration,
    action: Box<dyn Fn() + Send + Sync>,
}

impl ThrottleInner {
    fn run_trailing(&self) {
        {
            let mut state = self.state.lock();
            state.trailing = None;
            if state.cancelled {
                return;
            }
            state.last_run = Some(Instant::now());
        }
        (self.action)();
    }
}

/// Rate limiter with leading and trailing edges.
///
/// The first call in a quiet period runs immediately. Calls within `window`
/// of the last run collapse into a single trailing run at the end of the
/// window.
pub struct Throttle {
    inner: Arc<ThrottleInner>,
    scheduler: Weak<SchedulerInner>,
}

impl Throttle {
    pub fn new(scheduler: &Scheduler, window: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                state: Mutex::new(ThrottleState {
                    last_run: None,
                    trailing: None,
                    cancelled: false,
                }),
                window,
                action: Box::new(action),
            }),
            scheduler: Arc::downgrade(&scheduler.inner),
        }
    }

    pub fn call(&self) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        if state.cancelled || state.trailing.is_some() {
            return;
        }
        let elapsed = state.last_run.map(|t| now.duration_since(t));
        match elapsed {
            Some(elapsed) if elapsed < self.inner.window => {
                let Some(scheduler) = self.scheduler.upgrade() else {
                    return;
                };
                let weak = Arc::downgrade(&self.inner);
                let trailing = TimerCallback::Once(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_trailing();
                    }
                }));
                let at = now + (self.inner.window - elapsed);
                state.trailing = Some(scheduler.insert(at, trailing));
            }
            _ => {
                state.last_run = Some(now);
                drop(state);
                (self.inner.action)();
            }
        }
    }

    /// Cancels any pending trailing run and ignores later calls.
    pub fn cancel(&self) {
        let trailing = {
            let mut state = self.inner.state.lock();
            state.cancelled = true;
            state.trailing.take()
        };
        if let (Some(id), Some(scheduler)) = (trailing, self.scheduler.upgrade()) {
            scheduler.cancel(id);
        }
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("window", &self.inner.window)
            .finish()
    }
}
