//! Write fences.
//!
//! A fence lets a writer block until every result set affected by its writes
//! has reflected them and delivered the resulting callbacks. Each affected
//! result set begins a write on the fence when it is notified and commits it
//! once the effect is visible; the writer arms the fence and waits for it to
//! fire.

use parking_lot::{Condvar, Mutex};
use ripple_core::{Error, Result};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

type BeforeFireCallback = Box<dyn FnOnce(&WriteFence) + Send>;
type CompletionCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FenceState {
    outstanding: usize,
    armed: bool,
    fired: bool,
    retired: bool,
    before_fire: Vec<BeforeFireCallback>,
    completion: Vec<CompletionCallback>,
}

struct FenceInner {
    state: Mutex<FenceState>,
    fired: Condvar,
}

/// Counts outstanding writes and fires once all of them have committed.
///
/// Cloning yields another reference to the same fence.
#[derive(Clone)]
pub struct WriteFence {
    inner: Arc<FenceInner>,
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteFence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState::default()),
                fired: Condvar::new(),
            }),
        }
    }

    /// Registers an outstanding write.
    ///
    /// Fails once the fence has fired or been retired. Writes may still begin
    /// after arming, up to the moment the fence fires.
    pub fn begin_write(&self) -> Result<WriteToken> {
        let mut state = self.inner.state.lock();
        if state.retired {
            return Err(Error::FenceRetired);
        }
        if state.fired {
            return Err(Error::FenceFired);
        }
        state.outstanding += 1;
        Ok(WriteToken {
            fence: Some(self.clone()),
        })
    }

    /// Marks the fence ready to fire once no writes are outstanding.
    pub fn arm(&self) {
        self.inner.state.lock().armed = true;
        self.maybe_fire();
    }

    /// Registers a callback that runs just before the fence fires.
    ///
    /// The callback may begin further writes, which then delay the firing.
    pub fn on_before_fire(&self, callback: impl FnOnce(&WriteFence) + Send + 'static) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.fired {
            return Err(Error::FenceFired);
        }
        state.before_fire.push(Box::new(callback));
        Ok(())
    }

    /// Registers a callback that runs once the fence has fired. Runs it
    /// immediately if the fence already fired.
    pub fn on_all_committed(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.state.lock();
            if !state.fired {
                state.completion.push(Box::new(callback));
                return;
            }
        }
        run_guarded("completion", callback);
    }

    /// Arms the fence and blocks until it fires.
    pub fn arm_and_wait(&self) {
        self.arm();
        let mut state = self.inner.state.lock();
        while !state.fired {
            self.inner.fired.wait(&mut state);
        }
    }

    /// Marks the fence as retired. Later `begin_write` calls fail.
    pub fn retire(&self) {
        self.inner.state.lock().retired = true;
    }

    pub fn is_fired(&self) -> bool {
        self.inner.state.lock().fired
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().armed
    }

    /// Returns the number of writes begun but not yet committed.
    pub fn outstanding_writes(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    fn commit_one(&self) {
        {
            let mut state = self.inner.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.maybe_fire();
    }

    fn maybe_fire(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.fired || !state.armed || state.outstanding > 0 {
                return;
            }
            // Held across the before-fire callbacks so that writes they begin
            // and commit cannot fire the fence underneath us.
            state.outstanding += 1;
        }

        loop {
            let callbacks = std::mem::take(&mut self.inner.state.lock().before_fire);
            if callbacks.is_empty() {
                break;
            }
            for callback in callbacks {
                run_guarded("before-fire", || callback(self));
            }
        }

        let completion = {
            let mut state = self.inner.state.lock();
            state.outstanding -= 1;
            if state.outstanding > 0 {
                return;
            }
            state.fired = true;
            self.inner.fired.notify_all();
            std::mem::take(&mut state.completion)
        };
        for callback in completion {
            run_guarded("completion", callback);
        }
    }
}

impl fmt::Debug for WriteFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WriteFence")
            .field("outstanding", &state.outstanding)
            .field("armed", &state.armed)
            .field("fired", &state.fired)
            .field("retired", &state.retired)
            .finish()
    }
}

fn run_guarded(kind: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(kind, "write fence callback panicked");
    }
}

/// One outstanding write on a fence. Commits when consumed or dropped.
#[must_use = "dropping a write token commits it immediately"]
pub struct WriteToken {
    fence: Option<WriteFence>,
}

impl WriteToken {
    /// Commits the write.
    pub fn committed(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if let Some(fence) = self.fence.take() {
            fence.commit_one();
        }
    }
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.commit();
    }
}

impl fmt::Debug for WriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteToken")
            .field("committed", &self.fence.is_none())
            .finish()
    }
}
