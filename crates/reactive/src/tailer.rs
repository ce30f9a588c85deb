//! Change-log tailer.
//!
//! A single background thread follows the store's change log and hands each
//! entry to the listeners registered for its collection. The tailer remembers
//! the last marker it delivered, so after a read failure it reconnects and
//! resumes exactly where it left off. Entries are never delivered twice.
//!
//! Writers use [`ChangeLogTailer::call_when_processed_latest`] to learn when
//! everything they wrote has been delivered.

use crate::config::LiveQueryConfig;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use ripple_core::{Error, Result};
use ripple_store::{ChangeLogEntry, ChangeLogSource, Marker};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connection phase of the tailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailerPhase {
    Disconnected,
    Connecting,
    Streaming,
    Stopped,
}

type EntryFn = Arc<dyn Fn(&ChangeLogEntry) + Send + Sync>;
type ProcessedFn = Box<dyn FnOnce() + Send>;

struct TailerState {
    phase: TailerPhase,
    /// `None` until the first successful connection positions the tailer.
    last_delivered: Option<Marker>,
    positioned: bool,
    listeners: HashMap<String, Vec<(u64, EntryFn)>>,
    next_listener: u64,
    /// Sorted by marker.
    pending: Vec<(Marker, ProcessedFn)>,
}

impl TailerState {
    fn is_stopped(&self) -> bool {
        self.phase == TailerPhase::Stopped
    }

    /// Removes the callbacks whose marker has been delivered.
    fn take_processed(&mut self) -> Vec<ProcessedFn> {
        if !self.positioned {
            return Vec::new();
        }
        let Some(last) = self.last_delivered else {
            return self.pending.drain(..).map(|(_, f)| f).collect();
        };
        let upto = self.pending.partition_point(|(m, _)| *m <= last);
        self.pending.drain(..upto).map(|(_, f)| f).collect()
    }
}

struct TailerInner {
    source: Arc<dyn ChangeLogSource>,
    idle_interval: Duration,
    reconnect_delay: Duration,
    batch_size: usize,
    state: Mutex<TailerState>,
    wake: Condvar,
}

impl TailerInner {
    /// Sleeps for `timeout` unless stopped first. Returns false once stopped.
    fn pause(&self, state: &mut MutexGuard<'_, TailerState>, timeout: Duration) -> bool {
        if state.is_stopped() {
            return false;
        }
        self.wake.wait_for(state, timeout);
        !state.is_stopped()
    }

    fn run(&self) {
        loop {
            let (after, positioned) = {
                let state = self.state.lock();
                if state.is_stopped() {
                    break;
                }
                (state.last_delivered, state.positioned)
            };

            if !positioned {
                self.position();
                continue;
            }

            match self.source.read_after(after, self.batch_size) {
                Ok(entries) if entries.is_empty() => {
                    let processed = self.state.lock().take_processed();
                    run_callbacks(processed);
                    let mut state = self.state.lock();
                    if !self.pause(&mut state, self.idle_interval) {
                        break;
                    }
                }
                Ok(entries) => self.deliver(after, entries),
                Err(e) => {
                    let mut state = self.state.lock();
                    if state.is_stopped() {
                        break;
                    }
                    warn!(error = %e, last = ?state.last_delivered, "change log read failed, reconnecting");
                    state.phase = TailerPhase::Connecting;
                    if !self.pause(&mut state, self.reconnect_delay) {
                        break;
                    }
                    state.phase = TailerPhase::Streaming;
                }
            }
        }
        debug!("change log tailer exiting");
    }

    /// Positions a fresh tailer at the newest entry; history is not replayed.
    fn position(&self) {
        {
            let mut state = self.state.lock();
            if state.is_stopped() {
                return;
            }
            state.phase = TailerPhase::Connecting;
        }
        match self.source.latest_marker() {
            Ok(latest) => {
                let mut state = self.state.lock();
                if state.is_stopped() {
                    return;
                }
                state.last_delivered = latest;
                state.positioned = true;
                state.phase = TailerPhase::Streaming;
                self.wake.notify_all();
                info!(start = ?latest, "change log tailer streaming");
            }
            Err(e) => {
                let mut state = self.state.lock();
                warn!(error = %e, "change log unavailable, retrying");
                self.pause(&mut state, self.reconnect_delay);
            }
        }
    }

    fn deliver(&self, after: Option<Marker>, entries: Vec<ChangeLogEntry>) {
        for entry in entries {
            if after.is_some_and(|after| entry.marker <= after) {
                continue;
            }
            let listeners: Vec<EntryFn> = {
                let state = self.state.lock();
                if state.is_stopped() {
                    return;
                }
                if state.last_delivered.is_some_and(|last| entry.marker <= last) {
                    continue;
                }
                state
                    .listeners
                    .get(&entry.collection)
                    .map(|ls| ls.iter().map(|(_, f)| f.clone()).collect())
                    .unwrap_or_default()
            };
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&entry))).is_err() {
                    error!(marker = %entry.marker, "change log listener panicked");
                }
            }
            let processed = {
                let mut state = self.state.lock();
                state.last_delivered = Some(entry.marker);
                state.take_processed()
            };
            run_callbacks(processed);
        }
    }

    fn remove_listener(&self, collection: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(ls) = state.listeners.get_mut(collection) {
            ls.retain(|(lid, _)| *lid != id);
            if ls.is_empty() {
                state.listeners.remove(collection);
            }
        }
    }
}

fn run_callbacks(callbacks: Vec<ProcessedFn>) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            error!("change log catch-up callback panicked");
        }
    }
}

/// Follows a store's change log on a background thread.
///
/// Dropping the tailer stops it.
pub struct ChangeLogTailer {
    inner: Arc<TailerInner>,
}

impl ChangeLogTailer {
    pub fn start(source: Arc<dyn ChangeLogSource>, config: &LiveQueryConfig) -> Result<Self> {
        let inner = Arc::new(TailerInner {
            source,
            idle_interval: config.tailer_idle_interval,
            reconnect_delay: config.tailer_reconnect_delay,
            batch_size: config.tailer_batch_size.max(1),
            state: Mutex::new(TailerState {
                phase: TailerPhase::Disconnected,
                last_delivered: None,
                positioned: false,
                listeners: HashMap::new(),
                next_listener: 0,
                pending: Vec::new(),
            }),
            wake: Condvar::new(),
        });
        let worker = inner.clone();
        thread::Builder::new()
            .name("ripple-tailer".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::store("change_log", format!("failed to spawn tailer: {e}")))?;
        Ok(Self { inner })
    }

    /// Registers a listener for entries of `collection`.
    ///
    /// Blocks until the tailer has positioned itself, so every entry written
    /// after this returns reaches the listener. The listener runs on the
    /// tailer thread and must not block.
    pub fn on_entry(
        &self,
        collection: impl Into<String>,
        listener: impl Fn(&ChangeLogEntry) + Send + Sync + 'static,
    ) -> Result<TailerListener> {
        let collection = collection.into();
        let mut state = self.inner.state.lock();
        while !state.positioned && !state.is_stopped() {
            self.inner.wake.wait(&mut state);
        }
        if state.is_stopped() {
            return Err(Error::TailerStopped);
        }
        let id = state.next_listener;
        state.next_listener += 1;
        state
            .listeners
            .entry(collection.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        Ok(TailerListener {
            tailer: Arc::downgrade(&self.inner),
            collection,
            id,
        })
    }

    /// Runs `callback` once every entry written before this call has been
    /// delivered to listeners.
    ///
    /// Reading the newest marker is retried until it succeeds or the tailer
    /// stops. Stopping the tailer releases callbacks still waiting.
    pub fn call_when_processed_latest(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        let latest = loop {
            match self.inner.source.latest_marker() {
                Ok(latest) => break latest,
                Err(e) => {
                    let mut state = self.inner.state.lock();
                    warn!(error = %e, "reading newest change log marker failed, retrying");
                    if !self.inner.pause(&mut state, self.inner.reconnect_delay) {
                        return Err(Error::TailerStopped);
                    }
                }
            }
        };

        let mut state = self.inner.state.lock();
        if state.is_stopped() {
            return Err(Error::TailerStopped);
        }
        let waiting_for = latest.filter(|&latest| {
            !(state.positioned && state.last_delivered.is_some_and(|last| last >= latest))
        });
        let Some(marker) = waiting_for else {
            drop(state);
            callback();
            return Ok(());
        };
        let at = state.pending.partition_point(|(m, _)| *m <= marker);
        state.pending.insert(at, (marker, Box::new(callback)));
        self.inner.wake.notify_all();
        Ok(())
    }

    /// Blocks until everything written before this call has been delivered.
    pub fn wait_until_caught_up(&self) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.call_when_processed_latest(move || {
            let _ = tx.send(());
        })?;
        rx.recv().map_err(|_| Error::TailerStopped)
    }

    /// Stops the tailer and releases pending catch-up callbacks.
    pub fn stop(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            if state.is_stopped() {
                return;
            }
            state.phase = TailerPhase::Stopped;
            state.listeners.clear();
            self.inner.wake.notify_all();
            std::mem::take(&mut state.pending)
        };
        run_callbacks(released.into_iter().map(|(_, f)| f).collect());
    }

    pub fn phase(&self) -> TailerPhase {
        self.inner.state.lock().phase
    }

    pub fn last_delivered(&self) -> Option<Marker> {
        self.inner.state.lock().last_delivered
    }
}

impl Drop for ChangeLogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ChangeLogTailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChangeLogTailer")
            .field("phase", &state.phase)
            .field("last_delivered", &state.last_delivered)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Unregisters its change-log listener when dropped.
pub struct TailerListener {
    tailer: Weak<TailerInner>,
    collection: String,
    id: u64,
}

impl Drop for TailerListener {
    fn drop(&mut self) {
        if let Some(tailer) = self.tailer.upgrade() {
            tailer.remove_listener(&self.collection, self.id);
        }
    }
}

impl fmt::Debug for TailerListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailerListener")
            .field("collection", &self.collection)
            .field("id", &self.id)
            .finish()
    }
}
