//! Live result sets.
//!
//! A `LiveResultSet` is the shared, deduplicated state behind every observer
//! of one (descriptor, ordered) pair: the last snapshot delivered, the
//! attached handles and the writes waiting for the next poll. All work on a
//! result set runs on its serialized task queue; the state mutex only guards
//! the short critical sections that other threads (writers, `stop`, the
//! registry) need.
//!
//! A poll cycle:
//! 1. takes the writes pending so far,
//! 2. queries the store,
//! 3. diffs against the previous snapshot and fans the events out to every
//!    live handle,
//! 4. swaps in the new snapshot,
//! 5. commits the writes it took.

use crate::fence::WriteToken;
use crate::handle::{HandleId, ObserveCallbacks, ResultSetId};
use crate::queue::TaskQueue;
use crate::registry::{EngineContext, ObserveKey, RegistryInner};
use parking_lot::{Condvar, Mutex};
use ripple_core::{CursorDescriptor, DocId, Document, Error, Result};
use ripple_diff::{
    diff_snapshots, diff_unordered, stabilize_ties, ChangeBatch, ChangeEvent, IdMap, Snapshot,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, debug_span, error, trace, warn};

/// How a result set learns about changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DriverKind {
    /// Re-runs the query on invalidation and on a fallback interval.
    Polling,
    /// Applies change-log entries document by document.
    ChangeLog,
}

/// Result of one poll, as reported to a [`PollObserver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { events: usize },
    Failed,
}

/// Hook notified around every poll. Used for instrumentation and tests.
pub trait PollObserver: Send + Sync {
    fn poll_started(&self, _result_set: ResultSetId) {}
    fn poll_finished(&self, _result_set: ResultSetId, _outcome: PollOutcome) {}
}

/// Point-in-time view of a result set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResultSetStats {
    pub id: ResultSetId,
    pub collection: String,
    pub ordered: bool,
    pub driver: DriverKind,
    pub handles: usize,
    pub documents: usize,
    pub completed_polls: u64,
    pub ready: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// One attached observer.
pub(crate) struct HandleEntry {
    id: HandleId,
    callbacks: ObserveCallbacks,
    stopped: AtomicBool,
}

impl HandleEntry {
    pub(crate) fn new(id: HandleId, callbacks: ObserveCallbacks) -> Self {
        Self {
            id,
            callbacks,
            stopped: AtomicBool::new(false),
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.callbacks.dispatch_guarded(self.id, event);
        }
    }
}

type StopFn = Box<dyn FnOnce() + Send>;

struct ResultSetState {
    snapshot: Arc<Snapshot>,
    handles: BTreeMap<HandleId, Arc<HandleEntry>>,
    pending_writes: Vec<WriteToken>,
    /// Polls queued but not yet started; at most one outside of suspension.
    polls_scheduled: usize,
    /// Handles found in the registry whose add task has not run yet.
    add_tasks_in_flight: usize,
    readiness: Readiness,
    stopped: bool,
    completed_polls: u64,
    stop_callbacks: Vec<StopFn>,
}

impl ResultSetState {
    fn should_tear_down(&self) -> bool {
        !self.stopped && self.handles.is_empty() && self.add_tasks_in_flight == 0
    }

    /// Marks the set stopped and hands back what must be released outside
    /// the lock.
    fn begin_teardown(&mut self) -> Teardown {
        self.stopped = true;
        for handle in self.handles.values() {
            handle.stopped.store(true, Ordering::SeqCst);
        }
        self.handles.clear();
        Teardown {
            callbacks: std::mem::take(&mut self.stop_callbacks),
            writes: std::mem::take(&mut self.pending_writes),
        }
    }
}

#[must_use]
struct Teardown {
    callbacks: Vec<StopFn>,
    writes: Vec<WriteToken>,
}

pub(crate) struct LiveResultSet {
    id: ResultSetId,
    key: ObserveKey,
    descriptor: CursorDescriptor,
    ordered: bool,
    driver: DriverKind,
    ctx: Arc<EngineContext>,
    registry: Weak<RegistryInner>,
    queue: TaskQueue,
    state: Mutex<ResultSetState>,
    ready: Condvar,
}

impl LiveResultSet {
    /// Creates a result set with one add task already accounted for: the
    /// observer that caused its creation.
    pub(crate) fn new(
        id: ResultSetId,
        key: ObserveKey,
        descriptor: CursorDescriptor,
        driver: DriverKind,
        ctx: Arc<EngineContext>,
        registry: Weak<RegistryInner>,
    ) -> Result<Arc<Self>> {
        let ordered = key.ordered();
        let queue = TaskQueue::new(format!("ripple-rs-{id}"), id)?;
        Ok(Arc::new(Self {
            id,
            key,
            descriptor,
            ordered,
            driver,
            ctx,
            registry,
            queue,
            state: Mutex::new(ResultSetState {
                snapshot: Arc::new(Snapshot::empty(ordered)),
                handles: BTreeMap::new(),
                pending_writes: Vec::new(),
                polls_scheduled: 0,
                add_tasks_in_flight: 1,
                readiness: Readiness::Pending,
                stopped: false,
                completed_polls: 0,
                stop_callbacks: Vec::new(),
            }),
            ready: Condvar::new(),
        }))
    }

    pub(crate) fn id(&self) -> ResultSetId {
        self.id
    }

    pub(crate) fn descriptor(&self) -> &CursorDescriptor {
        &self.descriptor
    }

    pub(crate) fn driver(&self) -> DriverKind {
        self.driver
    }

    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub(crate) fn polls_scheduled(&self) -> usize {
        self.state.lock().polls_scheduled
    }

    pub(crate) fn stats(&self) -> ResultSetStats {
        let state = self.state.lock();
        ResultSetStats {
            id: self.id,
            collection: self.descriptor.collection().to_string(),
            ordered: self.ordered,
            driver: self.driver,
            handles: state.handles.len(),
            documents: state.snapshot.len(),
            completed_polls: state.completed_polls,
            ready: state.readiness == Readiness::Ready,
        }
    }

    /// Reserves a slot for a new handle. Fails if the set is torn down.
    pub(crate) fn try_begin_add(&self) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        state.add_tasks_in_flight += 1;
        true
    }

    /// Registers cleanup that runs once, at teardown.
    pub(crate) fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock();
            if !state.stopped {
                state.stop_callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Parks a fence write until the next poll that starts after this call.
    pub(crate) fn push_pending_write(&self, token: WriteToken) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.pending_writes.push(token);
        }
    }

    /// Queues a poll unless one is already queued and not yet started.
    pub(crate) fn ensure_poll_is_scheduled(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.stopped || state.polls_scheduled > 0 {
                return;
            }
            state.polls_scheduled += 1;
        }
        let this = self.clone();
        if let Err(e) = self.queue.queue_task(move || this.poll_cycle()) {
            warn!(result_set = self.id, error = %e, "could not queue poll");
            let mut state = self.state.lock();
            state.polls_scheduled = state.polls_scheduled.saturating_sub(1);
        }
    }

    /// Runs a poll right now. Only called from this set's own tasks.
    fn poll_inline(self: &Arc<Self>) {
        self.state.lock().polls_scheduled += 1;
        self.poll_cycle();
    }

    /// Blocks polling: once this returns no poll runs until `resume_polling`.
    ///
    /// Works by pretending a poll is queued, which suppresses scheduling,
    /// then draining whatever is already on the queue.
    pub(crate) fn suspend_polling(&self) -> Result<()> {
        self.state.lock().polls_scheduled += 1;
        self.queue.flush()
    }

    /// Undoes `suspend_polling` by running one poll synchronously.
    pub(crate) fn resume_polling(self: &Arc<Self>) -> Result<()> {
        let scheduled = self.polls_scheduled();
        if scheduled != 1 {
            warn!(result_set = self.id, scheduled, "resume_polling without a matching suspend");
        }
        let this = self.clone();
        self.queue.run_task(move || this.poll_cycle())
    }

    pub(crate) fn poll_cycle(self: &Arc<Self>) {
        let (writes, first, old) = {
            let mut state = self.state.lock();
            state.polls_scheduled = state.polls_scheduled.saturating_sub(1);
            if state.stopped {
                return;
            }
            (
                std::mem::take(&mut state.pending_writes),
                state.readiness == Readiness::Pending,
                state.snapshot.clone(),
            )
        };

        let span = debug_span!("poll", result_set = self.id, collection = %self.descriptor.collection());
        let _guard = span.enter();
        let observer = self.ctx.poll_observer();
        if let Some(observer) = &observer {
            observer.poll_started(self.id);
        }

        let docs = match self.ctx.store.find(&self.descriptor) {
            Ok(docs) => docs,
            Err(e) => {
                if let Some(observer) = &observer {
                    observer.poll_finished(self.id, PollOutcome::Failed);
                }
                if first {
                    error!(error = %e, "initial query failed");
                    self.fail_initial(e.to_string());
                } else {
                    warn!(error = %e, "poll failed, keeping previous results");
                }
                drop(writes);
                return;
            }
        };

        let docs = match (&*old, self.descriptor.options().sort.as_ref()) {
            (Snapshot::Ordered(prev), sort) => stabilize_ties(prev, docs, sort),
            _ => docs,
        };
        let new = Arc::new(Snapshot::from_documents(self.ordered, docs));
        let mut batch = ChangeBatch::deferred();
        diff_snapshots(&old, &new, &mut batch);
        let events = batch.into_events();
        self.fan_out(&events);

        {
            let mut state = self.state.lock();
            if !state.stopped {
                state.snapshot = new;
                state.completed_polls += 1;
                if state.readiness == Readiness::Pending {
                    state.readiness = Readiness::Ready;
                    self.ready.notify_all();
                }
            }
        }
        trace!(events = events.len(), writes = writes.len(), "poll complete");
        if let Some(observer) = &observer {
            observer.poll_finished(self.id, PollOutcome::Completed { events: events.len() });
        }
        drop(writes);
    }

    /// Re-checks one document against the query and patches the snapshot.
    ///
    /// Runs on the queue. `None` means the document no longer exists.
    pub(crate) fn apply_document(self: &Arc<Self>, id: &DocId, current: Option<Document>) {
        let old = {
            let state = self.state.lock();
            if state.stopped {
                return;
            }
            state.snapshot.clone()
        };
        let current = current
            .filter(|doc| self.descriptor.matches(doc))
            .map(|doc| self.descriptor.project(&doc));
        let before = old.get(id);
        if before == current.as_ref() {
            return;
        }

        let old_map: IdMap = before.map(|d| (id.clone(), d.clone())).into_iter().collect();
        let new_map: IdMap = current.iter().map(|d| (id.clone(), d.clone())).collect();
        let mut batch = ChangeBatch::deferred();
        diff_unordered(&old_map, &new_map, &mut batch);
        let events = batch.into_events();

        let mut next = (*old).clone();
        match current {
            Some(doc) => next.upsert(doc),
            None => {
                next.remove(id);
            }
        }
        self.fan_out(&events);

        let mut state = self.state.lock();
        if !state.stopped {
            state.snapshot = Arc::new(next);
        }
    }

    /// Handles a change-log entry this set could not apply document-wise.
    pub(crate) fn requery(self: &Arc<Self>, reason: &str) {
        debug!(result_set = self.id, reason, "re-polling from change log");
        self.poll_inline();
    }

    fn fan_out(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let handles: Vec<Arc<HandleEntry>> = self.state.lock().handles.values().cloned().collect();
        for event in events {
            for handle in &handles {
                handle.deliver(event);
            }
        }
    }

    /// Attaches a handle, replays the current snapshot to it as adds and
    /// waits until the set is ready.
    pub(crate) fn add_handle_and_send_initial_adds(self: &Arc<Self>, entry: Arc<HandleEntry>) -> Result<()> {
        let handle_id = entry.id;
        let this = self.clone();
        let attached = self.queue.run_task(move || this.attach_handle(entry));
        let attached = match attached {
            Ok(attached) => attached,
            // The task never ran, so its slot is still reserved.
            Err(e) => {
                self.release_add_task();
                return Err(e);
            }
        };
        attached?;

        let mut state = self.state.lock();
        loop {
            let failed = match &state.readiness {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(message) => Some(message.clone()),
                Readiness::Pending => None,
            };
            if let Some(message) = failed {
                drop(state);
                self.remove_handle(handle_id);
                return Err(Error::initial_query(self.descriptor.collection(), message));
            }
            if state.stopped {
                return Err(Error::ResultSetStopped { result_set: self.id });
            }
            self.ready.wait(&mut state);
        }
    }

    fn attach_handle(&self, entry: Arc<HandleEntry>) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            state.add_tasks_in_flight = state.add_tasks_in_flight.saturating_sub(1);
            if let Readiness::Failed(message) = &state.readiness {
                return Err(Error::initial_query(self.descriptor.collection(), message.clone()));
            }
            if state.stopped {
                return Err(Error::ResultSetStopped { result_set: self.id });
            }
            if state.handles.contains_key(&entry.id) {
                return Err(Error::DuplicateHandle {
                    result_set: self.id,
                    handle: entry.id,
                });
            }
            state.handles.insert(entry.id, entry.clone());
            state.snapshot.clone()
        };

        let mut sink = |event: ChangeEvent| entry.deliver(&event);
        let mut batch = ChangeBatch::immediate(&mut sink);
        snapshot.initial_adds(&mut batch);
        debug!(result_set = self.id, handle = entry.id, initial = batch.len(), "handle attached");
        Ok(())
    }

    fn release_add_task(&self) {
        let teardown = {
            let mut state = self.state.lock();
            state.add_tasks_in_flight = state.add_tasks_in_flight.saturating_sub(1);
            state.should_tear_down().then(|| state.begin_teardown())
        };
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown);
        }
    }

    /// Detaches a handle. Tears the set down when it was the last one.
    pub(crate) fn remove_handle(&self, handle: HandleId) {
        let teardown = {
            let mut state = self.state.lock();
            if let Some(entry) = state.handles.remove(&handle) {
                entry.stopped.store(true, Ordering::SeqCst);
            }
            state.should_tear_down().then(|| state.begin_teardown())
        };
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown);
        }
    }

    /// Tears the set down unconditionally.
    pub(crate) fn stop(&self) {
        let teardown = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.begin_teardown()
        };
        self.finish_teardown(teardown);
    }

    /// Tears down a set whose driver could not be started. Observers waiting
    /// for the initial query see the failure.
    pub(crate) fn fail_start(&self, error: &Error) {
        error!(result_set = self.id, error = %error, "driver failed to start");
        self.fail_initial(error.to_string());
    }

    fn fail_initial(&self, message: String) {
        let teardown = {
            let mut state = self.state.lock();
            state.readiness = Readiness::Failed(message);
            self.ready.notify_all();
            (!state.stopped).then(|| state.begin_teardown())
        };
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown);
        }
    }

    fn finish_teardown(&self, teardown: Teardown) {
        self.ready.notify_all();
        for callback in teardown.callbacks {
            callback();
        }
        drop(teardown.writes);
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id, &self.key);
        }
        debug!(result_set = self.id, collection = %self.descriptor.collection(), "result set torn down");
    }
}

impl fmt::Debug for LiveResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveResultSet")
            .field("id", &self.id)
            .field("collection", &self.descriptor.collection())
            .field("ordered", &self.ordered)
            .field("driver", &self.driver)
            .finish()
    }
}
