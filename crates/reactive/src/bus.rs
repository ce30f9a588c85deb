//! Invalidation bus.
//!
//! Writers announce "collection C (optionally document D) changed" and every
//! result set whose trigger overlaps is told to re-check. Notifications can
//! carry the writer's fence so that listeners join it.

use crate::fence::WriteFence;
use hashbrown::HashMap;
use parking_lot::Mutex;
use ripple_core::{CursorDescriptor, DocId};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

/// What changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub collection: String,
    /// The touched document, if known. `None` means "anything in the collection".
    pub id: Option<DocId>,
    pub drop_collection: bool,
}

impl Notification {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: None,
            drop_collection: false,
        }
    }

    pub fn document(collection: impl Into<String>, id: DocId) -> Self {
        Self {
            collection: collection.into(),
            id: Some(id),
            drop_collection: false,
        }
    }

    pub fn dropped(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: None,
            drop_collection: true,
        }
    }

    /// Returns true if a listener registered for `trigger` should hear this.
    ///
    /// Collections must be equal; ids only narrow when both sides name one.
    pub fn overlaps(&self, trigger: &Notification) -> bool {
        if self.collection != trigger.collection {
            return false;
        }
        match (&self.id, &trigger.id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Listener callback. Receives the notification and the writer's fence, if any.
pub type ListenerFn = Arc<dyn Fn(&Notification, Option<&WriteFence>) + Send + Sync>;

type ListenerId = u64;

struct Listener {
    id: ListenerId,
    trigger: Notification,
    callback: ListenerFn,
}

#[derive(Default)]
struct BusState {
    by_collection: HashMap<String, Vec<Listener>>,
    next_id: ListenerId,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
}

impl BusInner {
    fn remove(&self, collection: &str, id: ListenerId) {
        let mut state = self.state.lock();
        if let Some(listeners) = state.by_collection.get_mut(collection) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                state.by_collection.remove(collection);
            }
        }
    }
}

/// Process-wide publish/subscribe channel for invalidations.
#[derive(Clone, Default)]
pub struct InvalidationBus {
    inner: Arc<BusInner>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for notifications overlapping `trigger`.
    pub fn listen(
        &self,
        trigger: Notification,
        callback: impl Fn(&Notification, Option<&WriteFence>) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listen_shared(trigger, Arc::new(callback))
    }

    /// Registers one listener per trigger a query needs.
    ///
    /// Queries that pin down their ids get one trigger per id; everything else
    /// listens to the whole collection.
    pub fn listen_all(
        &self,
        descriptor: &CursorDescriptor,
        callback: impl Fn(&Notification, Option<&WriteFence>) + Send + Sync + 'static,
    ) -> Vec<ListenerHandle> {
        let callback: ListenerFn = Arc::new(callback);
        let collection = descriptor.collection();
        match descriptor.selector().ids_matched() {
            Some(ids) => ids
                .into_iter()
                .map(|id| self.listen_shared(Notification::document(collection, id), callback.clone()))
                .collect(),
            None => vec![self.listen_shared(Notification::collection(collection), callback)],
        }
    }

    fn listen_shared(&self, trigger: Notification, callback: ListenerFn) -> ListenerHandle {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let collection = trigger.collection.clone();
        state
            .by_collection
            .entry(collection.clone())
            .or_default()
            .push(Listener { id, trigger, callback });
        ListenerHandle {
            bus: Arc::downgrade(&self.inner),
            collection,
            id,
            stopped: false,
        }
    }

    /// Delivers a notification to every overlapping listener.
    ///
    /// Listeners run on the caller's thread, outside the bus lock.
    pub fn notify(&self, notification: &Notification, fence: Option<&WriteFence>) {
        let targets: Vec<ListenerFn> = {
            let state = self.inner.state.lock();
            state
                .by_collection
                .get(&notification.collection)
                .map(|listeners| {
                    listeners
                        .iter()
                        .filter(|l| notification.overlaps(&l.trigger))
                        .map(|l| l.callback.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        trace!(
            collection = %notification.collection,
            listeners = targets.len(),
            "bus notify"
        );
        for callback in targets {
            callback(notification, fence);
        }
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().by_collection.values().map(Vec::len).sum()
    }
}

impl fmt::Debug for InvalidationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Unregisters its listener when stopped or dropped.
pub struct ListenerHandle {
    bus: Weak<BusInner>,
    collection: String,
    id: ListenerId,
    stopped: bool,
}

impl ListenerHandle {
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.collection, self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("collection", &self.collection)
            .field("id", &self.id)
            .field("stopped", &self.stopped)
            .finish()
    }
}
