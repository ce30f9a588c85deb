//! Live query registry.
//!
//! The registry deduplicates observers: every `observe_changes` call for the
//! same canonical descriptor and callback flavor shares one `LiveResultSet`,
//! so N observers cost one query per poll. It also owns the process-wide
//! machinery shared by all result sets: the invalidation bus, the timer
//! thread and, when the store exposes one, the change-log tailer.

use crate::bus::{InvalidationBus, Notification};
use crate::change_log_driver;
use crate::config::LiveQueryConfig;
use crate::fence::WriteFence;
use crate::handle::{HandleId, ObserveCallbacks, ObserveHandle, ResultSetId};
use crate::polling;
use crate::queue;
use crate::result_set::{DriverKind, HandleEntry, LiveResultSet, PollObserver, ResultSetStats};
use crate::scheduler::Scheduler;
use crate::tailable;
use crate::tailer::ChangeLogTailer;
use crate::writer::WritePath;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use ripple_core::{CursorDescriptor, Error, Result};
use ripple_store::{ChangeLogSource, DocumentStore, DocumentWriter};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Dedup key: the descriptor's canonical encoding plus the callback flavor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ObserveKey {
    descriptor: Vec<u8>,
    ordered: bool,
}

impl ObserveKey {
    pub(crate) fn new(descriptor: &CursorDescriptor, ordered: bool) -> Result<Self> {
        Ok(Self {
            descriptor: descriptor.canonical_bytes()?,
            ordered,
        })
    }

    pub(crate) fn ordered(&self) -> bool {
        self.ordered
    }
}

/// Machinery shared by every result set of a registry.
pub(crate) struct EngineContext {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) bus: InvalidationBus,
    pub(crate) scheduler: Scheduler,
    pub(crate) tailer: Option<ChangeLogTailer>,
    pub(crate) config: LiveQueryConfig,
    poll_observer: RwLock<Option<Arc<dyn PollObserver>>>,
}

impl EngineContext {
    pub(crate) fn poll_observer(&self) -> Option<Arc<dyn PollObserver>> {
        self.poll_observer.read().clone()
    }

    fn driver_for(&self, descriptor: &CursorDescriptor, ordered: bool) -> DriverKind {
        let eligible = self.config.use_change_log && !ordered && descriptor.supports_change_log();
        if eligible && self.tailer.is_some() {
            DriverKind::ChangeLog
        } else {
            DriverKind::Polling
        }
    }
}

#[cfg(test)]
impl EngineContext {
    /// A standalone context for driving result sets without a registry.
    pub(crate) fn standalone(
        store: Arc<ripple_store::MemoryStore>,
        change_log: bool,
        config: LiveQueryConfig,
    ) -> Arc<Self> {
        let tailer = change_log.then(|| ChangeLogTailer::start(store.clone(), &config).unwrap());
        Arc::new(Self {
            store,
            bus: InvalidationBus::new(),
            scheduler: Scheduler::new().unwrap(),
            tailer,
            config,
            poll_observer: RwLock::new(None),
        })
    }
}

#[derive(Default)]
struct RegistryTable {
    by_key: HashMap<ObserveKey, ResultSetId>,
    sets: HashMap<ResultSetId, Arc<LiveResultSet>>,
    next_result_set: ResultSetId,
    next_handle: HandleId,
}

pub(crate) struct RegistryInner {
    ctx: Arc<EngineContext>,
    writer: Option<Arc<dyn DocumentWriter>>,
    table: Mutex<RegistryTable>,
}

impl RegistryInner {
    /// Removes a torn-down set. The key mapping is only dropped if it still
    /// points at this set; a replacement may already own it.
    pub(crate) fn unregister(&self, id: ResultSetId, key: &ObserveKey) {
        let mut table = self.table.lock();
        table.sets.remove(&id);
        if table.by_key.get(key) == Some(&id) {
            table.by_key.remove(key);
        }
    }

    pub(crate) fn detach(&self, result_set: ResultSetId, handle: HandleId) {
        let rs = self.table.lock().sets.get(&result_set).cloned();
        if let Some(rs) = rs {
            rs.remove_handle(handle);
        }
    }

    fn lookup(&self, id: ResultSetId) -> Option<Arc<LiveResultSet>> {
        self.table.lock().sets.get(&id).cloned()
    }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    store: Arc<dyn DocumentStore>,
    writer: Option<Arc<dyn DocumentWriter>>,
    change_log: Option<Arc<dyn ChangeLogSource>>,
    config: LiveQueryConfig,
}

impl RegistryBuilder {
    /// Enables `Registry::write` and `Registry::write_path`.
    pub fn writer(mut self, writer: Arc<dyn DocumentWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Lets eligible queries follow the store's change log instead of polling.
    pub fn change_log(mut self, source: Arc<dyn ChangeLogSource>) -> Self {
        self.change_log = Some(source);
        self
    }

    pub fn config(mut self, config: LiveQueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the timer thread and, if configured, the change-log tailer.
    pub fn build(self) -> Result<Registry> {
        let scheduler = Scheduler::new()?;
        let tailer = match self.change_log {
            Some(source) if self.config.use_change_log => Some(ChangeLogTailer::start(source, &self.config)?),
            _ => None,
        };
        info!(
            change_log = tailer.is_some(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "live query registry started"
        );
        let ctx = Arc::new(EngineContext {
            store: self.store,
            bus: InvalidationBus::new(),
            scheduler,
            tailer,
            config: self.config,
            poll_observer: RwLock::new(None),
        });
        Ok(Registry {
            inner: Arc::new(RegistryInner {
                ctx,
                writer: self.writer,
                table: Mutex::new(RegistryTable {
                    next_result_set: 1,
                    next_handle: 1,
                    ..RegistryTable::default()
                }),
            }),
        })
    }
}

/// Entry point of the live query engine.
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn builder(store: Arc<dyn DocumentStore>) -> RegistryBuilder {
        RegistryBuilder {
            store,
            writer: None,
            change_log: None,
            config: LiveQueryConfig::default(),
        }
    }

    /// Starts observing a query.
    ///
    /// Returns once the observer has received an add for every document
    /// currently in the result. Observers of an identical query share one
    /// result set; a new observer joining a live set gets its initial adds
    /// from the cached snapshot without a new query.
    ///
    /// Fails with `Error::InvalidDescriptor` for unobservable descriptors,
    /// `Error::InitialQuery` if the first query of a new result set fails and
    /// `Error::ReentrantTask` when called from a callback of the very result
    /// set it would join.
    pub fn observe_changes(
        &self,
        descriptor: CursorDescriptor,
        callbacks: impl Into<ObserveCallbacks>,
    ) -> Result<ObserveHandle> {
        let callbacks = callbacks.into();
        descriptor.validate()?;

        if descriptor.options().tailable {
            let handle = self.next_handle_id();
            return tailable::observe(self.inner.ctx.store.as_ref(), &descriptor, callbacks, handle);
        }

        let ordered = callbacks.is_ordered();
        let key = ObserveKey::new(&descriptor, ordered)?;
        let (rs, handle, created) = self.get_or_create(key, descriptor)?;
        if created {
            start_driver(&rs);
        }

        rs.add_handle_and_send_initial_adds(Arc::new(HandleEntry::new(handle, callbacks)))?;
        Ok(ObserveHandle::attached(Arc::downgrade(&self.inner), rs.id(), handle))
    }

    fn next_handle_id(&self) -> HandleId {
        let mut table = self.inner.table.lock();
        let id = table.next_handle;
        table.next_handle += 1;
        id
    }

    /// Finds a live set for `key` and reserves an add slot on it, or creates
    /// and registers a new one. Runs entirely under the registry lock so two
    /// racing observers of a new query end up on the same set. A new set is
    /// returned unstarted; the caller starts its driver after the lock is gone.
    fn get_or_create(
        &self,
        key: ObserveKey,
        descriptor: CursorDescriptor,
    ) -> Result<(Arc<LiveResultSet>, HandleId, bool)> {
        let mut table = self.inner.table.lock();
        let handle = table.next_handle;
        table.next_handle += 1;

        let existing = table.by_key.get(&key).and_then(|id| table.sets.get(id)).cloned();
        if let Some(rs) = existing {
            if rs.try_begin_add() {
                debug!(result_set = rs.id(), handle, "joining live result set");
                return Ok((rs, handle, false));
            }
            debug!(result_set = rs.id(), "replacing torn-down result set");
        }

        let id = table.next_result_set;
        table.next_result_set += 1;
        let driver = self.inner.ctx.driver_for(&descriptor, key.ordered());
        let rs = LiveResultSet::new(
            id,
            key.clone(),
            descriptor,
            driver,
            self.inner.ctx.clone(),
            Arc::downgrade(&self.inner),
        )?;
        table.by_key.insert(key, id);
        table.sets.insert(id, rs.clone());
        debug!(result_set = id, ?driver, collection = rs.descriptor().collection(), "created result set");
        Ok((rs, handle, true))
    }

    /// Runs `writes` against a fresh fence and blocks until every affected
    /// result set has reflected them and delivered its callbacks.
    ///
    /// Fails with `Error::ReentrantTask` from inside an observer callback:
    /// the fence could wait on the very worker running the callback. Use
    /// `write_path` there instead.
    pub fn write<R>(&self, writes: impl FnOnce(&WritePath) -> Result<R>) -> Result<R> {
        if let Some(result_set) = queue::current_owner() {
            return Err(Error::ReentrantTask { result_set });
        }
        let fence = WriteFence::new();
        let path = self.write_path()?.fenced(fence.clone());
        let result = writes(&path);
        fence.arm_and_wait();
        fence.retire();
        result
    }

    /// An unfenced write path: writes are announced but not waited on.
    pub fn write_path(&self) -> Result<WritePath> {
        let writer = self
            .inner
            .writer
            .clone()
            .ok_or_else(|| Error::store("*", "registry was built without a document writer"))?;
        Ok(WritePath::new(writer, self.inner.ctx.bus.clone(), &self.inner.ctx.config))
    }

    /// Announces a change made outside this registry's write path.
    pub fn notify(&self, notification: &Notification, fence: Option<&WriteFence>) {
        self.inner.ctx.bus.notify(notification, fence);
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.inner.ctx.bus
    }

    pub fn config(&self) -> &LiveQueryConfig {
        &self.inner.ctx.config
    }

    pub fn tailer(&self) -> Option<&ChangeLogTailer> {
        self.inner.ctx.tailer.as_ref()
    }

    /// Installs (or clears) the hook notified around every poll.
    pub fn set_poll_observer(&self, observer: Option<Arc<dyn PollObserver>>) {
        *self.inner.ctx.poll_observer.write() = observer;
    }

    /// Number of live result sets.
    pub fn result_set_count(&self) -> usize {
        self.inner.table.lock().sets.len()
    }

    pub fn result_set_stats(&self, id: ResultSetId) -> Option<ResultSetStats> {
        self.inner.lookup(id).map(|rs| rs.stats())
    }

    /// Stats for every live result set, ordered by id.
    pub fn result_sets(&self) -> Vec<ResultSetStats> {
        let sets: Vec<Arc<LiveResultSet>> = self.inner.table.lock().sets.values().cloned().collect();
        let mut stats: Vec<ResultSetStats> = sets.iter().map(|rs| rs.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Blocks polling of a result set until `resume_polling`.
    #[doc(hidden)]
    pub fn suspend_polling(&self, id: ResultSetId) -> Result<()> {
        self.lookup_live(id)?.suspend_polling()
    }

    /// Runs one poll synchronously and re-enables polling.
    #[doc(hidden)]
    pub fn resume_polling(&self, id: ResultSetId) -> Result<()> {
        self.lookup_live(id)?.resume_polling()
    }

    /// Tears down every result set. Their handles become inert.
    pub fn shutdown(&self) {
        let sets: Vec<Arc<LiveResultSet>> = self.inner.table.lock().sets.values().cloned().collect();
        for rs in sets {
            rs.stop();
        }
        if let Some(tailer) = &self.inner.ctx.tailer {
            tailer.stop();
        }
        info!("live query registry shut down");
    }

    fn lookup_live(&self, id: ResultSetId) -> Result<Arc<LiveResultSet>> {
        self.inner
            .lookup(id)
            .filter(|rs| !rs.is_stopped())
            .ok_or(Error::ResultSetStopped { result_set: id })
    }
}

/// Starts a freshly registered set. Never called under the registry lock.
///
/// The change-log driver waits for the tailer to position itself before its
/// initial poll, which can take as long as the log is unreachable. That wait
/// runs on the set's own queue: only observers of this set are held up.
fn start_driver(rs: &Arc<LiveResultSet>) {
    match rs.driver() {
        DriverKind::Polling => polling::start(rs),
        DriverKind::ChangeLog => {
            let task_rs = rs.clone();
            let queued = rs.queue().queue_task(move || {
                if let Err(e) = change_log_driver::start(&task_rs) {
                    task_rs.fail_start(&e);
                }
            });
            if let Err(e) = queued {
                rs.fail_start(&e);
            }
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("result_sets", &self.result_set_count())
            .field("change_log", &self.inner.ctx.tailer.is_some())
            .finish()
    }
}
