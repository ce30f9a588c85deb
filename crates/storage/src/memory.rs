//! In-memory reference store.
//!
//! `MemoryStore` implements every driver interface the engine consumes:
//! queries, point reads, tailing cursors, writes and a change log. It also
//! carries fault injection hooks so tests can simulate a flaky driver.

use crate::change_log::{ChangeLog, ChangeLogEntry, ChangeOp, Marker};
use crate::traits::{ChangeLogSource, DocumentStore, DocumentWriter, Modifier, TailCallback, TailHandle};
use hashbrown::HashMap;
use parking_lot::Mutex;
use ripple_core::{CursorDescriptor, DocId, Document, Error, Result, Selector};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

const CHANGE_LOG: &str = "change_log";

/// One collection: documents keyed by id, with an insertion sequence that
/// gives the natural order of unsorted queries.
#[derive(Default)]
struct Collection {
    docs: HashMap<DocId, (u64, Document)>,
}

impl Collection {
    fn in_natural_order(&self) -> Vec<&Document> {
        let mut docs: Vec<_> = self.docs.values().collect();
        docs.sort_by_key(|(seq, _)| *seq);
        docs.into_iter().map(|(_, d)| d).collect()
    }
}

struct StoreState {
    collections: HashMap<String, Collection>,
    log: ChangeLog,
    next_seq: u64,
}

struct TailSubscriber {
    descriptor: CursorDescriptor,
    callback: Arc<TailCallback>,
}

#[derive(Default)]
struct TailRegistry {
    subscribers: HashMap<u64, TailSubscriber>,
    next_id: u64,
}

#[derive(Default)]
struct Faults {
    failing_finds: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_log_reads: AtomicUsize,
    log_down: AtomicBool,
    find_delay_ms: AtomicU64,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Thread-safe in-memory document store.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    tails: Arc<Mutex<TailRegistry>>,
    faults: Faults,
    find_count: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_change_log_capacity(ChangeLog::DEFAULT_CAPACITY)
    }

    /// Creates an empty store whose change log retains `capacity` entries.
    pub fn with_change_log_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                collections: HashMap::new(),
                log: ChangeLog::with_capacity(capacity),
                next_seq: 0,
            }),
            tails: Arc::new(Mutex::new(TailRegistry::default())),
            faults: Faults::default(),
            find_count: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` calls to `find`/`find_by_id` fail.
    pub fn fail_next_finds(&self, n: usize) {
        self.faults.failing_finds.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` writes fail before touching any data.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` change-log reads fail.
    pub fn fail_next_change_log_reads(&self, n: usize) {
        self.faults.failing_log_reads.store(n, Ordering::SeqCst);
    }

    /// Simulates losing (or regaining) the change-log connection.
    pub fn set_change_log_available(&self, available: bool) {
        self.faults.log_down.store(!available, Ordering::SeqCst);
    }

    /// Adds a fixed latency to every `find`.
    pub fn set_find_delay(&self, delay: Duration) {
        self.faults
            .find_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Returns how many `find` calls have been served or failed.
    pub fn find_count(&self) -> usize {
        self.find_count.load(Ordering::SeqCst)
    }

    /// Returns the number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.docs.len())
    }

    /// Returns true if the collection holds no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Drops a collection and records a `Drop` entry.
    pub fn drop_collection(&self, collection: &str) -> Result<()> {
        self.check_write(collection)?;
        let mut state = self.state.lock();
        state.collections.remove(collection);
        state.log.append(collection, ChangeOp::Drop, None);
        debug!(collection, "dropped collection");
        Ok(())
    }

    fn check_write(&self, collection: &str) -> Result<()> {
        if Faults::take(&self.faults.failing_writes) {
            return Err(Error::store(collection, "injected write failure"));
        }
        Ok(())
    }

    fn check_find(&self, collection: &str) -> Result<()> {
        self.find_count.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.failing_finds) {
            return Err(Error::store(collection, "injected find failure"));
        }
        let delay = self.faults.find_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Ok(())
    }

    fn check_log(&self) -> Result<()> {
        if self.faults.log_down.load(Ordering::SeqCst) {
            return Err(Error::store(CHANGE_LOG, "change log unavailable"));
        }
        if Faults::take(&self.faults.failing_log_reads) {
            return Err(Error::store(CHANGE_LOG, "injected change log failure"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, descriptor: &CursorDescriptor) -> Result<Vec<Document>> {
        self.check_find(descriptor.collection())?;
        let state = self.state.lock();
        let docs = match state.collections.get(descriptor.collection()) {
            Some(c) => descriptor.execute(c.in_natural_order()),
            None => Vec::new(),
        };
        trace!(collection = descriptor.collection(), count = docs.len(), "find");
        Ok(docs)
    }

    fn find_by_id(&self, collection: &str, id: &DocId) -> Result<Option<Document>> {
        self.check_find(collection)?;
        let state = self.state.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .map(|(_, d)| d.clone()))
    }

    fn tail(&self, descriptor: &CursorDescriptor, on_document: TailCallback) -> Result<TailHandle> {
        let callback = Arc::new(on_document);
        // Snapshot and registration happen under the state lock so no insert
        // is delivered twice or missed.
        let (existing, id) = {
            let state = self.state.lock();
            let existing = match state.collections.get(descriptor.collection()) {
                Some(c) => descriptor.execute(c.in_natural_order()),
                None => Vec::new(),
            };
            let mut tails = self.tails.lock();
            let id = tails.next_id;
            tails.next_id += 1;
            tails.subscribers.insert(
                id,
                TailSubscriber {
                    descriptor: descriptor.clone(),
                    callback: callback.clone(),
                },
            );
            (existing, id)
        };
        for doc in existing {
            callback(doc);
        }
        let tails: Weak<Mutex<TailRegistry>> = Arc::downgrade(&self.tails);
        Ok(TailHandle::new(move || {
            if let Some(tails) = tails.upgrade() {
                tails.lock().subscribers.remove(&id);
            }
        }))
    }
}

impl DocumentWriter for MemoryStore {
    fn insert(&self, collection: &str, doc: Document) -> Result<()> {
        self.check_write(collection)?;
        let deliveries = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            let coll = state.collections.entry(collection.to_string()).or_default();
            if coll.docs.contains_key(doc.id()) {
                return Err(Error::duplicate_key(collection, doc.id().as_str()));
            }
            coll.docs.insert(doc.id().clone(), (seq, doc.clone()));
            state.next_seq += 1;
            state.log.append(collection, ChangeOp::Insert, Some(doc.id().clone()));

            let tails = self.tails.lock();
            tails
                .subscribers
                .values()
                .filter(|t| t.descriptor.collection() == collection && t.descriptor.matches(&doc))
                .map(|t| (t.callback.clone(), t.descriptor.project(&doc)))
                .collect::<Vec<_>>()
        };
        for (callback, doc) in deliveries {
            callback(doc);
        }
        Ok(())
    }

    fn update(&self, collection: &str, selector: &Selector, modifier: &Modifier) -> Result<usize> {
        self.check_write(collection)?;
        let mut state = self.state.lock();
        let StoreState {
            collections, log, ..
        } = &mut *state;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut matched: Vec<(u64, DocId)> = coll
            .docs
            .iter()
            .filter(|(_, (_, d))| selector.matches(d))
            .map(|(id, (seq, _))| (*seq, id.clone()))
            .collect();
        matched.sort();
        for (_, id) in &matched {
            if let Some((_, doc)) = coll.docs.get_mut(id) {
                if modifier.apply(doc) {
                    log.append(collection, ChangeOp::Update, Some(id.clone()));
                }
            }
        }
        Ok(matched.len())
    }

    fn remove(&self, collection: &str, selector: &Selector) -> Result<Vec<DocId>> {
        self.check_write(collection)?;
        let mut state = self.state.lock();
        let StoreState {
            collections, log, ..
        } = &mut *state;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(Vec::new());
        };
        let mut doomed: Vec<(u64, DocId)> = coll
            .docs
            .iter()
            .filter(|(_, (_, d))| selector.matches(d))
            .map(|(id, (seq, _))| (*seq, id.clone()))
            .collect();
        doomed.sort();
        let mut removed = Vec::with_capacity(doomed.len());
        for (_, id) in doomed {
            coll.docs.remove(&id);
            log.append(collection, ChangeOp::Delete, Some(id.clone()));
            removed.push(id);
        }
        Ok(removed)
    }
}

impl ChangeLogSource for MemoryStore {
    fn read_after(&self, after: Option<Marker>, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        self.check_log()?;
        Ok(self.state.lock().log.read_after(after, limit))
    }

    fn latest_marker(&self) -> Result<Option<Marker>> {
        self.check_log()?;
        Ok(self.state.lock().log.latest())
    }
}
