//! Driver interfaces consumed by the live query engine.
//!
//! Every call here may block on I/O and may fail with a transient
//! `Error::Store`.

use crate::change_log::{ChangeLogEntry, Marker};
use ripple_core::{CursorDescriptor, DocId, Document, Fields, Result, Selector, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Callback invoked for each document a tailing cursor produces.
pub type TailCallback = Box<dyn Fn(Document) + Send + Sync>;

/// Read access to a document store.
pub trait DocumentStore: Send + Sync {
    /// Runs a query, returning documents ordered by the descriptor's sort with
    /// skip, limit and projection applied.
    fn find(&self, descriptor: &CursorDescriptor) -> Result<Vec<Document>>;

    /// Fetches a single document by id.
    fn find_by_id(&self, collection: &str, id: &DocId) -> Result<Option<Document>>;

    /// Streams matching documents of an append-only collection, existing ones
    /// first, until the returned handle is stopped.
    fn tail(&self, descriptor: &CursorDescriptor, on_document: TailCallback) -> Result<TailHandle>;
}

/// Write access to a document store.
pub trait DocumentWriter: Send + Sync {
    /// Inserts a document. Fails with `Error::DuplicateKey` if the id exists.
    fn insert(&self, collection: &str, doc: Document) -> Result<()>;

    /// Applies a modifier to every matching document; returns the matched count.
    fn update(&self, collection: &str, selector: &Selector, modifier: &Modifier) -> Result<usize>;

    /// Removes every matching document; returns the removed ids.
    fn remove(&self, collection: &str, selector: &Selector) -> Result<Vec<DocId>>;
}

/// Read access to the store's append-only change log.
pub trait ChangeLogSource: Send + Sync {
    /// Returns at most `limit` entries with a marker strictly after `after`,
    /// in marker order. `None` reads from the oldest retained entry.
    fn read_after(&self, after: Option<Marker>, limit: usize) -> Result<Vec<ChangeLogEntry>>;

    /// Returns the newest marker visible in the log.
    fn latest_marker(&self) -> Result<Option<Marker>>;
}

/// Stops a tailing cursor when stopped or dropped.
pub struct TailHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl TailHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// Stops the cursor. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TailHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailHandle")
            .field("stopped", &self.stop.is_none())
            .finish()
    }
}

/// Field-level update applied to matching documents.
///
/// `set` and `unset` address top-level fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Modifier {
    pub set: Fields,
    pub unset: BTreeSet<String>,
}

impl Modifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        self.unset.remove(&field);
        self.set.insert(field, value.into());
        self
    }

    /// Clears a field.
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.set.remove(&field);
        self.unset.insert(field);
        self
    }

    /// Returns true if the modifier touches nothing.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Applies the modifier in place. Returns true if the document changed.
    pub fn apply(&self, doc: &mut Document) -> bool {
        let mut changed = false;
        for (field, value) in &self.set {
            if doc.get(field) != Some(value) {
                doc.set(field.clone(), value.clone());
                changed = true;
            }
        }
        for field in &self.unset {
            changed |= doc.remove(field).is_some();
        }
        changed
    }

    /// Builds the document an upsert inserts when nothing matched: the
    /// selector's equality fields overlaid with the modifier's `set`.
    pub fn upsert_document(&self, id: DocId, selector: &Selector) -> Document {
        let mut doc = Document::empty(id);
        collect_equalities(selector, &mut doc);
        for (field, value) in &self.set {
            doc.set(field.clone(), value.clone());
        }
        doc
    }
}

fn collect_equalities(selector: &Selector, doc: &mut Document) {
    match selector {
        Selector::Eq { field, value } if !field.contains('.') => {
            doc.set(field.clone(), value.clone());
        }
        Selector::And(children) => {
            for child in children {
                collect_equalities(child, doc);
            }
        }
        _ => {}
    }
}
