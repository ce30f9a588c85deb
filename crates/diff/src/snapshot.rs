//! Result snapshots.
//!
//! A `Snapshot` is the cached result of one query execution: an ordered list
//! for ordered observers or an id map for unordered ones. Snapshots are never
//! patched while shared; callers build a new one and swap it in whole.

use crate::batch::ChangeBatch;
use crate::change::{apply_changes, ChangeEvent};
use hashbrown::HashMap;
use ripple_core::{DocId, Document};
use tracing::warn;

/// Unordered result keyed by document id.
pub type IdMap = HashMap<DocId, Document>;

/// Cached result of a query.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    Ordered(Vec<Document>),
    Unordered(IdMap),
}

impl Snapshot {
    /// Creates an empty snapshot of the given shape.
    pub fn empty(ordered: bool) -> Self {
        if ordered {
            Snapshot::Ordered(Vec::new())
        } else {
            Snapshot::Unordered(IdMap::new())
        }
    }

    /// Builds a snapshot from a query result.
    ///
    /// If an id occurs more than once the last occurrence wins.
    pub fn from_documents(ordered: bool, docs: Vec<Document>) -> Self {
        if ordered {
            let mut last_index: HashMap<DocId, usize> = HashMap::with_capacity(docs.len());
            for (i, doc) in docs.iter().enumerate() {
                if last_index.insert(doc.id().clone(), i).is_some() {
                    warn!(id = %doc.id(), "duplicate id in ordered result, keeping last");
                }
            }
            if last_index.len() == docs.len() {
                return Snapshot::Ordered(docs);
            }
            let docs = docs
                .into_iter()
                .enumerate()
                .filter(|(i, d)| last_index.get(d.id()) == Some(i))
                .map(|(_, d)| d)
                .collect();
            Snapshot::Ordered(docs)
        } else {
            let mut map = IdMap::with_capacity(docs.len());
            for doc in docs {
                if let Some(prev) = map.insert(doc.id().clone(), doc) {
                    warn!(id = %prev.id(), "duplicate id in unordered result, keeping last");
                }
            }
            Snapshot::Unordered(map)
        }
    }

    #[inline]
    pub fn is_ordered(&self) -> bool {
        matches!(self, Snapshot::Ordered(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Ordered(docs) => docs.len(),
            Snapshot::Unordered(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a document by id.
    pub fn get(&self, id: &DocId) -> Option<&Document> {
        match self {
            Snapshot::Ordered(docs) => docs.iter().find(|d| d.id() == id),
            Snapshot::Unordered(map) => map.get(id),
        }
    }

    pub fn contains(&self, id: &DocId) -> bool {
        self.get(id).is_some()
    }

    /// Iterates documents; in result order for ordered snapshots.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Document> + '_> {
        match self {
            Snapshot::Ordered(docs) => Box::new(docs.iter()),
            Snapshot::Unordered(map) => Box::new(map.values()),
        }
    }

    /// Emits the synthetic adds that bring an empty observer up to date.
    pub fn initial_adds(&self, batch: &mut ChangeBatch<'_>) {
        match self {
            Snapshot::Ordered(docs) => {
                for doc in docs {
                    batch.push(ChangeEvent::AddedBefore {
                        id: doc.id().clone(),
                        fields: doc.fields().clone(),
                        before: None,
                    });
                }
            }
            Snapshot::Unordered(map) => {
                for doc in map.values() {
                    batch.push(ChangeEvent::Added {
                        id: doc.id().clone(),
                        fields: doc.fields().clone(),
                    });
                }
            }
        }
    }

    /// Inserts or replaces a document in an unordered snapshot.
    ///
    /// Ordered snapshots append (or replace in place).
    pub fn upsert(&mut self, doc: Document) {
        match self {
            Snapshot::Unordered(map) => {
                map.insert(doc.id().clone(), doc);
            }
            Snapshot::Ordered(docs) => match docs.iter().position(|d| d.id() == doc.id()) {
                Some(i) => docs[i] = doc,
                None => docs.push(doc),
            },
        }
    }

    /// Removes a document by id.
    pub fn remove(&mut self, id: &DocId) -> Option<Document> {
        match self {
            Snapshot::Unordered(map) => map.remove(id),
            Snapshot::Ordered(docs) => {
                let i = docs.iter().position(|d| d.id() == id)?;
                Some(docs.remove(i))
            }
        }
    }

    /// Applies one change event, the way an observer mirroring the result
    /// would. Events about unknown ids are ignored.
    pub fn apply(&mut self, event: &ChangeEvent) {
        match (self, event) {
            (Snapshot::Unordered(map), ChangeEvent::Added { id, fields })
            | (Snapshot::Unordered(map), ChangeEvent::AddedBefore { id, fields, .. }) => {
                map.insert(id.clone(), Document::new(id.clone(), fields.clone()));
            }
            (Snapshot::Ordered(docs), ChangeEvent::Added { id, fields }) => {
                docs.push(Document::new(id.clone(), fields.clone()));
            }
            (Snapshot::Ordered(docs), ChangeEvent::AddedBefore { id, fields, before }) => {
                let at = position_before(docs, before.as_ref());
                docs.insert(at, Document::new(id.clone(), fields.clone()));
            }
            (snapshot, ChangeEvent::Changed { id, changes }) => {
                let doc = match snapshot {
                    Snapshot::Unordered(map) => map.get_mut(id),
                    Snapshot::Ordered(docs) => docs.iter_mut().find(|d| d.id() == id),
                };
                if let Some(doc) = doc {
                    apply_changes(doc.fields_mut(), changes);
                }
            }
            (snapshot, ChangeEvent::Removed { id }) => {
                snapshot.remove(id);
            }
            (Snapshot::Ordered(docs), ChangeEvent::MovedBefore { id, before }) => {
                if let Some(from) = docs.iter().position(|d| d.id() == id) {
                    let doc = docs.remove(from);
                    let at = position_before(docs, before.as_ref());
                    docs.insert(at, doc);
                }
            }
            (Snapshot::Unordered(_), ChangeEvent::MovedBefore { .. }) => {}
        }
    }

    /// Returns the documents, consuming the snapshot.
    pub fn into_documents(self) -> Vec<Document> {
        match self {
            Snapshot::Ordered(docs) => docs,
            Snapshot::Unordered(map) => map.into_values().collect(),
        }
    }
}

fn position_before(docs: &[Document], before: Option<&DocId>) -> usize {
    before
        .and_then(|b| docs.iter().position(|d| d.id() == b))
        .unwrap_or(docs.len())
}
