//! Fenced write path.
//!
//! Every write goes to the store first and is then announced on the bus. When
//! the path carries a fence, each write holds a fence token from before the
//! store call until after the announcement, so result sets notified by the
//! announcement join the fence before the write's own token is released.

use crate::bus::{InvalidationBus, Notification};
use crate::config::LiveQueryConfig;
use crate::fence::WriteFence;
use ripple_core::{DocId, Document, Error, Result, Selector};
use ripple_store::{DocumentWriter, Modifier};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What an upsert did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Documents the update matched; zero when a new document was inserted.
    pub matched: usize,
    pub inserted: Option<DocId>,
}

/// Writes through to the store and invalidates overlapping result sets.
#[derive(Clone)]
pub struct WritePath {
    writer: Arc<dyn DocumentWriter>,
    bus: InvalidationBus,
    fence: Option<WriteFence>,
    upsert_attempts: u32,
}

impl WritePath {
    pub fn new(writer: Arc<dyn DocumentWriter>, bus: InvalidationBus, config: &LiveQueryConfig) -> Self {
        Self {
            writer,
            bus,
            fence: None,
            upsert_attempts: config.upsert_attempts.max(1),
        }
    }

    /// Returns a copy of this path whose writes join `fence`.
    pub fn fenced(&self, fence: WriteFence) -> Self {
        Self {
            fence: Some(fence),
            ..self.clone()
        }
    }

    pub fn fence(&self) -> Option<&WriteFence> {
        self.fence.as_ref()
    }

    pub fn insert(&self, collection: &str, doc: Document) -> Result<DocId> {
        let _token = self.begin()?;
        let id = doc.id().clone();
        self.writer.insert(collection, doc)?;
        self.announce(Notification::document(collection, id.clone()));
        Ok(id)
    }

    /// Applies `modifier` to every match; returns the matched count.
    pub fn update(&self, collection: &str, selector: &Selector, modifier: &Modifier) -> Result<usize> {
        let _token = self.begin()?;
        let matched = self.writer.update(collection, selector, modifier)?;
        self.announce_selector(collection, selector);
        Ok(matched)
    }

    /// Removes every match; returns the removed ids.
    pub fn remove(&self, collection: &str, selector: &Selector) -> Result<Vec<DocId>> {
        let _token = self.begin()?;
        let removed = self.writer.remove(collection, selector)?;
        for id in &removed {
            self.announce(Notification::document(collection, id.clone()));
        }
        Ok(removed)
    }

    /// Updates the matching documents, or inserts one built from the
    /// selector's equality fields and the modifier if nothing matches.
    ///
    /// Losing the insert to a concurrent writer retries the whole operation,
    /// up to the configured number of attempts.
    pub fn upsert(&self, collection: &str, selector: &Selector, modifier: &Modifier) -> Result<UpsertOutcome> {
        let _token = self.begin()?;
        for attempt in 1..=self.upsert_attempts {
            let matched = self.writer.update(collection, selector, modifier)?;
            if matched > 0 {
                self.announce_selector(collection, selector);
                return Ok(UpsertOutcome { matched, inserted: None });
            }

            // A selector pinned to exactly one id inserts under that id.
            let pinned = selector
                .ids_matched()
                .filter(|ids| ids.len() == 1)
                .and_then(|mut ids| ids.pop_first());
            let id = pinned.unwrap_or_else(DocId::generate);
            match self.writer.insert(collection, modifier.upsert_document(id.clone(), selector)) {
                Ok(()) => {
                    self.announce(Notification::document(collection, id.clone()));
                    return Ok(UpsertOutcome {
                        matched: 0,
                        inserted: Some(id),
                    });
                }
                Err(Error::DuplicateKey { .. }) => {
                    debug!(collection, attempt, "upsert lost an insert race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(collection, attempts = self.upsert_attempts, "upsert retries exhausted");
        Err(Error::UpsertRetriesExhausted {
            collection: collection.to_string(),
            attempts: self.upsert_attempts,
        })
    }

    fn begin(&self) -> Result<Option<crate::fence::WriteToken>> {
        self.fence.as_ref().map(WriteFence::begin_write).transpose()
    }

    fn announce_selector(&self, collection: &str, selector: &Selector) {
        match selector.ids_matched() {
            Some(ids) => {
                for id in ids {
                    self.announce(Notification::document(collection, id));
                }
            }
            None => self.announce(Notification::collection(collection)),
        }
    }

    fn announce(&self, notification: Notification) {
        self.bus.notify(&notification, self.fence.as_ref());
    }
}

impl fmt::Debug for WritePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePath")
            .field("fenced", &self.fence.is_some())
            .field("upsert_attempts", &self.upsert_attempts)
            .finish()
    }
}
