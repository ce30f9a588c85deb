//! Tailing observers.
//!
//! Tailable cursors over append-only collections bypass deduplication: every
//! observer gets its own store cursor and sees each matching document once,
//! as an add at the end of the result.

use crate::handle::{HandleId, ObserveCallbacks, ObserveHandle};
use ripple_core::{CursorDescriptor, Result};
use ripple_diff::ChangeEvent;
use ripple_store::{DocumentStore, TailHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) fn observe(
    store: &dyn DocumentStore,
    descriptor: &CursorDescriptor,
    callbacks: ObserveCallbacks,
    handle: HandleId,
) -> Result<ObserveHandle> {
    let ordered = callbacks.is_ordered();
    let stopped = Arc::new(AtomicBool::new(false));
    let gate = stopped.clone();

    let mut cursor = store.tail(
        descriptor,
        Box::new(move |doc| {
            if gate.load(Ordering::SeqCst) {
                return;
            }
            let (id, fields) = doc.into_parts();
            let event = if ordered {
                ChangeEvent::AddedBefore { id, fields, before: None }
            } else {
                ChangeEvent::Added { id, fields }
            };
            callbacks.dispatch_guarded(handle, &event);
        }),
    )?;
    debug!(handle, collection = descriptor.collection(), "tailing");

    Ok(ObserveHandle::tailing(
        handle,
        TailHandle::new(move || {
            stopped.store(true, Ordering::SeqCst);
            cursor.stop();
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{OrderedCallbacks, UnorderedCallbacks};
    use parking_lot::Mutex;
    use ripple_core::{Document, Error, Selector};
    use ripple_store::{DocumentWriter, MemoryStore};

    fn events() -> CursorDescriptor {
        CursorDescriptor::new("events", Selector::eq("kind", "log")).tailable()
    }

    fn log(id: &str) -> Document {
        Document::empty(id).with("kind", "log")
    }

    #[test]
    fn test_ordered_tail_appends_at_end() {
        let store = MemoryStore::new();
        store.insert("events", log("e1")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let callbacks = OrderedCallbacks::new()
            .on_added_before(move |id, _, before| s.lock().push((id.to_string(), before.cloned())));

        let handle = observe(&store, &events(), callbacks.into(), 4).unwrap();
        store.insert("events", log("e2")).unwrap();
        store.insert("events", Document::empty("x").with("kind", "audit")).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![("e1".to_string(), None), ("e2".to_string(), None)]
        );
        assert_eq!(handle.id(), 4);
        assert_eq!(handle.result_set_id(), None);
    }

    #[test]
    fn test_stopped_tail_sees_nothing_more() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let callbacks = UnorderedCallbacks::new().on_added(move |id, _| s.lock().push(id.to_string()));

        let handle = observe(&store, &events(), callbacks.into(), 1).unwrap();
        store.insert("events", log("e1")).unwrap();
        handle.stop().unwrap();
        store.insert("events", log("e2")).unwrap();

        assert_eq!(*seen.lock(), vec!["e1"]);
        assert!(matches!(handle.stop(), Err(Error::HandleStopped { handle: 1 })));
    }

    #[test]
    fn test_panicking_callback_keeps_tail_alive() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let callbacks = UnorderedCallbacks::new().on_added(move |id, _| {
            if id.as_str() == "bad" {
                panic!("callback failure");
            }
            s.lock().push(id.to_string());
        });

        let _handle = observe(&store, &events(), callbacks.into(), 1).unwrap();
        store.insert("events", log("bad")).unwrap();
        store.insert("events", log("good")).unwrap();
        assert_eq!(*seen.lock(), vec!["good"]);
    }
}
