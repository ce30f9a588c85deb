//! Observer callbacks and handles.
//!
//! An observer supplies either unordered callbacks (added / changed / removed)
//! or ordered ones (added-before / changed / removed / moved-before). The flavor
//! is part of the dedup key: ordered and unordered observers of the same query
//! get separate result sets.

use crate::registry::RegistryInner;
use parking_lot::Mutex;
use ripple_core::{DocId, Error, Fields, Result};
use ripple_diff::{ChangeEvent, ChangedFields};
use ripple_store::TailHandle;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tracing::error;

/// Identifies a result set within its registry.
pub type ResultSetId = u64;

/// Identifies an observer handle within its registry.
pub type HandleId = u64;

pub type AddedFn = Box<dyn Fn(&DocId, &Fields) + Send + Sync>;
pub type AddedBeforeFn = Box<dyn Fn(&DocId, &Fields, Option<&DocId>) + Send + Sync>;
pub type ChangedFn = Box<dyn Fn(&DocId, &ChangedFields) + Send + Sync>;
pub type RemovedFn = Box<dyn Fn(&DocId) + Send + Sync>;
pub type MovedBeforeFn = Box<dyn Fn(&DocId, Option<&DocId>) + Send + Sync>;

/// Callbacks for observers that do not care about order.
#[derive(Default)]
pub struct UnorderedCallbacks {
    added: Option<AddedFn>,
    changed: Option<ChangedFn>,
    removed: Option<RemovedFn>,
}

impl UnorderedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added(mut self, f: impl Fn(&DocId, &Fields) + Send + Sync + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    pub fn on_changed(mut self, f: impl Fn(&DocId, &ChangedFields) + Send + Sync + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    pub fn on_removed(mut self, f: impl Fn(&DocId) + Send + Sync + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }
}

/// Callbacks for observers that track position.
///
/// `before` is the id of the document that now follows, or `None` for the
/// end of the result.
#[derive(Default)]
pub struct OrderedCallbacks {
    added_before: Option<AddedBeforeFn>,
    changed: Option<ChangedFn>,
    removed: Option<RemovedFn>,
    moved_before: Option<MovedBeforeFn>,
}

impl OrderedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added_before(
        mut self,
        f: impl Fn(&DocId, &Fields, Option<&DocId>) + Send + Sync + 'static,
    ) -> Self {
        self.added_before = Some(Box::new(f));
        self
    }

    pub fn on_changed(mut self, f: impl Fn(&DocId, &ChangedFields) + Send + Sync + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    pub fn on_removed(mut self, f: impl Fn(&DocId) + Send + Sync + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }

    pub fn on_moved_before(mut self, f: impl Fn(&DocId, Option<&DocId>) + Send + Sync + 'static) -> Self {
        self.moved_before = Some(Box::new(f));
        self
    }
}

/// Either flavor of observer callbacks.
pub enum ObserveCallbacks {
    Unordered(UnorderedCallbacks),
    Ordered(OrderedCallbacks),
}

impl ObserveCallbacks {
    pub fn is_ordered(&self) -> bool {
        matches!(self, ObserveCallbacks::Ordered(_))
    }

    /// Invokes the callback matching `event`, if the observer supplied one.
    pub fn dispatch(&self, event: &ChangeEvent) {
        match (self, event) {
            (Self::Unordered(cb), ChangeEvent::Added { id, fields })
            | (Self::Unordered(cb), ChangeEvent::AddedBefore { id, fields, .. }) => {
                if let Some(f) = &cb.added {
                    f(id, fields);
                }
            }
            (Self::Ordered(cb), ChangeEvent::Added { id, fields }) => {
                if let Some(f) = &cb.added_before {
                    f(id, fields, None);
                }
            }
            (Self::Ordered(cb), ChangeEvent::AddedBefore { id, fields, before }) => {
                if let Some(f) = &cb.added_before {
                    f(id, fields, before.as_ref());
                }
            }
            (Self::Unordered(cb), ChangeEvent::Changed { id, changes }) => {
                if let Some(f) = &cb.changed {
                    f(id, changes);
                }
            }
            (Self::Ordered(cb), ChangeEvent::Changed { id, changes }) => {
                if let Some(f) = &cb.changed {
                    f(id, changes);
                }
            }
            (Self::Unordered(cb), ChangeEvent::Removed { id }) => {
                if let Some(f) = &cb.removed {
                    f(id);
                }
            }
            (Self::Ordered(cb), ChangeEvent::Removed { id }) => {
                if let Some(f) = &cb.removed {
                    f(id);
                }
            }
            (Self::Ordered(cb), ChangeEvent::MovedBefore { id, before }) => {
                if let Some(f) = &cb.moved_before {
                    f(id, before.as_ref());
                }
            }
            (Self::Unordered(_), ChangeEvent::MovedBefore { .. }) => {}
        }
    }

    /// Like `dispatch`, but a panicking callback is logged instead of
    /// unwinding into the engine.
    pub(crate) fn dispatch_guarded(&self, handle: HandleId, event: &ChangeEvent) {
        if catch_unwind(AssertUnwindSafe(|| self.dispatch(event))).is_err() {
            error!(handle, event = event.kind(), id = %event.id(), "observer callback panicked");
        }
    }
}

impl From<UnorderedCallbacks> for ObserveCallbacks {
    fn from(cb: UnorderedCallbacks) -> Self {
        ObserveCallbacks::Unordered(cb)
    }
}

impl From<OrderedCallbacks> for ObserveCallbacks {
    fn from(cb: OrderedCallbacks) -> Self {
        ObserveCallbacks::Ordered(cb)
    }
}

impl fmt::Debug for ObserveCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unordered(_) => f.write_str("ObserveCallbacks::Unordered"),
            Self::Ordered(_) => f.write_str("ObserveCallbacks::Ordered"),
        }
    }
}

pub(crate) enum HandleTarget {
    ResultSet {
        registry: Weak<RegistryInner>,
        result_set: ResultSetId,
    },
    Tail(Mutex<Option<TailHandle>>),
}

/// A live subscription returned by `observe_changes`.
///
/// Stopping (or dropping) the handle detaches it from its result set. The
/// last handle to leave tears the result set down. `stop` takes `&self`, so a
/// handle shared through an `Arc` can be stopped from inside its own
/// callbacks.
#[must_use = "dropping an ObserveHandle stops the observer"]
pub struct ObserveHandle {
    id: HandleId,
    target: HandleTarget,
    stopped: AtomicBool,
}

impl ObserveHandle {
    pub(crate) fn attached(registry: Weak<RegistryInner>, result_set: ResultSetId, id: HandleId) -> Self {
        Self {
            id,
            target: HandleTarget::ResultSet { registry, result_set },
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn tailing(id: HandleId, tail: TailHandle) -> Self {
        Self {
            id,
            target: HandleTarget::Tail(Mutex::new(Some(tail))),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The result set this handle is attached to; `None` for tailing observers.
    pub fn result_set_id(&self) -> Option<ResultSetId> {
        match &self.target {
            HandleTarget::ResultSet { result_set, .. } => Some(*result_set),
            HandleTarget::Tail(_) => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops delivery to this handle.
    ///
    /// No callback starts after `stop` returns, unless `stop` was called from
    /// inside a callback of this handle. Fails with `Error::HandleStopped` on
    /// a second call.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(Error::HandleStopped { handle: self.id });
        }
        match &self.target {
            HandleTarget::ResultSet { registry, result_set } => {
                if let Some(registry) = registry.upgrade() {
                    registry.detach(*result_set, self.id);
                }
            }
            HandleTarget::Tail(tail) => {
                if let Some(mut tail) = tail.lock().take() {
                    tail.stop();
                }
            }
        }
        Ok(())
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        if !self.is_stopped() {
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("id", &self.id)
            .field("result_set", &self.result_set_id())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
