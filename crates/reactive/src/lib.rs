//! Ripple Reactive - Live query engine for Ripple.
//!
//! This crate keeps query results continuously synchronized with a mutable
//! document store and streams incremental changes to any number of
//! observers, without running a query once per observer.
//!
//! # Core Concepts
//!
//! - `Registry`: deduplicates identical queries onto one shared result set
//! - `ObserveHandle`: one observer's subscription; stop it (or drop it) to leave
//! - `WriteFence`: lets a writer wait until its writes are visible to observers
//! - `InvalidationBus`: routes "collection X (document Y) changed" to result sets
//! - `ChangeLogTailer`: follows the store's change log with resume-from-marker
//! - `TaskQueue`: the serialized worker behind every result set
//!
//! Eligible queries (unordered, pure equality, no sort/limit/skip/projection)
//! follow the change log when the registry has one; everything else polls on
//! invalidation, throttled, plus a fallback interval.
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{CursorDescriptor, Document, Selector};
//! use ripple_reactive::{LiveQueryConfig, Registry, UnorderedCallbacks};
//! use ripple_store::MemoryStore;
//! use std::sync::{Arc, Mutex};
//!
//! let store = Arc::new(MemoryStore::new());
//! let registry = Registry::builder(store.clone())
//!     .writer(store.clone())
//!     .config(LiveQueryConfig::default().with_change_log(false))
//!     .build()
//!     .unwrap();
//!
//! let added = Arc::new(Mutex::new(Vec::new()));
//! let sink = added.clone();
//! let handle = registry
//!     .observe_changes(
//!         CursorDescriptor::new("tasks", Selector::eq("done", false)),
//!         UnorderedCallbacks::new().on_added(move |id, _| sink.lock().unwrap().push(id.clone())),
//!     )
//!     .unwrap();
//!
//! // `write` returns once every affected observer has seen the insert.
//! registry
//!     .write(|w| w.insert("tasks", Document::empty("t1").with("done", false)))
//!     .unwrap();
//! assert_eq!(added.lock().unwrap().len(), 1);
//!
//! handle.stop().unwrap();
//! ```

pub mod bus;
pub mod config;
pub mod fence;
pub mod handle;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod tailer;
pub mod writer;

mod change_log_driver;
mod polling;
mod result_set;
mod tailable;

pub use bus::{InvalidationBus, ListenerHandle, Notification};
pub use config::LiveQueryConfig;
pub use fence::{WriteFence, WriteToken};
pub use handle::{
    HandleId, ObserveCallbacks, ObserveHandle, OrderedCallbacks, ResultSetId, UnorderedCallbacks,
};
pub use queue::TaskQueue;
pub use registry::{Registry, RegistryBuilder};
pub use result_set::{DriverKind, PollObserver, PollOutcome, ResultSetStats};
pub use scheduler::{Scheduler, Throttle, TimerId};
pub use tailer::{ChangeLogTailer, TailerListener, TailerPhase};
pub use writer::{UpsertOutcome, WritePath};

// Re-export commonly used types from dependencies
pub use ripple_diff::{ChangeEvent, ChangedFields, FieldChange};
