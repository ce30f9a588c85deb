//! Ripple Store - Driver interfaces and reference store for Ripple.
//!
//! This crate provides the storage side of the live query engine:
//!
//! - `DocumentStore` / `DocumentWriter` / `ChangeLogSource`: the driver interfaces
//! - `ChangeLog` / `ChangeLogEntry` / `Marker`: the ordered change log
//! - `Modifier`: field-level updates
//! - `MemoryStore`: a thread-safe in-memory store with fault injection
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{CursorDescriptor, Document, Selector};
//! use ripple_store::{ChangeLogSource, DocumentStore, DocumentWriter, MemoryStore, Modifier};
//!
//! let store = MemoryStore::new();
//! store.insert("users", Document::empty("u1").with("team", "blue")).unwrap();
//! store
//!     .update("users", &Selector::id("u1"), &Modifier::new().set("team", "red"))
//!     .unwrap();
//!
//! let reds = store
//!     .find(&CursorDescriptor::new("users", Selector::eq("team", "red")))
//!     .unwrap();
//! assert_eq!(reds.len(), 1);
//! assert_eq!(store.read_after(None, 10).unwrap().len(), 2);
//! ```

pub mod change_log;
pub mod memory;
pub mod traits;

pub use change_log::{ChangeLog, ChangeLogEntry, ChangeOp, Marker};
pub use memory::MemoryStore;
pub use traits::{ChangeLogSource, DocumentStore, DocumentWriter, Modifier, TailCallback, TailHandle};
