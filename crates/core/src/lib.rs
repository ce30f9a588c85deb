//! Ripple Core - Document, selector and cursor types for Ripple live queries.
//!
//! This crate provides the foundational types shared by every Ripple layer:
//!
//! - `Value`: totally ordered, hashable field values
//! - `Document` / `DocId`: a record of a collection and its opaque id
//! - `Selector`: the filter language, with canonicalization
//! - `CursorDescriptor`: the immutable query description used as a dedup key
//! - `Error`: the error type for every Ripple operation
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{CursorDescriptor, Document, Selector, SortSpec};
//!
//! let query = CursorDescriptor::new("users", Selector::eq("team", "blue"))
//!     .with_sort(SortSpec::new().asc("name"));
//!
//! let docs = vec![
//!     Document::empty("u2").with("team", "blue").with("name", "Bo"),
//!     Document::empty("u1").with("team", "blue").with("name", "Al"),
//!     Document::empty("u3").with("team", "red").with("name", "Cy"),
//! ];
//!
//! let result = query.execute(&docs);
//! assert_eq!(result.len(), 2);
//! assert_eq!(result[0].id().as_str(), "u1");
//! ```

mod descriptor;
mod document;
mod error;
mod selector;
mod value;

pub use descriptor::{CursorDescriptor, CursorOptions, Projection, SortDirection, SortSpec};
pub use document::{DocId, Document, Fields, ID_FIELD};
pub use error::{Error, Result};
pub use selector::{CmpOp, Selector};
pub use value::Value;
