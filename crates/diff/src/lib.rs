//! Ripple Diff - Snapshot diffing for Ripple live queries.
//!
//! Given the previous and the freshly fetched result of a query, this crate
//! computes the minimal stream of change events an observer needs:
//!
//! - `ChangeEvent`: added / added-before / changed / removed / moved-before
//! - `ChangeBatch`: explicit context deciding whether events are queued or dispatched
//! - `Snapshot`: ordered list or id map of result documents
//! - `diff_unordered`: set difference by id plus field comparison
//! - `diff_ordered`: the same plus move detection via longest increasing subsequence
//! - `stabilize_ties`: keeps the old relative order of documents with equal sort keys
//!
//! # Example
//!
//! ```rust
//! use ripple_core::Document;
//! use ripple_diff::{diff_snapshots, ChangeBatch, ChangeEvent, Snapshot};
//!
//! let doc = |id: &str| Document::empty(id).with("v", 1i64);
//! let old = Snapshot::from_documents(true, vec![doc("A"), doc("B"), doc("C")]);
//! let new = Snapshot::from_documents(true, vec![doc("C"), doc("A"), doc("B")]);
//!
//! let mut batch = ChangeBatch::deferred();
//! diff_snapshots(&old, &new, &mut batch);
//! assert_eq!(
//!     batch.into_events(),
//!     vec![ChangeEvent::MovedBefore { id: "C".into(), before: Some("A".into()) }]
//! );
//! ```

pub mod batch;
pub mod change;
pub mod ordered;
pub mod snapshot;
pub mod unordered;

pub use batch::{ChangeBatch, ChangeSink};
pub use change::{apply_changes, changed_fields, ChangeEvent, ChangedFields, FieldChange};
pub use ordered::{diff_ordered, stabilize_ties};
pub use snapshot::{IdMap, Snapshot};
pub use unordered::diff_unordered;

/// Diffs two snapshots of the same query.
///
/// If the shapes differ, `old` is reshaped to match `new` first.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot, batch: &mut ChangeBatch<'_>) {
    match (old, new) {
        (Snapshot::Ordered(old), Snapshot::Ordered(new)) => diff_ordered(old, new, batch),
        (Snapshot::Unordered(old), Snapshot::Unordered(new)) => diff_unordered(old, new, batch),
        (old, new) => {
            let reshaped = Snapshot::from_documents(new.is_ordered(), old.iter().cloned().collect());
            diff_snapshots(&reshaped, new, batch);
        }
    }
}
