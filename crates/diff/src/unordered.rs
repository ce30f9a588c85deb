//! Unordered diff: set difference by id plus field comparison.

use crate::batch::ChangeBatch;
use crate::change::{changed_fields, ChangeEvent};
use crate::snapshot::IdMap;

/// Emits the events that turn `old` into `new`.
///
/// Additions and changes come first, then removals.
pub fn diff_unordered(old: &IdMap, new: &IdMap, batch: &mut ChangeBatch<'_>) {
    for (id, new_doc) in new {
        match old.get(id) {
            Some(old_doc) => {
                if old_doc.fields() != new_doc.fields() {
                    let changes = changed_fields(old_doc.fields(), new_doc.fields());
                    if !changes.is_empty() {
                        batch.push(ChangeEvent::Changed {
                            id: id.clone(),
                            changes,
                        });
                    }
                }
            }
            None => batch.push(ChangeEvent::Added {
                id: id.clone(),
                fields: new_doc.fields().clone(),
            }),
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            batch.push(ChangeEvent::Removed { id: id.clone() });
        }
    }
}
