//! Change events emitted by the diff engine.
//!
//! A `ChangeEvent` describes one step that takes an observer's copy of a
//! result set from its old state towards the new one.

use ripple_core::{DocId, Fields, Value};
use std::collections::BTreeMap;

/// Old and new value of one field. `new == None` means the field was cleared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl FieldChange {
    /// Returns true if the change clears the field.
    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.new.is_none()
    }
}

/// Changed fields of one document, by field name.
pub type ChangedFields = BTreeMap<String, FieldChange>;

/// One incremental change to a result set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A document entered an unordered result set.
    Added { id: DocId, fields: Fields },
    /// A document entered an ordered result set before `before` (or at the end).
    AddedBefore {
        id: DocId,
        fields: Fields,
        before: Option<DocId>,
    },
    /// Some fields of a document changed.
    Changed { id: DocId, changes: ChangedFields },
    /// A document left the result set.
    Removed { id: DocId },
    /// A document moved before `before` (or to the end).
    MovedBefore { id: DocId, before: Option<DocId> },
}

impl ChangeEvent {
    /// Returns the id of the document the event is about.
    pub fn id(&self) -> &DocId {
        match self {
            ChangeEvent::Added { id, .. }
            | ChangeEvent::AddedBefore { id, .. }
            | ChangeEvent::Changed { id, .. }
            | ChangeEvent::Removed { id }
            | ChangeEvent::MovedBefore { id, .. } => id,
        }
    }

    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added { .. } => "added",
            ChangeEvent::AddedBefore { .. } => "added_before",
            ChangeEvent::Changed { .. } => "changed",
            ChangeEvent::Removed { .. } => "removed",
            ChangeEvent::MovedBefore { .. } => "moved_before",
        }
    }
}

/// Compares two field maps and returns every field that differs.
pub fn changed_fields(old: &Fields, new: &Fields) -> ChangedFields {
    let mut changes = ChangedFields::new();
    for (name, old_value) in old {
        match new.get(name) {
            Some(new_value) if new_value == old_value => {}
            new_value => {
                changes.insert(
                    name.clone(),
                    FieldChange {
                        old: Some(old_value.clone()),
                        new: new_value.cloned(),
                    },
                );
            }
        }
    }
    for (name, new_value) in new {
        if !old.contains_key(name) {
            changes.insert(
                name.clone(),
                FieldChange {
                    old: None,
                    new: Some(new_value.clone()),
                },
            );
        }
    }
    changes
}

/// Applies changed fields to a field map, clearing fields whose new value is
/// `None`.
pub fn apply_changes(fields: &mut Fields, changes: &ChangedFields) {
    for (name, change) in changes {
        match &change.new {
            Some(value) => {
                fields.insert(name.clone(), value.clone());
            }
            None => {
                fields.remove(name);
            }
        }
    }
}
