//! Document structure for Ripple.
//!
//! This module defines the `Document` struct, a single record of a collection, and
//! its opaque `DocId`.

use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Field name reserved for the document id.
pub const ID_FIELD: &str = "_id";

/// The top-level fields of a document, ordered by name.
pub type Fields = BTreeMap<String, Value>;

/// Global counter for generated document ids.
static NEXT_DOC_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque document identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Creates an id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a process-unique id.
    pub fn generate() -> Self {
        let n = NEXT_DOC_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("doc-{n:016x}"))
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for DocId {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl Borrow<str> for DocId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A document in a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier for this document.
    id: DocId,
    /// Top-level fields, excluding `_id`.
    fields: Fields,
}

impl Document {
    /// Creates a new document with the given id and fields.
    ///
    /// A stray `_id` entry in `fields` is discarded.
    pub fn new(id: impl Into<DocId>, mut fields: Fields) -> Self {
        fields.remove(ID_FIELD);
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Creates a document with no fields.
    pub fn empty(id: impl Into<DocId>) -> Self {
        Self::new(id, Fields::new())
    }

    /// Builds a document from a JSON object carrying a string `_id`.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = json else {
            return Err(Error::invalid_descriptor("document must be a JSON object"));
        };
        let mut id = None;
        let mut fields = Fields::new();
        for (key, value) in map {
            if key == ID_FIELD {
                match value {
                    serde_json::Value::String(s) => id = Some(DocId(s)),
                    other => id = Some(DocId(other.to_string())),
                }
            } else {
                fields.insert(key, Value::from(value));
            }
        }
        let id = id.ok_or_else(|| Error::invalid_descriptor("document is missing `_id`"))?;
        Ok(Self { id, fields })
    }

    /// Adds a field, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Returns the document id.
    #[inline]
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Returns the top-level fields.
    #[inline]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Returns a mutable reference to the top-level fields.
    #[inline]
    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    /// Resolves a dotted field path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            None => self.fields.get(path),
            Some((head, rest)) => self.fields.get(head)?.get_path(rest),
        }
    }

    /// Sets a top-level field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        if name == ID_FIELD {
            return None;
        }
        self.fields.insert(name, value.into())
    }

    /// Removes a top-level field.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Keeps only the named top-level fields. The id is always kept.
    pub fn project(&self, include: &BTreeSet<String>) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| include.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            id: self.id.clone(),
            fields,
        }
    }

    /// Splits the document into id and fields.
    pub fn into_parts(self) -> (DocId, Fields) {
        (self.id, self.fields)
    }
}
