//! Cursor descriptors.
//!
//! A `CursorDescriptor` is the immutable description of a query: a collection
//! name, a selector and cursor options. Its canonical serialization is the
//! identity used to share one live result set between identical queries.

use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::selector::Selector;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Sort direction for one sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A lexicographic sort over document fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec(Vec<(String, SortDirection)>);

impl SortSpec {
    /// Creates an empty sort specification.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends an ascending key.
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortDirection::Asc));
        self
    }

    /// Appends a descending key.
    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortDirection::Desc));
        self
    }

    /// Returns the sort keys in priority order.
    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.0
    }

    /// Returns true if there are no sort keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extracts the sort key of a document. Missing fields sort as null.
    pub fn key_of(&self, doc: &Document) -> Vec<Value> {
        self.0
            .iter()
            .map(|(field, _)| {
                if field == ID_FIELD {
                    Value::String(doc.id().as_str().to_string())
                } else {
                    doc.get(field).cloned().unwrap_or(Value::Null)
                }
            })
            .collect()
    }

    /// Compares two documents by this sort.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ka = self.key_of(a);
        let kb = self.key_of(b);
        for (((_, dir), va), vb) in self.0.iter().zip(&ka).zip(&kb) {
            let ord = match dir {
                SortDirection::Asc => va.cmp(vb),
                SortDirection::Desc => vb.cmp(va),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Inclusion projection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Projection {
    /// Top-level fields to keep.
    pub include: BTreeSet<String>,
    /// Whether `_id` is kept. Live queries require it.
    pub id: bool,
}

impl Projection {
    /// Includes the given fields plus `_id`.
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: fields.into_iter().map(Into::into).collect(),
            id: true,
        }
    }

    /// Drops `_id` from the projection.
    pub fn without_id(mut self) -> Self {
        self.id = false;
        self
    }
}

/// Cursor options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorOptions {
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub fields: Option<Projection>,
    pub tailable: bool,
}

/// Immutable description of a query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "DescriptorFields")]
pub struct CursorDescriptor {
    collection: String,
    selector: Selector,
    options: CursorOptions,
}

/// Deserialized form of a descriptor, normalized on conversion.
#[derive(Deserialize)]
struct DescriptorFields {
    collection: String,
    selector: Selector,
    #[serde(default)]
    options: CursorOptions,
}

impl From<DescriptorFields> for CursorDescriptor {
    fn from(fields: DescriptorFields) -> Self {
        let mut options = fields.options;
        options.sort = options.sort.filter(|sort| !sort.is_empty());
        Self::new(fields.collection, fields.selector).with_options(options)
    }
}

impl CursorDescriptor {
    /// Creates a descriptor. The selector is stored in canonical form.
    pub fn new(collection: impl Into<String>, selector: Selector) -> Self {
        Self {
            collection: collection.into(),
            selector: selector.canonicalize(),
            options: CursorOptions::default(),
        }
    }

    /// Creates a descriptor that matches every document of a collection.
    pub fn all(collection: impl Into<String>) -> Self {
        Self::new(collection, Selector::All)
    }

    /// Replaces the options.
    pub fn with_options(mut self, options: CursorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the sort. An empty sort is the same as no sort.
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.options.sort = if sort.is_empty() { None } else { Some(sort) };
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.options.skip = Some(skip);
        self
    }

    pub fn with_fields(mut self, fields: Projection) -> Self {
        self.options.fields = Some(fields);
        self
    }

    /// Marks the cursor as tailing an append-only collection.
    pub fn tailable(mut self) -> Self {
        self.options.tailable = true;
        self
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    #[inline]
    pub fn options(&self) -> &CursorOptions {
        &self.options
    }

    /// Returns the canonical serialization used as the deduplication key.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Checks that the descriptor can be observed.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(Error::invalid_descriptor("collection name is empty"));
        }
        if let Some(fields) = &self.options.fields {
            if !fields.id {
                return Err(Error::invalid_descriptor(
                    "cannot observe a cursor whose projection excludes `_id`",
                ));
            }
        }
        if self.options.tailable && (self.options.skip.is_some() || self.options.sort.is_some()) {
            return Err(Error::invalid_descriptor(
                "tailable cursors cannot sort or skip",
            ));
        }
        Ok(())
    }

    /// Returns true if change-log entries alone can keep this query current.
    pub fn supports_change_log(&self) -> bool {
        let o = &self.options;
        !o.tailable
            && o.sort.is_none()
            && o.limit.is_none()
            && o.skip.is_none()
            && o.fields.is_none()
            && self.selector.is_pure_equality()
    }

    /// Evaluates the selector against a document.
    #[inline]
    pub fn matches(&self, doc: &Document) -> bool {
        self.selector.matches(doc)
    }

    /// Applies the projection, if any, to one document.
    pub fn project(&self, doc: &Document) -> Document {
        match &self.options.fields {
            Some(p) => doc.project(&p.include),
            None => doc.clone(),
        }
    }

    /// Runs the query over an in-memory collection.
    ///
    /// Filters, sorts (stable, so insertion order breaks ties), skips, limits
    /// and projects, in that order.
    pub fn execute<'a, I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched: Vec<&Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        if let Some(sort) = &self.options.sort {
            matched.sort_by(|a, b| sort.compare(a, b));
        }
        let skip = self.options.skip.unwrap_or(0);
        let limit = self.options.limit.unwrap_or(usize::MAX);
        matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|d| self.project(d))
            .collect()
    }
}
