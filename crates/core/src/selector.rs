//! Document selectors.
//!
//! A `Selector` is the filter part of a cursor descriptor. Selectors are plain
//! data: they can be evaluated against a document, canonicalized so that
//! logically identical filters serialize to identical bytes, and inspected for
//! the exact id set they are restricted to.

use crate::document::{DocId, Document, ID_FIELD};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A document filter.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Selector {
    /// Matches every document.
    All,
    /// Matches the document with this id.
    Id(DocId),
    /// Matches documents whose id is in the set.
    IdIn(BTreeSet<DocId>),
    /// Field equality. Array fields match if any element is equal.
    Eq { field: String, value: Value },
    /// Field comparison. Only values of the same type class are comparable.
    Cmp { field: String, op: CmpOp, value: Value },
    /// Field membership.
    In { field: String, values: Vec<Value> },
    /// Field presence.
    Exists { field: String, exists: bool },
    /// Conjunction.
    And(Vec<Selector>),
    /// Disjunction. An empty disjunction matches nothing.
    Or(Vec<Selector>),
}

impl Default for Selector {
    fn default() -> Self {
        Selector::All
    }
}

impl Selector {
    /// Field equality.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Field comparison.
    pub fn cmp(field: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Selector::Cmp {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Field membership.
    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Selector::In {
            field: field.into(),
            values: values.into_iter().collect(),
        }
    }

    /// Field presence.
    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Selector::Exists {
            field: field.into(),
            exists,
        }
    }

    /// Id equality.
    pub fn id(id: impl Into<DocId>) -> Self {
        Selector::Id(id.into())
    }

    /// Id membership.
    pub fn id_in<I, D>(ids: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DocId>,
    {
        Selector::IdIn(ids.into_iter().map(Into::into).collect())
    }

    /// Conjunction of the given selectors.
    pub fn and(selectors: impl IntoIterator<Item = Selector>) -> Self {
        Selector::And(selectors.into_iter().collect())
    }

    /// Disjunction of the given selectors.
    pub fn or(selectors: impl IntoIterator<Item = Selector>) -> Self {
        Selector::Or(selectors.into_iter().collect())
    }

    /// Evaluates the selector against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selector::All => true,
            Selector::Id(id) => doc.id() == id,
            Selector::IdIn(ids) => ids.contains(doc.id()),
            Selector::Eq { field, value } => match resolve(doc, field) {
                Some(found) => equals_or_contains(&found, value),
                None => value.is_null(),
            },
            Selector::Cmp { field, op, value } => {
                let found = resolve(doc, field);
                match op {
                    CmpOp::Ne => match found {
                        Some(found) => !equals_or_contains(&found, value),
                        None => !value.is_null(),
                    },
                    _ => found.is_some_and(|found| compare_any(&found, *op, value)),
                }
            }
            Selector::In { field, values } => match resolve(doc, field) {
                Some(found) => values.iter().any(|v| equals_or_contains(&found, v)),
                None => values.iter().any(Value::is_null),
            },
            Selector::Exists { field, exists } => resolve(doc, field).is_some() == *exists,
            Selector::And(children) => children.iter().all(|c| c.matches(doc)),
            Selector::Or(children) => children.iter().any(|c| c.matches(doc)),
        }
    }

    /// Returns the normal form of this selector.
    ///
    /// Nested conjunctions and disjunctions are flattened, children are sorted
    /// and deduplicated, single-child groups collapse, and membership lists are
    /// sorted. Two selectors with the same normal form match the same documents.
    pub fn canonicalize(&self) -> Selector {
        match self {
            Selector::IdIn(ids) if ids.len() == 1 => match ids.first() {
                Some(id) => Selector::Id(id.clone()),
                None => Selector::IdIn(ids.clone()),
            },
            Selector::In { field, values } => {
                let mut values = values.clone();
                values.sort();
                values.dedup();
                Selector::In {
                    field: field.clone(),
                    values,
                }
            }
            Selector::And(children) => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child.canonicalize() {
                        Selector::All => {}
                        Selector::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                flat.sort();
                flat.dedup();
                match flat.len() {
                    0 => Selector::All,
                    1 => flat.remove(0),
                    _ => Selector::And(flat),
                }
            }
            Selector::Or(children) => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child.canonicalize() {
                        Selector::All => return Selector::All,
                        Selector::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                flat.sort();
                flat.dedup();
                if flat.len() == 1 {
                    flat.remove(0)
                } else {
                    Selector::Or(flat)
                }
            }
            other => other.clone(),
        }
    }

    /// Returns the exact set of ids this selector is restricted to, if any.
    pub fn ids_matched(&self) -> Option<BTreeSet<DocId>> {
        match self {
            Selector::Id(id) => Some(BTreeSet::from([id.clone()])),
            Selector::IdIn(ids) => Some(ids.clone()),
            Selector::Eq { field, value } if field == ID_FIELD => {
                value.as_str().map(|s| BTreeSet::from([DocId::from(s)]))
            }
            Selector::And(children) => children
                .iter()
                .filter_map(Selector::ids_matched)
                .reduce(|acc, ids| acc.intersection(&ids).cloned().collect()),
            Selector::Or(children) if !children.is_empty() => {
                let mut all = BTreeSet::new();
                for child in children {
                    all.extend(child.ids_matched()?);
                }
                Some(all)
            }
            _ => None,
        }
    }

    /// Returns true if the selector is a conjunction of plain equalities.
    pub fn is_pure_equality(&self) -> bool {
        match self {
            Selector::All | Selector::Id(_) | Selector::Eq { .. } => true,
            Selector::And(children) => children.iter().all(Selector::is_pure_equality),
            _ => false,
        }
    }
}

fn resolve<'a>(doc: &'a Document, field: &str) -> Option<Cow<'a, Value>> {
    if field == ID_FIELD {
        return Some(Cow::Owned(Value::String(doc.id().as_str().to_string())));
    }
    doc.get(field).map(Cow::Borrowed)
}

fn equals_or_contains(found: &Value, expected: &Value) -> bool {
    if found == expected {
        return true;
    }
    match found {
        Value::Array(items) => items.iter().any(|item| item == expected),
        _ => false,
    }
}

fn compare_any(found: &Value, op: CmpOp, expected: &Value) -> bool {
    if let Value::Array(items) = found {
        if !matches!(expected, Value::Array(_)) {
            return items.iter().any(|item| compare(item, op, expected));
        }
    }
    compare(found, op, expected)
}

fn compare(found: &Value, op: CmpOp, expected: &Value) -> bool {
    let same_class = std::mem::discriminant(found) == std::mem::discriminant(expected)
        || (found.is_number() && expected.is_number());
    if !same_class {
        return false;
    }
    // Numeric comparison by magnitude so that 1 and 1.0 tie.
    let ord = match (found.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) if !a.is_nan() && !b.is_nan() => {
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        }
        _ => found.cmp(expected),
    };
    match op {
        CmpOp::Ne => ord.is_ne(),
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
    }
}
