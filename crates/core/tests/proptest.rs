//! Property-based tests for ripple-core using proptest.

use proptest::prelude::*;
use ripple_core::{CmpOp, CursorDescriptor, Document, Selector, Value};

fn leaf() -> impl Strategy<Value = Selector> {
    let field = prop::sample::select(vec!["a", "b", "c"]);
    prop_oneof![
        Just(Selector::All),
        (field.clone(), 0i64..4).prop_map(|(f, v)| Selector::eq(f, v)),
        (field.clone(), 0i64..4, prop::sample::select(vec![CmpOp::Lt, CmpOp::Ge, CmpOp::Ne]))
            .prop_map(|(f, v, op)| Selector::cmp(f, op, v)),
        (field.clone(), prop::collection::vec(0i64..4, 0..3))
            .prop_map(|(f, vs)| Selector::is_in(f, vs.into_iter().map(Value::from))),
        (field, any::<bool>()).prop_map(|(f, e)| Selector::exists(f, e)),
        prop::sample::select(vec!["x", "y", "z"]).prop_map(Selector::id),
    ]
}

fn selector() -> impl Strategy<Value = Selector> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Selector::and),
            prop::collection::vec(inner, 0..4).prop_map(Selector::or),
        ]
    })
}

fn document() -> impl Strategy<Value = Document> {
    (
        prop::sample::select(vec!["x", "y", "z"]),
        prop::option::of(0i64..4),
        prop::option::of(0i64..4),
        prop::option::of(0i64..4),
    )
        .prop_map(|(id, a, b, c)| {
            let mut doc = Document::empty(id);
            for (name, v) in [("a", a), ("b", b), ("c", c)] {
                if let Some(v) = v {
                    doc.set(name, v);
                }
            }
            doc
        })
}

proptest! {
    /// Canonicalization never changes which documents match.
    #[test]
    fn canonicalize_preserves_matching(sel in selector(), docs in prop::collection::vec(document(), 1..8)) {
        let canonical = sel.canonicalize();
        for doc in &docs {
            prop_assert_eq!(sel.matches(doc), canonical.matches(doc));
        }
    }

    /// Canonicalization is idempotent.
    #[test]
    fn canonicalize_is_idempotent(sel in selector()) {
        let once = sel.canonicalize();
        prop_assert_eq!(once.canonicalize(), once);
    }

    /// Reordering the children of a conjunction does not change the dedup key.
    #[test]
    fn conjunction_order_does_not_change_key(children in prop::collection::vec(selector(), 0..5)) {
        let mut reversed = children.clone();
        reversed.reverse();
        let a = CursorDescriptor::new("c", Selector::and(children));
        let b = CursorDescriptor::new("c", Selector::and(reversed));
        prop_assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    /// When a selector names its ids, nothing outside that set matches.
    #[test]
    fn ids_matched_is_an_upper_bound(sel in selector(), doc in document()) {
        if let Some(ids) = sel.ids_matched() {
            if sel.matches(&doc) {
                prop_assert!(ids.contains(doc.id()));
            }
        }
    }
}
