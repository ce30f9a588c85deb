//! Ordered diff with move detection.
//!
//! Documents that keep their relative order are found as the longest
//! increasing subsequence of their old positions, taken over the new result.
//! Everything else that survives is reported as moved. The new result is then
//! walked group by group, each group ending at an unmoved anchor (the last
//! group is anchored by the end of the list).

use crate::batch::ChangeBatch;
use crate::change::{changed_fields, ChangeEvent};
use hashbrown::{HashMap, HashSet};
use ripple_core::{DocId, Document, SortSpec};
use std::cmp::Ordering;

/// Emits the events that turn the list `old` into the list `new`.
///
/// Order of emission: removals, then for each group the additions
/// (`AddedBefore`) and moves (`Changed` if needed, then `MovedBefore`), then a
/// `Changed` on the anchor if needed.
pub fn diff_ordered(old: &[Document], new: &[Document], batch: &mut ChangeBatch<'_>) {
    let old_index: HashMap<&DocId, usize> =
        old.iter().enumerate().map(|(i, d)| (d.id(), i)).collect();
    let new_ids: HashSet<&DocId> = new.iter().map(|d| d.id()).collect();

    let unmoved = stable_positions(new, &old_index);

    for doc in old {
        if !new_ids.contains(doc.id()) {
            batch.push(ChangeEvent::Removed {
                id: doc.id().clone(),
            });
        }
    }

    let mut start = 0;
    for end in unmoved.into_iter().chain(std::iter::once(new.len())) {
        let anchor = new.get(end).map(|d| d.id().clone());
        for doc in &new[start..end] {
            match old_index.get(doc.id()) {
                None => batch.push(ChangeEvent::AddedBefore {
                    id: doc.id().clone(),
                    fields: doc.fields().clone(),
                    before: anchor.clone(),
                }),
                Some(&i) => {
                    push_changed(&old[i], doc, batch);
                    batch.push(ChangeEvent::MovedBefore {
                        id: doc.id().clone(),
                        before: anchor.clone(),
                    });
                }
            }
        }
        if let Some(anchor_doc) = new.get(end) {
            if let Some(&i) = old_index.get(anchor_doc.id()) {
                push_changed(&old[i], anchor_doc, batch);
            }
        }
        start = end + 1;
    }
}

fn push_changed(old: &Document, new: &Document, batch: &mut ChangeBatch<'_>) {
    if old.fields() == new.fields() {
        return;
    }
    let changes = changed_fields(old.fields(), new.fields());
    if !changes.is_empty() {
        batch.push(ChangeEvent::Changed {
            id: new.id().clone(),
            changes,
        });
    }
}

/// Returns the indices into `new` of the documents that did not move, in
/// increasing order.
fn stable_positions(new: &[Document], old_index: &HashMap<&DocId, usize>) -> Vec<usize> {
    // tails[k]: (old index, new index) ending the best subsequence of length k + 1
    let mut tails: Vec<(usize, usize)> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; new.len()];

    for (n, doc) in new.iter().enumerate() {
        let Some(&o) = old_index.get(doc.id()) else {
            continue;
        };
        let k = tails.partition_point(|&(t, _)| t < o);
        prev[n] = if k == 0 { None } else { Some(tails[k - 1].1) };
        if k == tails.len() {
            tails.push((o, n));
        } else {
            tails[k] = (o, n);
        }
    }

    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().map(|&(_, n)| n);
    while let Some(n) = cursor {
        out.push(n);
        cursor = prev[n];
    }
    out.reverse();
    out
}

/// Reorders runs of equal sort keys in `new` so that documents whose sort key
/// did not change keep their relative order from `old`.
///
/// Documents that are new, or whose sort key changed, keep the slot the store
/// gave them. Without a sort the whole result is a single run.
pub fn stabilize_ties(old: &[Document], new: Vec<Document>, sort: Option<&SortSpec>) -> Vec<Document> {
    if old.is_empty() || new.len() < 2 {
        return new;
    }
    let old_by_id: HashMap<&DocId, (usize, &Document)> =
        old.iter().enumerate().map(|(i, d)| (d.id(), (i, d))).collect();

    let same_key = |a: &Document, b: &Document| match sort {
        Some(sort) => sort.compare(a, b) == Ordering::Equal,
        None => true,
    };
    let old_position = |doc: &Document| -> Option<usize> {
        let &(i, prior) = old_by_id.get(doc.id())?;
        match sort {
            Some(sort) if sort.key_of(prior) != sort.key_of(doc) => None,
            _ => Some(i),
        }
    };

    let mut cells: Vec<Option<Document>> = new.into_iter().map(Some).collect();
    let mut start = 0;
    while start < cells.len() {
        let mut end = start + 1;
        while end < cells.len() {
            match (&cells[start], &cells[end]) {
                (Some(a), Some(b)) if same_key(a, b) => end += 1,
                _ => break,
            }
        }
        if end - start > 1 {
            let mut slots = Vec::new();
            let mut stable = Vec::new();
            for slot in start..end {
                let pos = cells[slot].as_ref().and_then(|d| old_position(d));
                if let Some(pos) = pos {
                    slots.push(slot);
                    if let Some(doc) = cells[slot].take() {
                        stable.push((pos, doc));
                    }
                }
            }
            stable.sort_by_key(|(pos, _)| *pos);
            for (slot, (_, doc)) in slots.into_iter().zip(stable) {
                cells[slot] = Some(doc);
            }
        }
        start = end;
    }
    cells.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::Value;

    fn doc(id: &str, v: i64) -> Document {
        Document::empty(id).with("v", v)
    }

    fn diff(old: &[Document], new: &[Document]) -> Vec<ChangeEvent> {
        let mut batch = ChangeBatch::deferred();
        diff_ordered(old, new, &mut batch);
        batch.into_events()
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.id().as_str()).collect()
    }

    #[test]
    fn test_change_without_move() {
        let old = vec![doc("A", 1), doc("B", 2), doc("C", 3)];
        let new = vec![doc("A", 1), doc("B", 20), doc("C", 3)];
        let events = diff(&old, &new);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ChangeEvent::Changed { id, changes }
            if id.as_str() == "B" && changes["v"].new == Some(Value::Int64(20))));
    }

    #[test]
    fn test_rotation_is_one_move() {
        let old = vec![doc("A", 1), doc("B", 2), doc("C", 3)];
        let new = vec![doc("C", 3), doc("A", 1), doc("B", 2)];
        let events = diff(&old, &new);
        assert_eq!(
            events,
            vec![ChangeEvent::MovedBefore {
                id: "C".into(),
                before: Some("A".into()),
            }]
        );
    }

    #[test]
    fn test_move_to_end() {
        let old = vec![doc("A", 1), doc("B", 2), doc("C", 3)];
        let new = vec![doc("B", 2), doc("C", 3), doc("A", 1)];
        let events = diff(&old, &new);
        assert_eq!(
            events,
            vec![ChangeEvent::MovedBefore {
                id: "A".into(),
                before: None,
            }]
        );
    }

    #[test]
    fn test_add_remove_and_anchor_change() {
        let old = vec![doc("A", 1), doc("B", 2), doc("C", 3)];
        let new = vec![doc("X", 9), doc("A", 1), doc("C", 30)];
        let events = diff(&old, &new);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ChangeEvent::Removed { id: "B".into() });
        assert!(matches!(&events[1], ChangeEvent::AddedBefore { id, before: Some(b), .. }
            if id.as_str() == "X" && b.as_str() == "A"));
        assert!(matches!(&events[2], ChangeEvent::Changed { id, .. } if id.as_str() == "C"));
    }

    #[test]
    fn test_moved_element_reports_change_before_move() {
        let old = vec![doc("A", 1), doc("B", 2), doc("C", 3)];
        let new = vec![doc("C", 0), doc("A", 1), doc("B", 2)];
        let events = diff(&old, &new);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "changed");
        assert_eq!(events[1].kind(), "moved_before");
    }

    #[test]
    fn test_identical_is_silent() {
        let list = vec![doc("A", 1), doc("B", 2)];
        assert!(diff(&list, &list.clone()).is_empty());
        assert!(diff(&[], &[]).is_empty());
    }

    #[test]
    fn test_stabilize_ties_keeps_old_order() {
        let sort = SortSpec::new().asc("v");
        let old = vec![doc("A", 1), doc("B", 1), doc("C", 2)];
        // The store returned the tie in the other order.
        let new = vec![doc("B", 1), doc("A", 1), doc("C", 2)];
        let stable = stabilize_ties(&old, new, Some(&sort));
        assert_eq!(ids(&stable), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_stabilize_ties_respects_changed_sort_field() {
        let sort = SortSpec::new().asc("v");
        let old = vec![doc("A", 1), doc("B", 0), doc("C", 1)];
        // B's sort field changed; it now ties with A and C and keeps its slot.
        let new = vec![doc("B", 1), doc("C", 1), doc("A", 1)];
        let stable = stabilize_ties(&old, new, Some(&sort));
        assert_eq!(ids(&stable), vec!["B", "A", "C"]);
    }

    #[test]
    fn test_stabilize_ties_leaves_new_documents() {
        let old = vec![doc("A", 1), doc("B", 1)];
        let new = vec![doc("B", 1), doc("N", 1), doc("A", 1)];
        let stable = stabilize_ties(&old, new, None);
        assert_eq!(ids(&stable), vec!["A", "N", "B"]);
    }
}
