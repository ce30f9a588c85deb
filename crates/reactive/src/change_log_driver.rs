//! Change-log driver.
//!
//! Serves unordered queries without sort, limit or skip from the store's
//! change log instead of re-running them. Each entry for the collection is
//! re-checked document by document on the result set's queue. Collection
//! drops and fetch failures fall back to a full re-poll.
//!
//! Fenced writes are committed once the tailer has delivered everything up
//! to the write and this set has applied it.

use crate::result_set::LiveResultSet;
use ripple_core::{Error, Result};
use ripple_store::ChangeLogEntry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs on the set's queue: `on_entry` blocks until the tailer is positioned.
pub(crate) fn start(rs: &Arc<LiveResultSet>) -> Result<()> {
    let ctx = rs.context().clone();
    let tailer = ctx.tailer.as_ref().ok_or(Error::TailerStopped)?;
    let weak = Arc::downgrade(rs);
    let ids = rs.descriptor().selector().ids_matched();

    // Registered before the initial poll is queued: an entry that races the
    // first query is then applied on top of it instead of being lost.
    let entries = tailer.on_entry(rs.descriptor().collection(), {
        let weak = weak.clone();
        move |entry| {
            if let (Some(ids), Some(id)) = (&ids, &entry.document_id) {
                if !ids.contains(id) {
                    return;
                }
            }
            let Some(rs) = weak.upgrade() else {
                return;
            };
            let task_rs = rs.clone();
            let entry = entry.clone();
            if let Err(e) = rs.queue().queue_task(move || apply_entry(&task_rs, &entry)) {
                debug!(result_set = rs.id(), error = %e, "dropping change log entry");
            }
        }
    })?;

    let listeners = ctx.bus.listen_all(rs.descriptor(), move |_, fence| {
        let (Some(fence), Some(rs)) = (fence, weak.upgrade()) else {
            return;
        };
        let Ok(token) = fence.begin_write() else {
            return;
        };
        let Some(tailer) = rs.context().tailer.as_ref() else {
            return;
        };
        let weak = Arc::downgrade(&rs);
        // If the callback is dropped unrun, the token commits on drop.
        let queued = tailer.call_when_processed_latest(move || {
            if let Some(rs) = weak.upgrade() {
                let _ = rs.queue().queue_task(move || token.committed());
            }
        });
        if let Err(e) = queued {
            debug!(result_set = rs.id(), error = %e, "tailer unavailable for fenced write");
        }
    });

    rs.on_stop(move || {
        drop(entries);
        drop(listeners);
    });

    rs.ensure_poll_is_scheduled();
    Ok(())
}

fn apply_entry(rs: &Arc<LiveResultSet>, entry: &ChangeLogEntry) {
    if rs.is_stopped() {
        return;
    }
    let Some(id) = entry.document_id.as_ref().filter(|_| !entry.is_drop()) else {
        rs.requery("collection dropped");
        return;
    };
    match rs.context().store.find_by_id(&entry.collection, id) {
        Ok(current) => rs.apply_document(id, current),
        Err(e) => {
            warn!(result_set = rs.id(), id = %id, error = %e, "fetching changed document failed");
            rs.requery("fetch failed");
        }
    }
}
