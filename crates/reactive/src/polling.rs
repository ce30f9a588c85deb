//! Polling driver.
//!
//! Re-runs the query whenever the bus reports an overlapping write, at most
//! once per throttle window, and on a fallback interval for writes made
//! outside this process. A write that arrives with a fence joins it; the
//! fence is released by the first poll that starts after the notification.

use crate::result_set::LiveResultSet;
use crate::scheduler::Throttle;
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) fn start(rs: &Arc<LiveResultSet>) {
    let ctx = rs.context().clone();
    let weak = Arc::downgrade(rs);

    let throttle = Arc::new(Throttle::new(&ctx.scheduler, ctx.config.throttle_window, {
        let weak = weak.clone();
        move || {
            if let Some(rs) = weak.upgrade() {
                rs.ensure_poll_is_scheduled();
            }
        }
    }));

    let listeners = ctx.bus.listen_all(rs.descriptor(), {
        let weak = weak.clone();
        let throttle = throttle.clone();
        move |notification, fence| {
            let Some(rs) = weak.upgrade() else {
                return;
            };
            if let Some(fence) = fence {
                match fence.begin_write() {
                    Ok(token) => rs.push_pending_write(token),
                    Err(e) => debug!(result_set = rs.id(), error = %e, "fence closed before poll"),
                }
            }
            trace!(result_set = rs.id(), collection = %notification.collection, "invalidated");
            if rs.polls_scheduled() == 0 {
                throttle.call();
            }
        }
    });

    let timer = ctx.scheduler.schedule_repeating(ctx.config.poll_interval, move || {
        if let Some(rs) = weak.upgrade() {
            rs.ensure_poll_is_scheduled();
        }
    });

    let cleanup_ctx = ctx.clone();
    rs.on_stop(move || {
        drop(listeners);
        throttle.cancel();
        cleanup_ctx.scheduler.cancel(timer);
    });

    rs.ensure_poll_is_scheduled();
}
