//! Explicit batching context for emitted change events.
//!
//! Diff functions never call observers directly. They push every event into a
//! `ChangeBatch`, which either queues it for later fan-out or hands it straight
//! to a sink. The choice belongs to the caller, not to ambient state.

use crate::change::ChangeEvent;

/// Receiver of immediately dispatched change events.
pub trait ChangeSink {
    fn on_event(&mut self, event: ChangeEvent);
}

impl<F> ChangeSink for F
where
    F: FnMut(ChangeEvent),
{
    fn on_event(&mut self, event: ChangeEvent) {
        self(event)
    }
}

/// Batching context passed to every diff call.
pub enum ChangeBatch<'a> {
    /// Events are collected and returned by `into_events`.
    Deferred(Vec<ChangeEvent>),
    /// Events are dispatched as they are produced.
    Immediate {
        sink: &'a mut dyn ChangeSink,
        dispatched: usize,
    },
}

impl<'a> ChangeBatch<'a> {
    /// Creates a batch that queues events.
    pub fn deferred() -> Self {
        ChangeBatch::Deferred(Vec::new())
    }

    /// Creates a batch that forwards events to `sink` immediately.
    pub fn immediate(sink: &'a mut dyn ChangeSink) -> Self {
        ChangeBatch::Immediate {
            sink,
            dispatched: 0,
        }
    }

    /// Records one event.
    pub fn push(&mut self, event: ChangeEvent) {
        match self {
            ChangeBatch::Deferred(events) => events.push(event),
            ChangeBatch::Immediate { sink, dispatched } => {
                *dispatched += 1;
                sink.on_event(event);
            }
        }
    }

    /// Returns the number of events recorded so far.
    pub fn len(&self) -> usize {
        match self {
            ChangeBatch::Deferred(events) => events.len(),
            ChangeBatch::Immediate { dispatched, .. } => *dispatched,
        }
    }

    /// Returns true if no event was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if events are being queued.
    pub fn is_deferred(&self) -> bool {
        matches!(self, ChangeBatch::Deferred(_))
    }

    /// Returns the queued events. Immediate batches have none left.
    pub fn into_events(self) -> Vec<ChangeEvent> {
        match self {
            ChangeBatch::Deferred(events) => events,
            ChangeBatch::Immediate { .. } => Vec::new(),
        }
    }
}

impl Default for ChangeBatch<'_> {
    fn default() -> Self {
        Self::deferred()
    }
}
