//! Integration tests for the live query engine.
//!
//! Every test drives a `Registry` over a `MemoryStore` end to end: observers
//! are attached through `observe_changes` and writes go through the fenced
//! write path unless a test needs otherwise.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use ripple_core::{CmpOp, CursorDescriptor, DocId, Document, Error, Selector, SortSpec};
use ripple_reactive::{
    DriverKind, LiveQueryConfig, Notification, ObserveHandle, OrderedCallbacks, PollObserver, PollOutcome,
    Registry, ResultSetId, UnorderedCallbacks,
};
use ripple_store::{DocumentWriter, MemoryStore, Modifier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polling only, with a fallback interval long enough to never fire.
fn polling_config() -> LiveQueryConfig {
    LiveQueryConfig::default()
        .with_change_log(false)
        .with_poll_interval(Duration::from_secs(60))
        .with_throttle_window(Duration::from_millis(5))
}

fn polling_registry(store: &Arc<MemoryStore>) -> Registry {
    init_tracing();
    Registry::builder(store.clone())
        .writer(store.clone())
        .config(polling_config())
        .build()
        .unwrap()
}

fn change_log_registry(store: &Arc<MemoryStore>) -> Registry {
    init_tracing();
    let config = LiveQueryConfig::default()
        .with_poll_interval(Duration::from_secs(60))
        .with_tailer_idle_interval(Duration::from_millis(1))
        .with_tailer_reconnect_delay(Duration::from_millis(5));
    Registry::builder(store.clone())
        .writer(store.clone())
        .change_log(store.clone())
        .config(config)
        .build()
        .unwrap()
}

/// Records every callback as a short line and forwards it to a channel.
#[derive(Clone)]
struct Recorder {
    lines: Arc<Mutex<Vec<String>>>,
    tx: Sender<String>,
}

impl Recorder {
    fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = unbounded();
        (
            Self {
                lines: Arc::new(Mutex::new(Vec::new())),
                tx,
            },
            rx,
        )
    }

    fn push(&self, line: String) {
        self.lines.lock().push(line.clone());
        let _ = self.tx.send(line);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }

    fn unordered(&self) -> UnorderedCallbacks {
        let (a, c, r) = (self.clone(), self.clone(), self.clone());
        UnorderedCallbacks::new()
            .on_added(move |id, _| a.push(format!("added {id}")))
            .on_changed(move |id, changes| {
                let fields: Vec<&str> = changes.keys().map(String::as_str).collect();
                c.push(format!("changed {id} {}", fields.join(",")))
            })
            .on_removed(move |id| r.push(format!("removed {id}")))
    }

    fn ordered(&self) -> OrderedCallbacks {
        let (a, c, r, m) = (self.clone(), self.clone(), self.clone(), self.clone());
        OrderedCallbacks::new()
            .on_added_before(move |id, _, before| a.push(format!("added {id} before {}", name(before))))
            .on_changed(move |id, _| c.push(format!("changed {id}")))
            .on_removed(move |id| r.push(format!("removed {id}")))
            .on_moved_before(move |id, before| m.push(format!("moved {id} before {}", name(before))))
    }
}

fn name(id: Option<&DocId>) -> String {
    id.map_or_else(|| "end".to_string(), |id| id.to_string())
}

fn player(id: &str, team: &str, score: i64) -> Document {
    Document::empty(id).with("team", team).with("score", score)
}

fn reds() -> CursorDescriptor {
    CursorDescriptor::new("players", Selector::eq("team", "red"))
}

#[derive(Default)]
struct PollCounter {
    started: AtomicUsize,
    outcomes: Mutex<Vec<(ResultSetId, PollOutcome)>>,
}

impl PollObserver for PollCounter {
    fn poll_started(&self, _result_set: ResultSetId) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn poll_finished(&self, result_set: ResultSetId, outcome: PollOutcome) {
        self.outcomes.lock().push((result_set, outcome));
    }
}

#[test]
fn test_identical_queries_share_one_poll() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = polling_registry(&store);
    let counter = Arc::new(PollCounter::default());
    registry.set_poll_observer(Some(counter.clone()));

    let recorders: Vec<(Recorder, Receiver<String>)> = (0..5).map(|_| Recorder::new()).collect();
    let handles: Vec<ObserveHandle> = recorders
        .iter()
        .map(|(rec, _)| registry.observe_changes(reds(), rec.unordered()).unwrap())
        .collect();

    // Joining observers are served from the cached snapshot.
    assert_eq!(store.find_count(), 1);
    assert_eq!(registry.result_set_count(), 1);
    for (rec, _) in &recorders {
        assert_eq!(rec.take(), vec!["added a"]);
    }

    registry
        .write(|w| w.insert("players", player("b", "red", 2)))
        .unwrap();
    assert_eq!(store.find_count(), 2);
    assert_eq!(counter.started.load(Ordering::SeqCst), 2);
    for (rec, _) in &recorders {
        assert_eq!(rec.take(), vec!["added b"]);
    }

    let stats = registry.result_set_stats(handles[0].result_set_id().unwrap()).unwrap();
    assert_eq!(stats.handles, 5);
    assert_eq!(stats.documents, 2);
    assert_eq!(stats.completed_polls, 2);
    assert_eq!(stats.driver, DriverKind::Polling);
}

#[test]
fn test_ordered_and_unordered_observers_do_not_share() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let (rec, _rx) = Recorder::new();
    let u = registry.observe_changes(reds(), rec.unordered()).unwrap();
    let o = registry.observe_changes(reds(), rec.ordered()).unwrap();
    assert_ne!(u.result_set_id(), o.result_set_id());
    assert_eq!(registry.result_set_count(), 2);
}

#[test]
fn test_unchanged_results_produce_no_events() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = polling_registry(&store);
    let counter = Arc::new(PollCounter::default());
    registry.set_poll_observer(Some(counter.clone()));
    let (rec, _rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();
    rec.take();

    // Touches the collection without affecting the result.
    registry
        .write(|w| w.insert("players", player("z", "blue", 9)))
        .unwrap();
    assert!(rec.take().is_empty());
    let outcomes = counter.outcomes.lock().clone();
    assert_eq!(outcomes.last().map(|(_, o)| *o), Some(PollOutcome::Completed { events: 0 }));
}

#[test]
fn test_unordered_add_change_remove() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let (rec, _rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();
    assert!(rec.take().is_empty());

    registry
        .write(|w| w.insert("players", player("a", "red", 1)))
        .unwrap();
    assert_eq!(rec.take(), vec!["added a"]);

    registry
        .write(|w| w.update("players", &Selector::id("a"), &Modifier::new().set("score", 5i64)))
        .unwrap();
    assert_eq!(rec.take(), vec!["changed a score"]);

    // Leaving the result is a removal, not a change.
    registry
        .write(|w| w.update("players", &Selector::id("a"), &Modifier::new().set("team", "blue")))
        .unwrap();
    assert_eq!(rec.take(), vec!["removed a"]);
}

#[test]
fn test_ordered_observer_sees_moves() {
    let store = Arc::new(MemoryStore::new());
    for (id, score) in [("a", 1i64), ("b", 2), ("c", 3)] {
        store.insert("players", player(id, "red", score)).unwrap();
    }
    let registry = polling_registry(&store);
    let (rec, _rx) = Recorder::new();
    let query = reds().with_sort(SortSpec::new().asc("score"));
    let _h = registry.observe_changes(query, rec.ordered()).unwrap();
    assert_eq!(rec.take(), vec!["added a before end", "added b before end", "added c before end"]);

    registry
        .write(|w| w.update("players", &Selector::id("c"), &Modifier::new().set("score", 0i64)))
        .unwrap();
    let lines = rec.take();
    assert!(lines.contains(&"changed c".to_string()), "{lines:?}");
    assert!(lines.contains(&"moved c before a".to_string()), "{lines:?}");
    assert_eq!(lines.len(), 2);
}

/// Start and finish time of every poll.
#[derive(Default)]
struct Timeline {
    started: Mutex<Vec<Instant>>,
    finished: Mutex<Vec<Instant>>,
}

impl PollObserver for Timeline {
    fn poll_started(&self, _result_set: ResultSetId) {
        self.started.lock().push(Instant::now());
    }

    fn poll_finished(&self, _result_set: ResultSetId, _outcome: PollOutcome) {
        self.finished.lock().push(Instant::now());
    }
}

#[test]
fn test_write_waits_for_a_poll_started_after_it() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let timeline = Arc::new(Timeline::default());
    registry.set_poll_observer(Some(timeline.clone()));
    let (rec, _rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();

    store.set_find_delay(Duration::from_millis(50));
    // Starts a slow poll that may or may not see the write below.
    registry.notify(&Notification::collection("players"), None);
    thread::sleep(Duration::from_millis(10));

    let before_write = Instant::now();
    registry
        .write(|w| w.insert("players", player("a", "red", 1)))
        .unwrap();
    let done = Instant::now();
    assert_eq!(rec.take(), vec!["added a"]);

    let started = timeline.started.lock().clone();
    let finished = timeline.finished.lock().clone();
    let covering = started
        .iter()
        .zip(&finished)
        .any(|(s, f)| *s >= before_write && *f <= done);
    assert!(covering, "no complete poll between the write and its return");
}

#[test]
fn test_observe_from_own_callback_is_reentrant() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = Arc::new(polling_registry(&store));
    let weak: Weak<Registry> = Arc::downgrade(&registry);
    let (tx, rx) = unbounded();

    let _h = registry
        .observe_changes(
            reds(),
            UnorderedCallbacks::new().on_added(move |_, _| {
                if let Some(registry) = weak.upgrade() {
                    let result = registry.observe_changes(reds(), UnorderedCallbacks::new());
                    let _ = tx.send(result.map(|h| h.id()));
                }
            }),
        )
        .unwrap();

    let result = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(result, Err(Error::ReentrantTask { .. })), "{result:?}");
    // The failed join left the set intact.
    assert_eq!(registry.result_set_count(), 1);
    let stats = registry.result_sets();
    assert_eq!(stats[0].handles, 1);
}

#[test]
fn test_initial_query_failure_is_reported_and_cleaned_up() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    store.fail_next_finds(1);

    let err = registry.observe_changes(reds(), UnorderedCallbacks::new()).unwrap_err();
    assert!(matches!(err, Error::InitialQuery { .. }), "{err:?}");
    assert_eq!(registry.result_set_count(), 0);
    assert_eq!(registry.bus().listener_count(), 0);

    // The next observer starts over with a fresh set.
    let h = registry.observe_changes(reds(), UnorderedCallbacks::new()).unwrap();
    assert_eq!(registry.result_set_count(), 1);
    h.stop().unwrap();
}

#[test]
fn test_transient_poll_failure_keeps_results_and_releases_writes() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = polling_registry(&store);
    let counter = Arc::new(PollCounter::default());
    registry.set_poll_observer(Some(counter.clone()));
    let (rec, _rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();
    rec.take();

    store.fail_next_finds(1);
    // Returns even though the poll it waited for failed.
    registry
        .write(|w| w.insert("players", player("b", "red", 2)))
        .unwrap();
    assert!(rec.take().is_empty());
    assert!(counter.outcomes.lock().iter().any(|(_, o)| *o == PollOutcome::Failed));

    registry
        .write(|w| w.insert("players", player("c", "red", 3)))
        .unwrap();
    let mut lines = rec.take();
    lines.sort();
    assert_eq!(lines, vec!["added b", "added c"]);
}

#[test]
fn test_stop_from_inside_callback() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = polling_registry(&store);
    let slot: Arc<Mutex<Option<ObserveHandle>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = {
        let slot = slot.clone();
        let calls = calls.clone();
        registry
            .observe_changes(
                reds(),
                UnorderedCallbacks::new().on_changed(move |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(handle) = slot.lock().take() {
                        handle.stop().unwrap();
                    }
                }),
            )
            .unwrap()
    };
    *slot.lock() = Some(handle);

    let bump = |n: i64| {
        registry
            .write(|w| w.update("players", &Selector::id("a"), &Modifier::new().set("score", n)))
            .unwrap()
    };
    bump(2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.result_set_count(), 0);

    bump(3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stopped_handle_receives_nothing() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let (kept, _rx1) = Recorder::new();
    let (gone, _rx2) = Recorder::new();
    let _keep = registry.observe_changes(reds(), kept.unordered()).unwrap();
    let leave = registry.observe_changes(reds(), gone.unordered()).unwrap();

    leave.stop().unwrap();
    assert!(matches!(leave.stop(), Err(Error::HandleStopped { .. })));
    registry
        .write(|w| w.insert("players", player("a", "red", 1)))
        .unwrap();
    assert_eq!(kept.take(), vec!["added a"]);
    assert!(gone.take().is_empty());
    assert_eq!(registry.result_set_count(), 1);
}

#[test]
fn test_suspend_and_resume_polling() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let (rec, _rx) = Recorder::new();
    let h = registry.observe_changes(reds(), rec.unordered()).unwrap();
    let id = h.result_set_id().unwrap();

    registry.suspend_polling(id).unwrap();
    registry
        .write_path()
        .unwrap()
        .insert("players", player("a", "red", 1))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(rec.take().is_empty());

    registry.resume_polling(id).unwrap();
    assert_eq!(rec.take(), vec!["added a"]);
}

#[test]
fn test_fallback_interval_catches_external_writes() {
    let store = Arc::new(MemoryStore::new());
    init_tracing();
    let registry = Registry::builder(store.clone())
        .config(polling_config().with_poll_interval(Duration::from_millis(20)))
        .build()
        .unwrap();
    let (rec, rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();

    // Bypasses the bus entirely.
    store.insert("players", player("a", "red", 1)).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "added a");
}

#[test]
fn test_upsert_through_registry() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let (rec, _rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();

    let sel = Selector::and([Selector::id("k"), Selector::eq("team", "red")]);
    let outcome = registry
        .write(|w| w.upsert("players", &sel, &Modifier::new().set("score", 1i64)))
        .unwrap();
    assert_eq!(outcome.inserted, Some(DocId::from("k")));
    assert_eq!(rec.take(), vec!["added k"]);

    let outcome = registry
        .write(|w| w.upsert("players", &sel, &Modifier::new().set("score", 2i64)))
        .unwrap();
    assert_eq!(outcome.matched, 1);
    assert_eq!(rec.take(), vec!["changed k score"]);
}

#[test]
fn test_change_log_driver_follows_writes() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = change_log_registry(&store);
    let counter = Arc::new(PollCounter::default());
    registry.set_poll_observer(Some(counter.clone()));
    let (rec, _rx) = Recorder::new();
    let h = registry.observe_changes(reds(), rec.unordered()).unwrap();
    assert_eq!(rec.take(), vec!["added a"]);

    let stats = registry.result_set_stats(h.result_set_id().unwrap()).unwrap();
    assert_eq!(stats.driver, DriverKind::ChangeLog);

    registry
        .write(|w| w.insert("players", player("b", "red", 2)))
        .unwrap();
    assert_eq!(rec.take(), vec!["added b"]);

    registry
        .write(|w| w.update("players", &Selector::id("a"), &Modifier::new().set("score", 7i64)))
        .unwrap();
    assert_eq!(rec.take(), vec!["changed a score"]);

    registry
        .write(|w| w.update("players", &Selector::id("b"), &Modifier::new().set("team", "blue")))
        .unwrap();
    assert_eq!(rec.take(), vec!["removed b"]);

    registry
        .write(|w| w.remove("players", &Selector::id("a")))
        .unwrap();
    assert_eq!(rec.take(), vec!["removed a"]);

    // Only the initial query ran; everything else came from the log.
    assert_eq!(counter.started.load(Ordering::SeqCst), 1);
}

#[test]
fn test_change_log_driver_requeries_on_drop() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = change_log_registry(&store);
    let (rec, rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "added a");

    store.drop_collection("players").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "removed a");
}

#[test]
fn test_change_log_driver_survives_read_failures() {
    let store = Arc::new(MemoryStore::new());
    let registry = change_log_registry(&store);
    let (rec, rx) = Recorder::new();
    let _h = registry.observe_changes(reds(), rec.unordered()).unwrap();

    store.fail_next_change_log_reads(3);
    store.insert("players", player("a", "red", 1)).unwrap();
    store.insert("players", player("b", "red", 2)).unwrap();
    let mut first: Vec<String> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    first.sort();
    assert_eq!(first, vec!["added a", "added b"]);

    registry
        .write(|w| w.insert("players", player("c", "red", 3)))
        .unwrap();
    let rest: Vec<String> = rx.try_iter().collect();
    assert_eq!(rest, vec!["added c"]);
}

#[test]
fn test_non_equality_query_polls_even_with_change_log() {
    let store = Arc::new(MemoryStore::new());
    let registry = change_log_registry(&store);
    let (rec, _rx) = Recorder::new();
    let query = CursorDescriptor::new("players", Selector::cmp("score", CmpOp::Gt, 10i64));
    let h = registry.observe_changes(query, rec.unordered()).unwrap();
    let stats = registry.result_set_stats(h.result_set_id().unwrap()).unwrap();
    assert_eq!(stats.driver, DriverKind::Polling);

    registry
        .write(|w| w.insert("players", player("a", "red", 11)))
        .unwrap();
    assert_eq!(rec.take(), vec!["added a"]);
}

#[test]
fn test_tailable_observer_bypasses_dedup() {
    let store = Arc::new(MemoryStore::new());
    store.insert("events", Document::empty("e1").with("kind", "log")).unwrap();
    let registry = polling_registry(&store);
    let (rec, rx) = Recorder::new();
    let query = CursorDescriptor::new("events", Selector::eq("kind", "log")).tailable();

    let h = registry.observe_changes(query, rec.unordered()).unwrap();
    assert_eq!(h.result_set_id(), None);
    assert_eq!(registry.result_set_count(), 0);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "added e1");

    store.insert("events", Document::empty("e2").with("kind", "log")).unwrap();
    store.insert("events", Document::empty("e3").with("kind", "audit")).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "added e2");

    h.stop().unwrap();
    store.insert("events", Document::empty("e4").with("kind", "log")).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_stats_serialize() {
    let store = Arc::new(MemoryStore::new());
    let registry = polling_registry(&store);
    let _h = registry.observe_changes(reds(), UnorderedCallbacks::new()).unwrap();
    let json = serde_json::to_value(registry.result_sets()).unwrap();
    assert_eq!(json[0]["collection"], "players");
    assert_eq!(json[0]["driver"], "Polling");
    assert_eq!(json[0]["ready"], true);
}

#[test]
fn test_unreachable_change_log_does_not_block_other_observers() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    store.set_change_log_available(false);
    let registry = Arc::new(change_log_registry(&store));

    let sorted = CursorDescriptor::new("players", Selector::All).with_sort(SortSpec::new().asc("score"));
    let polled = registry.observe_changes(sorted, UnorderedCallbacks::new()).unwrap();

    // Its change-log set cannot start until the tailer has positioned itself.
    let (rec, rx) = Recorder::new();
    let waiting = {
        let registry = registry.clone();
        let callbacks = rec.unordered();
        thread::spawn(move || registry.observe_changes(reds(), callbacks))
    };
    thread::sleep(Duration::from_millis(50));

    let (done_tx, done_rx) = unbounded();
    {
        let registry = registry.clone();
        thread::spawn(move || {
            let stopped = polled.stop().is_ok();
            let _ = done_tx.send((stopped, registry.result_set_count()));
        });
    }
    let (stopped, count) = done_rx.recv_timeout(WAIT).expect("stop blocked by the tailer");
    assert!(stopped);
    assert_eq!(count, 1);

    store.set_change_log_available(true);
    let handle = waiting.join().unwrap().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "added a");
    let stats = registry.result_set_stats(handle.result_set_id().unwrap()).unwrap();
    assert_eq!(stats.driver, DriverKind::ChangeLog);
    assert!(stats.ready);
}

#[test]
fn test_fenced_write_from_callback_is_reentrant() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = Arc::new(polling_registry(&store));
    let weak: Weak<Registry> = Arc::downgrade(&registry);
    let (tx, rx) = unbounded();

    let _h = registry
        .observe_changes(
            reds(),
            UnorderedCallbacks::new().on_added(move |id, _| {
                if id.as_str() != "a" {
                    return;
                }
                if let Some(registry) = weak.upgrade() {
                    let fenced = registry.write(|w| w.insert("players", player("c", "blue", 0)));
                    let unfenced = registry
                        .write_path()
                        .and_then(|w| w.insert("players", player("d", "red", 0)));
                    let _ = tx.send((fenced.map(|_| ()), unfenced.map(|_| ())));
                }
            }),
        )
        .unwrap();

    let (fenced, unfenced) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(fenced, Err(Error::ReentrantTask { .. })), "{fenced:?}");
    assert!(unfenced.is_ok(), "{unfenced:?}");
    assert_eq!(store.len("players"), 2);

    // The worker is still alive: a fenced write from outside completes.
    registry
        .write(|w| w.insert("players", player("e", "red", 0)))
        .unwrap();
    let stats = registry.result_sets();
    assert_eq!(stats[0].documents, 3);
}

#[test]
fn test_racing_observers_share_one_result_set() {
    const OBSERVERS: usize = 8;
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = Arc::new(polling_registry(&store));
    let barrier = Arc::new(Barrier::new(OBSERVERS));

    let workers: Vec<_> = (0..OBSERVERS)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let (rec, _rx) = Recorder::new();
                barrier.wait();
                let handle = registry.observe_changes(reds(), rec.unordered()).unwrap();
                (handle, rec.take())
            })
        })
        .collect();
    let observed: Vec<(ObserveHandle, Vec<String>)> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(registry.result_set_count(), 1);
    assert_eq!(store.find_count(), 1);
    let id = observed[0].0.result_set_id();
    for (handle, lines) in &observed {
        assert_eq!(handle.result_set_id(), id);
        assert_eq!(lines, &vec!["added a".to_string()]);
    }
    assert_eq!(registry.result_sets()[0].handles, OBSERVERS);
}

#[test]
fn test_joiner_keeps_set_alive_when_last_handle_stops() {
    let store = Arc::new(MemoryStore::new());
    store.insert("players", player("a", "red", 1)).unwrap();
    let registry = Arc::new(polling_registry(&store));
    let first = registry.observe_changes(reds(), UnorderedCallbacks::new()).unwrap();
    let id = first.result_set_id();

    // A slow poll holds the worker, so the joiner's attach queues behind it.
    store.set_find_delay(Duration::from_millis(200));
    registry.notify(&Notification::collection("players"), None);
    let joiner = {
        let registry = registry.clone();
        thread::spawn(move || {
            let (rec, _rx) = Recorder::new();
            let handle = registry.observe_changes(reds(), rec.unordered());
            (handle, rec.take())
        })
    };
    thread::sleep(Duration::from_millis(50));
    first.stop().unwrap();
    assert_eq!(registry.result_set_count(), 1);

    let (handle, lines) = joiner.join().unwrap();
    let handle = handle.unwrap();
    assert_eq!(handle.result_set_id(), id);
    assert_eq!(lines, vec!["added a"]);
    assert_eq!(registry.result_set_count(), 1);

    store.set_find_delay(Duration::ZERO);
    handle.stop().unwrap();
    assert_eq!(registry.result_set_count(), 0);
}
