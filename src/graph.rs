//! The graph handle
//!
//! A [`Graph`] is a cheap, clonable handle to one replica. All mutable state
//! sits in a [`Core`] behind a single mutex. Every public operation runs to
//! completion under that lock and collects the events it produces in an
//! outbox; the outbox is delivered after the lock is released, so listeners
//! are free to call back into the same graph.
//!
//! Records stamped later than the local clock are parked in the core. One
//! tokio task at a time sleeps until the earliest parked state and then
//! replays whatever has come due.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::GraphConfig;
use crate::entry::{Entry, State};
use crate::events::{Channel, EventBus, GraphEvent, ListenerId};
use crate::lock;
use crate::merge::{MergeOutcome, PendingRecord};
use crate::mutation::SetValue;
use crate::path;
use crate::record::{GraphSnapshot, Record};
use crate::reference::Ref;
use crate::store::Store;

/// Replica state guarded by the graph lock.
pub(crate) struct Core {
    pub(crate) store: Store,

    /// Newest state written locally or merged
    pub(crate) state: State,

    /// Paths of local interest; no entry lies under another
    pub(crate) listening: BTreeSet<String>,

    /// Future records ordered by state
    pub(crate) pending: Vec<PendingRecord>,

    pub(crate) config: GraphConfig,

    /// Events produced under the lock, delivered once it is released
    pub(crate) outbox: Vec<GraphEvent>,
}

impl Core {
    pub(crate) fn new(config: GraphConfig, state: State) -> Self {
        Self {
            store: Store::new(),
            state,
            listening: BTreeSet::new(),
            pending: Vec::new(),
            config,
            outbox: Vec::new(),
        }
    }

    /// Next local state: the clock reading, but always past anything seen.
    pub(crate) fn tick(&mut self, now: State) -> State {
        self.state = now.max(self.state + 1);
        self.state
    }

    pub(crate) fn is_listening(&self, path: &str) -> bool {
        self.listening.contains(path) || path::ancestors(path).any(|a| self.listening.contains(a))
    }

    /// Mark `path` as of interest. Returns false if it already was; only a
    /// newly covered path queues a `get` event, and only if `emit` is set.
    pub(crate) fn listen(&mut self, path: &str, emit: bool) -> bool {
        if self.is_listening(path) {
            return false;
        }
        self.listening.retain(|p| !path::is_under(p, path));
        self.listening.insert(path.to_string());

        if emit {
            log::trace!("demanding {}", path);
            self.outbox.push(GraphEvent::Get {
                path: path.to_string(),
            });
        }
        true
    }
}

struct ReplayTimer {
    target: State,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    current: Option<ReplayTimer>,
    generation: u64,
}

pub(crate) struct GraphInner {
    core: Mutex<Core>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    timer: Mutex<TimerSlot>,
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        let slot = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = slot.current.take() {
            timer.handle.abort();
        }
    }
}

/// A replica of the shared graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// An empty graph with default settings and the system clock.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// An empty graph stamping writes with `clock`.
    pub fn with_clock(config: GraphConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                core: Mutex::new(Core::new(config, 0)),
                events: EventBus::new(),
                clock,
                timer: Mutex::new(TimerSlot::default()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<GraphInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<GraphInner>) -> Option<Graph> {
        inner.upgrade().map(|inner| Graph { inner })
    }

    /// Run `f` under the graph lock, then deliver whatever events it queued.
    fn with_core<R>(&self, f: impl FnOnce(&mut Core, State) -> R) -> R {
        let now = self.inner.clock.now();
        let (result, events) = {
            let mut core = lock(&self.inner.core);
            let result = f(&mut core, now);
            (result, std::mem::take(&mut core.outbox))
        };
        for event in &events {
            self.inner.events.emit(event);
        }
        result
    }

    /// A handle to `path`. Nothing is stored until it is written.
    pub fn get(&self, path: &str) -> Ref {
        Ref::new(self.clone(), path.to_string(), self.inner.clock.now())
    }

    /// Write `value` at `path` and return the state it was stamped with.
    pub fn set(&self, path: &str, value: impl Into<SetValue>) -> State {
        let value = value.into();
        self.with_core(|core, now| core.set_local(path, &value, now))
    }

    /// Replace what is stored at `path` with a tombstone and return its
    /// state. Returns `None`, writing nothing, when nothing is stored there
    /// or its parent is not a Node.
    pub fn delete(&self, path: &str) -> Option<State> {
        self.with_core(|core, now| core.delete_local(path, now))
    }

    /// Merge a record received from a peer for `path`.
    pub fn merge(&self, path: &str, record: Record) -> MergeOutcome {
        let outcome = self.with_core(|core, now| core.merge(path, record, now));
        self.schedule_replay();
        outcome
    }

    /// Merge every record of a flat snapshot, parents first. Returns how many
    /// records changed something.
    pub fn merge_snapshot(&self, snapshot: GraphSnapshot) -> usize {
        let applied = self.with_core(|core, now| {
            snapshot
                .entries
                .into_iter()
                .map(|(path, record)| core.merge(&path, record, now))
                .filter(|outcome| *outcome == MergeOutcome::Applied)
                .count()
        });
        self.schedule_replay();
        applied
    }

    /// Materialized value at `path`, signalling demand for whatever is
    /// missing.
    pub fn value_at_path(&self, path: &str) -> Option<Value> {
        self.with_core(|core, _| core.value_at(path))
    }

    pub(crate) fn value_quiet(&self, path: &str) -> Option<Value> {
        lock(&self.inner.core).read(path).0
    }

    pub(crate) fn resolve_path(&self, path: &str) -> Option<String> {
        lock(&self.inner.core).resolve(path).ok()
    }

    /// A copy of the entry `path` resolves to. Demands the path if absent.
    pub fn node_at_path(&self, path: &str) -> Option<Entry> {
        self.with_core(|core, _| match core.resolve(path) {
            Ok(found) => core.store.get(&found).cloned(),
            Err(_) => {
                core.listen(path, true);
                None
            }
        })
    }

    /// Nested record of the slot at `path`, with the path it is stored at.
    pub fn record_at_path(&self, path: &str) -> Option<(String, Record)> {
        lock(&self.inner.core).record_at(path)
    }

    /// Flat path to record map of every stored entry.
    pub fn to_json(&self) -> GraphSnapshot {
        lock(&self.inner.core).snapshot()
    }

    /// Whether `path` holds no data: absent, deleted, null, or a Node whose
    /// children are all empty.
    pub fn is_empty(&self, path: &str) -> bool {
        let core = lock(&self.inner.core);
        match core.resolve(path) {
            Ok(found) => core.store.is_empty(&found),
            Err(_) => true,
        }
    }

    /// Register interest in `path`, optionally emitting a `get` event.
    /// Returns false if the path was already covered.
    pub fn listen_at_path(&self, path: &str, emit: bool) -> bool {
        self.with_core(|core, _| core.listen(path, emit))
    }

    pub fn is_listening(&self, path: &str) -> bool {
        lock(&self.inner.core).is_listening(path)
    }

    pub fn on(&self, channel: Channel, callback: impl Fn(&GraphEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(channel, callback)
    }

    pub fn once(&self, channel: Channel, callback: impl Fn(&GraphEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.once(channel, callback)
    }

    /// Listen for demand signals.
    pub fn on_get(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        self.on(Channel::Get, move |event| callback(event.path()))
    }

    /// Listen for local writes to broadcast.
    pub fn on_set(&self, callback: impl Fn(&str, &Record) + Send + Sync + 'static) -> ListenerId {
        self.on(Channel::Set, move |event| {
            if let Some(record) = event.record() {
                callback(event.path(), record);
            }
        })
    }

    /// Listen for every committed write.
    pub fn on_change(&self, callback: impl Fn(&str, &Record) + Send + Sync + 'static) -> ListenerId {
        self.on(Channel::Change, move |event| {
            if let Some(record) = event.record() {
                callback(event.path(), record);
            }
        })
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.inner.events.is_registered(id)
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        self.inner.events.listener_count(channel)
    }

    /// Default wait for one-shot reads.
    pub fn wait(&self) -> Duration {
        lock(&self.inner.core).config.wait()
    }

    pub fn set_wait(&self, wait: Duration) {
        lock(&self.inner.core).config.wait_ms = crate::config::millis(wait);
    }

    /// Newest state written locally or merged.
    pub fn state(&self) -> State {
        lock(&self.inner.core).state
    }

    /// Number of parked future records.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.core).pending.len()
    }

    /// Apply parked records that have come due. The replay timer calls this
    /// on its own; without a tokio runtime it must be called by hand.
    pub fn replay_due(&self) -> usize {
        let applied = self.with_core(|core, now| core.replay_due(now));
        self.schedule_replay();
        applied
    }

    /// Make sure a timer targets the earliest parked record.
    fn schedule_replay(&self) {
        let Some(target) = lock(&self.inner.core).next_pending() else {
            return;
        };

        let mut slot = lock(&self.inner.timer);
        if let Some(timer) = &slot.current {
            if timer.target <= target && !timer.handle.is_finished() {
                return;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("no tokio runtime, record at state {} waits for replay_due", target);
                return;
            }
        };

        if let Some(previous) = slot.current.take() {
            previous.handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        let delay = (target - self.inner.clock.now()).max(0) as u64;
        let weak = self.downgrade();

        log::trace!("replay timer set for state {} in {}ms", target, delay);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(graph) = Graph::upgrade(&weak) {
                graph.on_timer(generation);
            }
        });
        slot.current = Some(ReplayTimer {
            target,
            generation,
            handle,
        });
    }

    fn on_timer(&self, generation: u64) {
        {
            let mut slot = lock(&self.inner.timer);
            if slot.current.as_ref().is_some_and(|t| t.generation == generation) {
                slot.current = None;
            }
        }
        self.replay_due();
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.inner.core);
        f.debug_struct("Graph")
            .field("state", &core.state)
            .field("entries", &core.store.len())
            .field("listening", &core.listening)
            .field("pending", &core.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual_graph(start: State) -> (Graph, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let graph = Graph::with_clock(GraphConfig::default(), clock.clone());
        (graph, clock)
    }

    #[test]
    fn test_listen_deduplicates_prefixes() {
        let (graph, _) = manual_graph(1);
        let demands = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&demands);
        graph.on_get(move |path| seen.lock().unwrap().push(path.to_string()));

        assert!(graph.listen_at_path("a/b", true));
        assert!(graph.listen_at_path("a", true));
        assert!(!graph.listen_at_path("a/b/c", true));
        assert!(graph.listen_at_path("ab", false));

        assert_eq!(*demands.lock().unwrap(), vec!["a/b", "a"]);
        assert!(graph.is_listening("a/zzz"));
        assert!(!graph.is_listening("abc"));
    }

    #[test]
    fn test_set_emits_change_then_set() {
        let (graph, _) = manual_graph(10);
        let order = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::clone(&order);
        graph.on_change(move |path, _| changes.lock().unwrap().push(format!("change {}", path)));
        let sets = Arc::clone(&order);
        graph.on_set(move |path, _| sets.lock().unwrap().push(format!("set {}", path)));

        graph.set("a", json!({ "x": 1 }));
        assert_eq!(*order.lock().unwrap(), vec!["change a/x", "set a/x"]);
    }

    #[test]
    fn test_listener_may_write_back() {
        let (graph, _) = manual_graph(10);
        let mirror = graph.clone();
        graph.on_change(move |path, _| {
            if path == "a" {
                mirror.set("copy", mirror.value_quiet("a").map_or(SetValue::from(()), SetValue::from));
            }
        });

        graph.set("a", "hello");
        assert_eq!(graph.value_at_path("copy"), Some(json!("hello")));
    }

    #[test]
    fn test_merge_ignored_without_interest() {
        let (graph, _) = manual_graph(10);
        assert_eq!(graph.merge("x", Record::value(5, 1)), MergeOutcome::Ignored);
        graph.listen_at_path("x", false);
        assert_eq!(graph.merge("x", Record::value(5, 1)), MergeOutcome::Applied);
        assert_eq!(graph.state(), 5);
    }

    #[test]
    fn test_replay_without_runtime() {
        let (graph, clock) = manual_graph(100);
        graph.listen_at_path("ready", false);
        assert_eq!(graph.merge("ready", Record::value(105, true)), MergeOutcome::Buffered);
        assert_eq!(graph.pending_count(), 1);
        assert_eq!(graph.replay_due(), 0);

        clock.advance(5);
        assert_eq!(graph.replay_due(), 1);
        assert_eq!(graph.value_at_path("ready"), Some(json!(true)));
        assert_eq!(graph.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_timer_fires_on_schedule() {
        let (graph, clock) = manual_graph(1000);
        graph.listen_at_path("ready", false);
        graph.merge("ready", Record::value(1005, true));
        assert_eq!(graph.value_quiet("ready"), None);

        clock.advance(5);
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(graph.value_quiet("ready"), Some(json!(true)));
        assert_eq!(graph.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_record_reschedules_timer() {
        let (graph, clock) = manual_graph(1000);
        graph.listen_at_path("t", false);
        graph.merge("t/late", Record::value(1050, "late"));
        graph.merge("t/early", Record::value(1010, "early"));

        clock.advance(10);
        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(graph.value_quiet("t"), Some(json!({ "early": "early" })));

        clock.advance(40);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(graph.value_quiet("t"), Some(json!({ "early": "early", "late": "late" })));
    }

    #[test]
    fn test_snapshot_syncs_replicas() {
        let (left, _) = manual_graph(10);
        let (right, _) = manual_graph(20);
        left.set("a", json!({ "name": "Nathan", "tags": { "x": true } }));
        left.set("b/friend", &left.get("a"));

        right.listen_at_path("a", false);
        right.listen_at_path("b", false);
        assert!(right.merge_snapshot(left.to_json()) > 0);

        assert_eq!(right.value_at_path("b/friend/name"), Some(json!("Nathan")));
        assert_eq!(right.to_json(), left.to_json());
    }

    #[test]
    fn test_node_at_path_and_emptiness() {
        let (graph, _) = manual_graph(10);
        let demands = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&demands);
        graph.on_get(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        graph.set("a/b", ());
        assert!(graph.is_empty("a"));
        assert!(graph.node_at_path("a").unwrap().is_node());
        assert!(graph.node_at_path("missing").is_none());
        assert_eq!(demands.load(Ordering::SeqCst), 1);

        graph.set("a/c", 3);
        assert!(!graph.is_empty("a"));
        graph.delete("a/c");
        assert!(graph.is_empty("a"));
    }
}
