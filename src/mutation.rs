//! Local writes: `set` and `delete`
//!
//! A local write stamps a fresh state, replaces whatever shape stood at the
//! target (a scalar over a structured value discards the subtree; a
//! structured value over a scalar keeps the scalar only as the new Node's
//! cleared mark), and queues a `change` plus a `set` event per leaf so a
//! transport can broadcast exactly what changed. Deleting a path with
//! nothing stored at it writes nothing.

use std::collections::BTreeMap;

use crate::entry::{EdgeValue, Entry, Primitive, RefTarget, State};
use crate::events::GraphEvent;
use crate::graph::Core;
use crate::path;
use crate::record::Record;
use crate::reference::Ref;

/// A value accepted by `set`.
#[derive(Clone, Debug, PartialEq)]
pub enum SetValue {
    Scalar(Primitive),
    /// Pointer to the absolute path of another location in the same graph
    Ref(String),
    Map(BTreeMap<String, SetValue>),
}

impl SetValue {
    /// A structured value from key/value pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, SetValue)>) -> Self {
        SetValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// A pointer to `path`.
    pub fn pointer(path: impl Into<String>) -> Self {
        SetValue::Ref(path.into())
    }
}

impl From<Primitive> for SetValue {
    fn from(value: Primitive) -> Self {
        SetValue::Scalar(value)
    }
}

impl From<&str> for SetValue {
    fn from(value: &str) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<String> for SetValue {
    fn from(value: String) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<bool> for SetValue {
    fn from(value: bool) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<i64> for SetValue {
    fn from(value: i64) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<i32> for SetValue {
    fn from(value: i32) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<u64> for SetValue {
    fn from(value: u64) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<f64> for SetValue {
    fn from(value: f64) -> Self {
        SetValue::Scalar(value.into())
    }
}

impl From<()> for SetValue {
    fn from(_: ()) -> Self {
        SetValue::Scalar(Primitive::Null)
    }
}

impl From<&Ref> for SetValue {
    fn from(target: &Ref) -> Self {
        SetValue::Ref(target.path().to_string())
    }
}

impl From<Ref> for SetValue {
    fn from(target: Ref) -> Self {
        SetValue::from(&target)
    }
}

impl From<BTreeMap<String, SetValue>> for SetValue {
    fn from(map: BTreeMap<String, SetValue>) -> Self {
        SetValue::Map(map)
    }
}

impl From<serde_json::Value> for SetValue {
    /// Objects become structured values; arrays are keyed by index.
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => SetValue::Scalar(Primitive::Null),
            Value::Bool(b) => SetValue::Scalar(Primitive::Bool(b)),
            Value::Number(n) => SetValue::Scalar(Primitive::Number(n)),
            Value::String(s) => SetValue::Scalar(Primitive::String(s)),
            Value::Array(items) => SetValue::Map(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), SetValue::from(v)))
                    .collect(),
            ),
            Value::Object(object) => SetValue::Map(
                object
                    .into_iter()
                    .map(|(k, v)| (k, SetValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Who is writing. Nodes a remote write creates along the way are
/// announced as changes; a local write announces only its leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Local,
    Remote,
}

impl Core {
    /// Stamp a new local state and write `value` at `path`.
    pub(crate) fn set_local(&mut self, path: &str, value: &SetValue, now: State) -> State {
        let state = self.tick(now);
        if self.config.listen_on_write {
            self.listen(path, false);
        }
        self.write(path, value, state);
        state
    }

    /// Stamp a new local state and replace what is stored at `path` with a
    /// tombstone. Nothing is written when nothing is stored there.
    pub(crate) fn delete_local(&mut self, path: &str, now: State) -> Option<State> {
        let slot = self.slot(path)?;
        if self.store.get(&slot).map_or(true, Entry::is_tombstone) {
            log::trace!("nothing to delete at {}", path);
            return None;
        }

        let state = self.tick(now);
        if self.config.listen_on_write {
            self.listen(path, false);
        }
        self.put_edge(slot, EdgeValue::Tombstone, state);
        Some(state)
    }

    fn write(&mut self, path: &str, value: &SetValue, state: State) {
        match value {
            SetValue::Scalar(scalar) => self.write_edge(path, EdgeValue::Scalar(scalar.clone()), state),
            SetValue::Ref(target) => self.write_edge(
                path,
                EdgeValue::Ref(RefTarget {
                    path: target.clone(),
                    state,
                }),
                state,
            ),
            SetValue::Map(children) => {
                let node_path = self.node_path_for_write(path);
                self.claim_node(&node_path, state, WriteMode::Local);

                if children.is_empty() {
                    self.queue_local(node_path.clone(), Record::node(state, BTreeMap::new()));
                }
                for (key, child) in children {
                    self.write(&path::join(&node_path, key), child, state);
                }
            }
        }
    }

    fn write_edge(&mut self, path: &str, value: EdgeValue, state: State) {
        let slot = match path::parent_and_key(path) {
            (None, key) => key.to_string(),
            (Some(parent), key) => path::join(&self.node_path_for_write(parent), key),
        };
        self.put_edge(slot, value, state);
    }

    fn put_edge(&mut self, slot: String, value: EdgeValue, state: State) {
        if !self.open_ancestors(&slot, state, WriteMode::Local) {
            log::debug!("local write at {} outranked at state {}", slot, state);
            return;
        }
        let record = Record::of_edge(state, &value);
        self.place_edge(&slot, state, value);
        self.queue_local(slot, record);
    }

    fn queue_local(&mut self, path: String, record: Record) {
        self.outbox.push(GraphEvent::Change {
            path: path.clone(),
            record: record.clone(),
        });
        self.outbox.push(GraphEvent::Set { path, record });
    }

    /// The literal path a structured write at `path` lands on. Each segment
    /// holding a pointer to a Node is followed; anything else is written
    /// in place.
    fn node_path_for_write(&self, path: &str) -> String {
        let mut current: Option<String> = None;
        for key in path::segments(path) {
            let slot = match &current {
                Some(parent) => path::join(parent, key),
                None => key.to_string(),
            };
            let target = self
                .store
                .get(&slot)
                .and_then(Entry::ref_target)
                .and_then(|target| self.resolve(&target.path).ok())
                .filter(|found| self.store.get(found).is_some_and(Entry::is_node));
            current = Some(target.unwrap_or(slot));
        }
        current.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use serde_json::json;

    fn core() -> Core {
        Core::new(GraphConfig::default(), 0)
    }

    #[test]
    fn test_set_map_writes_leaves() {
        let mut core = core();
        let value = SetValue::from(json!({ "name": "Bob", "age": 30 }));
        let state = core.set_local("people/1", &value, 100);

        assert_eq!(state, 100);
        assert_eq!(core.read("people/1").0, Some(json!({ "name": "Bob", "age": 30 })));

        let sets: Vec<_> = core
            .outbox
            .iter()
            .filter_map(|e| match e {
                GraphEvent::Set { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(sets, vec!["people/1/age", "people/1/name"]);
    }

    #[test]
    fn test_local_states_strictly_increase() {
        let mut core = core();
        let first = core.set_local("a", &"x".into(), 50);
        let second = core.set_local("a", &"y".into(), 50);
        assert!(second > first);
        let third = core.set_local("a", &"z".into(), 10);
        assert!(third > second);
    }

    #[test]
    fn test_scalar_replaces_subtree() {
        let mut core = core();
        core.set_local("a", &SetValue::from(json!({ "b": { "c": 1 } })), 10);
        core.set_local("a", &SetValue::from(7), 11);
        assert!(core.store.get("a/b").is_none());
        assert!(core.store.get("a/b/c").is_none());
        assert_eq!(core.read("a").0, Some(json!(7)));

        core.set_local("a/b", &SetValue::from(true), 12);
        assert_eq!(core.read("a").0, Some(json!({ "b": true })));
    }

    #[test]
    fn test_map_write_passes_through_pointer() {
        let mut core = core();
        core.set_local("b", &SetValue::from(json!({ "name": "Billy" })), 10);
        core.set_local("a/child", &SetValue::pointer("b"), 11);
        core.set_local("a/child", &SetValue::from(json!({ "age": 4 })), 12);

        assert_eq!(core.read("b").0, Some(json!({ "name": "Billy", "age": 4 })));
        assert!(core.store.get("a/child").unwrap().ref_target().is_some());
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let mut core = core();
        core.set_local("a/b", &SetValue::from(1), 10);
        core.outbox.clear();
        let state = core.delete_local("a/b", 11).unwrap();

        assert!(core.store.get("a/b").unwrap().is_tombstone());
        assert_eq!(core.read("a").0, Some(json!({})));
        assert!(core.outbox.contains(&GraphEvent::Set {
            path: "a/b".into(),
            record: Record::tombstone(state),
        }));
    }

    #[test]
    fn test_delete_of_absent_path_stores_nothing() {
        let mut core = core();
        assert_eq!(core.delete_local("a/b/c", 10), None);
        assert_eq!(core.store.len(), 0);
        assert!(core.outbox.is_empty());
        assert_eq!(core.state, 0);

        core.set_local("a/b", &SetValue::from(1), 20);
        core.outbox.clear();
        assert_eq!(core.delete_local("a/x", 21), None);
        assert_eq!(core.delete_local("a/b/c", 21), None);
        assert!(core.store.get("a/x").is_none());
        assert!(core.outbox.is_empty());
    }

    #[test]
    fn test_delete_under_scalar_keeps_scalar() {
        let mut core = core();
        core.set_local("a", &SetValue::from(5), 10);
        assert_eq!(core.delete_local("a/b", 11), None);
        assert_eq!(core.read("a").0, Some(json!(5)));
        assert!(core.store.get("a").unwrap().is_edge());
    }

    #[test]
    fn test_delete_twice_writes_once() {
        let mut core = core();
        core.set_local("a/b", &SetValue::from(1), 10);
        assert!(core.delete_local("a/b", 11).is_some());
        core.outbox.clear();
        assert_eq!(core.delete_local("a/b", 12), None);
        assert!(core.outbox.is_empty());
    }

    #[test]
    fn test_map_over_scalar_keeps_it_as_mark() {
        let mut core = core();
        core.set_local("a", &SetValue::from(5), 10);
        core.set_local("a", &SetValue::from(json!({ "b": 1 })), 11);

        let node = core.store.get("a").unwrap();
        assert!(node.is_node());
        assert_eq!(node.cleared().map(|mark| mark.state), Some(10));
        assert_eq!(core.read("a").0, Some(json!({ "b": 1 })));
    }

    #[test]
    fn test_write_bumps_ancestor_state() {
        let mut core = core();
        core.set_local("a/b/c", &SetValue::from(1), 10);
        core.set_local("a/x", &SetValue::from(1), 20);
        assert_eq!(core.store.get("a").unwrap().state, 20);
        assert_eq!(core.store.get("a/b").unwrap().state, 10);
    }

    #[test]
    fn test_empty_map_creates_node() {
        let mut core = core();
        core.set_local("a", &SetValue::map(Vec::<(String, SetValue)>::new()), 10);
        assert!(core.store.get("a").unwrap().is_node());
        assert!(core.outbox.contains(&GraphEvent::Set {
            path: "a".into(),
            record: Record::node(10, BTreeMap::new()),
        }));
    }
}
