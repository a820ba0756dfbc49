//! Wire records exchanged between replicas
//!
//! A [`Record`] is the state-stamped unit a transport ships between graphs:
//! a leaf write, a pointer write, a node snapshot or a tombstone. The same
//! shapes are emitted by local mutations and accepted by `merge`.
//!
//! This module also owns the last-write-wins ordering ([`should_overwrite`])
//! so every replica compares candidates with the identical function.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::entry::{EdgeValue, Entry, EntryKind, Primitive, RefTarget, State};
use crate::error::{GraphError, Result};

/// A state-stamped write, in its JSON-compatible wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    /// `{ state, children: { key: record } }`, plus `cleared` when the
    /// Node overruled an Edge at its own path
    Node {
        state: State,
        children: BTreeMap<String, Record>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<Box<Record>>,
    },

    /// `{ state, deleted: true }`
    Tombstone {
        state: State,
        #[serde(deserialize_with = "deleted_marker")]
        deleted: bool,
    },

    /// `{ state, id }` where `id` is the absolute target path
    Ref { state: State, id: String },

    /// `{ state, value }`
    Value { state: State, value: Primitive },
}

impl Record {
    pub fn value(state: State, value: impl Into<Primitive>) -> Self {
        Record::Value {
            state,
            value: value.into(),
        }
    }

    pub fn pointer(state: State, id: impl Into<String>) -> Self {
        Record::Ref {
            state,
            id: id.into(),
        }
    }

    pub fn tombstone(state: State) -> Self {
        Record::Tombstone {
            state,
            deleted: true,
        }
    }

    pub fn node(state: State, children: BTreeMap<String, Record>) -> Self {
        Record::Node {
            state,
            children,
            cleared: None,
        }
    }

    /// The record of an Edge holding `value` at `state`.
    pub fn of_edge(state: State, value: &EdgeValue) -> Self {
        match value {
            EdgeValue::Scalar(value) => Record::value(state, value.clone()),
            EdgeValue::Ref(target) => Record::pointer(state, target.path.clone()),
            EdgeValue::Tombstone => Record::tombstone(state),
        }
    }

    pub fn state(&self) -> State {
        match self {
            Record::Node { state, .. }
            | Record::Tombstone { state, .. }
            | Record::Ref { state, .. }
            | Record::Value { state, .. } => *state,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Record::Node { .. })
    }

    /// The Edge value this record writes, `None` for a Node record.
    pub fn edge_value(&self) -> Option<EdgeValue> {
        match self {
            Record::Node { .. } => None,
            Record::Value { value, .. } => Some(EdgeValue::Scalar(value.clone())),
            Record::Ref { state, id } => Some(EdgeValue::Ref(RefTarget {
                path: id.clone(),
                state: *state,
            })),
            Record::Tombstone { .. } => Some(EdgeValue::Tombstone),
        }
    }

    /// The single-entry record describing `entry` alone (children omitted).
    pub fn of_entry(entry: &Entry) -> Self {
        match &entry.kind {
            EntryKind::Node { cleared, .. } => Record::Node {
                state: entry.state,
                children: BTreeMap::new(),
                cleared: cleared
                    .as_ref()
                    .map(|mark| Box::new(Record::of_edge(mark.state, &mark.value))),
            },
            EntryKind::Edge(value) => Record::of_edge(entry.state, value),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GraphError::Serialization(e.to_string()))
    }
}

fn deleted_marker<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    if bool::deserialize(deserializer)? {
        Ok(true)
    } else {
        Err(serde::de::Error::custom("a tombstone must carry `deleted: true`"))
    }
}

/// Flat path → record snapshot of every stored entry, suitable for bulk transfer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphSnapshot {
    pub entries: BTreeMap<String, Record>,
}

impl GraphSnapshot {
    pub fn get(&self, path: &str) -> Option<&Record> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.entries.iter()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GraphError::Serialization(e.to_string()))
    }
}

/// The shape of one side of a conflict, stripped of its state.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Shape<'a> {
    Node,
    Value(&'a Primitive),
    Ref(&'a str),
    Tombstone,
}

impl<'a> Shape<'a> {
    pub(crate) fn of_edge(value: &'a EdgeValue) -> Self {
        match value {
            EdgeValue::Scalar(value) => Shape::Value(value),
            EdgeValue::Ref(target) => Shape::Ref(&target.path),
            EdgeValue::Tombstone => Shape::Tombstone,
        }
    }

    pub(crate) fn of_record(record: &'a Record) -> Self {
        match record {
            Record::Node { .. } => Shape::Node,
            Record::Value { value, .. } => Shape::Value(value),
            Record::Ref { id, .. } => Shape::Ref(id),
            Record::Tombstone { .. } => Shape::Tombstone,
        }
    }

    /// Canonical serialization used to break ties between equal states.
    fn canonical(&self) -> String {
        let json = match self {
            Shape::Node => serde_json::json!({ "children": {} }),
            Shape::Value(value) => serde_json::json!({ "value": value.to_json() }),
            Shape::Ref(id) => serde_json::json!({ "id": id }),
            Shape::Tombstone => serde_json::json!({ "deleted": true }),
        };
        json.to_string()
    }
}

/// Last-write-wins decision: should the remote side replace the local one?
///
/// Newer state wins outright. On equal states the bytewise-greater canonical
/// serialization wins, so racing replicas pick the same winner without
/// talking to each other. Identical candidates never overwrite.
pub(crate) fn should_overwrite(
    local_state: State,
    local: Shape<'_>,
    remote_state: State,
    remote: Shape<'_>,
) -> bool {
    match remote_state.cmp(&local_state) {
        Ordering::Less => false,
        Ordering::Greater => true,
        Ordering::Equal => remote.canonical() > local.canonical(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let leaf: Record = serde_json::from_value(json!({ "state": 3, "value": "x" })).unwrap();
        assert_eq!(leaf, Record::value(3, "x"));

        let null_leaf: Record = serde_json::from_value(json!({ "state": 3, "value": null })).unwrap();
        assert_eq!(null_leaf, Record::value(3, ()));

        let pointer: Record = serde_json::from_value(json!({ "state": 4, "id": "a/b" })).unwrap();
        assert_eq!(pointer, Record::pointer(4, "a/b"));

        let tombstone: Record = serde_json::from_value(json!({ "state": 5, "deleted": true })).unwrap();
        assert_eq!(tombstone, Record::tombstone(5));

        let node: Record = serde_json::from_value(json!({
            "state": 6,
            "children": { "name": { "state": 6, "value": "Bob" } }
        }))
        .unwrap();
        assert!(node.is_node());
        assert_eq!(node.state(), 6);

        assert!(Record::from_json(r#"{"state": 1}"#).is_err());
        assert!(Record::from_json(r#"{"state": 5, "deleted": false}"#).is_err());
    }

    #[test]
    fn test_node_record_carries_cleared_edge() {
        let node: Record = serde_json::from_value(json!({
            "state": 12,
            "children": {},
            "cleared": { "state": 11, "value": 5 }
        }))
        .unwrap();
        let Record::Node { cleared, .. } = &node else {
            panic!("expected a node record, got {:?}", node);
        };
        assert_eq!(cleared.as_deref(), Some(&Record::value(11, 5)));

        let plain = serde_json::to_value(Record::node(3, BTreeMap::new())).unwrap();
        assert_eq!(plain, json!({ "state": 3, "children": {} }));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Record::tombstone(10)).unwrap();
        assert_eq!(json, json!({ "state": 10, "deleted": true }));
        let json = serde_json::to_value(Record::pointer(2, "people/1")).unwrap();
        assert_eq!(json, json!({ "state": 2, "id": "people/1" }));
    }

    #[test]
    fn test_should_overwrite_by_state() {
        let a = Primitive::from("a");
        let b = Primitive::from("b");
        assert!(should_overwrite(1, Shape::Value(&a), 2, Shape::Value(&b)));
        assert!(!should_overwrite(2, Shape::Value(&a), 1, Shape::Value(&b)));
    }

    #[test]
    fn test_tie_break_is_symmetric() {
        let a = Primitive::from("apple");
        let b = Primitive::from("banana");
        let forward = should_overwrite(5, Shape::Value(&a), 5, Shape::Value(&b));
        let backward = should_overwrite(5, Shape::Value(&b), 5, Shape::Value(&a));
        assert_ne!(forward, backward);
        assert!(!should_overwrite(5, Shape::Value(&a), 5, Shape::Value(&a)));
    }

    #[test]
    fn test_tie_break_across_shapes() {
        let v = Primitive::from(1);
        let pairs = [
            (Shape::Node, Shape::Tombstone),
            (Shape::Value(&v), Shape::Ref("x")),
            (Shape::Tombstone, Shape::Value(&v)),
        ];
        for (x, y) in pairs {
            assert_ne!(should_overwrite(7, x, 7, y), should_overwrite(7, y, 7, x));
        }
    }

    #[test]
    fn test_snapshot_is_flat_map() {
        let mut snapshot = GraphSnapshot::default();
        snapshot.entries.insert("a".into(), Record::node(1, BTreeMap::new()));
        snapshot.entries.insert("a/b".into(), Record::value(1, true));
        let text = snapshot.to_json_string().unwrap();
        let parsed = GraphSnapshot::from_json(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("a/b"), Some(&Record::value(1, true)));
    }
}
