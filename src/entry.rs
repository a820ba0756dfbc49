//! Entry model: the records stored at each path of a graph
//!
//! An [`Entry`] is either a Node (a structured object with named children)
//! or an Edge (a leaf holding a scalar, a pointer to another path, or a
//! tombstone). Entries refer to their parent and to pointer targets by path
//! only; nothing here owns another entry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::path;

/// Logical timestamp used to order writes across replicas. Larger is newer.
pub type State = i64;

/// A scalar leaf value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl Primitive {
    /// The JSON view of this scalar.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Primitive::Null => serde_json::Value::Null,
            Primitive::Bool(b) => serde_json::Value::Bool(*b),
            Primitive::Number(n) => serde_json::Value::Number(n.clone()),
            Primitive::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Primitive::Null)
    }
}

impl From<&str> for Primitive {
    fn from(s: &str) -> Self {
        Primitive::String(s.to_string())
    }
}

impl From<String> for Primitive {
    fn from(s: String) -> Self {
        Primitive::String(s)
    }
}

impl From<bool> for Primitive {
    fn from(b: bool) -> Self {
        Primitive::Bool(b)
    }
}

impl From<i64> for Primitive {
    fn from(n: i64) -> Self {
        Primitive::Number(n.into())
    }
}

impl From<i32> for Primitive {
    fn from(n: i32) -> Self {
        Primitive::Number(n.into())
    }
}

impl From<u64> for Primitive {
    fn from(n: u64) -> Self {
        Primitive::Number(n.into())
    }
}

impl From<f64> for Primitive {
    /// Non-finite floats have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Primitive::Number)
            .unwrap_or(Primitive::Null)
    }
}

impl From<()> for Primitive {
    fn from(_: ()) -> Self {
        Primitive::Null
    }
}

/// A stored pointer to another path of the same graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTarget {
    /// Absolute path of the target
    pub path: String,

    /// State at which the pointer was written
    pub state: State,
}

/// What an Edge holds.
#[derive(Clone, Debug, PartialEq)]
pub enum EdgeValue {
    Scalar(Primitive),
    Ref(RefTarget),
    /// The entry was deleted at the Edge's state
    Tombstone,
}

/// An Edge written at a Node's own path that newer children outrank.
///
/// The Node keeps it as a mark: anything under the Node the mark outranks
/// has been cleared, and stays cleared whenever it arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct Cleared {
    pub state: State,
    pub value: EdgeValue,
}

/// Node or Edge.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    Node {
        /// Keys of the child entries; each child lives at `path/key`
        children: BTreeSet<String>,
        cleared: Option<Cleared>,
    },
    Edge(EdgeValue),
}

/// A single record in the graph arena.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    /// Path of the parent Node, `None` at the root
    pub parent: Option<String>,

    /// Final path segment
    pub key: String,

    /// Newest state written to this entry. For a Node, the newest write at
    /// or under it that still stands.
    pub state: State,

    pub kind: EntryKind,
}

impl Entry {
    /// A fresh Node with no children.
    pub fn node(parent: Option<String>, key: impl Into<String>, state: State) -> Self {
        Self {
            parent,
            key: key.into(),
            state,
            kind: EntryKind::Node {
                children: BTreeSet::new(),
                cleared: None,
            },
        }
    }

    /// A fresh Edge.
    pub fn edge(parent: Option<String>, key: impl Into<String>, state: State, value: EdgeValue) -> Self {
        Self {
            parent,
            key: key.into(),
            state,
            kind: EntryKind::Edge(value),
        }
    }

    /// The entry's own path: parent path plus key, or the key alone at the root.
    ///
    /// An Edge holding a Ref still reports its own position, never its target's.
    pub fn path(&self) -> String {
        match &self.parent {
            Some(parent) => path::join(parent, &self.key),
            None => self.key.clone(),
        }
    }

    pub fn child_path(&self, key: &str) -> String {
        path::join(&self.path(), key)
    }

    pub fn is_node(&self) -> bool {
        matches!(self.kind, EntryKind::Node { .. })
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.kind, EntryKind::Edge(_))
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, EntryKind::Edge(EdgeValue::Tombstone))
    }

    /// The Edge value, if this is an Edge.
    pub fn edge_value(&self) -> Option<&EdgeValue> {
        match &self.kind {
            EntryKind::Edge(value) => Some(value),
            EntryKind::Node { .. } => None,
        }
    }

    /// The Ref target, if this is an Edge holding a pointer.
    pub fn ref_target(&self) -> Option<&RefTarget> {
        match &self.kind {
            EntryKind::Edge(EdgeValue::Ref(target)) => Some(target),
            _ => None,
        }
    }

    /// The Edge this Node overruled, if any.
    pub fn cleared(&self) -> Option<&Cleared> {
        match &self.kind {
            EntryKind::Node { cleared, .. } => cleared.as_ref(),
            EntryKind::Edge(_) => None,
        }
    }

    /// Child keys, empty for an Edge.
    pub fn children(&self) -> impl Iterator<Item = &String> {
        let children = match &self.kind {
            EntryKind::Node { children, .. } => Some(children.iter()),
            EntryKind::Edge(_) => None,
        };
        children.into_iter().flatten()
    }
}
