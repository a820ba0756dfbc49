//! Path resolution and value materialization
//!
//! Resolution walks a path one segment at a time. When a segment lands on
//! an Edge holding a pointer, the walk continues from the pointer's target,
//! so indirection is invisible to the caller. The chain of paths currently
//! being resolved is tracked; re-entering one of them is a cycle and that
//! branch resolves to nothing.
//!
//! Materialization expands an entry into a `serde_json::Value`, memoizing per
//! call. Re-entering an entry that is still being expanded (a pointer cycle)
//! leaves that branch out of the result instead of recursing forever.

use std::collections::HashMap;

use serde_json::Value;

use crate::entry::{EdgeValue, EntryKind};
use crate::graph::Core;
use crate::path;
use crate::record::{GraphSnapshot, Record};

/// Why a path did not resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Unresolved {
    /// Nothing is stored along the path (or it was deleted)
    Missing,
    /// Following pointers led back to a path already being resolved
    Cycle,
}

enum Memo {
    InProgress,
    Done(Option<Value>),
}

impl Core {
    /// The path of the entry `path` resolves to, with every pointer followed.
    pub(crate) fn resolve(&self, path: &str) -> Result<String, Unresolved> {
        let mut chain = Vec::new();
        self.resolve_in(path, &mut chain)
    }

    fn resolve_in(&self, path: &str, chain: &mut Vec<String>) -> Result<String, Unresolved> {
        if chain.iter().any(|p| p == path) {
            return Err(Unresolved::Cycle);
        }
        chain.push(path.to_string());
        let result = self.walk(path, chain);
        chain.pop();
        result
    }

    fn walk(&self, path: &str, chain: &mut Vec<String>) -> Result<String, Unresolved> {
        let mut segments = path::segments(path);
        let Some(root) = segments.next() else {
            return Err(Unresolved::Missing);
        };

        let mut current = root.to_string();
        for key in segments {
            current = self.follow(current, chain)?;
            match self.store.get(&current) {
                Some(entry) if entry.is_node() => current = path::join(&current, key),
                _ => return Err(Unresolved::Missing),
            }
        }
        self.follow(current, chain)
    }

    /// Step through a pointer edge at `path`, if there is one.
    fn follow(&self, path: String, chain: &mut Vec<String>) -> Result<String, Unresolved> {
        match self.store.get(&path) {
            None => Err(Unresolved::Missing),
            Some(entry) if entry.is_tombstone() => Err(Unresolved::Missing),
            Some(entry) => match entry.ref_target() {
                Some(target) => self.resolve_in(&target.path, chain),
                None => Ok(path),
            },
        }
    }

    /// Where an entry for `path` is stored: intermediate pointers are
    /// followed, the final key addresses its literal slot. `None` if the
    /// parent does not resolve to a Node.
    pub(crate) fn slot(&self, path: &str) -> Option<String> {
        match path::parent_and_key(path) {
            (None, key) => Some(key.to_string()),
            (Some(parent), key) => {
                let parent = self.resolve(parent).ok()?;
                self.store
                    .get(&parent)
                    .filter(|entry| entry.is_node())
                    .map(|_| path::join(&parent, key))
            }
        }
    }

    /// Materialize `path` without touching the listening set.
    ///
    /// Also returns every pointer target that was missing along the way.
    pub(crate) fn read(&self, path: &str) -> (Option<Value>, Vec<String>) {
        let mut dangling = Vec::new();
        let value = match self.resolve(path) {
            Ok(found) => self.materialize(&found, &mut HashMap::new(), &mut dangling),
            Err(_) => None,
        };
        (value, dangling)
    }

    /// Materialize `path`, registering interest in whatever is missing.
    pub(crate) fn value_at(&mut self, path: &str) -> Option<Value> {
        let (value, dangling) = self.read(path);
        if value.is_none() {
            self.listen(path, true);
        }
        if self.config.demand_on_dangling_ref {
            for target in dangling {
                self.listen(&target, true);
            }
        }
        value
    }

    fn materialize(
        &self,
        path: &str,
        memo: &mut HashMap<String, Memo>,
        dangling: &mut Vec<String>,
    ) -> Option<Value> {
        match memo.get(path) {
            Some(Memo::InProgress) => return None,
            Some(Memo::Done(value)) => return value.clone(),
            None => {}
        }

        let entry = self.store.get(path)?;
        let value = match &entry.kind {
            EntryKind::Edge(EdgeValue::Scalar(value)) => return Some(value.to_json()),
            EntryKind::Edge(EdgeValue::Tombstone) => return None,
            EntryKind::Edge(EdgeValue::Ref(target)) => {
                memo.insert(path.to_string(), Memo::InProgress);
                match self.resolve(&target.path) {
                    Ok(found) => self.materialize(&found, memo, dangling),
                    Err(Unresolved::Missing) => {
                        dangling.push(target.path.clone());
                        None
                    }
                    Err(Unresolved::Cycle) => None,
                }
            }
            EntryKind::Node { children, .. } => {
                memo.insert(path.to_string(), Memo::InProgress);
                let mut object = serde_json::Map::new();
                for key in children {
                    if let Some(child) = self.materialize(&path::join(path, key), memo, dangling) {
                        object.insert(key.clone(), child);
                    }
                }
                Some(Value::Object(object))
            }
        };

        memo.insert(path.to_string(), Memo::Done(value.clone()));
        value
    }

    /// Nested record of the slot at `path` and everything under it, along
    /// with the path it is stored at.
    pub(crate) fn record_at(&self, path: &str) -> Option<(String, Record)> {
        let slot = self.slot(path)?;
        let record = self.subtree_record(&slot)?;
        Some((slot, record))
    }

    fn subtree_record(&self, path: &str) -> Option<Record> {
        let entry = self.store.get(path)?;
        let record = match &entry.kind {
            EntryKind::Node { children, cleared } => Record::Node {
                state: entry.state,
                children: children
                    .iter()
                    .filter_map(|key| {
                        self.subtree_record(&path::join(path, key))
                            .map(|child| (key.clone(), child))
                    })
                    .collect(),
                cleared: cleared
                    .as_ref()
                    .map(|mark| Box::new(Record::of_edge(mark.state, &mark.value))),
            },
            EntryKind::Edge(_) => Record::of_entry(entry),
        };
        Some(record)
    }

    /// Flat single-entry records for every stored entry.
    pub(crate) fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            entries: self
                .store
                .iter()
                .map(|(path, entry)| (path.clone(), Record::of_entry(entry)))
                .collect(),
        }
    }
}
