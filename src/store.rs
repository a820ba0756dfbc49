//! Entry arena
//!
//! All entries of a graph live in one map keyed by their own absolute path.
//! Parent links and child lists are path strings, so pointer cycles in the
//! data never become ownership cycles in memory.

use std::collections::{BTreeSet, HashMap};

use crate::entry::{EdgeValue, Entry, EntryKind, State};
use crate::path;
use crate::record::{should_overwrite, Shape};

#[derive(Debug, Default)]
pub(crate) struct Store {
    entries: HashMap<String, Entry>,
    roots: BTreeSet<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Entry> {
        self.entries.get_mut(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    /// Store `entry` at its path, discarding whatever subtree was there.
    ///
    /// The parent, if any, must already be a Node.
    pub fn insert(&mut self, entry: Entry) -> String {
        let path = entry.path();
        self.remove_subtree(&path);

        match &entry.parent {
            Some(parent) => {
                if let Some(Entry {
                    kind: EntryKind::Node { children, .. },
                    ..
                }) = self.entries.get_mut(parent)
                {
                    children.insert(entry.key.clone());
                } else {
                    debug_assert!(false, "parent of {} is not a node", path);
                }
            }
            None => {
                self.roots.insert(entry.key.clone());
            }
        }

        self.entries.insert(path.clone(), entry);
        path
    }

    /// Remove the entry at `path` and everything under it. Returns how many
    /// entries were removed.
    pub fn remove_subtree(&mut self, path: &str) -> usize {
        let Some(entry) = self.entries.remove(path) else {
            return 0;
        };

        match &entry.parent {
            Some(parent) => {
                if let Some(Entry {
                    kind: EntryKind::Node { children, .. },
                    ..
                }) = self.entries.get_mut(parent)
                {
                    children.remove(&entry.key);
                }
            }
            None => {
                self.roots.remove(&entry.key);
            }
        }

        let mut removed = 1;
        let mut stack: Vec<String> = entry.children().map(|key| path::join(path, key)).collect();
        while let Some(child_path) = stack.pop() {
            if let Some(child) = self.entries.remove(&child_path) {
                stack.extend(child.children().map(|key| path::join(&child_path, key)));
                removed += 1;
            }
        }
        removed
    }

    /// Raise every ancestor Node of `path` to at least `state`.
    pub fn bump_ancestors(&mut self, path: &str, state: State) {
        for ancestor in path::ancestors(path) {
            if let Some(entry) = self.entries.get_mut(ancestor) {
                if entry.is_node() && entry.state < state {
                    entry.state = state;
                }
            }
        }
    }

    /// Drop everything under the Node at `path` that an Edge written there
    /// at `state` outranks. Each entry below competes as a Node at its own
    /// state, which for a Node is the newest write still standing inside
    /// it; a surviving Node is cleared in turn. Returns how many entries
    /// were removed.
    pub fn clear_under(&mut self, path: &str, state: State, shape: Shape<'_>) -> usize {
        let Some(entry) = self.entries.get(path) else {
            return 0;
        };
        let children: Vec<String> = entry.children().map(|key| path::join(path, key)).collect();

        let mut removed = 0;
        for child in children {
            let Some(entry) = self.entries.get_mut(&child) else {
                continue;
            };
            if should_overwrite(entry.state, Shape::Node, state, shape) {
                removed += self.remove_subtree(&child);
                continue;
            }
            if let EntryKind::Node { cleared, .. } = &mut entry.kind {
                if cleared
                    .as_ref()
                    .is_some_and(|mark| should_overwrite(mark.state, Shape::Node, state, shape))
                {
                    *cleared = None;
                }
                removed += self.clear_under(&child, state, shape);
            }
        }
        removed
    }

    /// Whether the entry at `path` carries no data.
    ///
    /// A Node is empty when every child is empty; null scalars and tombstones
    /// are empty; pointers are not. Absent paths are empty.
    pub fn is_empty(&self, path: &str) -> bool {
        match self.entries.get(path).map(|e| &e.kind) {
            None => true,
            Some(EntryKind::Node { children, .. }) => children
                .iter()
                .all(|key| self.is_empty(&path::join(path, key))),
            Some(EntryKind::Edge(EdgeValue::Scalar(value))) => value.is_null(),
            Some(EntryKind::Edge(EdgeValue::Tombstone)) => true,
            Some(EntryKind::Edge(EdgeValue::Ref(_))) => false,
        }
    }
}
