//! Merging remote records
//!
//! A merge is accepted only at paths this replica listens to. Records from
//! the future are parked until the local clock catches up; everything else
//! is resolved per entry by last-write-wins, ties broken by comparing the
//! canonical serialization of both sides. Node records carry their children,
//! which are merged one by one so a single stale child cannot block fresh
//! siblings.
//!
//! A Node and an Edge at the same path are settled from the records alone.
//! Every write counts as a Node claim on each of its ancestors. When an
//! Edge lands on a Node holding something newer, the Node stays and keeps
//! the Edge as a mark: what the mark outranks is cleared, and a later
//! arrival the mark outranks is refused.

use std::collections::{BTreeMap, BTreeSet};

use crate::entry::{Cleared, EdgeValue, Entry, EntryKind, State};
use crate::events::GraphEvent;
use crate::graph::Core;
use crate::mutation::WriteMode;
use crate::path;
use crate::record::{should_overwrite, Record, Shape};

/// What a call to `merge` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The path is not listened to; nothing was stored
    Ignored,
    /// Everything in the record is from the future and was parked
    Buffered,
    /// At least one entry changed
    Applied,
    /// The local replica already had the same or newer data
    Unchanged,
}

/// A record parked until local time reaches its state.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PendingRecord {
    pub path: String,
    pub record: Record,
}

#[derive(Default)]
struct Tally {
    applied: usize,
    buffered: usize,
}

impl Tally {
    fn outcome(&self) -> MergeOutcome {
        if self.applied > 0 {
            MergeOutcome::Applied
        } else if self.buffered > 0 {
            MergeOutcome::Buffered
        } else {
            MergeOutcome::Unchanged
        }
    }
}

impl Core {
    /// Merge a record received for `path`, judged against local time `now`.
    pub(crate) fn merge(&mut self, path: &str, record: Record, now: State) -> MergeOutcome {
        if !self.is_listening(path) {
            log::debug!("ignoring record for {}: not listening", path);
            return MergeOutcome::Ignored;
        }
        let mut tally = Tally::default();
        self.merge_record(path, record, now, &mut tally);
        tally.outcome()
    }

    fn merge_record(&mut self, path: &str, record: Record, now: State, tally: &mut Tally) {
        let state = record.state();
        if state > now {
            self.park(path, record);
            tally.buffered += 1;
            return;
        }
        self.state = self.state.max(state);

        match record {
            Record::Node {
                state,
                children,
                cleared,
            } => self.merge_node(path, state, children, cleared, now, tally),
            edge => self.merge_edge(path, edge, tally),
        }
    }

    fn merge_edge(&mut self, path: &str, record: Record, tally: &mut Tally) {
        let Some(value) = record.edge_value() else {
            return;
        };
        let state = record.state();

        if !self.outranks_slot(path, state, Shape::of_record(&record)) {
            log::trace!("keeping local {} over state {}", path, state);
            return;
        }
        if !self.open_ancestors(path, state, WriteMode::Remote) {
            log::debug!("dropping {} at state {}: an ancestor was overwritten later", path, state);
            return;
        }

        self.place_edge(path, state, value);
        self.outbox.push(GraphEvent::Change {
            path: path.to_string(),
            record,
        });
        tally.applied += 1;
    }

    fn merge_node(
        &mut self,
        path: &str,
        state: State,
        children: BTreeMap<String, Record>,
        cleared: Option<Box<Record>>,
        now: State,
        tally: &mut Tally,
    ) {
        if let Some(mark) = cleared {
            if mark.is_node() {
                log::debug!("ignoring node record cleared by a node at {}", path);
            } else {
                self.merge_record(path, *mark, now, tally);
            }
        }

        if self.claim_node(path, state, WriteMode::Remote) {
            tally.applied += 1;
        }

        for (key, child) in children {
            self.merge_record(&path::join(path, &key), child, now, tally);
        }
    }

    /// Whether a write of `shape` at `state` beats what stands in the slot
    /// at `path` itself: the Edge stored there, or the Edge a Node there
    /// overruled. A Node with no such mark never blocks.
    fn outranks_slot(&self, path: &str, state: State, shape: Shape<'_>) -> bool {
        let Some(entry) = self.store.get(path) else {
            return true;
        };
        match &entry.kind {
            EntryKind::Edge(value) => should_overwrite(entry.state, Shape::of_edge(value), state, shape),
            EntryKind::Node { cleared, .. } => cleared
                .as_ref()
                .map_or(true, |mark| should_overwrite(mark.state, Shape::of_edge(&mark.value), state, shape)),
        }
    }

    /// Make every ancestor of `path` a Node standing at `state` or newer.
    ///
    /// Fails without touching anything if an ancestor's slot outranks a
    /// Node at `state`. Missing ancestors are created; an Edge in the way
    /// becomes the new Node's cleared mark.
    pub(crate) fn open_ancestors(&mut self, path: &str, state: State, mode: WriteMode) -> bool {
        let ancestors: Vec<String> = path::ancestors(path).map(String::from).collect();
        if !ancestors
            .iter()
            .all(|ancestor| self.outranks_slot(ancestor, state, Shape::Node))
        {
            return false;
        }

        for ancestor in ancestors.iter().rev() {
            if !self.store.get(ancestor).is_some_and(Entry::is_node) {
                self.raise_node(ancestor, state, mode);
            }
        }
        self.store.bump_ancestors(path, state);
        true
    }

    /// Store a Node at `slot`, keeping any Edge it replaces as its mark.
    fn raise_node(&mut self, slot: &str, state: State, mode: WriteMode) {
        let cleared = self.store.get(slot).and_then(|entry| {
            entry.edge_value().map(|value| Cleared {
                state: entry.state,
                value: value.clone(),
            })
        });

        let (parent, key) = path::parent_and_key(slot);
        self.store.insert(Entry {
            parent: parent.map(String::from),
            key: key.to_string(),
            state,
            kind: EntryKind::Node {
                children: BTreeSet::new(),
                cleared,
            },
        });

        if mode == WriteMode::Remote {
            self.outbox.push(GraphEvent::Change {
                path: slot.to_string(),
                record: Record::node(state, BTreeMap::new()),
            });
        }
    }

    /// Write an Edge at `path`, whose slot and ancestors it has already
    /// been checked against. A Node that is newer than the Edge stays and
    /// keeps the Edge as its mark, losing whatever the Edge outranks.
    pub(crate) fn place_edge(&mut self, path: &str, state: State, value: EdgeValue) {
        let node_stands = self
            .store
            .get(path)
            .filter(|entry| entry.is_node())
            .is_some_and(|node| !should_overwrite(node.state, Shape::Node, state, Shape::of_edge(&value)));

        if node_stands {
            let removed = self.store.clear_under(path, state, Shape::of_edge(&value));
            log::trace!("{} overruled at state {}, cleared {} entries", path, state, removed);
            if let Some(Entry {
                kind: EntryKind::Node { cleared, .. },
                ..
            }) = self.store.get_mut(path)
            {
                *cleared = Some(Cleared { state, value });
            }
            return;
        }

        let (parent, key) = path::parent_and_key(path);
        self.store.insert(Entry::edge(parent.map(String::from), key, state, value));
    }

    /// Assert a Node at `path` as of `state`. Returns whether anything
    /// changed; a claim the slot or an ancestor outranks changes nothing.
    pub(crate) fn claim_node(&mut self, path: &str, state: State, mode: WriteMode) -> bool {
        if !self.outranks_slot(path, state, Shape::Node) {
            log::trace!("keeping local edge {} over node at state {}", path, state);
            return false;
        }
        if !self.open_ancestors(path, state, mode) {
            log::debug!("dropping node {} at state {}: an ancestor was overwritten later", path, state);
            return false;
        }

        let standing = self.store.get(path).filter(|entry| entry.is_node()).map(|node| node.state);
        match standing {
            Some(current) if current >= state => false,
            Some(_) => {
                if let Some(node) = self.store.get_mut(path) {
                    node.state = state;
                }
                true
            }
            None => {
                self.raise_node(path, state, mode);
                true
            }
        }
    }

    fn park(&mut self, path: &str, record: Record) {
        let state = record.state();
        log::debug!("parking record for {} until state {}", path, state);
        let index = self.pending.partition_point(|p| p.record.state() <= state);
        self.pending.insert(
            index,
            PendingRecord {
                path: path.to_string(),
                record,
            },
        );
    }

    /// State of the earliest parked record.
    pub(crate) fn next_pending(&self) -> Option<State> {
        self.pending.first().map(|p| p.record.state())
    }

    /// Apply every parked record whose state is no later than `now`. Returns
    /// the number of entries that changed.
    pub(crate) fn replay_due(&mut self, now: State) -> usize {
        let due = self.pending.partition_point(|p| p.record.state() <= now);
        if due == 0 {
            return 0;
        }
        let records: Vec<PendingRecord> = self.pending.drain(..due).collect();
        let mut tally = Tally::default();
        for PendingRecord { path, record } in records {
            log::trace!("replaying parked record for {}", path);
            self.merge_record(&path, record, now, &mut tally);
        }
        tally.applied
    }
}
