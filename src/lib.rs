// Meshgraph - Replicated Last-Write-Wins Graph Store

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod graph;
pub mod merge;
pub mod mutation;
pub mod path;
pub mod record;
pub mod reference;

mod resolve;
mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GraphConfig;
pub use entry::{Cleared, EdgeValue, Entry, EntryKind, Primitive, RefTarget, State};
pub use error::{GraphError, Result};
pub use events::{Channel, GraphEvent, ListenerId};
pub use graph::Graph;
pub use merge::MergeOutcome;
pub use mutation::SetValue;
pub use record::{GraphSnapshot, Record};
pub use reference::{Ref, Subscription};

/// Lock a mutex, carrying on with the data if a panicking listener
/// poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
