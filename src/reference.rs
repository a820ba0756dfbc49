//! Ref handles
//!
//! A [`Ref`] names a path in a graph and nothing more. It is resolved again
//! on every access, so it may point at data that does not exist yet, that
//! changes shape, or that is reached through pointers. Building a chain with
//! [`Ref::get`] never touches graph storage.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::entry::{Entry, State};
use crate::error::{GraphError, Result};
use crate::events::{Channel, ListenerId};
use crate::graph::{Graph, GraphInner};
use crate::lock;
use crate::mutation::SetValue;
use crate::path;

/// A named lookup into a graph.
#[derive(Clone)]
pub struct Ref {
    graph: Graph,
    path: String,
    state: State,
    wait: Option<Duration>,
}

impl Ref {
    pub(crate) fn new(graph: Graph, path: String, state: State) -> Self {
        Self {
            graph,
            path,
            state,
            wait: None,
        }
    }

    /// A ref to the child `key` of this path.
    pub fn get(&self, key: &str) -> Ref {
        Ref {
            graph: self.graph.clone(),
            path: path::join(&self.path, key),
            state: self.state,
            wait: self.wait,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Clock reading when the handle was created.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn set(&self, value: impl Into<SetValue>) -> State {
        self.graph.set(&self.path, value)
    }

    /// Delete whatever is stored here. `None` when there was nothing.
    pub fn delete(&self) -> Option<State> {
        self.graph.delete(&self.path)
    }

    /// Current materialized value. Demands the path when nothing is there.
    pub fn value(&self) -> Option<Value> {
        self.graph.value_at_path(&self.path)
    }

    /// A copy of the entry this ref resolves to.
    pub fn entry(&self) -> Option<Entry> {
        self.graph.node_at_path(&self.path)
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty(&self.path)
    }

    /// Override the graph's default wait for one-shot reads.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn wait(&self) -> Duration {
        self.wait.unwrap_or_else(|| self.graph.wait())
    }

    /// Call `callback` with the value now, if there is one, and again after
    /// every change at or under this path or under the entry it resolves to.
    ///
    /// If the path starts resolving somewhere else (a pointer along the way
    /// was rewritten), interest moves to the new target.
    pub fn on(&self, callback: impl Fn(Option<Value>) + Send + Sync + 'static) -> Subscription {
        let graph = &self.graph;
        let own = self.path.clone();

        let current = graph.value_quiet(&own);
        graph.listen_at_path(&own, current.is_none());
        let resolved = graph.resolve_path(&own);
        if let Some(target) = resolved.as_deref().filter(|t| *t != own) {
            graph.listen_at_path(target, false);
        }

        let tracked = Arc::new(Mutex::new(resolved));
        let callback = Arc::new(callback);
        let weak = graph.downgrade();

        let id = graph.on(Channel::Change, {
            let callback = Arc::clone(&callback);
            let weak = weak.clone();
            move |event| {
                let Some(graph) = Graph::upgrade(&weak) else {
                    return;
                };
                let now = graph.resolve_path(&own);
                let before = std::mem::replace(&mut *lock(&tracked), now.clone());
                let moved = now != before;
                if moved {
                    if let Some(target) = now.as_deref() {
                        log::trace!("{} now resolves to {}", own, target);
                        graph.listen_at_path(target, false);
                    }
                }

                let changed = event.path();
                let relevant = moved
                    || path::is_under(changed, &own)
                    || [now.as_deref(), before.as_deref()]
                        .into_iter()
                        .flatten()
                        .any(|p| path::is_under(changed, p));
                if relevant {
                    (*callback)(graph.value_quiet(&own));
                }
            }
        });

        if current.is_some() {
            (*callback)(current);
        }
        Subscription { id, graph: weak }
    }

    /// Like [`Ref::on`], but only for the first value seen.
    pub fn once(&self, callback: impl FnOnce(Value) + Send + 'static) -> Subscription {
        let pending = Arc::new(Mutex::new(Some(callback)));
        let handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let subscription = self.on({
            let pending = Arc::clone(&pending);
            let handle = Arc::clone(&handle);
            move |value| {
                let Some(value) = value else {
                    return;
                };
                let Some(callback) = lock(&pending).take() else {
                    return;
                };
                if let Some(subscription) = lock(&handle).as_ref() {
                    subscription.unsubscribe();
                }
                callback(value);
            }
        });

        // Already delivered while subscribing
        if lock(&pending).is_none() {
            subscription.unsubscribe();
        }
        *lock(&handle) = Some(subscription.clone());
        subscription
    }

    /// Wait for a value, up to [`Ref::wait`].
    ///
    /// A value that is already there is returned without registering a
    /// listener. Otherwise one change listener waits for the first value and
    /// is removed again whichever way the wait ends.
    pub async fn resolve(&self) -> Result<Value> {
        if let Some(value) = self.value() {
            return Ok(value);
        }

        let wait = self.wait();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.on(move |value| {
            if let Some(value) = value {
                if let Some(tx) = lock(&tx).take() {
                    let _ = tx.send(value);
                }
            }
        });
        let _guard = UnsubscribeOnDrop(subscription);

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GraphError::Cancelled),
            Err(_) => Err(GraphError::Timeout {
                wait_ms: crate::config::millis(wait),
            }),
        }
    }
}

impl IntoFuture for Ref {
    type Output = Result<Value>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.resolve().await })
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Ref {}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("wait", &self.wait)
            .finish()
    }
}

/// Handle to a [`Ref::on`] or [`Ref::once`] registration.
///
/// Subscriptions never expire on their own and are not cancelled on drop.
#[derive(Clone)]
pub struct Subscription {
    id: ListenerId,
    graph: Weak<GraphInner>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Stop delivery. Safe to call repeatedly and from inside the callback;
    /// returns whether this call removed the listener.
    pub fn unsubscribe(&self) -> bool {
        Graph::upgrade(&self.graph).is_some_and(|graph| graph.off(self.id))
    }

    pub fn is_active(&self) -> bool {
        Graph::upgrade(&self.graph).is_some_and(|graph| graph.is_registered(self.id))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct UnsubscribeOnDrop(Subscription);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_chain_builder_allocates_nothing() {
        let graph = Graph::new();
        let deep = graph.get("a").get("b").get("c");
        assert_eq!(deep.path(), "a/b/c");
        assert!(graph.to_json().is_empty());
        assert_eq!(deep, graph.get("a/b/c"));
        assert_ne!(deep, graph.get("a/b"));
    }

    #[test]
    fn test_on_delivers_current_and_later_values() {
        let graph = Graph::new();
        graph.set("a", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = graph.get("a").on(move |value| sink.lock().unwrap().push(value));

        graph.set("a", 2);
        graph.set("other", 3);
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        graph.set("a", 4);

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(1)), Some(json!(2))]);
    }

    #[test]
    fn test_on_sees_nested_writes() {
        let graph = Graph::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        graph.get("user").on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        graph.get("user").get("name").set("Ada");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(graph.get("user").value(), Some(json!({ "name": "Ada" })));
    }

    #[test]
    fn test_on_follows_retargeted_pointer() {
        let graph = Graph::new();
        graph.set("first", json!({ "name": "one" }));
        graph.set("second", json!({ "name": "two" }));
        graph.set("current", &graph.get("first"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        graph.get("current").get("name").on(move |value| sink.lock().unwrap().push(value));

        graph.set("current", &graph.get("second"));
        graph.set("second/name", "deux");
        graph.set("first/name", "ignored");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(json!("one")), Some(json!("two")), Some(json!("deux"))]
        );
    }

    #[test]
    fn test_unsubscribe_from_inside_callback() {
        let graph = Graph::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&slot);
        let counter = Arc::clone(&hits);
        let subscription = graph.get("x").on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(subscription) = inner.lock().unwrap().as_ref() {
                subscription.unsubscribe();
                subscription.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(subscription.clone());

        graph.set("x", 1);
        graph.set("x", 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_once_takes_first_value() {
        let graph = Graph::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = graph.get("x").once(move |value| sink.lock().unwrap().push(value));

        graph.set("x", "first");
        graph.set("x", "second");
        assert_eq!(*seen.lock().unwrap(), vec![json!("first")]);
        assert!(!subscription.is_active());
        assert_eq!(graph.listener_count(Channel::Change), 0);
    }

    #[test]
    fn test_once_with_value_present() {
        let graph = Graph::new();
        graph.set("x", true);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        graph.get("x").once(move |value| *sink.lock().unwrap() = Some(value));

        assert_eq!(*seen.lock().unwrap(), Some(json!(true)));
        assert_eq!(graph.listener_count(Channel::Change), 0);
    }

    #[test]
    fn test_wait_defaults_to_graph() {
        let graph = Graph::new();
        graph.set_wait(Duration::from_millis(40));
        assert_eq!(graph.get("a").wait(), Duration::from_millis(40));
        let short = graph.get("a").with_wait(Duration::from_millis(2));
        assert_eq!(short.get("b").wait(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_resolve_immediate_registers_nothing() {
        let graph = Graph::new();
        graph.set("x", 5);
        assert_eq!(graph.get("x").await.unwrap(), json!(5));
        assert_eq!(graph.listener_count(Channel::Change), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_times_out() {
        let graph = Graph::new();
        let err = graph
            .get("missing")
            .with_wait(Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, GraphError::Timeout { wait_ms: 1 });
        assert_eq!(err.to_string(), "Request took longer than 1ms to resolve");
        assert_eq!(graph.listener_count(Channel::Change), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_waits_for_write() {
        let graph = Graph::new();
        let writer = graph.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set("later", "here");
        });

        assert_eq!(graph.get("later").await.unwrap(), json!("here"));
        assert_eq!(graph.listener_count(Channel::Change), 0);
    }
}
