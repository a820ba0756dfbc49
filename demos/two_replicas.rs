//! Two replicas talking over an in-process wire
//!
//! Each replica broadcasts its local writes and its demands as messages on a
//! channel; a pump task delivers them to the other side, which merges writes
//! and answers demands from its own data.

use std::time::Duration;

use meshgraph::{Graph, Record};
use serde_json::json;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Message {
    Set { path: String, record: Record },
    Get { path: String },
}

/// Publish `graph`'s writes and demands on `wire`.
fn attach(graph: &Graph, wire: mpsc::UnboundedSender<Message>) {
    let sets = wire.clone();
    graph.on_set(move |path, record| {
        let _ = sets.send(Message::Set {
            path: path.to_string(),
            record: record.clone(),
        });
    });
    graph.on_get(move |path| {
        let _ = wire.send(Message::Get {
            path: path.to_string(),
        });
    });
}

/// Deliver messages from `inbox` to `local`, answering demands straight
/// into `peer`.
fn pump(
    name: &'static str,
    local: Graph,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    peer: Graph,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            match message {
                Message::Set { path, record } => {
                    let outcome = local.merge(&path, record);
                    println!("   {} <- set {} ({:?})", name, path, outcome);
                }
                Message::Get { path } => {
                    if let Some((slot, record)) = local.record_at_path(&path) {
                        println!("   {} answers get {}", name, path);
                        peer.listen_at_path(&slot, false);
                        peer.merge(&slot, record);
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("🔗 Two Replicas");
    println!("===============\n");

    let alice = Graph::new();
    let bob = Graph::new();

    let (to_bob, bob_inbox) = mpsc::unbounded_channel();
    let (to_alice, alice_inbox) = mpsc::unbounded_channel();
    attach(&alice, to_bob);
    attach(&bob, to_alice);

    let alice_pump = pump("alice", alice.clone(), alice_inbox, bob.clone());
    let bob_pump = pump("bob", bob.clone(), bob_inbox, alice.clone());

    println!("📝 Alice writes a profile...");
    alice.set("people/alice", json!({ "name": "Alice", "city": "Lisbon" }));

    println!("🔍 Bob asks for it...");
    let profile = bob
        .get("people")
        .get("alice")
        .with_wait(Duration::from_secs(1))
        .await?;
    println!("   Bob sees: {}\n", profile);

    println!("👀 Bob watches Alice's city...");
    let subscription = bob.get("people/alice/city").on(|city| {
        println!("   Bob's view of the city: {:?}", city);
    });

    alice.set("people/alice/city", "Porto");
    tokio::time::sleep(Duration::from_millis(50)).await;
    subscription.unsubscribe();

    println!("\n📊 Final state");
    println!("   alice: {}", alice.value_at_path("people").unwrap_or_default());
    println!("   bob:   {}", bob.value_at_path("people").unwrap_or_default());

    drop((alice, bob));
    alice_pump.abort();
    bob_pump.abort();
    Ok(())
}
