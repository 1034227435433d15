//! Full socket-based integration tests for hub <-> client communication.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_client::{Client, CoreEvents};
use chat_hub::Hub;
use chat_shared::config::ChatConfig;
use chat_shared::topology::TopologySnapshot;

/// Collects events so tests can assert on what a client observed.
#[derive(Default)]
struct RecordingEvents {
    messages: Mutex<Vec<(String, String)>>,
    directs: Mutex<Vec<(String, String)>>,
    joins: Mutex<Vec<String>>,
    user_lists: Mutex<Vec<Vec<String>>>,
    topologies: Mutex<Vec<TopologySnapshot>>,
}

impl CoreEvents for RecordingEvents {
    fn on_message(&self, user: &str, content: &str, _time: &str) {
        self.messages.lock().unwrap().push((user.to_string(), content.to_string()));
    }

    fn on_direct_message(&self, user: &str, content: &str, _time: &str, _is_direct: bool) {
        self.directs.lock().unwrap().push((user.to_string(), content.to_string()));
    }

    fn on_user_join(&self, user: &str) {
        self.joins.lock().unwrap().push(user.to_string());
    }

    fn on_user_list(&self, users: &[String]) {
        self.user_lists.lock().unwrap().push(users.to_vec());
    }

    fn on_topology_data(&self, snapshot: &TopologySnapshot) {
        self.topologies.lock().unwrap().push(snapshot.clone());
    }
}

async fn spawn_hub() -> anyhow::Result<ChatConfig> {
    let cfg = ChatConfig {
        tcp_addr: "127.0.0.1:0".to_string(),
        udp_addr: "127.0.0.1:0".to_string(),
        ..ChatConfig::default()
    };
    let hub = Arc::new(Hub::bind(cfg).await?);
    let client_cfg = ChatConfig {
        tcp_addr: hub.local_tcp_addr()?.to_string(),
        udp_addr: hub.local_udp_addr()?.to_string(),
        ..ChatConfig::default()
    };
    tokio::spawn(async move {
        let _ = hub.run().await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(client_cfg)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_broadcast_reaches_other_connected_users() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();
    let cfg = spawn_hub().await?;

    let alice_events = Arc::new(RecordingEvents::default());
    let alice = Client::connect(&cfg, "alice", alice_events.clone()).await?;

    let bob_events = Arc::new(RecordingEvents::default());
    let bob = Client::connect(&cfg, "bob", bob_events.clone()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.send_chat("hello everyone").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bob_messages = bob_events.messages.lock().unwrap();
    assert!(bob_messages.iter().any(|(u, c)| u == "alice" && c == "hello everyone"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_message_only_reaches_recipient() -> anyhow::Result<()> {
    let cfg = spawn_hub().await?;

    let alice_events = Arc::new(RecordingEvents::default());
    let alice = Client::connect(&cfg, "alice", alice_events.clone()).await?;
    let bob_events = Arc::new(RecordingEvents::default());
    let bob = Client::connect(&cfg, "bob", bob_events.clone()).await?;
    let carol_events = Arc::new(RecordingEvents::default());
    let _carol = Client::connect(&cfg, "carol", carol_events.clone()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.send_direct("bob", "just for you").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(bob_events
        .directs
        .lock()
        .unwrap()
        .iter()
        .any(|(u, c)| u == "alice" && c == "just for you"));
    assert!(carol_events.directs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_join_and_leave_are_broadcast() -> anyhow::Result<()> {
    let cfg = spawn_hub().await?;

    let alice_events = Arc::new(RecordingEvents::default());
    let _alice = Client::connect(&cfg, "alice", alice_events.clone()).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let bob_events = Arc::new(RecordingEvents::default());
    let bob = Client::connect(&cfg, "bob", bob_events.clone()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(alice_events.joins.lock().unwrap().contains(&"bob".to_string()));

    let users = bob.request_users().await?;
    assert!(users.contains(&"alice".to_string()));
    assert!(users.contains(&"bob".to_string()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_auth_with_taken_username_is_rejected() -> anyhow::Result<()> {
    let cfg = spawn_hub().await?;

    let events_a = Arc::new(RecordingEvents::default());
    let _alice = Client::connect(&cfg, "alice", events_a.clone()).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let events_b = Arc::new(RecordingEvents::default());
    let result = Client::connect(&cfg, "alice", events_b).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_server_triggers_a_topology_update() -> anyhow::Result<()> {
    let cfg = spawn_hub().await?;

    let events = Arc::new(RecordingEvents::default());
    let alice = Client::connect(&cfg, "alice", events.clone()).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;

    alice.ping_server().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let topologies = events.topologies.lock().unwrap();
    assert!(!topologies.is_empty());
    assert!(topologies
        .last()
        .unwrap()
        .nodes
        .iter()
        .any(|n| n.user == "SERVER"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn topology_request_returns_a_snapshot_after_pings() -> anyhow::Result<()> {
    let cfg = spawn_hub().await?;

    let alice_events = Arc::new(RecordingEvents::default());
    let alice = Client::connect(&cfg, "alice", alice_events.clone()).await?;
    let bob_events = Arc::new(RecordingEvents::default());
    let _bob = Client::connect(&cfg, "bob", bob_events.clone()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.ping_server().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = alice.request_topology().await?;
    assert!(snapshot.nodes.iter().any(|n| n.user == "alice"));
    Ok(())
}
