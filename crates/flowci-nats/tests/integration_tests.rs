//! Integration tests for flowci-nats.
//!
//! A NATS server with JetStream is started in a container.
//! Run with: `cargo test -p flowci-nats --features integration`

#![cfg(feature = "integration")]

use flowci_core::agent::AgentStatus;
use flowci_core::events::{AgentStatusChangedPayload, Event};
use flowci_core::ids::AgentId;
use flowci_core::ports::{Coordinator, CoordEvent, CreateMode, EventBus, MessageQueue, Priority};
use flowci_nats::{KvCoordinator, NatsConfig, NatsConnection, NatsEventBus, NatsQueue};
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;
use tokio_test::assert_ok;

struct Server {
    _container: ContainerAsync<Nats>,
    url: String,
}

async fn server() -> Server {
    let container = Nats::default()
        .with_tag("2.10-alpine")
        .with_cmd(["-js"])
        .start()
        .await
        .expect("start nats");
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(4222).await.unwrap();
    Server {
        url: format!("nats://{}:{}", host, port),
        _container: container,
    }
}

async fn connect(server: &Server) -> NatsConnection {
    let config = NatsConfig::new(&server.url)
        .with_namespace("it")
        .with_session_ttl(Duration::from_secs(2));
    NatsConnection::connect(config).await.expect("connect")
}

fn agent_event() -> Event {
    Event::AgentStatusChanged(AgentStatusChangedPayload {
        agent_id: AgentId::new(),
        name: "agent-1".to_string(),
        previous: AgentStatus::Idle,
        status: AgentStatus::Busy,
        job_id: None,
        changed_at: chrono::Utc::now(),
    })
}

#[tokio::test]
async fn test_publish_and_subscribe() {
    let server = server().await;
    let conn = connect(&server).await;
    let bus = NatsEventBus::new(&conn).await.unwrap();

    let mut events = bus.subscribe("agent.status.*").await.unwrap();
    assert_ok!(bus.publish(agent_event()).await);

    let received = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("event in time")
        .unwrap()
        .unwrap();
    assert!(matches!(received, Event::AgentStatusChanged(_)));

    let snapshot = conn.metrics().snapshot();
    assert_eq!(snapshot.events_published, 1);
    assert_eq!(bus.retained().await.unwrap(), 1);
    assert!(conn.health_check().status.is_healthy());
}

#[tokio::test]
async fn test_queue_serves_high_priority_first() {
    let server = server().await;
    let conn = connect(&server).await;
    let queue = NatsQueue::new(&conn).await.unwrap();

    queue.send("jobs", b"n1".to_vec(), Priority::Normal).await.unwrap();
    queue.send("jobs", b"n2".to_vec(), Priority::Normal).await.unwrap();
    queue.send("jobs", b"h1".to_vec(), Priority::High).await.unwrap();

    let mut deliveries = queue.consume("jobs").await.unwrap();
    let mut order = Vec::new();
    while order.len() < 3 {
        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .expect("delivery in time")
            .unwrap()
            .unwrap();
        order.push(String::from_utf8(delivery.payload.clone()).unwrap());
        delivery.ack().await.unwrap();
    }

    assert_eq!(order, vec!["h1", "n1", "n2"]);
    assert_eq!(conn.metrics().snapshot().messages_acked, 3);
}

#[tokio::test]
async fn test_nodes_and_locks() {
    let server = server().await;
    let conn = connect(&server).await;
    let coord = KvCoordinator::new(&conn).await.unwrap();

    coord.create(CreateMode::Persistent, "/agents", b"").await.unwrap();
    coord.create(CreateMode::Ephemeral, "/agents/a1", b"IDLE").await.unwrap();
    assert!(coord.create(CreateMode::Persistent, "/agents/a1", b"").await.is_err());

    coord.set("/agents/a1", b"BUSY").await.unwrap();
    assert_eq!(coord.get("/agents/a1").await.unwrap(), Some(b"BUSY".to_vec()));
    assert!(coord.set("/agents/missing", b"IDLE").await.is_err());

    let token = coord
        .acquire("/agents/a1-lock", Duration::from_millis(200))
        .await
        .unwrap()
        .expect("first lock");
    let contended = coord
        .acquire("/agents/a1-lock", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(contended.is_none());

    coord.release(token.clone()).await.unwrap();
    assert!(coord.release(token).await.is_err());

    assert!(coord.delete("/agents", false).await.is_err());
    coord.delete("/agents", true).await.unwrap();
    assert!(!coord.exists("/agents/a1").await.unwrap());
}

#[tokio::test]
async fn test_watch_reports_children() {
    let server = server().await;
    let conn = connect(&server).await;
    let coord = KvCoordinator::new(&conn).await.unwrap();
    coord.create(CreateMode::Persistent, "/agents", b"").await.unwrap();

    let mut events = coord.watch_children("/agents").await.unwrap();

    coord.create(CreateMode::Ephemeral, "/agents/a1", b"IDLE").await.unwrap();
    coord.set("/agents/a1", b"BUSY").await.unwrap();
    coord.delete("/agents/a1", false).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event in time")
            .unwrap();
        seen.push(event);
    }

    assert_eq!(
        seen,
        vec![
            CoordEvent::ChildAdded("/agents/a1".to_string()),
            CoordEvent::ChildUpdated("/agents/a1".to_string()),
            CoordEvent::ChildRemoved("/agents/a1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_ephemeral_node_expires_with_its_session() {
    let server = server().await;
    let watcher = KvCoordinator::new(&connect(&server).await).await.unwrap();
    watcher.create(CreateMode::Persistent, "/agents", b"").await.unwrap();

    let agent_conn = connect(&server).await;
    let agent = KvCoordinator::new(&agent_conn).await.unwrap();
    agent.create(CreateMode::Ephemeral, "/agents/a1", b"IDLE").await.unwrap();

    let mut events = watcher.watch_children("/agents").await.unwrap();
    agent_conn.shutdown().await;
    drop(agent);

    let removed = tokio::time::timeout(Duration::from_secs(15), async {
        while let Some(event) = events.next().await {
            if event == CoordEvent::ChildRemoved("/agents/a1".to_string()) {
                return true;
            }
        }
        false
    })
    .await
    .expect("removal in time");
    assert!(removed);
}
