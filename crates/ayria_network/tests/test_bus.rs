use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ayria_network::codec::{self, Armored, BusPacket};
use ayria_network::transport::{Datagram, MemorySocket};
use ayria_network::*;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([192, 168, 0, last], port))
}

struct Peer {
    bus: BusContext,
    store: Arc<SqliteStore>,
    multicast: Arc<MemorySocket>,
    unicast: Arc<MemorySocket>,
    hits: Arc<AtomicUsize>,
}

fn peer(last: u8) -> Peer {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let multicast = Arc::new(MemorySocket::new(addr(last, 4000)));
    let unicast = Arc::new(MemorySocket::new(addr(last, 5000)));
    let mut bus = BusContext::with_sockets(
        &AyriaConfig::default(),
        Arc::new(Identity::generate()),
        store.clone(),
        Some(multicast.clone()),
        Some(unicast.clone()),
    );

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    bus.on_message(
        &Topic::PresenceUpdate,
        Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );

    Peer {
        bus,
        store,
        multicast,
        unicast,
        hits,
    }
}

#[test]
fn test_scenario_a_publish_persists_local_record() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let node = AyriaNode::offline(AyriaConfig::default(), Arc::new(Identity::generate()), store.clone());

    let payload = br#"{"online":true}"#;
    node.publish(&Topic::PresenceUpdate, payload).unwrap();

    assert_eq!(store.message_count().unwrap(), 1);
    let record = store
        .latest_message(node.identity().long_id(), Topic::PresenceUpdate.hash())
        .unwrap()
        .unwrap();
    assert_eq!(record.owner_id, node.identity().long_id());
    assert_eq!(record.payload, Armored::wrap(payload).as_str());
    assert!(record.is_local);
}

#[tokio::test]
async fn test_publish_delivers_to_other_peer() {
    let mut alice = peer(1);
    let mut bob = peer(2);

    alice.bus.publish(&Topic::PresenceUpdate, br#"{"online":true}"#).unwrap();
    alice.bus.shutdown().await;

    for (_, bytes) in alice.multicast.take_sent() {
        bob.multicast.inject(bytes, addr(1, 4000));
    }
    assert_eq!(bob.bus.poll_multicast(), 1);
    assert_eq!(bob.hits.load(Ordering::SeqCst), 1);

    let record = bob
        .store
        .latest_message(alice.bus.identity().long_id(), Topic::PresenceUpdate.hash())
        .unwrap()
        .unwrap();
    assert!(!record.is_local);
    bob.bus.shutdown().await;
}

#[tokio::test]
async fn test_self_suppression() {
    let mut alice = peer(1);

    alice.bus.publish(&Topic::PresenceUpdate, b"{}").unwrap();
    let publisher = alice.bus.publisher();
    publisher.publish(&Topic::PresenceUpdate, b"{}").unwrap();
    drop(publisher);
    alice.bus.shutdown().await;

    let echoes = alice.multicast.take_sent();
    assert_eq!(echoes.len(), 2);
    for (_, bytes) in echoes {
        alice.multicast.inject(bytes, addr(1, 4000));
    }

    assert_eq!(alice.bus.poll_multicast(), 2);
    assert_eq!(alice.hits.load(Ordering::SeqCst), 0);
    assert_eq!(alice.bus.stats().dropped, 2);
    assert_eq!(alice.bus.local_addr(), Some(addr(1, 4000)));
}

#[tokio::test]
async fn test_freshness_future_packet_not_persisted() {
    let mut bob = peer(2);
    let sender = Identity::generate();
    let future = now_millis() + 10_000;
    let datagram = codec::encode(&sender, 77, &Topic::PresenceUpdate, b"{}", future).unwrap();
    bob.multicast.inject(datagram, addr(1, 4000));

    assert_eq!(bob.bus.poll_multicast(), 1);
    assert_eq!(bob.hits.load(Ordering::SeqCst), 0);
    assert_eq!(bob.store.message_count().unwrap(), 0);
    assert!(bob.store.client_last_seen(sender.long_id()).unwrap().is_none());
    bob.bus.shutdown().await;
}

#[tokio::test]
async fn test_budget_limits_router_poll() {
    let mut bob = peer(2);
    let router = addr(9, 6000);
    bob.bus.add_router(router);

    let sender = Identity::generate();
    for ts in 0..14u64 {
        let packet = BusPacket::sign(&sender, Topic::PresenceUpdate.hash(), ts, Armored::wrap(b"{}"));
        bob.unicast.inject(packet.encode().unwrap(), router);
    }

    assert_eq!(bob.bus.poll_routers(), 10);
    assert_eq!(bob.unicast.pending(), 4);
    assert_eq!(bob.bus.poll_routers(), 4);
    assert_eq!(bob.hits.load(Ordering::SeqCst), 14);
    bob.bus.shutdown().await;
}

#[tokio::test]
async fn test_router_relay_path() {
    let mut alice = peer(1);
    let mut bob = peer(2);
    let bob_router_addr = addr(2, 5000);
    alice.bus.add_router(bob_router_addr);

    alice.bus.publish(&Topic::PresenceUpdate, b"{}").unwrap();
    alice.bus.shutdown().await;

    let relayed = alice.unicast.take_sent();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].0, bob_router_addr);

    // Bob does not trust Alice as a router yet.
    let datagram = Datagram {
        data: relayed[0].1.clone(),
        from: addr(1, 5000),
    };
    assert_eq!(
        bob.bus.handle_router(&datagram),
        Err(DropReason::UntrustedRouter(addr(1, 5000)))
    );

    bob.bus.add_router(addr(1, 5000));
    bob.unicast.inject(datagram.data, datagram.from);
    assert_eq!(bob.bus.poll_routers(), 1);
    assert_eq!(bob.hits.load(Ordering::SeqCst), 1);
    bob.bus.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_datagrams_are_dropped_quietly() {
    let mut bob = peer(2);
    bob.multicast.inject(vec![], addr(1, 4000));
    bob.multicast.inject(vec![0; 20], addr(1, 4000));
    bob.multicast.inject(vec![0xFF; 300], addr(1, 4000));

    assert_eq!(bob.bus.poll_multicast(), 3);
    let stats = bob.bus.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.dropped, 3);
    bob.bus.shutdown().await;
}

// ---------------------------------------------------------------------------
// Endpoint calls over the bus
// ---------------------------------------------------------------------------

struct NodePeer {
    node: AyriaNode,
    multicast: Arc<MemorySocket>,
}

fn node_peer(last: u8) -> NodePeer {
    let config = AyriaConfig::default();
    let identity = Arc::new(Identity::generate());
    let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let multicast = Arc::new(MemorySocket::new(addr(last, 4000)));
    let bus = BusContext::with_sockets(
        &config,
        Arc::clone(&identity),
        Arc::clone(&store),
        Some(multicast.clone()),
        None,
    );
    let node = AyriaNode::from_parts(config, identity, store, bus, None, Arc::new(NotificationHub::new()));
    NodePeer { node, multicast }
}

/// Wait until the send workers of `from` have sent `expected` datagrams,
/// then hand them to `to`.
async fn relay(from: &NodePeer, to: &NodePeer, from_last: u8, expected: usize) -> usize {
    let mut sent = Vec::new();
    for _ in 0..200 {
        sent.extend(from.multicast.take_sent());
        if sent.len() >= expected {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let count = sent.len();
    for (_, bytes) in sent {
        to.multicast.inject(bytes, addr(from_last, 4000));
    }
    count
}

#[tokio::test]
async fn test_endpoint_call_over_bus() {
    let mut alice = node_peer(1);
    let mut bob = node_peer(2);
    bob.node
        .add_endpoint(
            "Test::Echo",
            Arc::new(|request| serde_json::json!({ "Echo": request })),
        )
        .unwrap();
    let bob_id = bob.node.identity().long_id().to_string();

    let echo = alice
        .node
        .call_remote(Some(&bob_id), "Test::Echo", serde_json::json!({ "n": 7 }))
        .unwrap();
    let missing = alice
        .node
        .call_remote(Some(&bob_id), "Test::Missing", serde_json::json!({}))
        .unwrap();

    assert_eq!(relay(&alice, &bob, 1, 2).await, 2);
    assert_eq!(bob.node.poll(), 2);
    assert_eq!(relay(&bob, &alice, 2, 2).await, 2);
    assert_eq!(alice.node.poll(), 2);

    let timeout = std::time::Duration::from_secs(1);
    assert_eq!(
        echo.wait(timeout).await.unwrap(),
        serde_json::json!({ "Echo": { "n": 7 } })
    );
    let error = missing.wait(timeout).await.unwrap();
    assert!(error["Error"].as_str().unwrap().contains("Test::Missing"));

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn test_endpoint_call_for_other_peer_is_not_answered() {
    let mut alice = node_peer(1);
    let mut bob = node_peer(2);

    let call = alice
        .node
        .call_remote(Some("someone-else"), "Network::Info", serde_json::json!({}))
        .unwrap();
    assert_eq!(relay(&alice, &bob, 1, 1).await, 1);
    assert_eq!(bob.node.poll(), 1);
    bob.node.shutdown().await;
    assert!(bob.multicast.take_sent().is_empty());

    assert!(matches!(
        call.wait(std::time::Duration::from_millis(20)).await,
        Err(NetworkError::RpcTimeout(_))
    ));
    alice.node.shutdown().await;
}
