//! Multi-node scenarios over an in-memory network.
//!
//! Every datagram goes through the wire codec and is delivered in FIFO order
//! by `SimNetwork::pump`; datagrams to unknown addresses are dropped.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use kadnode::{
    DhtNode, DhtSettings, Dict, Keypair, MUTABLE_ITEM_DOMAIN, Message, MessageBody, NodeId,
    ScrapeFilter, StoredSigned, Transport, Value, compact_addr, decode, encode, mutable_key,
    mutable_signing_bytes, sign_with_domain,
};

type Node = Arc<DhtNode<SimTransport>>;

#[derive(Default)]
struct SimNetwork {
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
    nodes: Mutex<HashMap<SocketAddr, Node>>,
}

struct SimTransport {
    addr: SocketAddr,
    net: Arc<SimNetwork>,
}

impl Transport for SimTransport {
    fn send(&self, message: &Message, to: SocketAddr) -> anyhow::Result<()> {
        let bytes = encode(message)?;
        self.net.queue.lock().push_back((self.addr, to, bytes));
        Ok(())
    }
}

impl SimNetwork {
    fn add_node(self: &Arc<Self>, addr: SocketAddr, settings: DhtSettings) -> Node {
        let transport = SimTransport {
            addr,
            net: self.clone(),
        };
        let node = Arc::new(DhtNode::with_random_id(settings, transport));
        self.nodes.lock().insert(addr, node.clone());
        node
    }

    /// Deliver queued datagrams until the network is quiet.
    fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.queue.lock().pop_front();
            let Some((from, to, bytes)) = next else {
                return delivered;
            };
            let node = self.nodes.lock().get(&to).cloned();
            if let Some(node) = node {
                node.incoming(&decode(&bytes).unwrap(), from);
                delivered += 1;
            }
        }
    }

    fn take_queue(&self) -> Vec<(SocketAddr, SocketAddr, Message)> {
        self.queue
            .lock()
            .drain(..)
            .map(|(from, to, bytes)| (from, to, decode(&bytes).unwrap()))
            .collect()
    }
}

fn addr(i: usize) -> SocketAddr {
    format!("10.0.{}.{}:6881", i / 250, i % 250 + 1).parse().unwrap()
}

/// Build a network where every node bootstrapped off the first one and then
/// refreshed its own neighbourhood.
fn network(size: usize) -> (Arc<SimNetwork>, Vec<Node>) {
    let net = Arc::new(SimNetwork::default());
    let nodes: Vec<Node> = (0..size)
        .map(|i| net.add_node(addr(i), DhtSettings::default()))
        .collect();
    for node in &nodes[1..] {
        node.bootstrap(&[addr(0)], |_| {});
        net.pump();
    }
    for node in &nodes {
        node.refresh(node.own_id(), |_| {});
        net.pump();
    }
    (net, nodes)
}

fn token_for(node: &Node, from: SocketAddr, target: &NodeId) -> Value {
    Value::Bytes(node.generate_token(from.ip(), target).to_vec())
}

fn dict(entries: Vec<(&str, Value)>) -> Dict {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[test]
fn bootstrap_returns_closest_nodes_without_self() {
    let (net, nodes) = network(20);

    let newcomer = net.add_node(addr(100), DhtSettings::default());
    let found = Arc::new(Mutex::new(None));
    let sink = found.clone();
    newcomer.bootstrap(&[addr(0)], move |nodes| {
        *sink.lock() = Some(nodes);
    });
    net.pump();

    let found = found.lock().take().expect("bootstrap completed");
    assert!(!found.is_empty());
    assert!(found.len() <= 8);
    assert!(found.iter().all(|(id, _)| *id != newcomer.own_id()));
    assert!(newcomer.size().0 > 0);

    let known: Vec<NodeId> = nodes.iter().map(|n| n.own_id()).collect();
    assert!(found.iter().all(|(id, _)| known.contains(id)));
    assert_eq!(newcomer.status().running_traversals, 0);
}

#[test]
fn single_seed_reply_listing_ourselves_is_filtered() {
    let net = Arc::new(SimNetwork::default());
    let a = net.add_node(addr(0), DhtSettings::default());
    let contacts: Vec<Node> = (1..=7)
        .map(|i| net.add_node(addr(i), DhtSettings::default()))
        .collect();

    let seed = addr(50);
    let found = Arc::new(Mutex::new(None));
    let sink = found.clone();
    a.bootstrap(&[seed], move |nodes| {
        *sink.lock() = Some(nodes);
    });

    let queued = net.take_queue();
    assert_eq!(queued.len(), 1);
    let (_, to, query) = &queued[0];
    assert_eq!(*to, seed);

    let mut compact = Vec::new();
    for (i, node) in contacts.iter().enumerate() {
        compact.extend_from_slice(node.own_id().as_bytes());
        compact.extend_from_slice(&compact_addr(&addr(i + 1)));
    }
    compact.extend_from_slice(a.own_id().as_bytes());
    compact.extend_from_slice(&compact_addr(&addr(0)));
    let reply = dict(vec![
        ("id", NodeId::random().into()),
        ("nodes", Value::Bytes(compact)),
    ]);
    a.incoming(&Message::reply(query.transaction_id.clone(), reply), seed);
    net.pump();

    let found = found.lock().take().expect("bootstrap completed");
    assert!(found.len() <= 8);
    assert!(found.iter().all(|(id, _)| *id != a.own_id()));
    assert!(a.size().0 <= 8);
    assert_eq!(a.size().0, 7);
    assert!(!a.routing_table_contains(&a.own_id()));
    assert!(contacts.iter().all(|c| a.routing_table_contains(&c.own_id())));
}

#[test]
fn scrape_reply_estimates_seeds_and_downloaders() {
    let net = Arc::new(SimNetwork::default());
    let node = net.add_node(addr(0), DhtSettings::default());
    let info_hash = NodeId::random();

    for i in 1..=5 {
        let from = addr(i);
        let announce = dict(vec![
            ("id", NodeId::random().into()),
            ("info_hash", info_hash.into()),
            ("port", Value::Int(7000)),
            ("token", token_for(&node, from, &info_hash)),
            ("seed", Value::Int(i64::from(i <= 3))),
        ]);
        node.incoming_request("announce_peer", &announce, from).unwrap();
    }

    let reply = node
        .incoming_request(
            "get_peers",
            &dict(vec![
                ("id", NodeId::random().into()),
                ("info_hash", info_hash.into()),
                ("scrape", Value::Int(1)),
            ]),
            addr(9),
        )
        .unwrap();
    assert!(!reply.contains_key("values"));

    let filter = |key: &str| {
        let bytes = reply.get(key).and_then(Value::as_bytes).unwrap();
        ScrapeFilter::from_slice(bytes).unwrap()
    };
    let seeds = filter("BFsd").estimated_count();
    let downloaders = filter("BFpe").estimated_count();
    assert!((seeds - 3.0).abs() < 0.5, "{seeds}");
    assert!((downloaders - 2.0).abs() < 0.5, "{downloaders}");
}

#[test]
fn announced_peer_is_found_by_another_node() {
    let (net, nodes) = network(10);
    let info_hash = NodeId::random();

    let first = Arc::new(Mutex::new(None));
    let sink = first.clone();
    nodes[3].announce(info_hash, 7000, false, move |peers| {
        *sink.lock() = Some(peers);
    });
    net.pump();
    assert_eq!(first.lock().take(), Some(Vec::new()));

    let stored: usize = nodes.iter().map(|n| n.num_peers()).sum();
    assert!(stored > 0);

    let second = Arc::new(Mutex::new(None));
    let sink = second.clone();
    nodes[7].announce(info_hash, 0, false, move |peers| {
        *sink.lock() = Some(peers);
    });
    net.pump();

    let peers = second.lock().take().expect("announce completed");
    let expected = SocketAddr::new(addr(3).ip(), 7000);
    assert!(peers.contains(&expected), "{peers:?}");
    // Implied port: the second announcer is stored under its UDP source port.
    assert!(
        nodes
            .iter()
            .any(|n| n.num_peers() >= 2 && n.num_torrents() == 1)
    );
}

#[test]
fn stale_mutable_put_is_rejected() {
    let (_net, nodes) = network(2);
    let node = &nodes[0];
    let writer = addr(1);
    let keypair = Keypair::generate();
    let salt = b"profile".to_vec();
    let target = mutable_key(&keypair.public_key_bytes(), &salt);

    let put = |seq: u64, value: &[u8]| {
        let signature = sign_with_domain(
            &keypair,
            MUTABLE_ITEM_DOMAIN,
            &mutable_signing_bytes(&salt, seq, value),
        );
        dict(vec![
            ("id", NodeId::random().into()),
            ("token", token_for(node, writer, &target)),
            ("v", Value::Bytes(value.to_vec())),
            ("k", Value::Bytes(keypair.public_key_bytes().to_vec())),
            ("sig", Value::Bytes(signature.to_vec())),
            ("seq", Value::Int(seq as i64)),
            ("salt", Value::Bytes(salt.clone())),
        ])
    };

    node.incoming_request("put", &put(5, b"v5"), writer).unwrap();
    let err = node
        .incoming_request("put", &put(3, b"v3"), writer)
        .unwrap_err();
    assert_eq!(err.code(), 302);

    let reply = node
        .incoming_request(
            "get",
            &dict(vec![("id", NodeId::random().into()), ("target", target.into())]),
            writer,
        )
        .unwrap();
    assert_eq!(reply["v"].as_bytes(), Some(&b"v5"[..]));
    assert_eq!(reply["seq"].as_int(), Some(5));
}

#[test]
fn write_tokens_survive_one_rotation() {
    let (_net, nodes) = network(2);
    let node = &nodes[0];
    let writer = addr(1);
    let info_hash = NodeId::random();
    let token = token_for(node, writer, &info_hash);

    let announce = dict(vec![
        ("id", NodeId::random().into()),
        ("info_hash", info_hash.into()),
        ("port", Value::Int(9000)),
        ("token", token),
    ]);

    node.new_write_key();
    node.incoming_request("announce_peer", &announce, writer).unwrap();

    node.new_write_key();
    let err = node
        .incoming_request("announce_peer", &announce, writer)
        .unwrap_err();
    assert_eq!(err.code(), 203);

    // A token is bound to the writer's address.
    let other = addr(9);
    let fresh = token_for(node, writer, &info_hash);
    let mut moved = announce.clone();
    moved.insert("token".into(), fresh);
    assert!(node.incoming_request("announce_peer", &moved, other).is_err());
}

#[test]
fn item_storage_stays_bounded() {
    let net = Arc::new(SimNetwork::default());
    let settings = DhtSettings {
        max_dht_items: 4,
        ..DhtSettings::default()
    };
    let node = net.add_node(addr(0), settings);

    for i in 0..10 {
        let writer = addr(i + 1);
        let value = format!("value {i}").into_bytes();
        let target = NodeId::hash_of(&value);
        let put = dict(vec![
            ("id", NodeId::random().into()),
            ("token", token_for(&node, writer, &target)),
            ("v", Value::Bytes(value)),
        ]);
        node.incoming_request("put", &put, writer).unwrap();
        assert!(node.data_size() <= 4);
    }
    assert_eq!(node.data_size(), 4);
}

#[test]
fn replies_from_the_wrong_address_are_ignored() {
    let net = Arc::new(SimNetwork::default());
    let a = net.add_node(addr(0), DhtSettings::default());
    let b = net.add_node(addr(1), DhtSettings::default());

    a.add_node(addr(1));
    let queued = net.take_queue();
    assert_eq!(queued.len(), 1);
    let (_, to, ping) = &queued[0];
    assert_eq!(*to, addr(1));
    assert!(ping.is_query());

    let impostor = NodeId::random();
    let mut forged = Dict::new();
    forged.insert("id".into(), impostor.into());
    a.incoming(&Message::reply(ping.transaction_id.clone(), forged), addr(2));
    assert!(!a.routing_table_contains(&impostor));
    assert_eq!(a.status().outstanding_rpcs, 1);

    let mut genuine = Dict::new();
    genuine.insert("id".into(), b.own_id().into());
    a.incoming(&Message::reply(ping.transaction_id.clone(), genuine), addr(1));
    assert!(a.routing_table_contains(&b.own_id()));
    assert_eq!(a.status().outstanding_rpcs, 0);
}

#[test]
fn cancelled_announce_never_completes() {
    let (net, nodes) = network(6);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let id = nodes[2].announce(NodeId::random(), 6000, true, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(nodes[2].cancel(id));
    net.pump();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(nodes[2].status().running_traversals, 0);
    assert_eq!(nodes.iter().map(|n| n.num_peers()).sum::<usize>(), 0);
}

#[test]
fn signed_data_round_trip() {
    let (net, nodes) = network(10);
    let keypair = Keypair::generate();
    let username = keypair.public_key_hex();

    let stored = Arc::new(AtomicUsize::new(0));
    let counter = stored.clone();
    nodes[1]
        .put_data(&username, "status", false, b"hello".to_vec(), &keypair, 100, 1, move |n| {
            counter.store(n, Ordering::SeqCst);
        })
        .unwrap();
    net.pump();
    assert!(stored.load(Ordering::SeqCst) > 0);

    let fetch = |node: &Node, user: &str, resource: &str, multi: bool| {
        let found = Arc::new(Mutex::new(None));
        let sink = found.clone();
        node.get_data(user, resource, multi, move |items: Vec<StoredSigned>| {
            *sink.lock() = Some(items);
        });
        net.pump();
        found.lock().take().expect("get_data completed")
    };

    let items = fetch(&nodes[8], &username, "status", false);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].payload.value, b"hello");

    // A newer sequence replaces the single value.
    nodes[4]
        .put_data(&username, "status", false, b"bye".to_vec(), &keypair, 200, 2, |_| {})
        .unwrap();
    net.pump();
    let items = fetch(&nodes[6], &username, "status", false);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].payload.value, b"bye");
    assert_eq!(items[0].payload.seq, 2);
}

#[test]
fn multi_value_resource_collects_every_writer() {
    let (net, nodes) = network(10);
    let alice = Keypair::generate();
    let bob = Keypair::generate();

    nodes[2]
        .put_data("tags", "#rust", true, b"from alice".to_vec(), &alice, 10, 0, |_| {})
        .unwrap();
    net.pump();
    nodes[5]
        .put_data("tags", "#rust", true, b"from bob".to_vec(), &bob, 20, 0, |_| {})
        .unwrap();
    net.pump();

    let found = Arc::new(Mutex::new(None));
    let sink = found.clone();
    nodes[9].get_data("tags", "#rust", true, move |items| {
        *sink.lock() = Some(items);
    });
    net.pump();

    let items = found.lock().take().expect("get_data completed");
    let values: Vec<&[u8]> = items.iter().map(|s| s.payload.value.as_slice()).collect();
    assert_eq!(values, vec![&b"from alice"[..], &b"from bob"[..]]);
}

#[test]
fn single_value_key_rejects_foreign_signer() {
    let net = Arc::new(SimNetwork::default());
    let node = net.add_node(addr(0), DhtSettings::default());
    let keypair = Keypair::generate();
    let result = node.put_data("alice", "status", false, b"x".to_vec(), &keypair, 1, 1, |_| {});
    assert!(result.is_err());
    assert_eq!(node.status().running_traversals, 0);
}

#[test]
fn error_replies_carry_codes() {
    let net = Arc::new(SimNetwork::default());
    let node = net.add_node(addr(0), DhtSettings::default());
    let query = Message::query(
        vec![0, 1],
        "get_peers",
        dict(vec![("id", NodeId::random().into())]),
    );
    node.incoming(&query, addr(5));

    let queued = net.take_queue();
    assert_eq!(queued.len(), 1);
    match &queued[0].2.body {
        MessageBody::Error { code, .. } => assert_eq!(*code, 203),
        other => panic!("expected error, got {other:?}"),
    }
}
