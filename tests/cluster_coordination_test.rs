// tests/cluster_coordination_test.rs

//! End-to-end tests for the cluster coordination core.
//!
//! These tests drive two or more in-process nodes, each with its own
//! `ClusterState` and cluster-bus listener bound to `127.0.0.1`, and
//! exercise the gossip/election/migration machinery the way an embedding
//! server would: through `ops` and `router`, never by poking engine
//! internals directly.

use bytes::Bytes;
use slotmesh::cluster::router::{KeyPresence, RouteDecision, RouterContext};
use slotmesh::cluster::slot::get_slot;
use slotmesh::cluster::{ClusterConfig, ClusterState, NodeId, engine, ops};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Binds an ephemeral TCP port on loopback and hands it back closed, so
/// the caller can bind the real listener at the same address a moment
/// later without a hardcoded port colliding across test runs.
async fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_config() -> ClusterConfig {
    let mut cfg = ClusterConfig::default();
    cfg.enabled = true;
    cfg.tick_interval_ms = 20;
    cfg.node_timeout = 2_000;
    cfg
}

struct Node {
    state: Arc<ClusterState>,
    client_port: u16,
}

async fn spawn_node() -> Node {
    let client_port = free_port().await;
    let cfg = fast_config();
    let bus_port = client_port + cfg.bus_port_offset;
    let addr = slotmesh::cluster::node::PeerAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_port,
        cfg.bus_port_offset,
    );
    let state = Arc::new(ClusterState::new(NodeId::random(), cfg, Some(addr)));
    let bus_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bus_port);
    let run_state = state.clone();
    tokio::spawn(async move {
        let _ = engine::run(run_state, bus_addr).await;
    });
    // give the listener a moment to bind before anyone dials it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    Node { state, client_port }
}

/// Polls `f` until it returns `true` or `timeout` elapses, returning
/// whether it converged.
async fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct NoKeys;
impl KeyPresence for NoKeys {
    fn contains(&self, _key: &[u8]) -> bool {
        false
    }
}

#[tokio::test]
async fn two_nodes_converge_via_meet() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    ops::meet(&a.state, IpAddr::V4(Ipv4Addr::LOCALHOST), b.client_port).unwrap();

    let converged = wait_until(Duration::from_secs(3), || {
        a.state.all_peers().len() == 2 && b.state.all_peers().len() == 2
    })
    .await;
    assert!(converged, "nodes did not learn about each other via gossip");

    // Neither side should still be handshake-pending once the real
    // node ids have been exchanged.
    assert!(a.state.contains_peer(b.state.my_id));
    assert!(b.state.contains_peer(a.state.my_id));
}

#[tokio::test]
async fn slot_assignment_propagates_to_peer_as_a_moved_redirect() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    ops::meet(&a.state, IpAddr::V4(Ipv4Addr::LOCALHOST), b.client_port).unwrap();

    let converged = wait_until(Duration::from_secs(3), || a.state.all_peers().len() == 2).await;
    assert!(converged);

    ops::add_slots(&a.state, &[0, 1, 2]).unwrap();

    // b should eventually learn, via gossip, that a owns slot 0.
    let learned = wait_until(Duration::from_secs(3), || b.state.slot_owner(0) == Some(a.state.my_id)).await;
    assert!(learned, "peer never learned the new slot assignment via gossip");

    // Find a key that actually hashes into the {0, 1, 2} range we assigned
    // to `a`, rather than assuming any particular literal does.
    let key = (0u32..)
        .map(|n| Bytes::from(format!("probe-{n}")))
        .find(|k| get_slot(k) <= 2)
        .expect("some probe key hashes into the assigned range");
    let slot = get_slot(&key);

    let decision = b.state.with_slot_map(|slot_map| {
        let ctx = RouterContext {
            self_id: b.state.my_id,
            slot_map,
            self_is_replica_of: None,
            read_only_session: false,
            asking_session: false,
        };
        slotmesh::cluster::router::route(&ctx, &[key], true, &NoKeys)
    });
    assert_eq!(decision, RouteDecision::Moved { owner: a.state.my_id, slot });
}

#[tokio::test]
async fn migrating_slot_sends_ask_for_missing_keys_and_serves_present_ones() {
    let state = Arc::new(ClusterState::new(NodeId::random(), ClusterConfig::default(), None));
    let target = NodeId::random();
    let key = Bytes::from_static(b"{tag}member");
    let slot = get_slot(&key);

    ops::add_slots(&state, &[slot]).unwrap();
    ops::set_slot_migrating(&state, slot, target).unwrap();

    struct Present(Vec<Vec<u8>>);
    impl KeyPresence for Present {
        fn contains(&self, key: &[u8]) -> bool {
            self.0.iter().any(|k| k == key)
        }
    }

    let route = |presence: &dyn KeyPresence, keys: &[Bytes]| {
        state.with_slot_map(|slot_map| {
            let ctx = RouterContext {
                self_id: state.my_id,
                slot_map,
                self_is_replica_of: None,
                read_only_session: false,
                asking_session: false,
            };
            slotmesh::cluster::router::route(&ctx, keys, true, presence)
        })
    };

    let missing = Present(vec![]);
    assert_eq!(
        route(&missing, &[key.clone()]),
        RouteDecision::Ask { target, slot }
    );

    let present = Present(vec![key.to_vec()]);
    assert_eq!(route(&present, &[key]), RouteDecision::ServeHere);
}

#[tokio::test]
async fn manual_failover_promotes_the_replica_to_primary() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    ops::meet(&a.state, IpAddr::V4(Ipv4Addr::LOCALHOST), b.client_port).unwrap();
    assert!(wait_until(Duration::from_secs(3), || a.state.all_peers().len() == 2).await);

    ops::add_slots(&a.state, &(0u16..200).collect::<Vec<_>>()).unwrap();
    assert!(wait_until(Duration::from_secs(3), || b.state.slot_owner(0) == Some(a.state.my_id)).await);

    // b becomes a's replica.
    ops::replicate(&b.state, a.state.my_id).unwrap();
    b.state.with_peer_mut(b.state.my_id, |p| p.replicates_of = Some(a.state.my_id));

    ops::failover(&b.state, true).unwrap();

    let promoted = wait_until(Duration::from_secs(3), || b.state.i_own_slot(0)).await;
    assert!(promoted, "forced manual failover never promoted the replica");
}
