// src/core/cluster/engine.rs

//! The single task that owns write access to `ClusterState`r(component 5's
//! tokio resolution): it is the sole consumer of link events and the sole
//! driver of the scheduler tick, so every inbound frame and every tick is
//! processed strictly in arrival order.

use super::codec::{ClusterMessage, MessageType, Payload};
use super::election::{self, ElectionState, VoteRequest, VoterState};
use super::gossip;
use super::id::NodeId;
use super::link::{self, LinkEvent};
use super::manual_failover::ManualFailoverState;
use super::node::{NodeFlags, PeerAddr, PeerRecord};
use super::state::ClusterState;
use crate::core::errors::CoreError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs the engine for the process lifetime: binds the bus listener,
/// drives the scheduler tick, and dispatches every decoded frame. Returns
/// only on an unrecoverable bind error.
pub async fn run(state: Arc<ClusterState>, bus_addr: SocketAddr) -> Result<(), CoreError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LinkEvent>();

    let accept_events = events_tx.clone();
    let listener = tokio::net::TcpListener::bind(bus_addr).await?;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "accepted inbound cluster bus connection");
                    link::spawn_inbound(stream, accept_events.clone());
                }
                Err(e) => {
                    warn!(error = %e, "cluster bus accept failed");
                    break;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(state.config.tick_interval());
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                gossip::run_tick(&state, &events_tx, tick_count).await;
                advance_failure_detector(&state);
                advance_election(&state, &events_tx);
                advance_manual_failover(&state);
                tick_count += 1;
            }
            maybe_event = events_rx.recv() => {
                match maybe_event {
                    Some(LinkEvent::Frame(msg)) => handle_frame(&state, &events_tx, msg),
                    Some(LinkEvent::OutboundClosed(id)) => {
                        state.drop_outbound_link(id);
                        debug!(%id, "outbound link closed");
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn handle_frame(state: &Arc<ClusterState>, events_tx: &mpsc::UnboundedSender<LinkEvent>, msg: ClusterMessage) {
    let now = Instant::now();
    state.observe_epoch(msg.header.current_epoch);
    state.resolve_epoch_collision(msg.header.sender_id, msg.header.config_epoch);

    let sender = msg.header.sender_id;
    if sender == state.my_id {
        return;
    }
    if state.is_blacklisted(sender, now) {
        return;
    }

    if !state.contains_peer(sender) {
        // A node introduced via `ops::meet` is provisioned under a placeholder
        // identity before its real one is known; reconcile by matching the
        // handshake-pending placeholder listening on the same port.
        let placeholder = state
            .all_peers()
            .into_iter()
            .find(|p| p.flags.contains(NodeFlags::HANDSHAKE) && p.addr.map(|a| a.port) == Some(msg.header.sender_port))
            .map(|p| (p.id, p.addr));
        let addr = match placeholder {
            Some((placeholder_id, addr)) => {
                state.remove_peer(placeholder_id);
                addr
            }
            None => None,
        };
        state.insert_peer(PeerRecord::new(sender, addr, NodeFlags::empty()));
    }
    state.with_peer_mut(sender, |p| {
        p.flags.remove(NodeFlags::HANDSHAKE);
        p.config_epoch = p.config_epoch.max(msg.header.config_epoch);
        p.replication_offset = msg.header.replication_offset;
        p.slots = msg.header.sender_slots.clone();
        p.replicates_of = msg.header.replicates_of;
        if msg.header.replicates_of.is_some() {
            p.flags.insert(NodeFlags::REPLICA);
        } else {
            p.flags.remove(NodeFlags::REPLICA);
        }
    });

    match msg.msg_type {
        MessageType::Meet | MessageType::Ping | MessageType::Pong => {
            if msg.msg_type == MessageType::Pong {
                state.note_pong(sender, now);
            }
            if let Payload::Gossip(entries) = msg.payload {
                for entry in entries {
                    merge_gossip_entry(state, entry);
                }
            }
            if msg.msg_type != MessageType::Pong {
                let reply = gossip::build_header(state);
                let sample = gossip::select_gossip_sample(state, sender, state.config.gossip_fanout);
                let pong = ClusterMessage::new(reply, MessageType::Pong, Payload::Gossip(sample));
                let _ = state.send_to(sender, pong);
            }
        }
        MessageType::Fail => {
            if let Payload::FailReport { target } = msg.payload {
                if target != state.my_id {
                    state.mark_fail(target, now);
                    info!(%target, reporter = %sender, "accepted FAIL verdict from peer");
                }
            }
        }
        MessageType::Publish => {
            debug!(%sender, "received PUBLISH relay (no local subscribers in this crate)");
        }
        MessageType::FailoverAuthRequest => {
            handle_auth_request(state, sender, &msg, now);
        }
        MessageType::FailoverAuthAck => {
            handle_auth_ack(state, sender, &msg, events_tx);
        }
        MessageType::MfStart => {
            info!(%sender, "replica requested manual failover handover");
        }
        MessageType::Update => {
            if let Payload::Update { target, epoch, bitmap } = msg.payload {
                apply_update(state, target, epoch, bitmap);
            }
        }
    }
}

fn merge_gossip_entry(state: &Arc<ClusterState>, entry: super::codec::GossipEntry) {
    if entry.id == state.my_id {
        return;
    }
    if state.is_blacklisted(entry.id, Instant::now()) {
        return;
    }
    if !state.contains_peer(entry.id) {
        let addr = PeerAddr::new(
            IpAddr::V4(std::net::Ipv4Addr::from(entry.ip)),
            entry.port,
            state.config.bus_port_offset,
        );
        state.insert_peer(PeerRecord::new(entry.id, Some(addr), NodeFlags::HANDSHAKE));
    }
}

fn apply_update(state: &Arc<ClusterState>, target: NodeId, epoch: u64, bitmap: super::bitmap::SlotBitmap) {
    let current = state.peer(target).map(|p| p.config_epoch).unwrap_or(0);
    if epoch <= current {
        return;
    }
    state.with_peer_mut(target, |p| {
        p.config_epoch = epoch;
        p.slots = bitmap.clone();
    });
    for slot in bitmap.iter_slots() {
        state.force_assign_slot(slot, target);
    }
}

fn handle_auth_request(state: &Arc<ClusterState>, requester: NodeId, msg: &ClusterMessage, now: Instant) {
    let me = state.my_record();
    let Some(failed_primary_peer) = requester_primary(state, requester) else {
        return;
    };
    let req = VoteRequest {
        requester_epoch: msg.header.current_epoch,
        requester_is_replica_of_failed: failed_primary_peer.is_fail(),
        forced: msg.header.flags.contains(super::codec::MessageFlags::FORCE_ACK),
        requester_claimed_slots_have_no_newer_owner: msg.header.sender_slots.iter_slots().all(|slot| {
            state
                .slot_owner(slot)
                .and_then(|owner| state.peer(owner))
                .is_none_or(|owner| owner.config_epoch <= msg.header.config_epoch)
        }),
    };
    let voter = VoterState {
        self_is_primary_with_slots: me.is_primary() && me.owns_any_slot(),
        current_epoch: state.current_epoch(),
        last_vote_epoch: state.last_vote_epoch(),
        last_vote_for_primary_at: state.last_vote_for_primary_at(failed_primary_peer.id),
    };
    if election::should_grant_vote(&req, &voter, state.config.node_timeout(), now) {
        state.cast_vote(msg.header.current_epoch, failed_primary_peer.id, now);
        let ack = gossip::build_auth_ack(state);
        let _ = state.send_to(requester, ack);
    }
}

fn requester_primary(state: &Arc<ClusterState>, requester: NodeId) -> Option<PeerRecord> {
    let requester_record = state.peer(requester)?;
    match requester_record.replicates_of {
        Some(primary) => state.peer(primary),
        None => Some(requester_record),
    }
}

fn handle_auth_ack(state: &Arc<ClusterState>, voter: NodeId, msg: &ClusterMessage, events_tx: &mpsc::UnboundedSender<LinkEvent>) {
    let Some(voter_peer) = state.peer(voter) else { return };
    if !voter_peer.is_primary() || !voter_peer.owns_any_slot() {
        return;
    }
    let mut guard = state.election.write();
    let Some(election_state) = guard.as_mut() else { return };
    if msg.header.current_epoch < election_state.auth_epoch {
        return;
    }
    election_state.record_vote();
    let quorum = state.quorum();
    if election_state.has_majority(quorum) {
        let failed_primary = election_state.failed_primary;
        let auth_epoch = election_state.auth_epoch;
        *guard = None;
        drop(guard);
        promote_self(state, failed_primary, auth_epoch, events_tx);
    }
}

fn promote_self(state: &Arc<ClusterState>, failed_primary: NodeId, auth_epoch: u64, _events_tx: &mpsc::UnboundedSender<LinkEvent>) {
    state.with_peer_mut(state.my_id, |p| {
        p.replicates_of = None;
        p.flags.remove(NodeFlags::REPLICA);
        p.flags.insert(NodeFlags::PRIMARY);
        p.config_epoch = auth_epoch;
    });
    let moved = state.take_over_slots_from(failed_primary, state.my_id);
    *state.manual_failover.write() = None;
    info!(%failed_primary, slots = moved.len(), epoch = auth_epoch, "promoted to primary");

    for (id, msg) in gossip::broadcast_pong(state) {
        let _ = state.send_to(id, msg);
    }
}

/// Advances the failure detector: suspects silent peers, then confirms
/// FAIL by quorum, broadcasting the verdict only when self is a primary.
fn advance_failure_detector(state: &Arc<ClusterState>) {
    let now = Instant::now();
    let node_timeout = state.config.node_timeout();

    for id in state.other_peers() {
        let Some(p) = state.peer(id) else { continue };
        if p.is_fail() {
            continue;
        }
        if super::failure_detector::should_suspect(p.ping_sent_at, p.pong_received_at, node_timeout, now) {
            if !p.is_pfail() {
                state.mark_pfail(id);
                info!(%id, "marked peer PFAIL");
            }
        }
        state.expire_failure_reports(id, state.config.pfail_validity(), now);
    }

    let candidates = state.candidates_for_fail(now);
    let self_is_primary = state.my_record().is_primary();
    for id in candidates {
        state.mark_fail(id, now);
        warn!(%id, "confirmed peer FAIL by quorum");
        if self_is_primary {
            let fail_msg = gossip::build_fail_broadcast(state, id);
            for peer_id in state.other_peers() {
                if peer_id != id {
                    let _ = state.send_to(peer_id, fail_msg.clone());
                }
            }
        }
    }

    for id in state.other_peers() {
        if state.peer(id).is_some_and(|p| p.is_fail()) {
            state.undo_fail_if_eligible(id, now);
        }
    }
}

/// Advances the election state machine for this node (a replica only)
/// through rounds 1-3; round 4 (vote collection) is handled in
/// `handle_auth_ack` as acks arrive.
fn advance_election(state: &Arc<ClusterState>, _events_tx: &mpsc::UnboundedSender<LinkEvent>) {
    let now = Instant::now();
    let me = state.my_record();
    let Some(primary_id) = me.replicates_of else { return };
    let Some(primary) = state.peer(primary_id) else { return };

    let mut guard = state.election.write();

    if guard.is_none() {
        let mf_active = state
            .manual_failover
            .read()
            .as_ref()
            .is_some_and(|mf| mf.can_start);
        if !primary.is_fail() && !mf_active {
            return;
        }
        let sibling_offsets: Vec<u64> = state
            .replicas_of(primary_id)
            .into_iter()
            .filter(|s| s.id != state.my_id)
            .filter_map(|s| state.peer(s.id).map(|p| p.replication_offset))
            .collect();
        let rank = election::compute_rank(me.replication_offset, sibling_offsets);
        *guard = Some(ElectionState::schedule(primary_id, rank, mf_active, now));
        drop(guard);
        // Broadcast our own offset to co-replicas so their rank
        // computations see the freshest data too.
        for (id, msg) in gossip::broadcast_pong(state) {
            let _ = state.send_to(id, msg);
        }
        return;
    }

    let election_state = guard.as_mut().unwrap();
    if election_state.timed_out(now, state.config.auth_timeout()) {
        *guard = None;
        return;
    }
    if election_state.ready_to_request(now) {
        let new_epoch = state.bump_current_epoch();
        let forced = election_state.forced;
        election_state.mark_requested(new_epoch);
        let request = gossip::build_auth_request(state, forced);
        for id in state.other_peers() {
            let _ = state.send_to(id, request.clone());
        }
    }
}

fn advance_manual_failover(state: &Arc<ClusterState>) {
    let now = Instant::now();
    let mut guard = state.manual_failover.write();
    if let Some(mf) = guard.as_ref() {
        if mf.expired(now) {
            *guard = None;
        }
    }
}

/// Operator entry point for component 4.7 step 1: a replica begins a
/// manual failover against its current primary.
pub fn begin_manual_failover(state: &Arc<ClusterState>, force: bool) -> Result<(), CoreError> {
    let me = state.my_record();
    let Some(primary_id) = me.replicates_of else {
        return Err(CoreError::PreconditionViolated(
            "manual failover requires this node to be a replica".into(),
        ));
    };
    *state.manual_failover.write() = Some(ManualFailoverState::begin(force, state.config.mf_timeout(), now()));
    let mfstart = gossip::build_mfstart(state);
    state.send_to(primary_id, mfstart)
}

fn now() -> Instant {
    Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::config::ClusterConfig;

    #[test]
    fn merge_gossip_entry_creates_handshake_peer() {
        let state = Arc::new(ClusterState::new(NodeId::random(), ClusterConfig::default(), None));
        let entry = super::super::codec::GossipEntry {
            id: NodeId::random(),
            ip: [10, 0, 0, 1],
            port: 7000,
            flags: 0,
            last_ping_sent_ms: 0,
            last_pong_received_ms: 0,
        };
        let id = entry.id;
        merge_gossip_entry(&state, entry);
        assert!(state.contains_peer(id));
        assert!(state.peer(id).unwrap().is_handshaking());
    }

    #[test]
    fn apply_update_with_newer_epoch_moves_ownership() {
        let state = Arc::new(ClusterState::new(NodeId::random(), ClusterConfig::default(), None));
        let old_owner = NodeId::random();
        let new_owner = NodeId::random();
        state.insert_peer(PeerRecord::new(old_owner, None, NodeFlags::empty()));
        state.insert_peer(PeerRecord::new(new_owner, None, NodeFlags::empty()));
        state.assign_slot(5, old_owner).unwrap();

        let mut bm = super::super::bitmap::SlotBitmap::new();
        bm.set(5, true);
        apply_update(&state, new_owner, 10, bm);

        assert_eq!(state.slot_owner(5), Some(new_owner));
    }

    #[test]
    fn apply_update_with_stale_epoch_is_ignored() {
        let state = Arc::new(ClusterState::new(NodeId::random(), ClusterConfig::default(), None));
        let owner = NodeId::random();
        state.insert_peer(PeerRecord::new(owner, None, NodeFlags::empty()));
        state.with_peer_mut(owner, |p| p.config_epoch = 5);
        state.assign_slot(5, owner).unwrap();

        let mut bm = super::super::bitmap::SlotBitmap::new();
        bm.set(5, true);
        let intruder = NodeId::random();
        apply_update(&state, intruder, 1, bm);

        assert_eq!(state.slot_owner(5), Some(owner));
    }
}
