// src/core/cluster/gossip.rs

//! The gossip scheduler tick (component 4.4): dials missing links, times
//! out silent peers, and periodically pokes the staleset peer, attaching a
//! bounded random sample of peer status to every outgoing message.

use super::codec::{ClusterHealth, ClusterMessage, GossipEntry, Header, MessageFlags, MessageType, Payload};
use super::id::NodeId;
use super::link::{self, LinkEvent};
use super::node::NodeFlags;
use super::state::ClusterState;
use crate::core::errors::CoreError;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

fn now_ms_since(origin: Instant, now: Instant) -> u32 {
    now.saturating_duration_since(origin).as_millis().min(u32::MAX as u128) as u32
}

/// Builds the header every outgoing message shares, stamped with self's
/// current epoch, config epoch, slot bitmap and role.
pub fn build_header(state: &ClusterState) -> Header {
    let me = state.my_record();
    Header {
        sender_id: me.id,
        sender_port: me.addr.map(|a| a.port).unwrap_or(0),
        sender_slots: me.slots.clone(),
        replicates_of: me.replicates_of,
        current_epoch: state.current_epoch(),
        config_epoch: me.config_epoch,
        replication_offset: me.replication_offset,
        sender_state: ClusterHealth::Ok,
        flags: MessageFlags::empty(),
    }
}

/// Selects up to `fanout` random peers (excluding self and `exclude`) to
/// describe in a gossip sample, skipping handshake-pending, addressless,
/// and slotless-disconnected peers.
pub fn select_gossip_sample(state: &ClusterState, exclude: NodeId, fanout: usize) -> Vec<GossipEntry> {
    let mut candidates: Vec<_> = state
        .all_peers()
        .into_iter()
        .filter(|p| {
            p.id != state.my_id
                && p.id != exclude
                && !p.flags.contains(NodeFlags::HANDSHAKE)
                && !p.flags.contains(NodeFlags::NOADDR)
                && p.addr.is_some()
                && (state.has_outbound_link(p.id) || p.slot_count > 0)
        })
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(fanout);

    let now = Instant::now();
    candidates
        .into_iter()
        .filter_map(|p| {
            let addr = p.addr?;
            let ipv4 = match addr.ip {
                std::net::IpAddr::V4(v4) => v4.octets(),
                std::net::IpAddr::V6(_) => return None,
            };
            Some(GossipEntry {
                id: p.id,
                ip: ipv4,
                port: addr.port,
                flags: p.flags.bits(),
                last_ping_sent_ms: 0,
                last_pong_received_ms: now_ms_since(now, now),
            })
        })
        .collect()
}

fn gossip_message(state: &ClusterState, target: NodeId, msg_type: MessageType) -> ClusterMessage {
    let header = build_header(state);
    let sample = select_gossip_sample(state, target, state.config.gossip_fanout);
    ClusterMessage::new(header, msg_type, Payload::Gossip(sample))
}

/// Dials any known peer lacking an outbound link and not blacklisted,
/// queuing a MEET for fresh handshake-pending peers or a PING otherwise.
pub async fn establish_missing_links(
    state: &Arc<ClusterState>,
    events_tx: &mpsc::UnboundedSender<LinkEvent>,
) {
    let now = Instant::now();
    for id in state.other_peers() {
        if state.has_outbound_link(id) || state.is_blacklisted(id, now) {
            continue;
        }
        let Some(peer) = state.peer(id) else { continue };
        let Some(addr) = peer.addr else { continue };
        let bus_addr = SocketAddr::new(addr.ip, addr.bus_port);
        let msg_type = if peer.is_handshaking() {
            MessageType::Meet
        } else {
            MessageType::Ping
        };
        match link::dial(id, bus_addr, events_tx.clone()).await {
            Ok(outbound) => {
                let msg = gossip_message(state, id, msg_type);
                if outbound.send(msg).is_ok() {
                    state.set_outbound_link(id, outbound);
                    // Preserve a pre-disconnect ping_sent_at so a flapping
                    // link's suspicion timer doesn't reset on reconnect.
                    state.with_peer_mut(id, |p| {
                        if p.ping_sent_at.is_none() {
                            p.ping_sent_at = Some(now);
                        }
                    });
                }
            }
            Err(e) => {
                debug!(%id, error = %e, "dial failed, will retry next tick");
            }
        }
    }
}

/// Step 2: once every `ping_sweep_ticks`, pings the linked peer with the
/// oldest `pong_received_at`.
pub fn sweep_stalest_peer(state: &Arc<ClusterState>) -> Option<(NodeId, ClusterMessage)> {
    let now = Instant::now();
    let mut candidates: Vec<_> = state
        .other_peers()
        .into_iter()
        .filter(|&id| state.has_outbound_link(id))
        .filter_map(|id| state.peer(id).map(|p| (id, p)))
        .filter(|(_, p)| !p.is_handshaking())
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(5);
    let stalest = candidates
        .into_iter()
        .min_by_key(|(_, p)| p.pong_received_at.unwrap_or(Instant::now() - std::time::Duration::from_secs(3600)))?;
    let (id, _) = stalest;
    state.with_peer_mut(id, |p| p.ping_sent_at = Some(now));
    Some((id, gossip_message(state, id, MessageType::Ping)))
}

/// Steps 3-4: drops links with a stale outstanding PING (forcing
/// reconnect) and pings linked peers that are due but not yet pinged.
pub fn check_ping_timers(state: &Arc<ClusterState>) -> (Vec<NodeId>, Vec<(NodeId, ClusterMessage)>) {
    let now = Instant::now();
    let half_timeout = state.config.node_timeout() / 2;
    let mut to_drop = Vec::new();
    let mut to_ping = Vec::new();

    for id in state.other_peers() {
        if !state.has_outbound_link(id) {
            continue;
        }
        let Some(p) = state.peer(id) else { continue };
        if p.is_handshaking() {
            continue;
        }
        match (p.ping_sent_at, p.pong_received_at) {
            (Some(sent), pong) => {
                let pong_after_sent = pong.is_some_and(|pg| pg >= sent);
                if !pong_after_sent && now.duration_since(sent) > half_timeout {
                    to_drop.push(id);
                }
            }
            (None, pong) => {
                let stale = pong.is_none_or(|pg| now.duration_since(pg) > half_timeout);
                if stale {
                    state.with_peer_mut(id, |p| p.ping_sent_at = Some(now));
                    to_ping.push((id, gossip_message(state, id, MessageType::Ping)));
                }
            }
        }
    }
    (to_drop, to_ping)
}

/// Runs one full scheduler tick (steps 1-4 of component 4.4; suspicion and
/// election advancement are driven separately by the engine since they
/// need access to the full failure-detector/election modules).
pub async fn run_tick(
    state: &Arc<ClusterState>,
    events_tx: &mpsc::UnboundedSender<LinkEvent>,
    tick_count: u64,
) {
    establish_missing_links(state, events_tx).await;

    if tick_count % state.config.ping_sweep_ticks as u64 == 0 {
        if let Some((id, msg)) = sweep_stalest_peer(state) {
            let _ = state.send_to(id, msg);
        }
    }

    let (to_drop, to_ping) = check_ping_timers(state);
    for id in to_drop {
        state.drop_outbound_link(id);
        info!(%id, "dropped stale outbound link pending reconnect");
    }
    for (id, msg) in to_ping {
        let _ = state.send_to(id, msg);
    }
}

/// Builds and sends an unsolicited PONG broadcast to every peer, used
/// after promotion to announce new slot ownership immediately rather than
/// waiting for the next scheduled ping.
pub fn broadcast_pong(state: &Arc<ClusterState>) -> Vec<(NodeId, ClusterMessage)> {
    state
        .other_peers()
        .into_iter()
        .filter(|&id| state.has_outbound_link(id))
        .map(|id| (id, gossip_message(state, id, MessageType::Pong)))
        .collect()
}

pub fn build_fail_broadcast(state: &ClusterState, target: NodeId) -> ClusterMessage {
    let header = build_header(state);
    ClusterMessage::new(header, MessageType::Fail, Payload::FailReport { target })
}

/// `forced` carries a manual failover's force-ack flag onto the wire so the
/// voting primary can grant a vote even though its current primary hasn't
/// actually failed (component 4.7, step 2).
pub fn build_auth_request(state: &ClusterState, forced: bool) -> ClusterMessage {
    let mut header = build_header(state);
    if forced {
        header.flags.insert(MessageFlags::FORCE_ACK);
    }
    ClusterMessage::new(header, MessageType::FailoverAuthRequest, Payload::None)
}

pub fn build_auth_ack(state: &ClusterState) -> ClusterMessage {
    let header = build_header(state);
    ClusterMessage::new(header, MessageType::FailoverAuthAck, Payload::None)
}

pub fn build_mfstart(state: &ClusterState) -> ClusterMessage {
    let header = build_header(state);
    ClusterMessage::new(header, MessageType::MfStart, Payload::None)
}

pub fn build_update(state: &ClusterState, target: NodeId, epoch: u64) -> ClusterMessage {
    let header = build_header(state);
    let bitmap = state
        .peer(target)
        .map(|p| p.slots)
        .unwrap_or_default();
    ClusterMessage::new(
        header,
        MessageType::Update,
        Payload::Update {
            target,
            epoch,
            bitmap,
        },
    )
}
