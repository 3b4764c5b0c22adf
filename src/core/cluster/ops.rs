// src/core/cluster/ops.rs

//! The operator command surface (component 4.11): one typed operation per
//! subcommand, mirroring the teacher's one-file-per-subcommand layout but
//! collapsed into a single module since each operation here is a handful
//! of lines over `ClusterState`.

use super::engine;
use super::id::NodeId;
use super::node::{NodeFlags, PeerAddr, PeerRecord, PeerSummary};
use super::slot;
use super::state::ClusterState;
use crate::core::errors::CoreError;
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const FORGET_BLACKLIST: Duration = Duration::from_secs(60);

/// Snapshot returned by `cluster_info`.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub state_ok: bool,
    pub known_nodes: usize,
    pub size: usize,
    pub current_epoch: u64,
    pub my_epoch: u64,
    pub slots_assigned: u32,
}

/// Introduces a new peer: creates a handshake-pending record so the next
/// gossip tick sends it a MEET.
pub fn meet(state: &Arc<ClusterState>, ip: IpAddr, port: u16) -> Result<(), CoreError> {
    let addr = PeerAddr::new(ip, port, state.config.bus_port_offset);
    if let Some(existing) = state
        .all_peers()
        .into_iter()
        .find(|p| p.addr.map(|a| (a.ip, a.port)) == Some((ip, port)))
    {
        return Err(CoreError::PreconditionViolated(format!(
            "{existing_id} already known at that address",
            existing_id = existing.id
        )));
    }
    state.insert_peer(PeerRecord::new(NodeId::random(), Some(addr), NodeFlags::HANDSHAKE));
    Ok(())
}

pub fn nodes(state: &ClusterState) -> Vec<PeerSummary> {
    state.all_peers()
}

/// Releases every slot this node owns. The caller's datastore must have
/// already verified it holds no keys in those slots; this op only mutates
/// the slot map.
pub fn flush_slots(state: &ClusterState) {
    for slot in state.with_slot_map(|m| m.owned_slots(state.my_id).collect::<Vec<_>>()) {
        let _ = state.release_slot(slot);
    }
}

pub fn add_slots(state: &ClusterState, slots: &[u16]) -> Result<(), CoreError> {
    for &s in slots {
        if let Some(owner) = state.slot_owner(s) {
            if owner != state.my_id {
                return Err(CoreError::SlotAlreadyOwned { slot: s, owner });
            }
        }
    }
    for &s in slots {
        state.assign_slot(s, state.my_id)?;
    }
    Ok(())
}

pub fn del_slots(state: &ClusterState, slots: &[u16]) -> Result<(), CoreError> {
    for &s in slots {
        if state.slot_owner(s).is_none() {
            return Err(CoreError::SlotNotOwned { slot: s });
        }
    }
    for &s in slots {
        state.release_slot(s)?;
    }
    Ok(())
}

pub fn set_slot_migrating(state: &ClusterState, slot: u16, target: NodeId) -> Result<(), CoreError> {
    if state.slot_owner(slot) != Some(state.my_id) {
        return Err(CoreError::SlotNotOwned { slot });
    }
    if !state.contains_peer(target) {
        return Err(CoreError::UnknownPeer(target));
    }
    state.set_migrating(slot, target);
    Ok(())
}

pub fn set_slot_importing(state: &ClusterState, slot: u16, source: NodeId) -> Result<(), CoreError> {
    if !state.contains_peer(source) {
        return Err(CoreError::UnknownPeer(source));
    }
    state.set_importing(slot, source);
    Ok(())
}

pub fn set_slot_stable(state: &ClusterState, slot: u16) {
    state.set_stable(slot);
}

/// Completes a migration's bookkeeping: assigns `slot` to `owner`
/// (overriding whoever held it) and clears migrating/importing state.
pub fn set_slot_node(state: &ClusterState, slot: u16, owner: NodeId) -> Result<(), CoreError> {
    if !state.contains_peer(owner) {
        return Err(CoreError::UnknownPeer(owner));
    }
    state.force_assign_slot(slot, owner);
    state.set_stable(slot);
    Ok(())
}

pub fn cluster_info(state: &ClusterState) -> ClusterInfo {
    let me = state.my_record();
    ClusterInfo {
        state_ok: state.all_peers().iter().all(|p| !p.flags.contains(NodeFlags::FAIL)),
        known_nodes: state.all_peers().len(),
        size: state.size(),
        current_epoch: state.current_epoch(),
        my_epoch: me.config_epoch,
        slots_assigned: me.slots.count(),
    }
}

pub fn persist_config(state: &ClusterState, path: &std::path::Path) -> Result<(), CoreError> {
    let snapshot = super::persistence::ConfigSnapshot {
        my_id: state.my_id,
        peers: state
            .all_peers()
            .into_iter()
            .map(|p| super::persistence::PeerLine {
                id: p.id,
                addr: p.addr.map(|a| (a.ip, a.port)),
                flags: p.flags,
                replicates_of: p.replicates_of,
                config_epoch: p.config_epoch,
                connected: state.has_outbound_link(p.id) || p.flags.contains(NodeFlags::MYSELF),
                slot_ranges: compress_slots(state.with_slot_map(|m| m.owned_slots(p.id).collect())),
            })
            .collect(),
        current_epoch: state.current_epoch(),
        last_vote_epoch: state.last_vote_epoch(),
    };
    super::persistence::save_config(path, &snapshot)
}

fn compress_slots(mut slots: Vec<u16>) -> Vec<(u16, u16)> {
    slots.sort_unstable();
    let mut ranges = Vec::new();
    for s in slots {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == s => *end = s,
            _ => ranges.push((s, s)),
        }
    }
    ranges
}

pub fn key_hash_slot(key: &Bytes) -> u16 {
    slot::get_slot(key)
}

/// Validates the slot argument only; enumerating the actual keys is the
/// caller's `KeyMover`/`KeyPresence` oracle's job since this crate holds
/// no key bytes.
pub fn get_keys_in_slot(_state: &ClusterState, slot: u16) -> Result<(), CoreError> {
    if slot as usize >= slot::NUM_SLOTS {
        return Err(CoreError::PreconditionViolated(format!("slot {slot} out of range")));
    }
    Ok(())
}

pub fn forget(state: &ClusterState, node_id: NodeId) -> Result<(), CoreError> {
    state.forget_peer(node_id, FORGET_BLACKLIST)
}

pub fn replicate(state: &ClusterState, master_id: NodeId) -> Result<(), CoreError> {
    if !state.contains_peer(master_id) {
        return Err(CoreError::UnknownPeer(master_id));
    }
    if state.my_record().owns_any_slot() {
        return Err(CoreError::PreconditionViolated(
            "cannot become a replica while owning slots".into(),
        ));
    }
    state.with_peer_mut(state.my_id, |p| {
        p.replicates_of = Some(master_id);
        p.flags.remove(NodeFlags::PRIMARY);
        p.flags.insert(NodeFlags::REPLICA);
    });
    Ok(())
}

pub fn replicas_of(state: &ClusterState, node_id: NodeId) -> Vec<PeerSummary> {
    state.replicas_of(node_id)
}

pub fn failover(state: &Arc<ClusterState>, force: bool) -> Result<(), CoreError> {
    engine::begin_manual_failover(state, force)
}

/// Only permitted on a node with no slots and no peers beyond itself,
/// matching the precondition in the error-handling design.
pub fn set_config_epoch(state: &ClusterState, epoch: u64) -> Result<(), CoreError> {
    let me = state.my_record();
    if me.owns_any_slot() || !state.other_peers().is_empty() {
        return Err(CoreError::PreconditionViolated(
            "set-config-epoch is only permitted on a fresh node".into(),
        ));
    }
    state.with_peer_mut(state.my_id, |p| p.config_epoch = epoch);
    Ok(())
}

/// Soft-resets the peer directory and slot map; `hard` additionally drops
/// epoch counters back to zero. Identity regeneration (hard reset's other
/// documented effect) is the caller's responsibility since `NodeId` is
/// immutable once `ClusterState` is constructed.
pub fn reset(state: &Arc<ClusterState>, hard: bool) {
    for id in state.other_peers() {
        let _ = state.forget_peer(id, Duration::from_secs(0));
    }
    flush_slots(state);
    if hard {
        state.reset_epoch();
    }
}
