// src/core/cluster/state.rs

//! The singleton cluster state: the peer directory, slot map, and epoch
//! counters described in the data model (section 3). Concurrent-safe
//! containers back every field so the router can take consistent read
//! snapshots from outside the engine task while the engine remains the
//! sole writer (see the concurrency model's tokio resolution).

use super::config::ClusterConfig;
use super::election::ElectionState;
use super::failure_detector;
use super::id::NodeId;
use super::link::OutboundLink;
use super::manual_failover::ManualFailoverState;
use super::node::{NodeFlags, NodeRole, PeerAddr, PeerRecord, PeerSummary};
use super::slotmap::SlotMap;
use crate::core::errors::CoreError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// The cluster-wide coordination state owned by the engine task.
pub struct ClusterState {
    pub my_id: NodeId,
    pub config: ClusterConfig,
    peers: DashMap<NodeId, PeerRecord>,
    blacklist: DashMap<NodeId, Instant>,
    slot_map: RwLock<SlotMap>,
    current_epoch: AtomicU64,
    last_vote_epoch: AtomicU64,
    last_vote_for_primary_at: RwLock<HashMap<NodeId, Instant>>,
    pub election: RwLock<Option<ElectionState>>,
    pub manual_failover: RwLock<Option<ManualFailoverState>>,
    outbound_links: DashMap<NodeId, OutboundLink>,
}

impl ClusterState {
    pub fn new(my_id: NodeId, config: ClusterConfig, my_addr: Option<PeerAddr>) -> Self {
        let peers = DashMap::new();
        peers.insert(
            my_id,
            PeerRecord::new(my_id, my_addr, NodeFlags::MYSELF | NodeFlags::PRIMARY),
        );
        Self {
            my_id,
            config,
            peers,
            blacklist: DashMap::new(),
            slot_map: RwLock::new(SlotMap::new()),
            current_epoch: AtomicU64::new(0),
            last_vote_epoch: AtomicU64::new(0),
            last_vote_for_primary_at: RwLock::new(HashMap::new()),
            election: RwLock::new(None),
            manual_failover: RwLock::new(None),
            outbound_links: DashMap::new(),
        }
    }

    // --- Peer directory -------------------------------------------------

    pub fn peer(&self, id: NodeId) -> Option<PeerRecord> {
        self.peers.get(&id).map(|r| r.clone())
    }

    pub fn my_record(&self) -> PeerRecord {
        self.peers
            .get(&self.my_id)
            .expect("self record always present")
            .clone()
    }

    pub fn my_role(&self) -> NodeRole {
        self.my_record().role()
    }

    pub fn contains_peer(&self, id: NodeId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn insert_peer(&self, record: PeerRecord) {
        self.peers.insert(record.id, record);
    }

    pub fn remove_peer(&self, id: NodeId) -> Option<PeerRecord> {
        self.outbound_links.remove(&id);
        self.peers.remove(&id).map(|(_, v)| v)
    }

    pub fn forget_peer(&self, id: NodeId, blacklist_for: Duration) -> Result<(), CoreError> {
        if self.remove_peer(id).is_none() {
            return Err(CoreError::UnknownPeer(id));
        }
        self.blacklist.insert(id, Instant::now() + blacklist_for);
        self.slot_map.write().release_all_owned_by(id);
        Ok(())
    }

    pub fn is_blacklisted(&self, id: NodeId, now: Instant) -> bool {
        match self.blacklist.get(&id) {
            Some(until) => *until > now,
            None => false,
        }
    }

    pub fn with_peer_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        self.peers.get_mut(&id).map(|mut r| f(&mut r))
    }

    pub fn all_peers(&self) -> Vec<PeerSummary> {
        self.peers.iter().map(|r| PeerSummary::from(r.value())).collect()
    }

    pub fn other_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|r| *r.key() != self.my_id)
            .map(|r| *r.key())
            .collect()
    }

    pub fn replicas_of(&self, primary: NodeId) -> Vec<PeerSummary> {
        self.peers
            .iter()
            .filter(|r| r.replicates_of == Some(primary))
            .map(|r| PeerSummary::from(r.value()))
            .collect()
    }

    /// Count of primaries currently owning at least one slot — the basis
    /// for every quorum computation.
    pub fn size(&self) -> usize {
        self.peers
            .iter()
            .filter(|r| r.is_primary() && r.owns_any_slot())
            .count()
    }

    pub fn quorum(&self) -> usize {
        self.size() / 2 + 1
    }

    // --- Slot map ---------------------------------------------------------

    pub fn slot_owner(&self, slot: u16) -> Option<NodeId> {
        self.slot_map.read().owner(slot)
    }

    pub fn i_own_slot(&self, slot: u16) -> bool {
        self.slot_owner(slot) == Some(self.my_id)
    }

    pub fn assign_slot(&self, slot: u16, owner: NodeId) -> Result<(), CoreError> {
        self.slot_map.write().assign(slot, owner)?;
        self.with_peer_mut(owner, |p| p.slots.set(slot, true));
        Ok(())
    }

    pub fn force_assign_slot(&self, slot: u16, owner: NodeId) {
        let mut sm = self.slot_map.write();
        if let Some(previous) = sm.owner(slot) {
            self.with_peer_mut(previous, |p| p.slots.set(slot, false));
        }
        sm.force_assign(slot, owner);
        drop(sm);
        self.with_peer_mut(owner, |p| p.slots.set(slot, true));
    }

    pub fn release_slot(&self, slot: u16) -> Result<(), CoreError> {
        if let Some(owner) = self.slot_map.read().owner(slot) {
            self.with_peer_mut(owner, |p| p.slots.set(slot, false));
        }
        self.slot_map.write().release(slot)
    }

    pub fn take_over_slots_from(&self, old_primary: NodeId, new_owner: NodeId) -> Vec<u16> {
        let mut sm = self.slot_map.write();
        let slots: Vec<u16> = sm.owned_slots(old_primary).collect();
        for &slot in &slots {
            sm.force_assign(slot, new_owner);
        }
        drop(sm);
        self.with_peer_mut(old_primary, |p| {
            for &slot in &slots {
                p.slots.set(slot, false);
            }
        });
        self.with_peer_mut(new_owner, |p| {
            for &slot in &slots {
                p.slots.set(slot, true);
            }
        });
        slots
    }

    pub fn set_migrating(&self, slot: u16, target: NodeId) {
        self.slot_map.write().set_migrating(slot, target);
    }

    pub fn set_importing(&self, slot: u16, source: NodeId) {
        self.slot_map.write().set_importing(slot, source);
    }

    pub fn set_stable(&self, slot: u16) {
        self.slot_map.write().set_stable(slot);
    }

    pub fn migrating_to(&self, slot: u16) -> Option<NodeId> {
        self.slot_map.read().migrating_to(slot)
    }

    pub fn importing_from(&self, slot: u16) -> Option<NodeId> {
        self.slot_map.read().importing_from(slot)
    }

    pub fn with_slot_map<R>(&self, f: impl FnOnce(&SlotMap) -> R) -> R {
        f(&self.slot_map.read())
    }

    // --- Epochs -------------------------------------------------------

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    pub fn bump_current_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Enforces the epoch-ordering invariant: after observing an inbound
    /// epoch `e`, self's epoch must be at least `e`.
    pub fn observe_epoch(&self, e: u64) {
        self.current_epoch.fetch_max(e, Ordering::SeqCst);
    }

    /// Clears epoch counters back to zero, for a hard reset. Never used in
    /// normal operation — epochs otherwise only move forward.
    pub fn reset_epoch(&self) {
        self.current_epoch.store(0, Ordering::SeqCst);
        self.last_vote_epoch.store(0, Ordering::SeqCst);
    }

    pub fn last_vote_epoch(&self) -> u64 {
        self.last_vote_epoch.load(Ordering::SeqCst)
    }

    pub fn cast_vote(&self, epoch: u64, for_primary: NodeId, now: Instant) {
        self.last_vote_epoch.store(epoch, Ordering::SeqCst);
        self.last_vote_for_primary_at
            .write()
            .insert(for_primary, now);
    }

    pub fn last_vote_for_primary_at(&self, primary: NodeId) -> Option<Instant> {
        self.last_vote_for_primary_at.read().get(&primary).copied()
    }

    /// Epoch-collision resolution: if self ties another primary's
    /// `config_epoch` and loses the identity tiebreak, bump and adopt a
    /// fresh epoch as its own.
    pub fn resolve_epoch_collision(&self, other_primary: NodeId, other_config_epoch: u64) {
        let mine = self.my_record().config_epoch;
        if other_config_epoch == mine && self.my_id > other_primary {
            let new_epoch = self.bump_current_epoch();
            self.with_peer_mut(self.my_id, |p| p.config_epoch = new_epoch);
        }
    }

    // --- Failure detection ---------------------------------------------

    pub fn note_pong(&self, id: NodeId, now: Instant) {
        self.with_peer_mut(id, |p| {
            p.pong_received_at = Some(now);
            if p.flags.contains(NodeFlags::PFAIL) {
                p.flags.remove(NodeFlags::PFAIL);
            }
        });
    }

    pub fn mark_pfail(&self, id: NodeId) {
        self.with_peer_mut(id, |p| p.flags.insert(NodeFlags::PFAIL));
    }

    pub fn record_failure_report(&self, target: NodeId, reporter: NodeId, now: Instant) {
        self.with_peer_mut(target, |p| p.record_failure_report(reporter, now));
    }

    pub fn expire_failure_reports(&self, target: NodeId, validity: Duration, now: Instant) {
        self.with_peer_mut(target, |p| p.expire_failure_reports(validity, now));
    }

    /// Evaluates quorum confirmation for every PFAIL peer; returns the ids
    /// that should transition to FAIL on this tick.
    pub fn candidates_for_fail(&self, now: Instant) -> Vec<NodeId> {
        let self_is_primary = self.my_record().is_primary();
        let cluster_size = self.size();
        self.peers
            .iter()
            .filter_map(|r| {
                let p = r.value();
                if p.is_fail() || !p.is_pfail() {
                    return None;
                }
                let reporters = p
                    .failure_reports
                    .iter()
                    .filter(|rep| now.duration_since(rep.reported_at) < self.config.pfail_validity())
                    .count();
                failure_detector::should_confirm_fail(true, reporters, self_is_primary, cluster_size)
                    .then_some(p.id)
            })
            .collect()
    }

    pub fn mark_fail(&self, id: NodeId, now: Instant) {
        self.with_peer_mut(id, |p| {
            p.flags.insert(NodeFlags::FAIL);
            p.fail_time = Some(now);
        });
    }

    pub fn undo_fail_if_eligible(&self, id: NodeId, now: Instant) -> bool {
        let Some(p) = self.peer(id) else { return false };
        if !p.is_fail() {
            return false;
        }
        let Some(fail_time) = p.fail_time else {
            return false;
        };
        let eligible = failure_detector::should_undo_fail(
            !p.is_primary(),
            p.owns_any_slot(),
            fail_time,
            self.config.fail_undo_validity(),
            now,
        );
        if eligible {
            self.with_peer_mut(id, |p| {
                p.flags.remove(NodeFlags::FAIL);
                p.fail_time = None;
            });
        }
        eligible
    }

    // --- Links -----------------------------------------------------------

    pub fn set_outbound_link(&self, id: NodeId, link: OutboundLink) {
        self.outbound_links.insert(id, link);
    }

    pub fn has_outbound_link(&self, id: NodeId) -> bool {
        self.outbound_links.contains_key(&id)
    }

    pub fn drop_outbound_link(&self, id: NodeId) {
        self.outbound_links.remove(&id);
    }

    pub fn send_to(&self, id: NodeId, msg: super::codec::ClusterMessage) -> Result<(), CoreError> {
        match self.outbound_links.get(&id) {
            Some(link) => link.send(msg),
            None => Err(CoreError::UnknownPeer(id)),
        }
    }

    pub fn resolve_addr(&self, id: NodeId) -> Option<IpAddr> {
        self.peer(id).and_then(|p| p.addr).map(|a| a.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ClusterState {
        ClusterState::new(NodeId::random(), ClusterConfig::default(), None)
    }

    #[test]
    fn myself_is_present_and_primary_by_default() {
        let s = state();
        assert_eq!(s.my_role(), NodeRole::Primary);
        assert!(s.contains_peer(s.my_id));
    }

    #[test]
    fn assign_slot_updates_both_slot_map_and_peer_bitmap() {
        let s = state();
        s.assign_slot(10, s.my_id).unwrap();
        assert!(s.i_own_slot(10));
        assert!(s.my_record().slots.get(10));
    }

    #[test]
    fn take_over_slots_moves_ownership_and_bitmaps_atomically() {
        let s = state();
        let other = NodeId::random();
        s.insert_peer(PeerRecord::new(other, None, NodeFlags::empty()));
        s.assign_slot(1, other).unwrap();
        s.assign_slot(2, other).unwrap();

        let moved = s.take_over_slots_from(other, s.my_id);
        assert_eq!(moved.len(), 2);
        assert!(s.i_own_slot(1));
        assert!(s.i_own_slot(2));
        assert!(!s.peer(other).unwrap().slots.get(1));
    }

    #[test]
    fn epoch_observation_never_decreases() {
        let s = state();
        s.observe_epoch(5);
        s.observe_epoch(2);
        assert_eq!(s.current_epoch(), 5);
    }

    #[test]
    fn quorum_is_majority_of_slot_owning_primaries() {
        let s = state();
        s.assign_slot(1, s.my_id).unwrap();
        let p2 = NodeId::random();
        s.insert_peer(PeerRecord::new(p2, None, NodeFlags::empty()));
        s.assign_slot(2, p2).unwrap();
        let p3 = NodeId::random();
        s.insert_peer(PeerRecord::new(p3, None, NodeFlags::REPLICA));
        assert_eq!(s.size(), 2);
        assert_eq!(s.quorum(), 2);
    }

    #[test]
    fn forget_peer_blacklists_and_releases_slots() {
        let s = state();
        let other = NodeId::random();
        s.insert_peer(PeerRecord::new(other, None, NodeFlags::empty()));
        s.assign_slot(1, other).unwrap();
        s.forget_peer(other, Duration::from_secs(60)).unwrap();
        assert!(!s.contains_peer(other));
        assert!(s.is_blacklisted(other, Instant::now()));
        assert_eq!(s.slot_owner(1), None);
    }
}
