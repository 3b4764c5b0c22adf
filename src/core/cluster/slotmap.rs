// src/core/cluster/slotmap.rs

//! The slot ownership table (component 4.1): `slot -> owner`, plus the
//! sticky migrating/importing redirection flags used during resharding.

use super::id::NodeId;
use super::slot::NUM_SLOTS;
use crate::core::errors::CoreError;
use std::collections::HashMap;

/// Owns the `slot -> owner` table and the per-slot migration pointers.
///
/// Kept as one struct (rather than independent maps) so that ownership and
/// the derived per-peer bitmap can never be updated out of step with one
/// another — every mutator here is the single place that touches `owners`.
#[derive(Debug, Default)]
pub struct SlotMap {
    owners: Vec<Option<NodeId>>,
    migrating_to: HashMap<u16, NodeId>,
    importing_from: HashMap<u16, NodeId>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            owners: vec![None; NUM_SLOTS],
            migrating_to: HashMap::new(),
            importing_from: HashMap::new(),
        }
    }

    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.owners[slot as usize]
    }

    /// Assigns `slot` to `owner`. Fails if the slot is already owned by a
    /// different node; assigning to the current owner is a no-op success.
    pub fn assign(&mut self, slot: u16, owner: NodeId) -> Result<(), CoreError> {
        match self.owners[slot as usize] {
            Some(existing) if existing != owner => Err(CoreError::SlotAlreadyOwned {
                slot,
                owner: existing,
            }),
            _ => {
                self.owners[slot as usize] = Some(owner);
                Ok(())
            }
        }
    }

    /// Forcibly overwrites ownership, used when an UPDATE message carries a
    /// strictly newer epoch and must win regardless of current owner.
    pub fn force_assign(&mut self, slot: u16, owner: NodeId) {
        self.owners[slot as usize] = Some(owner);
    }

    pub fn release(&mut self, slot: u16) -> Result<(), CoreError> {
        if self.owners[slot as usize].is_none() {
            return Err(CoreError::SlotNotOwned { slot });
        }
        self.owners[slot as usize] = None;
        Ok(())
    }

    pub fn release_all_owned_by(&mut self, node: NodeId) {
        for o in self.owners.iter_mut() {
            if *o == Some(node) {
                *o = None;
            }
        }
    }

    pub fn owned_slots(&self, node: NodeId) -> impl Iterator<Item = u16> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter_map(move |(i, o)| (*o == Some(node)).then_some(i as u16))
    }

    pub fn set_migrating(&mut self, slot: u16, target: NodeId) {
        self.migrating_to.insert(slot, target);
    }

    pub fn clear_migrating(&mut self, slot: u16) {
        self.migrating_to.remove(&slot);
    }

    pub fn migrating_to(&self, slot: u16) -> Option<NodeId> {
        self.migrating_to.get(&slot).copied()
    }

    pub fn set_importing(&mut self, slot: u16, source: NodeId) {
        self.importing_from.insert(slot, source);
    }

    pub fn clear_importing(&mut self, slot: u16) {
        self.importing_from.remove(&slot);
    }

    pub fn importing_from(&self, slot: u16) -> Option<NodeId> {
        self.importing_from.get(&slot).copied()
    }

    pub fn set_stable(&mut self, slot: u16) {
        self.clear_migrating(slot);
        self.clear_importing(slot);
    }

    pub fn count_owned_by(&self, node: NodeId) -> usize {
        self.owners.iter().filter(|o| **o == Some(node)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_then_release_round_trips() {
        let mut sm = SlotMap::new();
        let a = NodeId::random();
        sm.assign(100, a).unwrap();
        assert_eq!(sm.owner(100), Some(a));
        sm.release(100).unwrap();
        assert_eq!(sm.owner(100), None);
    }

    #[test]
    fn assign_rejects_conflicting_owner() {
        let mut sm = SlotMap::new();
        let a = NodeId::random();
        let b = NodeId::random();
        sm.assign(5, a).unwrap();
        assert!(sm.assign(5, b).is_err());
    }

    #[test]
    fn release_rejects_unowned_slot() {
        let mut sm = SlotMap::new();
        assert!(sm.release(5).is_err());
    }

    #[test]
    fn release_all_owned_by_clears_only_that_node() {
        let mut sm = SlotMap::new();
        let a = NodeId::random();
        let b = NodeId::random();
        sm.assign(1, a).unwrap();
        sm.assign(2, b).unwrap();
        sm.release_all_owned_by(a);
        assert_eq!(sm.owner(1), None);
        assert_eq!(sm.owner(2), Some(b));
    }

    #[test]
    fn migrating_and_importing_flags_are_independent_and_clearable() {
        let mut sm = SlotMap::new();
        let target = NodeId::random();
        sm.set_migrating(10, target);
        assert_eq!(sm.migrating_to(10), Some(target));
        sm.set_stable(10);
        assert_eq!(sm.migrating_to(10), None);
    }
}
