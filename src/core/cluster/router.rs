// src/core/cluster/router.rs

//! Per-request routing decisions (component 4.10). Pure over the slot map
//! plus a caller-supplied key-presence oracle; never touches storage
//! itself, since the datastore is an external collaborator.

use super::id::NodeId;
use super::slot::get_slot;
use super::slotmap::SlotMap;
use bytes::Bytes;

/// The narrow interface the router needs from the (external) datastore to
/// decide ASK/TRYAGAIN during a slot migration.
pub trait KeyPresence {
    fn contains(&self, key: &[u8]) -> bool;
}

/// A decision the router hands back to the command executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    ServeHere,
    Moved { owner: NodeId, slot: u16 },
    Ask { target: NodeId, slot: u16 },
    TryAgain,
    CrossSlotError,
    /// No owner assigned to the slot.
    Unstable,
}

/// Addressing/role context the router needs about `self` for the current
/// request; supplied by the caller from its `ClusterState` snapshot.
pub struct RouterContext<'a> {
    pub self_id: NodeId,
    pub slot_map: &'a SlotMap,
    pub self_is_replica_of: Option<NodeId>,
    pub read_only_session: bool,
    pub asking_session: bool,
}

/// Computes the hash slot for every key in `keys`, requiring they all
/// agree; returns `None` (cross-slot) when they don't, `Some(None)` when
/// there are no keys at all.
pub fn keys_slot(keys: &[Bytes]) -> Result<Option<u16>, ()> {
    let mut slot = None;
    for key in keys {
        let s = get_slot(key);
        match slot {
            None => slot = Some(s),
            Some(existing) if existing != s => return Err(()),
            _ => {}
        }
    }
    Ok(slot)
}

/// Decides how to route a request touching `keys`, given which of them are
/// present locally (via `presence`) and whether the command is read-only.
pub fn route(
    ctx: &RouterContext<'_>,
    keys: &[Bytes],
    command_is_read_only: bool,
    presence: &dyn KeyPresence,
) -> RouteDecision {
    let slot = match keys_slot(keys) {
        Err(()) => return RouteDecision::CrossSlotError,
        Ok(None) => return RouteDecision::ServeHere,
        Ok(Some(s)) => s,
    };

    let owner = match ctx.slot_map.owner(slot) {
        // An unowned slot operates on an empty keyspace; there's no node to
        // redirect to, so serve it here rather than report instability.
        None => return RouteDecision::ServeHere,
        Some(o) => o,
    };

    if owner == ctx.self_id {
        if let Some(target) = ctx.slot_map.migrating_to(slot) {
            let any_missing = keys.iter().any(|k| !presence.contains(k));
            if any_missing {
                return RouteDecision::Ask { target, slot };
            }
        }
        return RouteDecision::ServeHere;
    }

    if ctx.slot_map.importing_from(slot).is_some() && ctx.asking_session {
        let any_missing = keys.iter().any(|k| !presence.contains(k));
        if any_missing {
            return if keys.len() > 1 {
                RouteDecision::TryAgain
            } else {
                RouteDecision::ServeHere
            };
        }
        return RouteDecision::ServeHere;
    }

    if ctx.read_only_session && command_is_read_only && ctx.self_is_replica_of == Some(owner) {
        return RouteDecision::ServeHere;
    }

    RouteDecision::Moved { owner, slot }
}
