// src/core/cluster/node.rs

//! Peer records: the per-node view the cluster keeps of every other node
//! (and of itself).

use super::bitmap::SlotBitmap;
use super::id::NodeId;
use bitflags::bitflags;
use std::net::IpAddr;
use std::time::Instant;

bitflags! {
    /// Per-peer status flags, mirrored directly from the bus header's flag field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        const MYSELF    = 0b0000_0000_0001;
        const PRIMARY   = 0b0000_0000_0010;
        const REPLICA   = 0b0000_0000_0100;
        const PFAIL     = 0b0000_0000_1000;
        const FAIL      = 0b0000_0001_0000;
        const HANDSHAKE = 0b0000_0010_0000;
        const NOADDR    = 0b0000_0100_0000;
        const MIGRATING = 0b0000_1000_0000;
        const IMPORTING = 0b0001_0000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Replica,
}

/// The network address of a peer: client port plus derived bus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub bus_port: u16,
}

impl PeerAddr {
    pub fn new(ip: IpAddr, port: u16, bus_port_offset: u16) -> Self {
        Self {
            ip,
            port,
            bus_port: port.saturating_add(bus_port_offset),
        }
    }
}

/// A failed-liveness observation reported by one peer about another.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub reporter: NodeId,
    pub reported_at: Instant,
}

/// Everything the cluster knows about one peer, including itself.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub addr: Option<PeerAddr>,
    pub flags: NodeFlags,
    pub replicates_of: Option<NodeId>,
    pub slots: SlotBitmap,
    pub config_epoch: u64,
    pub replication_offset: u64,
    pub replication_offset_time: Option<Instant>,
    pub ping_sent_at: Option<Instant>,
    pub pong_received_at: Option<Instant>,
    pub fail_time: Option<Instant>,
    pub created_at: Instant,
    pub failure_reports: Vec<FailureReport>,
    pub vote_accepted_at: Option<Instant>,
}

impl PeerRecord {
    pub fn new(id: NodeId, addr: Option<PeerAddr>, flags: NodeFlags) -> Self {
        Self {
            id,
            addr,
            flags,
            replicates_of: None,
            slots: SlotBitmap::new(),
            config_epoch: 0,
            replication_offset: 0,
            replication_offset_time: None,
            ping_sent_at: None,
            pong_received_at: None,
            fail_time: None,
            created_at: Instant::now(),
            failure_reports: Vec::new(),
            vote_accepted_at: None,
        }
    }

    pub fn role(&self) -> NodeRole {
        if self.flags.contains(NodeFlags::REPLICA) {
            NodeRole::Replica
        } else {
            NodeRole::Primary
        }
    }

    pub fn is_primary(&self) -> bool {
        !self.flags.contains(NodeFlags::REPLICA)
    }

    pub fn is_pfail(&self) -> bool {
        self.flags.contains(NodeFlags::PFAIL)
    }

    pub fn is_fail(&self) -> bool {
        self.flags.contains(NodeFlags::FAIL)
    }

    pub fn is_handshaking(&self) -> bool {
        self.flags.contains(NodeFlags::HANDSHAKE)
    }

    pub fn owns_any_slot(&self) -> bool {
        self.slots.count() > 0
    }

    /// Drops failure reports about this peer older than `validity`.
    pub fn expire_failure_reports(&mut self, validity: std::time::Duration, now: Instant) {
        self.failure_reports
            .retain(|r| now.duration_since(r.reported_at) < validity);
    }

    pub fn record_failure_report(&mut self, reporter: NodeId, now: Instant) {
        if let Some(existing) = self
            .failure_reports
            .iter_mut()
            .find(|r| r.reporter == reporter)
        {
            existing.reported_at = now;
        } else {
            self.failure_reports.push(FailureReport {
                reporter,
                reported_at: now,
            });
        }
    }

    pub fn distinct_reporters(&self) -> usize {
        self.failure_reports.len()
    }
}

/// A compact, copyable summary used in gossip samples and operator listings.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub id: NodeId,
    pub addr: Option<PeerAddr>,
    pub flags: NodeFlags,
    pub replicates_of: Option<NodeId>,
    pub config_epoch: u64,
    pub slot_count: u32,
}

impl From<&PeerRecord> for PeerSummary {
    fn from(p: &PeerRecord) -> Self {
        Self {
            id: p.id,
            addr: p.addr,
            flags: p.flags,
            replicates_of: p.replicates_of,
            config_epoch: p.config_epoch,
            slot_count: p.slots.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reports_dedupe_by_reporter() {
        let mut p = PeerRecord::new(NodeId::random(), None, NodeFlags::empty());
        let reporter = NodeId::random();
        let now = Instant::now();
        p.record_failure_report(reporter, now);
        p.record_failure_report(reporter, now);
        assert_eq!(p.distinct_reporters(), 1);
    }

    #[test]
    fn expire_failure_reports_drops_stale_entries() {
        let mut p = PeerRecord::new(NodeId::random(), None, NodeFlags::empty());
        p.record_failure_report(NodeId::random(), Instant::now() - std::time::Duration::from_secs(60));
        p.expire_failure_reports(std::time::Duration::from_secs(30), Instant::now());
        assert_eq!(p.distinct_reporters(), 0);
    }
}
