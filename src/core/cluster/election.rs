// src/core/cluster/election.rs

//! Rank-delayed replacement-primary election (component 4.6).
//!
//! A replica whose primary has gone FAIL schedules its own vote request
//! with a delay proportional to its rank among co-replicas (the
//! freshest-offset replica goes first), then solicits votes from every
//! primary still owning slots. Promotion happens once a majority grants.

use super::id::NodeId;
use rand::Rng;
use std::time::{Duration, Instant};

const ELECTION_BASE_DELAY: Duration = Duration::from_millis(500);
const ELECTION_JITTER_MAX: Duration = Duration::from_millis(500);
const RANK_DELAY_STEP: Duration = Duration::from_secs(1);

/// Tracks one in-progress (or not-yet-started) election attempt by this
/// node, when it is a replica.
#[derive(Debug, Clone)]
pub struct ElectionState {
    /// The primary being replaced.
    pub failed_primary: NodeId,
    /// When this node should broadcast FAILOVER_AUTH_REQUEST.
    pub auth_time: Instant,
    /// Epoch this attempt is running under, once the request has been sent.
    pub auth_epoch: u64,
    /// Distinct-primary vote count collected so far.
    pub auth_count: usize,
    /// Whether FAILOVER_AUTH_REQUEST has been broadcast yet.
    pub auth_sent: bool,
    /// Whether this attempt was started under a forced manual failover.
    pub forced: bool,
    pub started_at: Instant,
}

impl ElectionState {
    /// Schedules round 1: compute `auth_time` from the replica's rank (the
    /// count of co-replicas with a strictly greater replication offset).
    pub fn schedule(failed_primary: NodeId, rank: usize, forced: bool, now: Instant) -> Self {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=ELECTION_JITTER_MAX.as_millis() as u64));
        let auth_time = now + ELECTION_BASE_DELAY + jitter + RANK_DELAY_STEP * rank as u32;
        Self {
            failed_primary,
            auth_time,
            auth_epoch: 0,
            auth_count: 0,
            auth_sent: false,
            forced,
            started_at: now,
        }
    }

    /// Round 2: a higher rank observed mid-wait pushes `auth_time` out.
    pub fn extend_for_rank(&mut self, rank: usize, now: Instant) {
        let candidate = now + ELECTION_BASE_DELAY + RANK_DELAY_STEP * rank as u32;
        if candidate > self.auth_time {
            self.auth_time = candidate;
        }
    }

    pub fn ready_to_request(&self, now: Instant) -> bool {
        !self.auth_sent && now >= self.auth_time
    }

    /// Round 3: mark the request as sent under the given (already
    /// incremented) cluster epoch.
    pub fn mark_requested(&mut self, epoch: u64) {
        self.auth_epoch = epoch;
        self.auth_count = 0;
        self.auth_sent = true;
    }

    /// Round 4: record a vote from a distinct primary.
    pub fn record_vote(&mut self) {
        self.auth_count += 1;
    }

    pub fn has_majority(&self, quorum: usize) -> bool {
        self.auth_sent && self.auth_count >= quorum
    }

    pub fn timed_out(&self, now: Instant, auth_timeout: Duration) -> bool {
        self.auth_sent && now.duration_since(self.auth_time) > auth_timeout
    }
}

/// Computes this replica's rank among siblings replicating the same
/// primary: the number of co-replicas with a strictly greater replication
/// offset. Rank 0 means "freshest", and runs first.
pub fn compute_rank(my_offset: u64, sibling_offsets: impl IntoIterator<Item = u64>) -> usize {
    sibling_offsets
        .into_iter()
        .filter(|&offset| offset > my_offset)
        .count()
}

/// Primary-side vote policy (component 4.6 "Vote policy").
pub struct VoteRequest {
    pub requester_epoch: u64,
    pub requester_is_replica_of_failed: bool,
    pub forced: bool,
    pub requester_claimed_slots_have_no_newer_owner: bool,
}

pub struct VoterState {
    pub self_is_primary_with_slots: bool,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
    pub last_vote_for_primary_at: Option<Instant>,
}

/// Decides whether to grant a vote, per the primary-side policy in 4.6.
/// Does not mutate state; caller applies the resulting vote bookkeeping.
pub fn should_grant_vote(req: &VoteRequest, voter: &VoterState, node_timeout: Duration, now: Instant) -> bool {
    if !voter.self_is_primary_with_slots {
        return false;
    }
    if req.requester_epoch < voter.current_epoch {
        return false;
    }
    if voter.last_vote_epoch >= req.requester_epoch {
        // Already voted in this epoch or a newer one.
        return false;
    }
    if !req.requester_is_replica_of_failed && !req.forced {
        return false;
    }
    if let Some(last) = voter.last_vote_for_primary_at {
        if now.duration_since(last) < node_timeout * 2 {
            return false;
        }
    }
    req.requester_claimed_slots_have_no_newer_owner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_zero_for_freshest_replica() {
        assert_eq!(compute_rank(100, [90, 80]), 0);
    }

    #[test]
    fn rank_counts_only_strictly_greater_offsets() {
        assert_eq!(compute_rank(100, [100, 101, 50]), 1);
    }

    #[test]
    fn higher_rank_schedules_later_auth_time() {
        let now = Instant::now();
        let fresh = ElectionState::schedule(NodeId::random(), 0, false, now);
        let stale = ElectionState::schedule(NodeId::random(), 2, false, now);
        assert!(stale.auth_time > fresh.auth_time);
    }

    #[test]
    fn majority_requires_sent_request() {
        let mut e = ElectionState::schedule(NodeId::random(), 0, false, Instant::now());
        e.auth_count = 10;
        assert!(!e.has_majority(2), "unsent request must not count as majority");
        e.mark_requested(5);
        e.auth_count = 2;
        assert!(e.has_majority(2));
    }

    #[test]
    fn vote_refused_when_epoch_stale() {
        let req = VoteRequest {
            requester_epoch: 1,
            requester_is_replica_of_failed: true,
            forced: false,
            requester_claimed_slots_have_no_newer_owner: true,
        };
        let voter = VoterState {
            self_is_primary_with_slots: true,
            current_epoch: 5,
            last_vote_epoch: 0,
            last_vote_for_primary_at: None,
        };
        assert!(!should_grant_vote(&req, &voter, Duration::from_secs(1), Instant::now()));
    }

    #[test]
    fn vote_granted_when_conditions_met() {
        let req = VoteRequest {
            requester_epoch: 5,
            requester_is_replica_of_failed: true,
            forced: false,
            requester_claimed_slots_have_no_newer_owner: true,
        };
        let voter = VoterState {
            self_is_primary_with_slots: true,
            current_epoch: 5,
            last_vote_epoch: 4,
            last_vote_for_primary_at: None,
        };
        assert!(should_grant_vote(&req, &voter, Duration::from_secs(1), Instant::now()));
    }

    #[test]
    fn forced_ack_overrides_non_replica_requirement() {
        let req = VoteRequest {
            requester_epoch: 5,
            requester_is_replica_of_failed: false,
            forced: true,
            requester_claimed_slots_have_no_newer_owner: true,
        };
        let voter = VoterState {
            self_is_primary_with_slots: true,
            current_epoch: 5,
            last_vote_epoch: 4,
            last_vote_for_primary_at: None,
        };
        assert!(should_grant_vote(&req, &voter, Duration::from_secs(1), Instant::now()));
    }
}
