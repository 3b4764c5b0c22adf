// src/core/cluster/failure_detector.rs

//! Local suspicion (PFAIL) and quorum-confirmed failure (FAIL), component
//! 4.5. Pure decision logic over counts and timestamps; `state.rs` wires
//! this to the peer directory and broadcasts the resulting verdicts.

use std::time::{Duration, Instant};

/// True once `now - ping_sent_at` exceeds `node_timeout` with no
/// intervening PONG.
pub fn should_suspect(ping_sent_at: Option<Instant>, pong_received_at: Option<Instant>, node_timeout: Duration, now: Instant) -> bool {
    match ping_sent_at {
        Some(sent) => {
            let pong_is_newer = pong_received_at.is_some_and(|p| p >= sent);
            !pong_is_newer && now.duration_since(sent) > node_timeout
        }
        None => false,
    }
}

/// Quorum confirmation: self must already suspect the peer, and the
/// number of distinct, non-expired primary reporters (self included, if
/// self is a primary) must reach `floor(size/2) + 1`.
pub fn should_confirm_fail(
    self_suspects: bool,
    distinct_non_expired_reporters: usize,
    self_is_primary: bool,
    cluster_size: usize,
) -> bool {
    if !self_suspects {
        return false;
    }
    let quorum = cluster_size / 2 + 1;
    let effective_reporters = distinct_non_expired_reporters + usize::from(self_is_primary);
    effective_reporters >= quorum
}

/// Whether an incoming PONG should clear an existing FAIL verdict.
pub fn should_undo_fail(
    peer_is_replica: bool,
    peer_owns_any_slot: bool,
    fail_time: Instant,
    undo_validity: Duration,
    now: Instant,
) -> bool {
    if peer_is_replica || !peer_owns_any_slot {
        return true;
    }
    now.duration_since(fail_time) > undo_validity
}
