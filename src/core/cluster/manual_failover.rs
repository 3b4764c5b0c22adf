// src/core/cluster/manual_failover.rs

//! Operator-triggered, replica-initiated manual failover (component 4.7).
//!
//! Unlike automatic failover, the old primary is healthy and cooperates:
//! it pauses clients and keeps replicating until the chosen replica has
//! caught up, then the normal election machinery runs with a forced-ack
//! flag so primaries vote even though nothing has failed.

use std::time::{Duration, Instant};

/// State held by a replica running (or about to run) a manual failover.
#[derive(Debug, Clone)]
pub struct ManualFailoverState {
    pub deadline: Instant,
    /// Replication offset the old primary reported at the moment it paused
    /// clients; the replica must apply up to this offset before voting.
    pub master_offset_at_pause: Option<u64>,
    /// Set once the replica's applied offset has caught up.
    pub can_start: bool,
    pub force: bool,
}

impl ManualFailoverState {
    pub fn begin(force: bool, timeout: Duration, now: Instant) -> Self {
        Self {
            deadline: now + timeout,
            master_offset_at_pause: None,
            can_start: force,
            force,
        }
    }

    pub fn record_pause_offset(&mut self, offset: u64) {
        self.master_offset_at_pause = Some(offset);
    }

    /// Call whenever the replica's applied offset advances.
    pub fn note_applied_offset(&mut self, applied_offset: u64) {
        if let Some(target) = self.master_offset_at_pause {
            if applied_offset >= target {
                self.can_start = true;
            }
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Primary-side pause state: entered on MFSTART, cleared on timeout or on
/// observing the replica's promotion.
#[derive(Debug, Clone, Copy)]
pub struct ClientPause {
    pub paused_at: Instant,
    pub offset_at_pause: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_manual_failover_can_start_immediately() {
        let mf = ManualFailoverState::begin(true, Duration::from_secs(10), Instant::now());
        assert!(mf.can_start);
    }

    #[test]
    fn unforced_waits_for_offset_catch_up() {
        let mut mf = ManualFailoverState::begin(false, Duration::from_secs(10), Instant::now());
        mf.record_pause_offset(1000);
        assert!(!mf.can_start);
        mf.note_applied_offset(999);
        assert!(!mf.can_start);
        mf.note_applied_offset(1000);
        assert!(mf.can_start);
    }

    #[test]
    fn expires_after_deadline() {
        let mf = ManualFailoverState::begin(false, Duration::from_millis(0), Instant::now());
        assert!(mf.expired(Instant::now() + Duration::from_millis(1)));
    }
}
