// src/core/errors.rs

//! The primary error type for the cluster coordination core.

use crate::core::cluster::id::NodeId;
use std::sync::Arc;
use thiserror::Error;

/// All failure modes the cluster core can surface. Fallible functions
/// return `Result<_, CoreError>`, propagated with `?`; only an embedding
/// `main` translates the documented-fatal variants into process exits.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("malformed bus frame: {0}")]
    Codec(String),

    /// A decode failure discovered before the frame length was consumed
    /// from the read buffer, so the next frame's alignment cannot be
    /// trusted. The link must be torn down rather than just dropping the
    /// frame. Contrast with `Codec`, raised once the frame has already
    /// been split off the buffer by its declared length.
    #[error("bus frame boundary corrupted: {0}")]
    FrameBoundaryCorrupt(String),

    #[error("slot {slot} already owned by {owner}")]
    SlotAlreadyOwned { slot: u16, owner: NodeId },

    #[error("slot {slot} is not currently owned")]
    SlotNotOwned { slot: u16 },

    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("peer {0} is blacklisted")]
    Blacklisted(NodeId),

    #[error("cluster config file corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("failed to acquire exclusive lock on config file: {0}")]
    LockUnavailable(String),

    #[error("bus port {0} is out of range")]
    BusPortOutOfRange(u16),

    #[error("operator precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    #[error("TRYAGAIN")]
    TryAgain,

    #[error("CROSSSLOT keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(Arc::new(e))
    }
}
