// src/core/cluster/mod.rs

//! Cluster coordination core: keyspace partitioning into 16384 hash slots,
//! eventually-consistent topology gossip, quorum-based failure detection,
//! replacement-primary election, manual failover, slot migration, and
//! client request routing.

pub mod bitmap;
pub mod codec;
pub mod config;
pub mod election;
pub mod engine;
pub mod failure_detector;
pub mod gossip;
pub mod id;
pub mod link;
pub mod manual_failover;
pub mod migration;
pub mod node;
pub mod ops;
pub mod persistence;
pub mod router;
pub mod slot;
pub mod slotmap;
pub mod state;

pub use config::ClusterConfig;
pub use id::NodeId;
pub use node::{NodeFlags, NodeRole, PeerRecord, PeerSummary};
pub use router::RouteDecision;
pub use state::ClusterState;
