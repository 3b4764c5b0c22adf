// src/core/cluster/id.rs

//! The opaque node identity used throughout the cluster bus.

use crate::core::errors::CoreError;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

/// Number of random bytes backing a node identity.
pub const NODE_ID_BYTES: usize = 20;
/// Length of the hex-encoded identity as it travels on the wire.
pub const NODE_ID_HEX_LEN: usize = NODE_ID_BYTES * 2;

/// A stable, opaque identifier for a cluster node.
///
/// Generated once at first boot from 20 random bytes and hex-encoded to a
/// 40-character ASCII string for wire transport, matching how the bus
/// exchanges identities directly rather than re-packing them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_BYTES]);

impl NodeId {
    /// Generates a fresh random identity.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    /// Parses the fixed 40-byte ASCII-hex wire representation.
    pub fn from_wire(raw: &[u8]) -> Result<Self, CoreError> {
        if raw.len() != NODE_ID_HEX_LEN {
            return Err(CoreError::Codec(format!(
                "node id must be {NODE_ID_HEX_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let decoded = hex::decode(raw)
            .map_err(|e| CoreError::Codec(format!("invalid node id hex: {e}")))?;
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Encodes as the fixed 40-byte ASCII-hex wire representation.
    pub fn to_wire(self) -> [u8; NODE_ID_HEX_LEN] {
        let mut out = [0u8; NODE_ID_HEX_LEN];
        hex::encode_to_slice(self.0, &mut out).expect("fixed-size buffer");
        out
    }

    /// True when this is the well-known all-zero placeholder used to mean
    /// "no replicates-of" in a wire header.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; NODE_ID_BYTES]
    }

    pub const NIL: NodeId = NodeId([0u8; NODE_ID_BYTES]);
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != NODE_ID_HEX_LEN {
            return Err(CoreError::Codec(format!(
                "node id must be {NODE_ID_HEX_LEN} hex chars, got {}",
                s.len()
            )));
        }
        let decoded =
            hex::decode(s).map_err(|e| CoreError::Codec(format!("invalid node id hex: {e}")))?;
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NodeId::from_str(&s).map_err(serde::de::Error::custom)
    }
}
