// src/core/cluster/codec.rs

//! The cluster bus wire format: a fixed binary header shared by every
//! message type, followed by a type-dependent payload. All multi-byte
//! integers are little-endian except the PUBLISH payload's string-length
//! prefixes, which are big-endian — the one deliberate exception called
//! out in the design notes.

use super::bitmap::{SLOT_BITMAP_BYTES, SlotBitmap};
use super::id::{NODE_ID_HEX_LEN, NodeId};
use crate::core::errors::CoreError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// `R C m b` — the four signature bytes opening every frame.
pub const SIGNATURE: [u8; 4] = *b"RCmb";
pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 4 + 1 + 4 + 1 + 2 + NODE_ID_HEX_LEN + 2 + SLOT_BITMAP_BYTES
    + NODE_ID_HEX_LEN
    + 8
    + 8
    + 8
    + 1
    + 2;

/// Caps a single frame to the header plus one generously-sized UPDATE/gossip
/// payload, so a corrupt `total_length` can never trigger an unbounded
/// allocation.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + 2 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Meet = 0,
    Ping = 1,
    Pong = 2,
    Fail = 3,
    Publish = 4,
    FailoverAuthRequest = 5,
    FailoverAuthAck = 6,
    MfStart = 7,
    Update = 8,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<Self, CoreError> {
        Ok(match v {
            0 => Self::Meet,
            1 => Self::Ping,
            2 => Self::Pong,
            3 => Self::Fail,
            4 => Self::Publish,
            5 => Self::FailoverAuthRequest,
            6 => Self::FailoverAuthAck,
            7 => Self::MfStart,
            8 => Self::Update,
            other => return Err(CoreError::Codec(format!("unknown message type {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClusterHealth {
    Ok = 0,
    Fail = 1,
}

impl ClusterHealth {
    fn from_u8(v: u8) -> Result<Self, CoreError> {
        match v {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Fail),
            other => Err(CoreError::Codec(format!("unknown cluster health {other}"))),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u16 {
        /// Set on FAILOVER_AUTH_REQUEST to request a vote even though the
        /// old primary has not been confirmed FAIL (manual failover).
        const FORCE_ACK = 0b01;
        /// Set on messages a primary sends while clients are paused for a
        /// manual failover handover.
        const PAUSED    = 0b10;
    }
}

/// One entry in a PING/PONG/MEET gossip sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    pub id: NodeId,
    pub ip: [u8; 4],
    pub port: u16,
    pub flags: u16,
    pub last_ping_sent_ms: u32,
    pub last_pong_received_ms: u32,
}

pub const GOSSIP_ENTRY_LEN: usize = NODE_ID_HEX_LEN + 4 + 2 + 2 + 4 + 4;

impl GossipEntry {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.id.to_wire());
        buf.put_slice(&self.ip);
        buf.put_u16_le(self.port);
        buf.put_u16_le(self.flags);
        buf.put_u32_le(self.last_ping_sent_ms);
        buf.put_u32_le(self.last_pong_received_ms);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CoreError> {
        if buf.len() < GOSSIP_ENTRY_LEN {
            return Err(CoreError::Codec("truncated gossip entry".into()));
        }
        let id = NodeId::from_wire(&buf.split_to(NODE_ID_HEX_LEN))?;
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&buf.split_to(4));
        let port = buf.get_u16_le();
        let flags = buf.get_u16_le();
        let last_ping_sent_ms = buf.get_u32_le();
        let last_pong_received_ms = buf.get_u32_le();
        Ok(Self {
            id,
            ip,
            port,
            flags,
            last_ping_sent_ms,
            last_pong_received_ms,
        })
    }
}

/// The header shared by every message, including the sender's full slot
/// bitmap — even a bare PING carries authoritative ownership so a peer
/// that missed a PONG still converges from the next PING it sees.
#[derive(Debug, Clone)]
pub struct Header {
    pub sender_id: NodeId,
    pub sender_port: u16,
    pub sender_slots: SlotBitmap,
    pub replicates_of: Option<NodeId>,
    pub current_epoch: u64,
    pub config_epoch: u64,
    pub replication_offset: u64,
    pub sender_state: ClusterHealth,
    pub flags: MessageFlags,
}

/// A single framed cluster-bus message.
#[derive(Debug, Clone)]
pub struct ClusterMessage {
    pub header: Header,
    pub msg_type: MessageType,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Gossip(Vec<GossipEntry>),
    FailReport { target: NodeId },
    Publish { channel: Bytes, message: Bytes },
    Update { target: NodeId, epoch: u64, bitmap: SlotBitmap },
    None,
}

impl ClusterMessage {
    pub fn new(header: Header, msg_type: MessageType, payload: Payload) -> Self {
        Self {
            header,
            msg_type,
            payload,
        }
    }
}

/// `tokio_util::codec` implementation framing the bus stream.
#[derive(Debug, Default)]
pub struct ClusterMessageCodec {
    /// Length of the frame currently being assembled, once known.
    pending_len: Option<usize>,
}

impl ClusterMessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<ClusterMessage> for ClusterMessageCodec {
    type Error = CoreError;

    fn encode(&mut self, msg: ClusterMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload_buf = BytesMut::new();
        let count: u16 = match &msg.payload {
            Payload::Gossip(entries) => {
                for e in entries {
                    e.encode(&mut payload_buf);
                }
                entries.len() as u16
            }
            Payload::FailReport { target } => {
                payload_buf.put_slice(&target.to_wire());
                0
            }
            Payload::Publish { channel, message } => {
                payload_buf.put_u32(channel.len() as u32);
                payload_buf.put_slice(channel);
                payload_buf.put_u32(message.len() as u32);
                payload_buf.put_slice(message);
                0
            }
            Payload::Update {
                target,
                epoch,
                bitmap,
            } => {
                payload_buf.put_slice(&target.to_wire());
                payload_buf.put_u64_le(*epoch);
                payload_buf.put_slice(&bitmap.to_wire());
                0
            }
            Payload::None => 0,
        };

        let total_len = HEADER_LEN + payload_buf.len();
        dst.reserve(total_len);
        dst.put_slice(&SIGNATURE);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32_le(total_len as u32);
        dst.put_u8(msg.msg_type as u8);
        dst.put_u16_le(count);
        dst.put_slice(&msg.header.sender_id.to_wire());
        dst.put_u16_le(msg.header.sender_port);
        dst.put_slice(&msg.header.sender_slots.to_wire());
        dst.put_slice(
            &msg.header
                .replicates_of
                .unwrap_or(NodeId::NIL)
                .to_wire(),
        );
        dst.put_u64_le(msg.header.current_epoch);
        dst.put_u64_le(msg.header.config_epoch);
        dst.put_u64_le(msg.header.replication_offset);
        dst.put_u8(msg.header.sender_state as u8);
        dst.put_u16_le(msg.header.flags.bits());
        dst.put_slice(&payload_buf);
        Ok(())
    }
}

impl Decoder for ClusterMessageCodec {
    type Item = ClusterMessage;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending_len.is_none() {
            if src.len() < 9 {
                return Ok(None);
            }
            if src[0..4] != SIGNATURE {
                return Err(CoreError::FrameBoundaryCorrupt("bad frame signature".into()));
            }
            let version = src[4];
            if version != PROTOCOL_VERSION {
                return Err(CoreError::FrameBoundaryCorrupt(format!(
                    "unsupported protocol version {version}"
                )));
            }
            let total_len = u32::from_le_bytes([src[5], src[6], src[7], src[8]]) as usize;
            if total_len < HEADER_LEN || total_len > MAX_FRAME_LEN {
                return Err(CoreError::FrameBoundaryCorrupt(format!(
                    "frame length {total_len} out of bounds"
                )));
            }
            self.pending_len = Some(total_len);
        }

        let total_len = self.pending_len.unwrap();
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total_len).freeze();
        self.pending_len = None;

        frame.advance(9); // signature + version + total_length, already validated
        let msg_type = MessageType::from_u8(frame.get_u8())?;
        let count = frame.get_u16_le();
        let sender_id = NodeId::from_wire(&frame.split_to(NODE_ID_HEX_LEN))?;
        let sender_port = frame.get_u16_le();
        let sender_slots = SlotBitmap::from_wire(&frame.split_to(SLOT_BITMAP_BYTES))
            .ok_or_else(|| CoreError::Codec("malformed slot bitmap".into()))?;
        let replicates_of_raw = NodeId::from_wire(&frame.split_to(NODE_ID_HEX_LEN))?;
        let replicates_of = (!replicates_of_raw.is_nil()).then_some(replicates_of_raw);
        let current_epoch = frame.get_u64_le();
        let config_epoch = frame.get_u64_le();
        let replication_offset = frame.get_u64_le();
        let sender_state = ClusterHealth::from_u8(frame.get_u8())?;
        let flags = MessageFlags::from_bits_truncate(frame.get_u16_le());

        let header = Header {
            sender_id,
            sender_port,
            sender_slots,
            replicates_of,
            current_epoch,
            config_epoch,
            replication_offset,
            sender_state,
            flags,
        };

        let payload = match msg_type {
            MessageType::Meet | MessageType::Ping | MessageType::Pong => {
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(GossipEntry::decode(&mut frame)?);
                }
                Payload::Gossip(entries)
            }
            MessageType::Fail => {
                if frame.len() < NODE_ID_HEX_LEN {
                    return Err(CoreError::Codec("truncated FAIL payload".into()));
                }
                let target = NodeId::from_wire(&frame.split_to(NODE_ID_HEX_LEN))?;
                Payload::FailReport { target }
            }
            MessageType::Publish => {
                if frame.len() < 4 {
                    return Err(CoreError::Codec("truncated PUBLISH payload".into()));
                }
                let channel_len = frame.get_u32() as usize;
                if frame.len() < channel_len + 4 {
                    return Err(CoreError::Codec("truncated PUBLISH channel".into()));
                }
                let channel = frame.split_to(channel_len);
                let message_len = frame.get_u32() as usize;
                if frame.len() < message_len {
                    return Err(CoreError::Codec("truncated PUBLISH message".into()));
                }
                let message = frame.split_to(message_len);
                Payload::Publish { channel, message }
            }
            MessageType::FailoverAuthRequest | MessageType::FailoverAuthAck | MessageType::MfStart => {
                Payload::None
            }
            MessageType::Update => {
                if frame.len() < NODE_ID_HEX_LEN + 8 + SLOT_BITMAP_BYTES {
                    return Err(CoreError::Codec("truncated UPDATE payload".into()));
                }
                let target = NodeId::from_wire(&frame.split_to(NODE_ID_HEX_LEN))?;
                let epoch = frame.get_u64_le();
                let bitmap = SlotBitmap::from_wire(&frame.split_to(SLOT_BITMAP_BYTES))
                    .ok_or_else(|| CoreError::Codec("malformed UPDATE bitmap".into()))?;
                Payload::Update {
                    target,
                    epoch,
                    bitmap,
                }
            }
        };

        Ok(Some(ClusterMessage::new(header, msg_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            sender_id: NodeId::random(),
            sender_port: 6380,
            sender_slots: SlotBitmap::new(),
            replicates_of: None,
            current_epoch: 3,
            config_epoch: 2,
            replication_offset: 1234,
            sender_state: ClusterHealth::Ok,
            flags: MessageFlags::empty(),
        }
    }

    #[test]
    fn ping_round_trips() {
        let mut codec = ClusterMessageCodec::new();
        let mut header = sample_header();
        header.sender_slots.set(10, true);
        let entries = vec![GossipEntry {
            id: NodeId::random(),
            ip: [127, 0, 0, 1],
            port: 6381,
            flags: 0,
            last_ping_sent_ms: 100,
            last_pong_received_ms: 50,
        }];
        let msg = ClusterMessage::new(header, MessageType::Ping, Payload::Gossip(entries));

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.header.sender_id, msg.header.sender_id);
        assert_eq!(decoded.header.current_epoch, 3);
        assert!(decoded.header.sender_slots.get(10));
        match decoded.payload {
            Payload::Gossip(entries) => assert_eq!(entries.len(), 1),
            _ => panic!("expected gossip payload"),
        }
    }

    #[test]
    fn publish_uses_big_endian_length_prefixes() {
        let mut codec = ClusterMessageCodec::new();
        let header = sample_header();
        let msg = ClusterMessage::new(
            header,
            MessageType::Publish,
            Payload::Publish {
                channel: Bytes::from_static(b"news"),
                message: Bytes::from_static(b"hello"),
            },
        );
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let payload_start = HEADER_LEN;
        let channel_len_be =
            u32::from_be_bytes(buf[payload_start..payload_start + 4].try_into().unwrap());
        assert_eq!(channel_len_be, 4);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded.payload {
            Payload::Publish { channel, message } => {
                assert_eq!(&channel[..], b"news");
                assert_eq!(&message[..], b"hello");
            }
            _ => panic!("expected publish payload"),
        }
    }

    #[test]
    fn update_round_trips() {
        let mut codec = ClusterMessageCodec::new();
        let header = sample_header();
        let target = NodeId::random();
        let mut bitmap = SlotBitmap::new();
        bitmap.set(42, true);
        let msg = ClusterMessage::new(
            header,
            MessageType::Update,
            Payload::Update {
                target,
                epoch: 7,
                bitmap: bitmap.clone(),
            },
        );
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded.payload {
            Payload::Update {
                target: t,
                epoch,
                bitmap: bm,
            } => {
                assert_eq!(t, target);
                assert_eq!(epoch, 7);
                assert!(bm.get(42));
            }
            _ => panic!("expected update payload"),
        }
    }

    #[test]
    fn decode_rejects_bad_signature() {
        let mut codec = ClusterMessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(b"XXXX");
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32_le(HEADER_LEN as u32);
        // A bad signature is discovered before the frame length is consumed,
        // so it corrupts the buffer boundary rather than just this frame.
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CoreError::FrameBoundaryCorrupt(_))
        ));
    }

    #[test]
    fn decode_rejects_unsupported_version_as_boundary_corrupt() {
        let mut codec = ClusterMessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&SIGNATURE);
        buf.put_u8(PROTOCOL_VERSION + 1);
        buf.put_u32_le(HEADER_LEN as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CoreError::FrameBoundaryCorrupt(_))
        ));
    }

    #[test]
    fn decode_waits_for_full_frame_on_partial_input() {
        let mut codec = ClusterMessageCodec::new();
        let header = sample_header();
        let msg = ClusterMessage::new(header, MessageType::Ping, Payload::Gossip(vec![]));
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
