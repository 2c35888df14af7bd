//! # Wire Message Layer
//!
//! Fixed-layout binary framing for every message exchanged between cluster
//! nodes. Packing is byte-identical across processes: all fields are
//! little-endian, written at explicit offsets with no padding.
//!
//! Every datagram starts with a [`MessageHeader`] followed by a
//! type-specific payload. Payloads are fixed-size structs except for
//! [`AdvanceFrame`], which is followed by the variable tagged-section list
//! (see [`crate::frame_data`]).

use crate::{ClusterError, NodeId, NodeMask, NodeRole, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Protocol version stamped into every header and checked on decode.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifies the kind of message a datagram carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Repeater announcing itself to the emitter during discovery.
    HelloEmitter = 1,
    /// Emitter accepting a repeater into the cluster.
    WelcomeRepeater = 2,
    /// Emitter starting a frame: `AdvanceFrame` plus the frame state blob.
    StartFrame = 3,
    /// Repeater acknowledging it has applied state and rendered a frame.
    FrameDone = 4,
}

impl MessageKind {
    /// Every kind, in wire-tag order. Used to size per-kind counters.
    pub const ALL: [MessageKind; 4] = [
        MessageKind::HelloEmitter,
        MessageKind::WelcomeRepeater,
        MessageKind::StartFrame,
        MessageKind::FrameDone,
    ];
}

impl TryFrom<u8> for MessageKind {
    type Error = ClusterError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(MessageKind::HelloEmitter),
            2 => Ok(MessageKind::WelcomeRepeater),
            3 => Ok(MessageKind::StartFrame),
            4 => Ok(MessageKind::FrameDone),
            _ => Err(ClusterError::UnknownMessageKind { tag }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::HelloEmitter => "HelloEmitter",
            MessageKind::WelcomeRepeater => "WelcomeRepeater",
            MessageKind::StartFrame => "StartFrame",
            MessageKind::FrameDone => "FrameDone",
        };
        write!(f, "{name}")
    }
}

/// Bit flags carried by every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// No flags set.
    pub const NONE: MessageFlags = MessageFlags(0);
    /// Send to the whole multicast group instead of unicast fan-out.
    pub const BROADCAST: MessageFlags = MessageFlags(1);
    /// Fire-and-forget: retried by the sender's own timer, not the transport.
    pub const DOES_NOT_REQUIRE_ACK: MessageFlags = MessageFlags(1 << 1);
    /// Message originates from an editor process (diagnostic only).
    pub const SENT_FROM_EDITOR: MessageFlags = MessageFlags(1 << 2);

    /// Tests whether every flag in `other` is set.
    pub fn contains(&self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw flag byte.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Builds flags from a raw byte (unknown bits are preserved).
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: MessageFlags) {
        self.0 |= rhs.0;
    }
}

/// Fixed-layout header prefixed to every datagram.
///
/// `origin_id` always identifies the physical sender; destination bit *n*
/// set means node *n* should process the message. The transport stamps
/// `origin_id`, `sequence`, `payload_size` and `offset_to_payload` on send.
///
/// Wire layout (24 bytes, little-endian):
///
/// ```text
/// 0      1        2       3      4            12         20            22
/// [kind] [version][origin][flags][dest mask   ][sequence ][payload size][offset]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub version: u8,
    pub origin_id: NodeId,
    pub flags: MessageFlags,
    pub destination_mask: NodeMask,
    pub sequence: u64,
    pub payload_size: u16,
    pub offset_to_payload: u16,
}

impl MessageHeader {
    /// Encoded size of the header in bytes.
    pub const SIZE: usize = 24;

    /// Creates a header for the given kind and destinations. Transport-owned
    /// fields (origin, sequence, sizes) are filled in by `publish_message`.
    pub fn new(kind: MessageKind, destination_mask: NodeMask, flags: MessageFlags) -> Self {
        Self {
            kind,
            version: PROTOCOL_VERSION,
            origin_id: NodeId::EMITTER,
            flags,
            destination_mask,
            sequence: 0,
            payload_size: 0,
            offset_to_payload: Self::SIZE as u16,
        }
    }

    /// Encodes the header at the current position of `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.version);
        buf.put_u8(self.origin_id.value());
        buf.put_u8(self.flags.bits());
        buf.put_u64_le(self.destination_mask.bits());
        buf.put_u64_le(self.sequence);
        buf.put_u16_le(self.payload_size);
        buf.put_u16_le(self.offset_to_payload);
    }

    /// Decodes a header from the front of `buf`.
    ///
    /// A short buffer and a corrupt kind tag are distinct errors so that
    /// callers can treat truncation as "not a message" without masking
    /// genuinely bad data.
    pub fn read_from(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(ClusterError::TruncatedMessage {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }

        let kind = MessageKind::try_from(buf.get_u8())?;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ClusterError::UnsupportedVersion { version });
        }
        let origin = buf.get_u8();
        let origin_id = NodeId::new(origin)
            .ok_or_else(|| ClusterError::network(format!("invalid origin node id {origin}")))?;
        let flags = MessageFlags::from_bits(buf.get_u8());
        let destination_mask = NodeMask::from_bits(buf.get_u64_le());
        let sequence = buf.get_u64_le();
        let payload_size = buf.get_u16_le();
        let offset_to_payload = buf.get_u16_le();

        Ok(Self {
            kind,
            version,
            origin_id,
            flags,
            destination_mask,
            sequence,
            payload_size,
            offset_to_payload,
        })
    }
}

/// Registration payload announcing a node's role during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePublication {
    pub role: NodeRole,
}

impl RolePublication {
    /// Encoded payload size in bytes.
    pub const SIZE: usize = 1;

    /// Encodes the payload at the current position of `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.role.to_wire());
    }

    /// Decodes the payload, or `None` when the buffer is too short or the
    /// role tag is unknown.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        let raw = *buf.first()?;
        NodeRole::from_wire(raw).map(|role| Self { role })
    }
}

/// Frame-start payload: the frame this state blob belongs to.
///
/// On the wire the `StartFrame` message carries this struct immediately
/// followed by the tagged-section state list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceFrame {
    pub frame_number: u64,
}

impl AdvanceFrame {
    /// Encoded payload size in bytes (excluding the trailing section list).
    pub const SIZE: usize = 8;

    /// Encodes the payload at the current position of `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.frame_number);
    }

    /// Decodes the payload, or `None` when the buffer is too short.
    pub fn read_from(mut buf: &[u8]) -> Option<Self> {
        (buf.len() >= Self::SIZE).then(|| Self {
            frame_number: buf.get_u64_le(),
        })
    }
}

/// Frame acknowledgement payload sent by repeaters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDone {
    pub frame_number: u64,
}

impl FrameDone {
    /// Encoded payload size in bytes.
    pub const SIZE: usize = 8;

    /// Encodes the payload at the current position of `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.frame_number);
    }

    /// Decodes the payload, or `None` when the buffer is too short.
    pub fn read_from(mut buf: &[u8]) -> Option<Self> {
        (buf.len() >= Self::SIZE).then(|| Self {
            frame_number: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MessageHeader {
        let mut header = MessageHeader::new(
            MessageKind::StartFrame,
            NodeMask::from_bits(0b1110),
            MessageFlags::BROADCAST | MessageFlags::DOES_NOT_REQUIRE_ACK,
        );
        header.origin_id = NodeId::new(0).unwrap();
        header.sequence = 42;
        header.payload_size = 128;
        header
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SIZE);

        let decoded = MessageHeader::read_from(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_short_buffer_is_truncated_not_panic() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        let err = MessageHeader::read_from(&buf[..MessageHeader::SIZE - 1]).unwrap_err();
        assert!(matches!(err, ClusterError::TruncatedMessage { .. }));
    }

    #[test]
    fn header_rejects_unknown_kind_tag() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        buf[0] = 0xee;

        let err = MessageHeader::read_from(&buf).unwrap_err();
        assert!(matches!(
            err,
            ClusterError::UnknownMessageKind { tag: 0xee }
        ));
    }

    #[test]
    fn header_rejects_wrong_version() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        buf[1] = PROTOCOL_VERSION + 1;

        let err = MessageHeader::read_from(&buf).unwrap_err();
        assert!(matches!(err, ClusterError::UnsupportedVersion { .. }));
    }

    #[test]
    fn payload_round_trips() {
        let mut buf = BytesMut::new();
        AdvanceFrame { frame_number: 7 }.write_to(&mut buf);
        assert_eq!(AdvanceFrame::read_from(&buf).unwrap().frame_number, 7);

        let mut buf = BytesMut::new();
        FrameDone { frame_number: 9 }.write_to(&mut buf);
        assert_eq!(FrameDone::read_from(&buf).unwrap().frame_number, 9);

        let mut buf = BytesMut::new();
        RolePublication {
            role: NodeRole::Repeater,
        }
        .write_to(&mut buf);
        assert_eq!(
            RolePublication::read_from(&buf).unwrap().role,
            NodeRole::Repeater
        );
    }

    #[test]
    fn payload_short_buffers_yield_none() {
        assert!(AdvanceFrame::read_from(&[0u8; 7]).is_none());
        assert!(FrameDone::read_from(&[]).is_none());
        assert!(RolePublication::read_from(&[]).is_none());
        assert!(RolePublication::read_from(&[9]).is_none());
    }

    #[test]
    fn flags_contains() {
        let flags = MessageFlags::BROADCAST | MessageFlags::SENT_FROM_EDITOR;
        assert!(flags.contains(MessageFlags::BROADCAST));
        assert!(!flags.contains(MessageFlags::DOES_NOT_REQUIRE_ACK));
        assert!(flags.contains(MessageFlags::BROADCAST | MessageFlags::SENT_FROM_EDITOR));
    }
}
