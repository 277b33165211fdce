//! Datagram header shared by both channels
//!
//! `[u8 kind][u16 sequence][u16 ack][u32 ack_bits]` followed by the body.
//! Bit `i` of `ack_bits` acknowledges packet `ack - 1 - i`.

use crate::error::SyncError;
use crate::net::framing::{FrameBuilder, FrameReader};
use crate::net::sequence::Sequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Body: `[u16 message id][u16 fragment index][u16 fragment count][chunk]`
    Reliable = 1,
    /// Body: payload
    Unreliable = 2,
    /// Empty body, keeps acks flowing when there is nothing else to send
    Heartbeat = 3,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<PacketKind> {
        match value {
            1 => Some(PacketKind::Reliable),
            2 => Some(PacketKind::Unreliable),
            3 => Some(PacketKind::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub sequence: Sequence,
    /// Most recent sequence received from the peer
    pub ack: Sequence,
    pub ack_bits: u32,
}

impl PacketHeader {
    pub fn write(&self, frame: FrameBuilder) -> FrameBuilder {
        frame
            .write_u8(self.kind as u8)
            .write_u16(self.sequence)
            .write_u16(self.ack)
            .write_u32(self.ack_bits)
    }

    /// Parse the header, returning it and the body
    pub fn read(datagram: &[u8]) -> Result<(PacketHeader, &[u8]), SyncError> {
        let mut reader = FrameReader::new(datagram);
        let truncated = || SyncError::malformed(format!("datagram of {} bytes has no header", datagram.len()));

        let kind = reader.read_u8().ok_or_else(truncated)?;
        let kind = PacketKind::from_u8(kind)
            .ok_or_else(|| SyncError::malformed(format!("unknown packet kind {}", kind)))?;
        let sequence = reader.read_u16().ok_or_else(truncated)?;
        let ack = reader.read_u16().ok_or_else(truncated)?;
        let ack_bits = reader.read_u32().ok_or_else(truncated)?;

        Ok((
            PacketHeader {
                kind,
                sequence,
                ack,
                ack_bits,
            },
            reader.remaining(),
        ))
    }
}
