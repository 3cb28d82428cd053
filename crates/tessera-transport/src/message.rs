//! # Control Messages
//!
//! Payloads of MESSAGE packets. Each message is one tagged variant whose
//! encoded size is computed from its contents; messages always travel as a
//! single fragment.
//!
//! Cursor, clipboard and file payloads are opaque here: the transport only
//! carries them between the peers' synchronisers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitrate::{CodecType, NetworkSettings};
use crate::wire::{PacketType, MAX_PAYLOAD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageTag {
    Nack = 0x01,
    NetworkSettings = 0x02,
    Cursor = 0x10,
    Clipboard = 0x11,
    FileChunk = 0x12,
}

impl MessageTag {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageTag::Nack),
            0x02 => Some(MessageTag::NetworkSettings),
            0x10 => Some(MessageTag::Cursor),
            0x11 => Some(MessageTag::Clipboard),
            0x12 => Some(MessageTag::FileChunk),
            _ => None,
        }
    }
}

const NACK_BODY_LEN: usize = 1 + 4 + 2;
const SETTINGS_BODY_LEN: usize = 4 + 4 + 8 + 4 + 2;

/// Largest opaque body that still fits one MESSAGE fragment.
pub const MAX_OPAQUE_LEN: usize = MAX_PAYLOAD_SIZE - 1 - 4;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Request a retransmission of one fragment.
    Nack {
        packet_type: PacketType,
        id: i32,
        index: u16,
    },
    /// Client-requested encoder and throttler settings.
    NetworkSettings(NetworkSettings),
    Cursor(Bytes),
    Clipboard(Bytes),
    FileChunk(Bytes),
}

impl ControlMessage {
    fn tag(&self) -> MessageTag {
        match self {
            ControlMessage::Nack { .. } => MessageTag::Nack,
            ControlMessage::NetworkSettings(_) => MessageTag::NetworkSettings,
            ControlMessage::Cursor(_) => MessageTag::Cursor,
            ControlMessage::Clipboard(_) => MessageTag::Clipboard,
            ControlMessage::FileChunk(_) => MessageTag::FileChunk,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + match self {
            ControlMessage::Nack { .. } => NACK_BODY_LEN,
            ControlMessage::NetworkSettings(_) => SETTINGS_BODY_LEN,
            ControlMessage::Cursor(b) | ControlMessage::Clipboard(b) | ControlMessage::FileChunk(b) => {
                4 + b.len()
            }
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.tag() as u8);
        match self {
            ControlMessage::Nack {
                packet_type,
                id,
                index,
            } => {
                buf.put_u8(*packet_type as u8);
                buf.put_i32(*id);
                buf.put_u16(*index);
            }
            ControlMessage::NetworkSettings(s) => {
                buf.put_u32(s.bitrate);
                buf.put_u32(s.burst_bitrate);
                buf.put_f64(s.fec_packet_ratio);
                buf.put_u32(s.fps);
                buf.put_u16(s.desired_codec as u16);
            }
            ControlMessage::Cursor(b) | ControlMessage::Clipboard(b) | ControlMessage::FileChunk(b) => {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let msg = match MessageTag::from_byte(buf.get_u8())? {
            MessageTag::Nack => {
                if buf.remaining() < NACK_BODY_LEN {
                    return None;
                }
                let packet_type = PacketType::from_byte(buf.get_u8())?;
                ControlMessage::Nack {
                    packet_type,
                    id: buf.get_i32(),
                    index: buf.get_u16(),
                }
            }
            MessageTag::NetworkSettings => {
                if buf.remaining() < SETTINGS_BODY_LEN {
                    return None;
                }
                ControlMessage::NetworkSettings(NetworkSettings {
                    bitrate: buf.get_u32(),
                    burst_bitrate: buf.get_u32(),
                    fec_packet_ratio: buf.get_f64(),
                    fps: buf.get_u32(),
                    desired_codec: CodecType::from_u16(buf.get_u16()),
                })
            }
            tag @ (MessageTag::Cursor | MessageTag::Clipboard | MessageTag::FileChunk) => {
                if buf.remaining() < 4 {
                    return None;
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return None;
                }
                let body = buf.copy_to_bytes(len);
                match tag {
                    MessageTag::Cursor => ControlMessage::Cursor(body),
                    MessageTag::Clipboard => ControlMessage::Clipboard(body),
                    _ => ControlMessage::FileChunk(body),
                }
            }
        };
        if buf.has_remaining() {
            return None;
        }
        Some(msg)
    }
}
