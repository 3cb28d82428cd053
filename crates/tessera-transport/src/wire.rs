//! # Wire Format
//!
//! Every datagram (after decryption) is a fixed 14-byte header followed by
//! the fragment payload. All integers are big-endian.
//!
//! ```text
//!  0        1                 5          7              9                 13        14
//! +--------+-----------------+----------+--------------+-----------------+---------+--------
//! |  type  |       id        |  index   | num_indices  |  payload_size   | is_nack | payload
//! +--------+-----------------+----------+--------------+-----------------+---------+--------
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest fragment payload carried by a single datagram.
pub const MAX_PAYLOAD_SIZE: usize = 1285;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 14;

/// Largest plaintext datagram.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Number of distinct packet types.
pub const NUM_PACKET_TYPES: usize = 3;

// ─── Packet Type ─────────────────────────────────────────────────────────────

/// Logical stream a packet belongs to. Ids are assigned per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PacketType {
    Video = 0,
    Audio = 1,
    Message = 2,
}

impl PacketType {
    pub const ALL: [PacketType; NUM_PACKET_TYPES] =
        [PacketType::Video, PacketType::Audio, PacketType::Message];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Video),
            1 => Some(PacketType::Audio),
            2 => Some(PacketType::Message),
            _ => None,
        }
    }

    /// Dense index for per-type tables.
    pub fn index(self) -> usize {
        self as usize
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// One fragment of a logical unit (frame, audio chunk or control message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Monotonic per type, assigned by the sender.
    pub id: i32,
    /// Position of this fragment, `0 <= index < num_indices`.
    pub index: u16,
    /// Number of fragments making up the logical unit.
    pub num_indices: u16,
    /// Set when the packet is a retransmission answering a NACK.
    pub is_a_nack: bool,
    pub payload: Bytes,
}

impl Packet {
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.packet_type as u8);
        buf.put_i32(self.id);
        buf.put_u16(self.index);
        buf.put_u16(self.num_indices);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u8(self.is_a_nack as u8);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one datagram. Rejects unknown types, inconsistent indices,
    /// oversized or truncated payloads, and trailing garbage.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_SIZE {
            return None;
        }
        let packet_type = PacketType::from_byte(buf.get_u8())?;
        let id = buf.get_i32();
        let index = buf.get_u16();
        let num_indices = buf.get_u16();
        let payload_size = buf.get_u32() as usize;
        let is_a_nack = match buf.get_u8() {
            0 => false,
            1 => true,
            _ => return None,
        };
        if num_indices == 0 || index >= num_indices {
            return None;
        }
        if payload_size > MAX_PAYLOAD_SIZE || buf.remaining() != payload_size {
            return None;
        }
        let payload = buf.copy_to_bytes(payload_size);
        Some(Packet {
            packet_type,
            id,
            index,
            num_indices,
            is_a_nack,
            payload,
        })
    }
}
