//! # NACK Retransmission Buffers
//!
//! The sender keeps the most recent `num_buffers` logical units of each
//! packet type so that individual fragments can be resent when the
//! receiver NACKs them. Unit `id` lives in slot `id % num_buffers`; a
//! lookup whose slot has since been reused by a newer id reports NotFound
//! rather than resending stale data.
//!
//! Each type's buffer sits behind its own mutex so video, audio and
//! message traffic never contend with each other.

use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, TransportError};
use crate::wire::{Packet, PacketType, MAX_PAYLOAD_SIZE, NUM_PACKET_TYPES};

// ─── Single-Type Buffer ──────────────────────────────────────────────────────

pub struct NackBuffer {
    num_buffers: usize,
    max_indices: usize,
    max_payload_size: usize,
    /// `num_buffers * max_indices` positions, filled lazily.
    slots: Vec<Option<Packet>>,
}

impl NackBuffer {
    /// Sized for units of up to `max_payload_size` bytes: each slot keeps
    /// `max_payload_size / MAX_PAYLOAD_SIZE + 2` fragment positions.
    pub fn new(max_payload_size: usize, num_buffers: usize) -> Self {
        let num_buffers = num_buffers.max(1);
        let max_indices = max_payload_size / MAX_PAYLOAD_SIZE + 2;
        NackBuffer {
            num_buffers,
            max_indices,
            max_payload_size,
            slots: vec![None; num_buffers * max_indices],
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn max_indices(&self) -> usize {
        self.max_indices
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn position(&self, id: i32, index: u16) -> Option<usize> {
        let index = index as usize;
        if index >= self.max_indices {
            return None;
        }
        let slot = (id as i64).rem_euclid(self.num_buffers as i64) as usize;
        Some(slot * self.max_indices + index)
    }

    /// Keep a copy of `packet` for later retransmission. Fragments whose
    /// index exceeds the buffer geometry are not retained.
    pub fn store(&mut self, packet: &Packet) -> bool {
        match self.position(packet.id, packet.index) {
            Some(pos) => {
                self.slots[pos] = Some(packet.clone());
                true
            }
            None => false,
        }
    }

    /// Fetch fragment `index` of unit `id`, marking it as a retransmission.
    pub fn nack(&mut self, id: i32, index: u16) -> Option<Packet> {
        let pos = self.position(id, index)?;
        let stored = self.slots[pos].as_mut()?;
        if stored.id != id || stored.index != index {
            tracing::warn!(
                packet_type = ?stored.packet_type,
                requested = id,
                located = stored.id,
                index,
                "nacked packet not found, slot holds a different id"
            );
            return None;
        }
        stored.is_a_nack = true;
        Some(stored.clone())
    }
}

// ─── Per-Type Registry ───────────────────────────────────────────────────────

/// One optional buffer per packet type.
pub struct NackBuffers {
    buffers: [Mutex<Option<NackBuffer>>; NUM_PACKET_TYPES],
}

impl NackBuffers {
    pub fn new() -> Self {
        NackBuffers {
            buffers: std::array::from_fn(|_| Mutex::new(None)),
        }
    }

    /// Lock the buffer for `packet_type`; `None` inside when unregistered.
    pub fn lock(&self, packet_type: PacketType) -> MutexGuard<'_, Option<NackBuffer>> {
        self.buffers[packet_type.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, packet_type: PacketType, max_payload_size: usize, num_buffers: usize) -> Result<()> {
        let mut slot = self.lock(packet_type);
        if slot.is_some() {
            return Err(TransportError::NackBufferExists(packet_type));
        }
        *slot = Some(NackBuffer::new(max_payload_size, num_buffers));
        tracing::debug!(?packet_type, max_payload_size, num_buffers, "registered NACK buffer");
        Ok(())
    }

    pub fn is_registered(&self, packet_type: PacketType) -> bool {
        self.lock(packet_type).is_some()
    }

    pub fn nack(&self, packet_type: PacketType, id: i32, index: u16) -> Result<Packet> {
        let mut guard = self.lock(packet_type);
        let buffer = guard
            .as_mut()
            .ok_or(TransportError::NoNackBuffer(packet_type))?;
        buffer.nack(id, index).ok_or(TransportError::NackNotFound {
            packet_type,
            id,
            index,
        })
    }
}

impl Default for NackBuffers {
    fn default() -> Self {
        Self::new()
    }
}
