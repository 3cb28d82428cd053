//! # Receiver Frame Ring
//!
//! Reassembles fragments of one packet type into logical units and decides
//! which missing fragments to NACK.
//!
//! ## Model
//!
//! - Unit `id` lives in slot `id % ring_size`. A newer id evicts an older
//!   one; an older id than the slot holds is stale and dropped.
//! - Duplicates (including late retransmissions) are counted and ignored.
//! - Once a unit is taken, every older id is finished: late fragments for
//!   them are stale and incomplete ones count as skipped.
//! - Gaps are NACKed for every unfinished unit up to the newest id seen.
//!   For the newest unit only indices below its highest received index are
//!   considered missing. Units from which nothing arrived at all get a NACK
//!   for index 0, which reveals their fragment count.
//! - Each index is NACKed at most `max_nacks_per_index` times, no more often
//!   than `rearm_interval`.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use serde::Serialize;

use crate::wire::{Packet, PacketType, MAX_PAYLOAD_SIZE};

#[derive(Debug, Clone)]
pub struct FrameRingConfig {
    /// Units kept in flight.
    pub ring_size: usize,
    /// Largest accepted `num_indices`.
    pub max_fragments: usize,
    pub rearm_interval: Duration,
    pub max_nacks_per_index: u8,
    /// Upper bound on NACKs returned by one `collect_nacks` call.
    pub max_nacks_per_call: usize,
}

impl Default for FrameRingConfig {
    fn default() -> Self {
        FrameRingConfig {
            ring_size: 275,
            max_fragments: 1024,
            rearm_interval: Duration::from_millis(25),
            max_nacks_per_index: 3,
            max_nacks_per_call: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Fragment stored, unit still incomplete.
    Stored,
    /// Fragment already present; nothing changed.
    Duplicate,
    /// Fragment completed its unit; call [`FrameRing::take_frame`].
    Completed,
    /// Unit already finished or evicted by a newer one.
    Stale,
    /// Wrong type or inconsistent indices.
    Invalid,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RingStats {
    pub originals_received: u64,
    pub retransmissions_received: u64,
    pub duplicates: u64,
    pub frames_completed: u64,
    pub frames_skipped: u64,
    pub nacks_requested: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct NackState {
    count: u8,
    last: Option<Instant>,
}

struct FrameSlot {
    id: i32,
    /// Zero until the first fragment arrives.
    num_indices: u16,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    highest_index: u16,
    nacks: Vec<NackState>,
    taken: bool,
}

impl FrameSlot {
    fn placeholder(id: i32) -> Self {
        FrameSlot {
            id,
            num_indices: 0,
            fragments: Vec::new(),
            received: 0,
            highest_index: 0,
            nacks: vec![NackState::default()],
            taken: false,
        }
    }

    fn init(&mut self, num_indices: u16) {
        let n = num_indices as usize;
        self.num_indices = num_indices;
        self.fragments = vec![None; n];
        let first = self.nacks.first().copied().unwrap_or_default();
        self.nacks = vec![NackState::default(); n];
        self.nacks[0] = first;
    }

    fn is_complete(&self) -> bool {
        self.num_indices > 0 && self.received == self.num_indices as usize
    }
}

pub struct FrameRing {
    packet_type: PacketType,
    config: FrameRingConfig,
    slots: Vec<Option<FrameSlot>>,
    max_id: Option<i32>,
    /// Lowest id ever received; bounds gap detection before the first take.
    min_id: Option<i32>,
    last_taken: Option<i32>,
    stats: RingStats,
}

impl FrameRing {
    pub fn new(packet_type: PacketType, config: FrameRingConfig) -> Self {
        let ring_size = config.ring_size.max(1);
        FrameRing {
            packet_type,
            config: FrameRingConfig { ring_size, ..config },
            slots: (0..ring_size).map(|_| None).collect(),
            max_id: None,
            min_id: None,
            last_taken: None,
            stats: RingStats::default(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }

    pub fn max_id(&self) -> Option<i32> {
        self.max_id
    }

    fn slot_index(&self, id: i32) -> usize {
        (id as i64).rem_euclid(self.config.ring_size as i64) as usize
    }

    fn is_finished(&self, id: i32) -> bool {
        self.last_taken.is_some_and(|t| id <= t)
    }

    /// Replace whatever occupies `id`'s slot, counting an unfinished evictee
    /// as skipped.
    fn evict_for(&mut self, id: i32) {
        let idx = self.slot_index(id);
        if let Some(old) = &self.slots[idx] {
            if !old.taken && !self.last_taken.is_some_and(|t| old.id <= t) {
                self.stats.frames_skipped += 1;
                tracing::debug!(packet_type = ?self.packet_type, id = old.id, "evicting unfinished frame");
            }
        }
        self.slots[idx] = Some(FrameSlot::placeholder(id));
    }

    pub fn receive(&mut self, packet: &Packet) -> ReceiveOutcome {
        if packet.packet_type != self.packet_type
            || packet.num_indices == 0
            || packet.index >= packet.num_indices
            || packet.num_indices as usize > self.config.max_fragments
            || packet.payload.len() > MAX_PAYLOAD_SIZE
        {
            return ReceiveOutcome::Invalid;
        }
        if self.is_finished(packet.id) {
            if packet.is_a_nack {
                self.stats.duplicates += 1;
            }
            return ReceiveOutcome::Stale;
        }

        let idx = self.slot_index(packet.id);
        match self.slots[idx].as_ref().map(|s| s.id) {
            Some(existing) if existing > packet.id => return ReceiveOutcome::Stale,
            Some(existing) if existing == packet.id => {}
            _ => {
                self.evict_for(packet.id);
            }
        }
        let Some(slot) = self.slots[idx].as_mut() else {
            return ReceiveOutcome::Invalid;
        };
        if slot.num_indices == 0 {
            slot.init(packet.num_indices);
        } else if slot.num_indices != packet.num_indices {
            return ReceiveOutcome::Invalid;
        }

        let index = packet.index as usize;
        if slot.fragments[index].is_some() {
            self.stats.duplicates += 1;
            return ReceiveOutcome::Duplicate;
        }
        slot.fragments[index] = Some(packet.payload.clone());
        slot.received += 1;
        slot.highest_index = slot.highest_index.max(packet.index);
        let complete = slot.is_complete();

        if packet.is_a_nack {
            self.stats.retransmissions_received += 1;
        } else {
            self.stats.originals_received += 1;
        }
        if self.max_id.map_or(true, |m| packet.id > m) {
            self.max_id = Some(packet.id);
        }
        if self.min_id.map_or(true, |m| packet.id < m) {
            self.min_id = Some(packet.id);
        }

        if complete {
            ReceiveOutcome::Completed
        } else {
            ReceiveOutcome::Stored
        }
    }

    /// Hand out a completed unit. Every older unit becomes finished;
    /// incomplete ones among them count as skipped.
    pub fn take_frame(&mut self, id: i32) -> Option<Bytes> {
        let idx = self.slot_index(id);
        let slot = self.slots[idx].as_mut().filter(|s| s.id == id)?;
        if slot.taken || !slot.is_complete() {
            return None;
        }
        slot.taken = true;
        let total = slot.fragments.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for frag in slot.fragments.iter().flatten() {
            out.extend_from_slice(frag);
        }
        self.stats.frames_completed += 1;

        let from = match self.last_taken {
            Some(t) => t.saturating_add(1),
            None => id.saturating_sub(self.config.ring_size as i32 - 1),
        };
        for older in from..id {
            let idx = self.slot_index(older);
            if let Some(s) = self.slots[idx].as_mut().filter(|s| s.id == older && !s.taken) {
                s.taken = true;
                self.stats.frames_skipped += 1;
            }
        }
        if self.last_taken.map_or(true, |t| id > t) {
            self.last_taken = Some(id);
        }
        Some(out.freeze())
    }

    /// Missing fragments due for a NACK at `now`, as `(id, index)`.
    pub fn collect_nacks(&mut self, now: Instant) -> Vec<(i32, u16)> {
        let Some(max_id) = self.max_id else {
            return Vec::new();
        };
        let window_start = max_id.saturating_sub(self.config.ring_size as i32 - 1);
        let start = match (self.last_taken, self.min_id) {
            (Some(t), _) => t.saturating_add(1).max(window_start),
            (None, Some(m)) => m.max(window_start),
            (None, None) => max_id,
        };

        let mut out = Vec::new();
        let mut id = start;
        while id <= max_id && out.len() < self.config.max_nacks_per_call {
            let idx = self.slot_index(id);
            let present = self.slots[idx].as_ref().is_some_and(|s| s.id == id);
            if !present {
                if id == max_id {
                    break;
                }
                // nothing of this unit arrived yet
                self.evict_for(id);
            }
            let cfg = &self.config;
            if let Some(slot) = self.slots[idx].as_mut() {
                if !slot.taken && !slot.is_complete() {
                    let limit = if slot.num_indices == 0 {
                        1
                    } else if id == max_id {
                        slot.highest_index as usize
                    } else {
                        slot.num_indices as usize
                    };
                    for index in 0..limit {
                        if out.len() >= cfg.max_nacks_per_call {
                            break;
                        }
                        if slot.fragments.get(index).is_some_and(Option::is_some) {
                            continue;
                        }
                        let state = &mut slot.nacks[index];
                        if state.count >= cfg.max_nacks_per_index {
                            continue;
                        }
                        if state.last.is_some_and(|t| now.saturating_duration_since(t) < cfg.rearm_interval) {
                            continue;
                        }
                        state.count += 1;
                        state.last = Some(now);
                        out.push((id, index as u16));
                    }
                }
            }
            if id == i32::MAX {
                break;
            }
            id += 1;
        }
        self.stats.nacks_requested += out.len() as u64;
        out
    }
}
