//! # Fragmentation
//!
//! Splits a logical payload into indexed packets of at most `max` bytes and
//! reassembles them in index order regardless of arrival order.

use bytes::{Bytes, BytesMut};

use crate::wire::{Packet, PacketType};

/// Number of fragments needed for `size` bytes. An empty payload still
/// occupies one fragment.
pub fn num_indices(size: usize, max: usize) -> usize {
    if size == 0 {
        1
    } else {
        size.div_ceil(max.max(1))
    }
}

/// Split `payload` into packets carrying `[i*max, min((i+1)*max, len))`.
///
/// Callers must ensure the fragment count fits a `u16`; the socket layer
/// validates this against the NACK buffer limits before fragmenting.
pub fn fragment_payload(packet_type: PacketType, id: i32, payload: &Bytes, max: usize) -> Vec<Packet> {
    let max = max.max(1);
    let count = num_indices(payload.len(), max);
    (0..count)
        .map(|i| {
            let start = i * max;
            let end = ((i + 1) * max).min(payload.len());
            Packet {
                packet_type,
                id,
                index: i as u16,
                num_indices: count as u16,
                is_a_nack: false,
                payload: payload.slice(start..end),
            }
        })
        .collect()
}

/// Concatenate a complete fragment set in index order.
///
/// Accepts any arrival order and tolerates duplicates; fails with `None`
/// when fragments disagree on type, id or count, or an index is missing.
pub fn reassemble(fragments: &[Packet]) -> Option<Bytes> {
    let first = fragments.first()?;
    let count = first.num_indices as usize;
    let mut slots: Vec<Option<&Bytes>> = vec![None; count];
    for frag in fragments {
        if frag.packet_type != first.packet_type
            || frag.id != first.id
            || frag.num_indices != first.num_indices
        {
            return None;
        }
        let slot = slots.get_mut(frag.index as usize)?;
        if slot.is_none() {
            *slot = Some(&frag.payload);
        }
    }

    let total: usize = slots.iter().map(|s| s.map_or(0, |b| b.len())).sum();
    let mut out = BytesMut::with_capacity(total);
    for slot in slots {
        out.extend_from_slice(slot?);
    }
    Some(out.freeze())
}
