//! Property-based tests for the packet path.
//!
//! Fragmentation, bundles and the wire header must hold up for arbitrary
//! payloads and arrival orders; the bitrate controller must stay inside
//! its bounds for arbitrary statistics.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use tessera_transport::bitrate::*;
use tessera_transport::bundle::{bundle_size, extract_bundle, write_bundle};
use tessera_transport::fragment::{fragment_payload, num_indices, reassemble};
use tessera_transport::queue::FifoQueue;
use tessera_transport::wire::*;

fn packet_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Video),
        Just(PacketType::Audio),
        Just(PacketType::Message),
    ]
}

fn statistics() -> impl Strategy<Value = NetworkStatistics> {
    (
        0u32..5_000,
        0u32..20_000,
        0u32..120,
        0u32..120,
        0u64..100_000_000,
        any::<bool>(),
    )
        .prop_map(|(nacks, received, skipped, rendered, throughput, gathered)| NetworkStatistics {
            num_nacks_per_second: nacks,
            num_received_packets_per_second: received,
            num_skipped_frames_per_second: skipped,
            num_rendered_frames_per_second: rendered,
            throughput_per_second: throughput,
            statistics_gathered: gathered,
        })
}

fn policy() -> impl Strategy<Value = BitratePolicy> {
    prop_oneof![
        Just(BitratePolicy::RatioEwma),
        Just(BitratePolicy::Ewma),
        Just(BitratePolicy::Fallback),
    ]
}

// ─── Fragmentation ───────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn fragments_cover_payload(
        data in proptest::collection::vec(any::<u8>(), 0..8_000),
        max in 1usize..2_000,
        ty in packet_type(),
        id in any::<i32>(),
    ) {
        let payload = Bytes::from(data);
        let frags = fragment_payload(ty, id, &payload, max);
        prop_assert_eq!(frags.len(), num_indices(payload.len(), max));
        for (i, f) in frags.iter().enumerate() {
            prop_assert_eq!(f.index as usize, i);
            prop_assert_eq!(f.num_indices as usize, frags.len());
            prop_assert!(f.payload.len() <= max);
            prop_assert_eq!(f.id, id);
            prop_assert!(!f.is_a_nack);
        }
        let total: usize = frags.iter().map(|f| f.payload.len()).sum();
        prop_assert_eq!(total, payload.len());
    }

    #[test]
    fn reassembly_ignores_arrival_order(
        data in proptest::collection::vec(any::<u8>(), 1..6_000),
        max in 1usize..1_500,
        seed in any::<u64>(),
    ) {
        let payload = Bytes::from(data);
        let mut frags = fragment_payload(PacketType::Video, 7, &payload, max);
        // deterministic shuffle
        let mut state = seed | 1;
        for i in (1..frags.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            frags.swap(i, (state % (i as u64 + 1)) as usize);
        }
        prop_assert_eq!(reassemble(&frags), Some(payload));
    }

    #[test]
    fn reassembly_fails_with_a_fragment_missing(
        data in proptest::collection::vec(any::<u8>(), 2..4_000),
        drop_at in any::<prop::sample::Index>(),
    ) {
        let payload = Bytes::from(data);
        let mut frags = fragment_payload(PacketType::Audio, 1, &payload, 1);
        frags.remove(drop_at.index(frags.len()));
        prop_assert!(reassemble(&frags).is_none());
    }
}

// ─── Bundles ─────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn bundle_roundtrip(frames in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..12)) {
        let mut buf = vec![0u8; bundle_size(&frames)];
        let written = write_bundle(&frames, &mut buf).unwrap();
        prop_assert_eq!(written, buf.len());
        let out = extract_bundle(&Bytes::from(buf)).unwrap();
        prop_assert_eq!(out.len(), frames.len());
        for (a, b) in out.iter().zip(&frames) {
            prop_assert_eq!(&a[..], &b[..]);
        }
    }

    #[test]
    fn bundle_rejects_short_buffer(
        frames in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..6),
        short_by in 1usize..8,
    ) {
        let needed = bundle_size(&frames);
        let mut buf = vec![0u8; needed - short_by.min(needed)];
        prop_assert!(write_bundle(&frames, &mut buf).is_err());
    }

    #[test]
    fn truncated_bundle_never_panics(
        frames in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..6),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut buf = vec![0u8; bundle_size(&frames)];
        write_bundle(&frames, &mut buf).unwrap();
        let len = cut.index(buf.len());
        prop_assert!(extract_bundle(&Bytes::copy_from_slice(&buf[..len])).is_err());
    }
}

// ─── Wire Header ─────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn packet_header_roundtrip(
        ty in packet_type(),
        id in any::<i32>(),
        (num, index) in (1u16..=u16::MAX).prop_flat_map(|n| (Just(n), 0..n)),
        is_a_nack in any::<bool>(),
        data in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
    ) {
        let packet = Packet {
            packet_type: ty,
            id,
            index,
            num_indices: num,
            is_a_nack,
            payload: Bytes::from(data),
        };
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        prop_assert_eq!(buf.len(), HEADER_SIZE + packet.payload_size());
        prop_assert_eq!(Packet::decode(&mut buf.freeze()), Some(packet));
    }

    #[test]
    fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..1_400)) {
        let _ = Packet::decode(&mut Bytes::from(data));
    }
}

// ─── Queue ───────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn queue_is_fifo_and_bounded(items in proptest::collection::vec(any::<u32>(), 0..64), capacity in 1usize..32) {
        let queue = FifoQueue::new(capacity);
        let mut accepted = Vec::new();
        for item in &items {
            if queue.enqueue(*item).is_ok() {
                accepted.push(*item);
            }
        }
        prop_assert_eq!(accepted.len(), items.len().min(capacity));
        prop_assert_eq!(&accepted[..], &items[..accepted.len()]);
        let drained: Vec<u32> = std::iter::from_fn(|| queue.dequeue()).collect();
        prop_assert_eq!(drained, accepted);
        prop_assert!(queue.is_empty());
    }
}

// ─── Bitrate Bounds ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn requested_settings_stay_in_bounds(
        policy in policy(),
        periods in proptest::collection::vec(statistics(), 1..40),
    ) {
        let mut controller = BitrateController::new(policy);
        for stats in &periods {
            let s = controller.get_desired_network_settings(stats);
            prop_assert!((MINIMUM_BITRATE..=MAXIMUM_BITRATE).contains(&s.bitrate), "bitrate {}", s.bitrate);
            prop_assert!(
                (MINIMUM_BITRATE..=STARTING_BURST_BITRATE).contains(&s.burst_bitrate),
                "burst {}",
                s.burst_bitrate
            );
            prop_assert_eq!(s.fps, DEFAULT_FPS);
        }
    }
}
