//! Property and fuzz-style tests for the protocol core.
//!
//! The frame parser, COBS codec, and RLE codec must be total over
//! arbitrary input: any byte sequence yields either a parsed frame or a
//! documented error kind, never a panic.

use mcubridge::rpc::frame::{self, FrameError};
use mcubridge::rpc::protocol::{CMD_FLAG_COMPRESSED, MAX_PAYLOAD_SIZE, STATUS_CODE_MIN};
use mcubridge::rpc::{rle, wire};
use mcubridge::state::BoundedQueue;
use proptest::prelude::*;

proptest! {
    /// Arbitrary bytes (≤ 200) through COBS-decode + parse never panic
    /// and only surface documented error kinds.
    #[test]
    fn parser_is_fuzz_stable(data in proptest::collection::vec(any::<u8>(), 0..=200)) {
        if let Ok(decoded) = wire::cobs_decode(&data) {
            match frame::parse(&decoded) {
                Ok((command_id, payload)) => {
                    prop_assert!(command_id & 0x7FFF >= STATUS_CODE_MIN);
                    prop_assert!(payload.len() <= decoded.len());
                }
                Err(
                    FrameError::Incomplete { .. }
                    | FrameError::CrcMismatch { .. }
                    | FrameError::UnsupportedVersion(_)
                    | FrameError::InvalidCommandId(_)
                    | FrameError::LengthMismatch { .. },
                ) => {}
                Err(other) => prop_assert!(false, "undocumented parse error: {other:?}"),
            }
        }
    }

    /// Round-trip: every valid (command, payload) survives build + parse.
    #[test]
    fn frame_round_trip(
        cmd in STATUS_CODE_MIN..=0x7FFFu16,
        compressed in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
    ) {
        let wire_id = if compressed { cmd | CMD_FLAG_COMPRESSED } else { cmd };
        let raw = frame::build(wire_id, &payload).unwrap();
        let (parsed_id, parsed_payload) = frame::parse(&raw).unwrap();
        prop_assert_eq!(parsed_id, wire_id);
        prop_assert_eq!(parsed_payload, payload);
    }

    /// Flipping any single bit of a valid frame is always detected.
    #[test]
    fn single_bit_corruption_is_detected(
        cmd in STATUS_CODE_MIN..=0x7FFFu16,
        payload in proptest::collection::vec(any::<u8>(), 0..=32),
        bit in 0usize..((9 + 32) * 8),
    ) {
        let mut raw = frame::build(cmd, &payload).unwrap();
        let bit = bit % (raw.len() * 8);
        raw[bit / 8] ^= 1 << (bit % 8);

        match frame::parse(&raw) {
            Err(
                FrameError::CrcMismatch { .. }
                | FrameError::LengthMismatch { .. }
                | FrameError::UnsupportedVersion(_)
                | FrameError::InvalidCommandId(_),
            ) => {}
            Ok(_) => prop_assert!(false, "corrupted frame parsed"),
            Err(other) => prop_assert!(false, "unexpected error kind: {other:?}"),
        }
    }

    /// COBS encode/decode round-trips arbitrary byte slices, and the
    /// encoded form is always delimiter-free.
    #[test]
    fn cobs_round_trip(data in proptest::collection::vec(any::<u8>(), 0..=600)) {
        let encoded = wire::cobs_encode(&data);
        prop_assert!(!encoded.contains(&0));
        prop_assert_eq!(wire::cobs_decode(&encoded).unwrap(), data);
    }

    /// RLE decode inverts encode for arbitrary input.
    #[test]
    fn rle_round_trip(data in proptest::collection::vec(any::<u8>(), 0..=512)) {
        let encoded = rle::encode(&data);
        prop_assert_eq!(rle::decode(&encoded).unwrap(), data);
    }

    /// RLE decode never panics on arbitrary (possibly malformed) input.
    #[test]
    fn rle_decode_is_total(data in proptest::collection::vec(any::<u8>(), 0..=256)) {
        let _ = rle::decode(&data);
    }

    /// Bounded queues hold their caps after every operation, and drops
    /// account exactly for the difference.
    #[test]
    fn bounded_queue_invariants(
        ops in proptest::collection::vec((any::<bool>(), 0usize..12), 1..=100),
        max_items in 1usize..8,
        max_bytes in 1usize..64,
    ) {
        let mut queue: BoundedQueue<Vec<u8>> = BoundedQueue::new("prop", max_items, max_bytes);
        let mut enqueued = 0u64;
        let mut consumed = 0u64;

        for (push, size) in ops {
            if push {
                queue.push_drop_oldest(vec![0u8; size]);
                enqueued += 1;
            } else if queue.pop_front().is_some() {
                consumed += 1;
            }
            prop_assert!(queue.len() <= max_items);
            prop_assert!(queue.bytes() <= max_bytes);
        }

        prop_assert_eq!(queue.dropped(), enqueued - (queue.len() as u64 + consumed));
    }
}
