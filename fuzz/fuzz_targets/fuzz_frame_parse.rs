//! Fuzz target: frame parser totality.
//!
//! Feeds arbitrary bytes through the COBS decoder and the frame parser
//! and verifies:
//! - no panics under any byte sequence
//! - a frame that parses back out round-trips through `build`
//!
//! cargo fuzz run fuzz_frame_parse

#![no_main]

use libfuzzer_sys::fuzz_target;
use mcubridge::rpc::protocol::MAX_PAYLOAD_SIZE;
use mcubridge::rpc::{frame, wire};

fuzz_target!(|data: &[u8]| {
    // Raw bytes straight into the parser.
    let _ = frame::parse(data);

    // And the transport path: COBS decode first.
    if let Ok(decoded) = wire::cobs_decode(data) {
        if let Ok((command_id, payload)) = frame::parse(&decoded) {
            // Whatever parsed within the payload budget must rebuild to
            // the identical raw frame.
            if payload.len() <= MAX_PAYLOAD_SIZE {
                let rebuilt = frame::build(command_id, &payload).unwrap();
                assert_eq!(rebuilt, decoded);
            }
        }
    }
});
