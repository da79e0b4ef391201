//! Fuzz target: COBS codec.
//!
//! - decode never panics on arbitrary input
//! - encode(decode(x)) is consistent: anything that decodes cleanly
//!   re-encodes to a zero-free packet that decodes to the same bytes
//!
//! cargo fuzz run fuzz_cobs_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use mcubridge::rpc::wire;

fuzz_target!(|data: &[u8]| {
    if let Ok(decoded) = wire::cobs_decode(data) {
        let reencoded = wire::cobs_encode(&decoded);
        assert!(!reencoded.contains(&0));
        assert_eq!(wire::cobs_decode(&reencoded).unwrap(), decoded);
    }

    // Encoding arbitrary data always round-trips.
    let encoded = wire::cobs_encode(data);
    assert_eq!(wire::cobs_decode(&encoded).unwrap(), data);
});
