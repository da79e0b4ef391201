//! Fuzz target: RLE codec.
//!
//! - decode never panics on arbitrary (possibly truncated) input
//! - encode(x) always decodes back to x
//!
//! cargo fuzz run fuzz_rle_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use mcubridge::rpc::rle;

fuzz_target!(|data: &[u8]| {
    let _ = rle::decode(data);

    let encoded = rle::encode(data);
    assert_eq!(rle::decode(&encoded).unwrap(), data);
});
