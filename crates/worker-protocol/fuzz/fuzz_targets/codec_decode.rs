#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use worker_protocol::codec::decode_frame;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Drain every complete frame; malformed input must surface as Err, never a panic
    while let Ok(Some(_frame)) = decode_frame(&mut buf) {}
});
