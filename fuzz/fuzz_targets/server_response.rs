#![no_main]
use libfuzzer_sys::fuzz_target;
use tantu::transport::decode_server_body;

fuzz_target!(|data: &[u8]| {
    let _ = decode_server_body(data);
});
