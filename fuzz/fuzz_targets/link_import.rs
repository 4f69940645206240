#![no_main]
use libfuzzer_sys::fuzz_target;
use tantu::crypto::Sha256Hasher;
use tantu::link::{ChainLink, RawLink};

fuzz_target!(|data: &[u8]| {
    if let Ok(raw) = serde_json::from_slice::<RawLink>(data) {
        let _ = ChainLink::import_from_server(raw, &Sha256Hasher, None);
    }
});
