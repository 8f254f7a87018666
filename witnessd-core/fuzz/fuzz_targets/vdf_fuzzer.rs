#![no_main]
use libfuzzer_sys::fuzz_target;
use std::time::Duration;
use witnessd_core::vdf::{self, VdfProof};

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 { return; }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&data[..32]);

    let params = vdf::default_parameters();
    if let Ok(proof) = vdf::compute(seed, Duration::from_millis(1), params) {
        let encoded = proof.encode();
        let decoded = VdfProof::decode(&encoded).expect("roundtrip");
        assert_eq!(decoded, proof);
    }

    // Decoding arbitrary bytes must never panic.
    let _ = VdfProof::decode(data);
});
