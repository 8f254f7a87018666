use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::vdf::proof::{compute_chain, VdfError, VdfProof};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Parameters {
    pub iterations_per_second: u64,
    pub min_iterations: u64,
    pub max_iterations: u64,
    #[serde(default)]
    pub calibrated: bool,
}

pub fn default_parameters() -> Parameters {
    Parameters {
        iterations_per_second: 1_000_000,
        min_iterations: 100_000,
        max_iterations: 3_600_000_000,
        calibrated: false,
    }
}

/// Measure this machine's sequential hash rate by running the chain for
/// `duration`. The bounds follow from the measured rate: at least a tenth
/// of a second of work per proof, at most an hour.
pub fn calibrate(duration: Duration) -> Result<Parameters, VdfError> {
    if duration < Duration::from_millis(100) {
        return Err(VdfError::CalibrationTooShort);
    }

    let mut hash: [u8; 32] = Sha256::digest(b"witnessd-calibration-input-v1").into();

    let mut iterations = 0u64;
    let start = Instant::now();
    let deadline = start + duration;

    while Instant::now() < deadline {
        hash = compute_chain(hash, 1000);
        iterations += 1000;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let iterations_per_second = (iterations as f64 / elapsed) as u64;

    Ok(Parameters {
        iterations_per_second,
        min_iterations: iterations_per_second / 10,
        max_iterations: iterations_per_second.saturating_mul(3600),
        calibrated: true,
    })
}

pub fn compute(
    input: [u8; 32],
    duration: Duration,
    params: Parameters,
) -> Result<VdfProof, VdfError> {
    VdfProof::compute(input, duration, params)
}

pub fn verify(proof: &VdfProof, params: Parameters) -> bool {
    proof.verify(params)
}

pub fn min_elapsed(proof: &VdfProof, params: Parameters) -> Duration {
    proof.min_elapsed(params)
}
