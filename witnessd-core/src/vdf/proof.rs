use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::vdf::Parameters;

/// Domain tag hashed into every iteration so the chain cannot collide with
/// any other SHA-256 use in the protocol.
const ITERATION_TAG: u8 = 0x56;

pub const ENCODED_LEN: usize = 32 + 32 + 8;

#[derive(Debug, thiserror::Error)]
pub enum VdfError {
    #[error("vdf: empty input")]
    EmptyInput,
    #[error("vdf: {iterations} iterations outside [{min}, {max}]")]
    IterationsOutOfBounds { iterations: u64, min: u64, max: u64 },
    #[error("vdf: calibration duration too short")]
    CalibrationTooShort,
    #[error("vdf: proof data too short")]
    Truncated,
}

/// Verifiable Delay Function (VDF) proof.
///
/// `iterations` is authoritative: verification recomputes the chain from
/// `input` for exactly that count and bounds-checks it against the
/// calibration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdfProof {
    pub input: [u8; 32],
    pub output: [u8; 32],
    pub iterations: u64,
}

impl VdfProof {
    pub fn compute(
        input: [u8; 32],
        target_duration: Duration,
        params: Parameters,
    ) -> Result<Self, VdfError> {
        if input == [0u8; 32] {
            return Err(VdfError::EmptyInput);
        }

        let requested = (target_duration.as_secs_f64()
            * params.iterations_per_second as f64) as u64;
        let iterations = requested.clamp(params.min_iterations, params.max_iterations);

        Ok(Self::compute_iterations(input, iterations))
    }

    pub fn compute_iterations(input: [u8; 32], iterations: u64) -> Self {
        let output = compute_chain(input, iterations);
        Self {
            input,
            output,
            iterations,
        }
    }

    pub fn verify(&self, params: Parameters) -> bool {
        if self.iterations < params.min_iterations || self.iterations > params.max_iterations {
            return false;
        }
        compute_chain(self.input, self.iterations) == self.output
    }

    /// Lower bound on wall-clock time this proof demonstrates. The
    /// iterations-per-second figure is advisory: it bounds, it does not
    /// certify.
    pub fn min_elapsed(&self, params: Parameters) -> Duration {
        let seconds = self.iterations as f64 / params.iterations_per_second as f64;
        Duration::from_secs_f64(seconds)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENCODED_LEN];
        buf[0..32].copy_from_slice(&self.input);
        buf[32..64].copy_from_slice(&self.output);
        buf[64..72].copy_from_slice(&self.iterations.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, VdfError> {
        if data.len() < ENCODED_LEN {
            return Err(VdfError::Truncated);
        }

        let mut input = [0u8; 32];
        let mut output = [0u8; 32];
        input.copy_from_slice(&data[0..32]);
        output.copy_from_slice(&data[32..64]);
        let iterations = u64::from_be_bytes(data[64..72].try_into().unwrap());

        Ok(Self {
            input,
            output,
            iterations,
        })
    }
}

/// Sequential hash chain: each iteration consumes the previous state, so
/// the computation cannot be parallelized or precomputed.
pub(crate) fn compute_chain(input: [u8; 32], iterations: u64) -> [u8; 32] {
    let mut hash = input;
    for _ in 0..iterations {
        let mut hasher = Sha256::new();
        hasher.update([ITERATION_TAG]);
        hasher.update(hash);
        hash = hasher.finalize().into();
    }
    hash
}
