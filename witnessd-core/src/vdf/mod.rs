pub mod params;
pub mod proof;

pub use params::{calibrate, compute, default_parameters, min_elapsed, verify, Parameters};
pub use proof::{VdfError, VdfProof};
