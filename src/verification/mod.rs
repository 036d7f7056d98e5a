pub mod sampler;

pub use sampler::{
    recoverability_findings, sample_device, sample_positions, VerificationOutcome, SAMPLE_BYTES,
};
