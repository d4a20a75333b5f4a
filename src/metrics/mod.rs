//! Metrics module: host resource sampling and backend metric normalization.

mod normalizer;
mod sampler;

pub use normalizer::*;
pub use sampler::*;
