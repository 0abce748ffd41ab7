//! Dataset discovery, splitting, noise pooling and batch streaming.

pub mod noise;
pub mod samples;
pub mod split;
pub mod stream;
