//! Residual 1D convolutional speaker classifier.
//!
//! The model is trained directly in Rust with hand-written gradients over
//! flat `f32` buffers and exported/loaded as reproducible JSON.

mod model;
mod train;

pub use model::{Conv1d, Dense, ResNetConfig, ResNetModel, ResidualBlock, softmax};
pub use train::{AdamState, BatchStats, TrainOptions, evaluate_batch, train_batch};
