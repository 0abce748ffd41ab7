//! Machine learning building blocks: the residual convolutional classifier,
//! its training step, and evaluation metrics.

pub mod metrics;
pub mod resnet;
