use crate::common::*;
use thiserror::Error;

/// Fatal configuration errors raised before or while building the networks.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("architecture \"{0}\" is not implemented")]
    UnknownArchitecture(String),
    #[error("unknown weight initialization method \"{0}\", expect one of default, orthogonal, glorot, normal")]
    UnknownInitMethod(String),
    #[error("data size {0} is not supported, expect one of 32, 64, 128, 256")]
    UnsupportedResolution(usize),
    #[error("the conditional architecture requires pixel maps but none were given")]
    MissingConditioning,
    #[error("CUDA is not available and is required for training")]
    AcceleratorUnavailable,
    #[error("attention layer {index} is out of range, expect a block index in 1..{num_blocks}")]
    InvalidAttentionLayer { index: usize, num_blocks: usize },
    #[error("invalid pixel count: {0}")]
    InvalidPixelCount(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no {role} checkpoint for step {step} at '{}'", path.display())]
    Missing {
        role: &'static str,
        step: usize,
        path: PathBuf,
    },
}
